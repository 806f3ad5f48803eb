use std::{collections::BTreeMap, path::PathBuf, sync::RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CropcastResult, IoError};

/// Run-level state for one source, updated after every `run()`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorRunState {
    pub source_name: String,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub request_count: u64,
}

impl CollectorRunState {
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < 3
    }
}

/// Registry of run states across sources, optionally persisted as JSON so the
/// health surface survives restarts.
pub struct RunStateRegistry {
    states: RwLock<BTreeMap<String, CollectorRunState>>,
    path: Option<PathBuf>,
}

impl RunStateRegistry {
    pub fn in_memory() -> Self {
        Self {
            states: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Load from `path` if it exists; subsequent updates write back.
    pub fn persistent(path: PathBuf) -> Self {
        let states = std::fs::read_to_string(&path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
        Self {
            states: RwLock::new(states),
            path: Some(path),
        }
    }

    /// Record one run outcome. `not_published` runs do not count as failures
    /// until the release retry window is exhausted; the scheduler passes
    /// `count_failure = false` for those.
    pub fn record_run(
        &self,
        source_name: &str,
        success: bool,
        count_failure: bool,
        request_count: u64,
    ) {
        if let Ok(mut states) = self.states.write() {
            let state = states.entry(source_name.to_string()).or_default();
            state.source_name = source_name.to_string();
            state.last_run = Some(Utc::now());
            state.request_count += request_count;
            if success {
                state.last_success = Some(Utc::now());
                state.consecutive_failures = 0;
            } else if count_failure {
                state.consecutive_failures += 1;
            }
        }
        if let Err(e) = self.flush() {
            tracing::warn!("run-state flush failed: {e}");
        }
    }

    pub fn get(&self, source_name: &str) -> Option<CollectorRunState> {
        self.states
            .read()
            .ok()
            .and_then(|s| s.get(source_name).cloned())
    }

    pub fn snapshot(&self) -> Vec<CollectorRunState> {
        self.states
            .read()
            .map(|s| s.values().cloned().collect())
            .unwrap_or_default()
    }

    fn flush(&self) -> CropcastResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let states = self
            .states
            .read()
            .map_err(|e| IoError::FileSystem(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(IoError::Io)?;
        }
        let text = serde_json::to_string_pretty(&*states).map_err(IoError::Json)?;
        std::fs::write(path, text).map_err(IoError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_flips_at_three_failures() {
        let registry = RunStateRegistry::in_memory();
        for _ in 0..2 {
            registry.record_run("comex", false, true, 1);
        }
        assert!(registry.get("comex").unwrap().is_healthy());

        registry.record_run("comex", false, true, 1);
        assert!(!registry.get("comex").unwrap().is_healthy());

        registry.record_run("comex", true, true, 1);
        let state = registry.get("comex").unwrap();
        assert!(state.is_healthy());
        assert_eq!(state.consecutive_failures, 0);
        assert!(state.last_success.is_some());
    }

    #[test]
    fn not_published_runs_do_not_count() {
        let registry = RunStateRegistry::in_memory();
        registry.record_run("indec", false, false, 2);
        let state = registry.get("indec").unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.request_count, 2);
    }
}
