use std::{
    collections::BTreeMap,
    path::{Component, Path, PathBuf},
};

use regex::Regex;
use serde_json::Value;

use crate::config::SecurityPatterns;

/// Outcome of a guard check.
#[derive(Debug, Clone)]
pub struct GuardDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

impl GuardDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            warnings: Vec::new(),
        }
    }

    fn block(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            warnings: Vec::new(),
        }
    }
}

/// Hard barrier in front of the executor: a pattern blocklist over any task
/// payload, a per-task-type allowlist for the sensitive types, and a path
/// check for filesystem operations.
pub struct SecurityGuard {
    blocked: Vec<(Regex, String)>,
    allowed: BTreeMap<String, Vec<Regex>>,
    blocked_directories: Vec<PathBuf>,
    deletable_roots: Vec<PathBuf>,
}

impl SecurityGuard {
    pub fn new(patterns: &SecurityPatterns) -> Self {
        let blocked = patterns
            .blocked
            .iter()
            .filter_map(|p| {
                Regex::new(&format!("(?i){}", p.pattern))
                    .ok()
                    .map(|re| (re, p.reason.clone()))
            })
            .collect::<Vec<_>>();

        let allowed = patterns
            .allowed
            .iter()
            .map(|(task_type, list)| {
                (
                    task_type.clone(),
                    list.iter()
                        .filter_map(|p| Regex::new(&format!("(?i){p}")).ok())
                        .collect(),
                )
            })
            .collect();

        tracing::info!(
            block_patterns = blocked.len(),
            "security guard initialized"
        );
        Self {
            blocked,
            allowed,
            blocked_directories: patterns.blocked_directories.iter().map(PathBuf::from).collect(),
            deletable_roots: patterns.deletable_roots.iter().map(PathBuf::from).collect(),
        }
    }

    /// Check a task payload before execution.
    ///
    /// Blocklist matches reject outright. For task types carrying an
    /// allowlist, the payload must additionally match at least one allowed
    /// pattern.
    pub fn check_task(&self, task_type: &str, payload: &Value) -> GuardDecision {
        let payload_str = payload.to_string();

        for (pattern, reason) in &self.blocked {
            if pattern.is_match(&payload_str) {
                tracing::warn!(task_type, "security guard blocked payload: {reason}");
                return GuardDecision::block(reason.clone());
            }
        }

        if let Some(allowed) = self.allowed.get(task_type) {
            let any_match = allowed.iter().any(|p| p.is_match(&payload_str));
            if !any_match {
                return GuardDecision::block(format!(
                    "payload for task type '{task_type}' matches no allowed operation"
                ));
            }
        }

        GuardDecision::allow()
    }

    /// Reject paths that resolve under a blocklisted directory.
    pub fn check_path(&self, path: &Path) -> GuardDecision {
        let normalized = normalize(path);
        let resolved = std::fs::canonicalize(&normalized).unwrap_or(normalized);

        for blocked in &self.blocked_directories {
            if resolved.starts_with(blocked) {
                return GuardDecision::block(format!(
                    "path {} resolves under blocked directory {}",
                    resolved.display(),
                    blocked.display()
                ));
            }
        }
        GuardDecision::allow()
    }

    /// Delete operations are only permitted under the declared data/temp
    /// roots.
    pub fn check_delete(&self, path: &Path) -> GuardDecision {
        let base = self.check_path(path);
        if !base.allowed {
            return base;
        }
        let normalized = normalize(path);
        let permitted = self
            .deletable_roots
            .iter()
            .any(|root| normalized.starts_with(root));
        if permitted {
            GuardDecision::allow()
        } else {
            GuardDecision::block(format!(
                "delete outside declared data/temp roots: {}",
                normalized.display()
            ))
        }
    }
}

/// Lexical normalization: fold `.` and `..` without touching the filesystem,
/// so traversal cannot smuggle a path past the prefix checks.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn guard() -> SecurityGuard {
        SecurityGuard::new(&SecurityPatterns::default())
    }

    #[test]
    fn blocklist_rejects_recursive_delete() {
        let g = guard();
        let decision = g.check_task("script", &json!({"command": "rm -rf /data"}));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("prohibited"));
    }

    #[test]
    fn blocklist_is_case_insensitive() {
        let g = guard();
        let decision = g.check_task("script", &json!({"command": "RM -RF /"}));
        assert!(!decision.allowed);
    }

    #[test]
    fn credential_echo_is_rejected() {
        let g = guard();
        let decision = g.check_task("script", &json!({"command": "echo $DB_password"}));
        assert!(!decision.allowed);
    }

    #[test]
    fn data_collection_requires_allowlisted_operation() {
        let g = guard();
        let ok = g.check_task(
            "data_collection",
            &json!({"function": "http_get(\"https://api.example.com\")"}),
        );
        assert!(ok.allowed);

        let not_allowed = g.check_task(
            "data_collection",
            &json!({"function": "launch_missiles()"}),
        );
        assert!(!not_allowed.allowed);
    }

    #[test]
    fn benign_script_payload_passes() {
        let g = guard();
        let decision = g.check_task("script", &json!({"function": "rebuild_features", "args": ["corn"]}));
        assert!(decision.allowed);
    }

    #[test]
    fn path_traversal_cannot_escape_blocklist() {
        let g = guard();
        let decision = g.check_path(Path::new("/var/tmp/../../etc/passwd"));
        assert!(!decision.allowed);
    }

    #[test]
    fn deletes_restricted_to_data_roots() {
        let g = guard();
        assert!(g.check_delete(Path::new("data/cache/stale.json")).allowed);
        assert!(!g.check_delete(Path::new("src/lib.rs")).allowed);
    }
}
