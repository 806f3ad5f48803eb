use std::{collections::BTreeMap, path::Path, sync::Arc};

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    audit::{AuditLog, LogAction, LogLevel, LogRecord, generate_run_id, read_log},
    config::Config,
    error::CropcastResult,
};

// ================================================================================================
// Severity Rules
// ================================================================================================

/// Mismatch severity. The rules mapping field names to severities are data
/// loaded from configuration, not code.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum VerifyMode {
    Sample,
    Full,
}

#[derive(Debug, Clone)]
pub struct CheckerConfig {
    pub checker_name: String,
    pub mode: VerifyMode,
    /// Percentage of targets verified in sample mode, minimum one.
    pub sample_percentage: u32,
    /// Field name -> severity; unmatched fields default to LOW.
    pub severity_rules: BTreeMap<String, Severity>,
}

impl CheckerConfig {
    pub fn new(checker_name: &str) -> Self {
        Self {
            checker_name: checker_name.to_string(),
            mode: VerifyMode::Sample,
            sample_percentage: 20,
            severity_rules: BTreeMap::new(),
        }
    }

    pub fn full(mut self) -> Self {
        self.mode = VerifyMode::Full;
        self
    }

    pub fn with_rule(mut self, field: &str, severity: Severity) -> Self {
        self.severity_rules.insert(field.to_string(), severity);
        self
    }

    /// Load rules from the severity -> field-list table shape the config
    /// files use (`{"HIGH": ["AIRName"], "MEDIUM": [...]}`).
    pub fn with_rules_table(mut self, table: &BTreeMap<Severity, Vec<String>>) -> Self {
        for (severity, fields) in table {
            for field in fields {
                self.severity_rules.insert(field.clone(), *severity);
            }
        }
        self
    }
}

// ================================================================================================
// Targets & Results
// ================================================================================================

/// One saved record to re-verify against its upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationTarget {
    pub record_id: String,
    pub facility_name: String,
    pub source_endpoint: String,
    pub verification_url: String,
    pub saved_values: Map<String, Value>,
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mismatch {
    pub field: String,
    pub saved: Value,
    pub fresh: Value,
    pub severity: Severity,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckerResult {
    pub success: bool,
    pub run_id: String,
    pub collector_log_file: String,
    pub records_checked: usize,
    pub records_matched: usize,
    pub records_mismatched: usize,
    pub records_source_unavailable: usize,
    pub high_severity_count: usize,
    pub mismatches: Vec<(String, Vec<Mismatch>)>,
}

/// Re-fetches the current upstream state of one saved record.
///
/// Implementations use the collector contract but never write through to
/// storage. `Ok(None)` means the source did not return the record.
#[async_trait]
pub trait FreshFetcher: Send + Sync {
    async fn fetch_fresh(
        &self,
        target: &VerificationTarget,
    ) -> CropcastResult<Option<Map<String, Value>>>;
}

// ================================================================================================
// Checker
// ================================================================================================

/// Replays a collector's audit log and verifies saved records against fresh
/// upstream fetches, classifying mismatches by the severity-rule table.
pub struct Checker {
    config: CheckerConfig,
    audit: Arc<AuditLog>,
    run_id: String,
}

impl Checker {
    pub fn new(app: &Config, config: CheckerConfig) -> CropcastResult<Self> {
        let run_id = generate_run_id();
        let audit = Arc::new(AuditLog::create(
            &app.dirs.log_dir,
            &config.checker_name,
            &run_id,
        )?);
        Ok(Self {
            config,
            audit,
            run_id,
        })
    }

    pub fn in_memory(config: CheckerConfig) -> Self {
        let run_id = generate_run_id();
        let audit = Arc::new(AuditLog::in_memory(&config.checker_name, &run_id));
        Self {
            config,
            audit,
            run_id,
        }
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Materialize verification targets from DATA_SAVE / DATA_UPDATE entries.
    pub fn extract_targets(entries: &[LogRecord]) -> Vec<VerificationTarget> {
        let mut targets = Vec::new();
        for entry in entries {
            if entry.action != LogAction::DataSave && entry.action != LogAction::DataUpdate {
                continue;
            }
            let details = &entry.details;
            let saved_values = details
                .get("new_values")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let record_ids: Vec<String> = details
                .get("affected_record_ids")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            for record_id in record_ids {
                targets.push(VerificationTarget {
                    record_id,
                    facility_name: details
                        .get("facility_name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    source_endpoint: details
                        .get("source_endpoint")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    verification_url: details
                        .get("verification_url")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    saved_values: saved_values.clone(),
                    action: entry.action.to_string(),
                });
            }
        }
        targets
    }

    /// Sample-mode selection: random `sample_percentage`% of targets, at
    /// least one.
    fn select_sample(&self, mut targets: Vec<VerificationTarget>) -> Vec<VerificationTarget> {
        if self.config.mode == VerifyMode::Full || targets.is_empty() {
            return targets;
        }
        let sample_size =
            ((targets.len() * self.config.sample_percentage as usize) / 100).max(1);
        let mut rng = rand::rng();
        targets.shuffle(&mut rng);
        targets.truncate(sample_size.min(targets.len()));
        targets
    }

    /// Field-by-field comparison. A field empty on either side is skipped:
    /// the source may simply not have provided it this run.
    pub fn compare(
        saved: &Map<String, Value>,
        fresh: &Map<String, Value>,
        rules: &BTreeMap<String, Severity>,
    ) -> Vec<Mismatch> {
        let mut mismatches = Vec::new();
        for (field, saved_value) in saved {
            let fresh_value = fresh.get(field).cloned().unwrap_or(Value::Null);
            if is_empty(saved_value) || is_empty(&fresh_value) {
                continue;
            }
            if !values_equal(saved_value, &fresh_value) {
                mismatches.push(Mismatch {
                    field: field.clone(),
                    saved: saved_value.clone(),
                    fresh: fresh_value,
                    severity: rules.get(field).copied().unwrap_or(Severity::Low),
                });
            }
        }
        mismatches
    }

    /// Verify a collector log end to end.
    pub async fn check(
        &self,
        collector_log: &Path,
        fetcher: &dyn FreshFetcher,
    ) -> CropcastResult<CheckerResult> {
        let entries = read_log(collector_log)?;
        let collector_run_id = entries
            .first()
            .map(|e| e.run_id.clone())
            .unwrap_or_default();
        let all_targets = Self::extract_targets(&entries);
        let total_targets = all_targets.len();
        let targets = self.select_sample(all_targets);

        self.audit.record(
            LogLevel::Info,
            LogAction::VerificationStart,
            json!({
                "description": format!(
                    "Verifying {} of {} saved records from run {}",
                    targets.len(), total_targets, collector_run_id
                ),
                "collector_log": collector_log.display().to_string(),
                "collector_run_id": collector_run_id,
                "mode": self.config.mode.to_string(),
            }),
        );

        let mut result = CheckerResult {
            run_id: self.run_id.clone(),
            collector_log_file: collector_log.display().to_string(),
            ..CheckerResult::default()
        };

        for target in &targets {
            result.records_checked += 1;

            let fresh = match fetcher.fetch_fresh(target).await {
                Ok(Some(fresh)) => fresh,
                Ok(None) | Err(_) => {
                    result.records_source_unavailable += 1;
                    self.audit.record(
                        LogLevel::Warn,
                        LogAction::VerificationResult,
                        json!({
                            "description": format!(
                                "Source unavailable for {}", target.record_id
                            ),
                            "record_id": target.record_id,
                            "facility_name": target.facility_name,
                            "status": "source_unavailable",
                        }),
                    );
                    continue;
                }
            };

            let mismatches =
                Self::compare(&target.saved_values, &fresh, &self.config.severity_rules);
            if mismatches.is_empty() {
                result.records_matched += 1;
                self.audit.record(
                    LogLevel::Info,
                    LogAction::VerificationResult,
                    json!({
                        "description": format!("Match for {}", target.record_id),
                        "record_id": target.record_id,
                        "facility_name": target.facility_name,
                        "status": "match",
                    }),
                );
            } else {
                result.records_mismatched += 1;
                result.high_severity_count += mismatches
                    .iter()
                    .filter(|m| m.severity == Severity::High)
                    .count();
                self.audit.record(
                    LogLevel::Warn,
                    LogAction::VerificationResult,
                    json!({
                        "description": format!(
                            "{} field mismatch(es) for {}",
                            mismatches.len(), target.record_id
                        ),
                        "record_id": target.record_id,
                        "facility_name": target.facility_name,
                        "status": "mismatch",
                        "mismatches": mismatches,
                    }),
                );
                result
                    .mismatches
                    .push((target.record_id.clone(), mismatches));
            }
        }

        result.success = result.high_severity_count == 0;
        self.audit.record(
            LogLevel::Info,
            LogAction::Shutdown,
            json!({
                "description": format!(
                    "Verification complete: {} checked, {} matched, {} mismatched, {} unavailable",
                    result.records_checked,
                    result.records_matched,
                    result.records_mismatched,
                    result.records_source_unavailable,
                ),
                "records_checked": result.records_checked,
                "records_matched": result.records_matched,
                "records_mismatched": result.records_mismatched,
                "records_source_unavailable": result.records_source_unavailable,
                "high_severity_count": result.high_severity_count,
            }),
        );

        Ok(result)
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Loose equality: numeric values compare as f64, strings after trimming,
/// anything else strictly.
fn values_equal(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return (x - y).abs() < 1e-9;
    }
    if let (Value::String(x), Value::String(y)) = (a, b) {
        return x.trim() == y.trim();
    }
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mismatch_severity_follows_rules() {
        let rules = BTreeMap::from([("AIRName".to_string(), Severity::High)]);
        let saved = json!({"AIRName": "ACME PROCESSORS", "AIRCity": "AMES"});
        let fresh = json!({"AIRName": "ACME PROCESSING LLC", "AIRCity": "AMES"});

        let mismatches = Checker::compare(
            saved.as_object().unwrap(),
            fresh.as_object().unwrap(),
            &rules,
        );
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].field, "AIRName");
        assert_eq!(mismatches[0].severity, Severity::High);
    }

    #[test]
    fn empty_fields_are_skipped() {
        let rules = BTreeMap::new();
        let saved = json!({"a": "", "b": null, "c": "x"});
        let fresh = json!({"a": "fresh", "b": "fresh", "c": ""});
        let mismatches = Checker::compare(
            saved.as_object().unwrap(),
            fresh.as_object().unwrap(),
            &rules,
        );
        assert!(mismatches.is_empty());
    }

    #[test]
    fn numeric_strings_compare_loosely() {
        assert!(values_equal(&json!("42"), &json!("42")));
        assert!(values_equal(&json!(42.0), &json!(42)));
        assert!(!values_equal(&json!("42"), &json!("43")));
    }

    #[test]
    fn unmatched_fields_default_low() {
        let rules = BTreeMap::new();
        let saved = json!({"x": 1});
        let fresh = json!({"x": 2});
        let mismatches = Checker::compare(
            saved.as_object().unwrap(),
            fresh.as_object().unwrap(),
            &rules,
        );
        assert_eq!(mismatches[0].severity, Severity::Low);
    }
}
