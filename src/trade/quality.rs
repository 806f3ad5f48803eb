use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::trade::record::{Flow, TradeRecord};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Range/sanity violation that invalidates the batch.
    Fatal,
    /// Advisory: outliers, low totals, duplicates.
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAlert {
    pub severity: AlertSeverity,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub records_checked: usize,
    pub fatal_count: usize,
    pub warning_count: usize,
    pub alerts: Vec<QualityAlert>,
    /// Expected (country, flow) pairs that produced no records this period.
    pub missing_pairs: Vec<(String, Flow)>,
}

impl QualityReport {
    pub fn passed(&self) -> bool {
        self.fatal_count == 0
    }
}

/// Batch validator: schema, range, per-commodity sanity, cross-reference
/// totals, duplicates, and z-score outlier detection.
pub struct QualityValidator {
    pub zscore_threshold: f64,
    pub deviation_threshold_pct: f64,
    /// Reasonableness floor for total value per (reporter, flow), USD.
    pub min_total_value_usd: f64,
}

impl Default for QualityValidator {
    fn default() -> Self {
        Self {
            zscore_threshold: 3.0,
            deviation_threshold_pct: 200.0,
            min_total_value_usd: 10_000.0,
        }
    }
}

impl QualityValidator {
    pub fn validate(
        &self,
        records: &[TradeRecord],
        expected_pairs: &[(String, Flow)],
    ) -> QualityReport {
        let mut report = QualityReport {
            records_checked: records.len(),
            ..QualityReport::default()
        };

        self.check_schema(records, &mut report);
        self.check_ranges(records, &mut report);
        self.check_duplicates(records, &mut report);
        self.check_totals(records, &mut report);
        self.check_outliers(records, &mut report);
        self.check_completeness(records, expected_pairs, &mut report);

        report.fatal_count = report
            .alerts
            .iter()
            .filter(|a| a.severity == AlertSeverity::Fatal)
            .count();
        report.warning_count = report.alerts.len() - report.fatal_count;
        report
    }

    fn push(report: &mut QualityReport, severity: AlertSeverity, code: &str, message: String) {
        report.alerts.push(QualityAlert {
            severity,
            code: code.to_string(),
            message,
        });
    }

    fn check_schema(&self, records: &[TradeRecord], report: &mut QualityReport) {
        for record in records {
            if record.month < 1 || record.month > 12 {
                Self::push(
                    report,
                    AlertSeverity::Fatal,
                    "schema.month",
                    format!("{}: month {} out of range", record.period, record.month),
                );
            }
            if let Some(hs6) = &record.hs_code_6 {
                if hs6.len() != 6 {
                    Self::push(
                        report,
                        AlertSeverity::Fatal,
                        "schema.hs6",
                        format!("{}: hs_code_6 '{}' is not 6 digits", record.hs_code, hs6),
                    );
                }
            }
            if let (Some(kg), Some(tons)) = (record.quantity_kg, record.quantity_tons) {
                if tons > 0.0 && ((tons - kg / 1000.0).abs() / tons) >= 1e-6 {
                    Self::push(
                        report,
                        AlertSeverity::Fatal,
                        "schema.quantity",
                        format!(
                            "{} {}: quantity_tons {} disagrees with quantity_kg {}",
                            record.reporter_country, record.hs_code, tons, kg
                        ),
                    );
                }
            }
        }
    }

    fn check_ranges(&self, records: &[TradeRecord], report: &mut QualityReport) {
        for record in records {
            if record.value_usd < 0.0 {
                Self::push(
                    report,
                    AlertSeverity::Fatal,
                    "range.value",
                    format!(
                        "{} {} {}: negative value {}",
                        record.reporter_country, record.period, record.hs_code, record.value_usd
                    ),
                );
            }
            if record.quantity_tons.is_some_and(|t| t < 0.0) {
                Self::push(
                    report,
                    AlertSeverity::Fatal,
                    "range.quantity",
                    format!(
                        "{} {} {}: negative quantity",
                        record.reporter_country, record.period, record.hs_code
                    ),
                );
            }
            if record.unit_price().is_some_and(|p| p < 0.0) {
                Self::push(
                    report,
                    AlertSeverity::Fatal,
                    "sanity.price",
                    format!(
                        "{} {} {}: negative implied price",
                        record.reporter_country, record.period, record.hs_code
                    ),
                );
            }
        }
    }

    fn check_duplicates(&self, records: &[TradeRecord], report: &mut QualityReport) {
        let mut seen = BTreeSet::new();
        for record in records {
            let key = (
                record.data_source.clone(),
                record.reporter_country.clone(),
                record.flow,
                record.period.clone(),
                record.hs_code.clone(),
                record.partner_country.clone(),
                record.state_region.clone(),
            );
            if !seen.insert(key) {
                Self::push(
                    report,
                    AlertSeverity::Warning,
                    "duplicate",
                    format!(
                        "duplicate record {} {} {} -> {}",
                        record.reporter_country, record.period, record.hs_code,
                        record.partner_country
                    ),
                );
            }
        }
    }

    fn check_totals(&self, records: &[TradeRecord], report: &mut QualityReport) {
        let mut totals: BTreeMap<(String, Flow), f64> = BTreeMap::new();
        for record in records {
            *totals
                .entry((record.reporter_country.clone(), record.flow))
                .or_default() += record.value_usd;
        }
        for ((reporter, flow), total) in totals {
            if total < self.min_total_value_usd {
                Self::push(
                    report,
                    AlertSeverity::Warning,
                    "crossref.total",
                    format!(
                        "{reporter} {flow}: total value ${total:.0} below floor ${:.0}",
                        self.min_total_value_usd
                    ),
                );
            }
        }
    }

    /// Z-score outliers of value within (reporter, flow, hs6) groups.
    fn check_outliers(&self, records: &[TradeRecord], report: &mut QualityReport) {
        let mut groups: BTreeMap<(String, Flow, String), Vec<&TradeRecord>> = BTreeMap::new();
        for record in records {
            if let Some(hs6) = &record.hs_code_6 {
                groups
                    .entry((record.reporter_country.clone(), record.flow, hs6.clone()))
                    .or_default()
                    .push(record);
            }
        }

        for ((reporter, flow, hs6), group) in groups {
            if group.len() < 4 {
                continue;
            }
            let values: Vec<f64> = group.iter().map(|r| r.value_usd).collect();
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            let variance =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            let std = variance.sqrt();
            if std <= f64::EPSILON {
                continue;
            }

            for record in &group {
                let z = (record.value_usd - mean) / std;
                let deviation_pct = if mean.abs() > f64::EPSILON {
                    (record.value_usd - mean).abs() / mean.abs() * 100.0
                } else {
                    0.0
                };
                if z.abs() > self.zscore_threshold && deviation_pct > self.deviation_threshold_pct
                {
                    Self::push(
                        report,
                        AlertSeverity::Warning,
                        "outlier.zscore",
                        format!(
                            "{reporter} {flow} {hs6} -> {}: value ${:.0} is {z:.1} sigma from group mean (${mean:.0})",
                            record.partner_country, record.value_usd
                        ),
                    );
                }
            }
        }
    }

    fn check_completeness(
        &self,
        records: &[TradeRecord],
        expected_pairs: &[(String, Flow)],
        report: &mut QualityReport,
    ) {
        let present: BTreeSet<(String, Flow)> = records
            .iter()
            .map(|r| (r.reporter_country.clone(), r.flow))
            .collect();
        for pair in expected_pairs {
            if !present.contains(pair) {
                Self::push(
                    report,
                    AlertSeverity::Warning,
                    "completeness",
                    format!("expected {} {} produced no records", pair.0, pair.1),
                );
                report.missing_pairs.push(pair.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn record(value: f64, partner: &str) -> TradeRecord {
        TradeRecord {
            data_source: "TEST".into(),
            reporter_country: "BRA".into(),
            flow: Flow::Export,
            year: 2024,
            month: 8,
            period: "2024-08".into(),
            hs_code: "12019000".into(),
            hs_level: 8,
            hs_code_6: Some("120190".into()),
            partner_country: partner.into(),
            quantity_kg: Some(1000.0),
            quantity_tons: Some(1.0),
            value_usd: value,
            value_fob_usd: None,
            value_cif_usd: None,
            hs_description: None,
            state_region: None,
            customs_office: None,
            provisional: false,
            ingested_at: Utc::now(),
        }
    }

    #[test]
    fn negative_value_is_fatal() {
        let validator = QualityValidator::default();
        let report = validator.validate(&[record(-5.0, "CHN")], &[]);
        assert!(!report.passed());
        assert!(report.alerts.iter().any(|a| a.code == "range.value"));
    }

    #[test]
    fn clean_batch_passes_with_low_total_warning() {
        let validator = QualityValidator::default();
        let report = validator.validate(&[record(5000.0, "CHN")], &[]);
        assert!(report.passed());
        assert!(report.alerts.iter().any(|a| a.code == "crossref.total"));
    }

    #[test]
    fn duplicates_are_warned() {
        let validator = QualityValidator::default();
        let report = validator.validate(&[record(20_000.0, "CHN"), record(20_000.0, "CHN")], &[]);
        assert!(report.alerts.iter().any(|a| a.code == "duplicate"));
        assert!(report.passed());
    }

    #[test]
    fn extreme_outlier_is_detected() {
        let validator = QualityValidator::default();
        let mut records: Vec<TradeRecord> = (0..10)
            .map(|i| record(100_000.0 + i as f64, &format!("P{i}")))
            .collect();
        records.push(record(900_000_000.0, "OUT"));
        let report = validator.validate(&records, &[]);
        assert!(report.alerts.iter().any(|a| a.code == "outlier.zscore"));
    }

    #[test]
    fn missing_expected_pair_is_reported() {
        let validator = QualityValidator::default();
        let expected = vec![("BRA".to_string(), Flow::Export), ("ARG".to_string(), Flow::Export)];
        let report = validator.validate(&[record(20_000.0, "CHN")], &expected);
        assert_eq!(report.missing_pairs, vec![("ARG".to_string(), Flow::Export)]);
    }
}
