use std::collections::BTreeMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::{
    store::TableRef,
    trade::record::{Flow, TradeRecord},
};

/// One cell of the reporter↔partner reconciliation matrix.
///
/// For `(period, hs_code_6, country_a, country_b)` there are two observations
/// in principle: A's reported export to B and B's reported import from A. An
/// entry is emitted even when only one side reports; the missing side stays
/// null, never zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceEntry {
    pub period: String,
    pub hs_code_6: String,
    pub country_a: String,
    pub country_b: String,
    pub export_value_usd: Option<f64>,
    pub import_value_usd: Option<f64>,
    pub export_tons: Option<f64>,
    pub import_tons: Option<f64>,
    pub abs_diff_value: Option<f64>,
    /// Percentage (0–100) discrepancy of the value observations.
    pub pct_diff_value: Option<f64>,
    pub flagged: bool,
}

impl BalanceEntry {
    pub fn table() -> TableRef {
        TableRef::gold("trade_balance_matrix")
    }

    pub const UNIQUE_COLUMNS: [&'static str; 4] =
        ["period", "hs_code_6", "country_a", "country_b"];
}

#[derive(Debug, Clone, Copy, Default)]
struct SideTotals {
    value_usd: f64,
    tons: f64,
    has_tons: bool,
}

/// Builds the balance matrix from harmonized records and flags discrepancies
/// above a percentage threshold.
pub struct BalanceMatrixBuilder {
    threshold_pct: f64,
}

impl Default for BalanceMatrixBuilder {
    fn default() -> Self {
        Self { threshold_pct: 10.0 }
    }
}

impl BalanceMatrixBuilder {
    pub fn new(threshold_pct: f64) -> Self {
        Self { threshold_pct }
    }

    pub fn build(&self, records: &[TradeRecord]) -> Vec<BalanceEntry> {
        type Key = (String, String, String, String);
        let mut exports: BTreeMap<Key, SideTotals> = BTreeMap::new();
        let mut imports: BTreeMap<Key, SideTotals> = BTreeMap::new();

        for record in records {
            if record.provisional {
                continue;
            }
            let Some(hs6) = &record.hs_code_6 else {
                continue;
            };
            // Key orientation: (A, B) where A is the exporter side.
            let (key, side) = match record.flow {
                Flow::Export => (
                    (
                        record.period.clone(),
                        hs6.clone(),
                        record.reporter_country.clone(),
                        record.partner_country.clone(),
                    ),
                    &mut exports,
                ),
                Flow::Import => (
                    (
                        record.period.clone(),
                        hs6.clone(),
                        record.partner_country.clone(),
                        record.reporter_country.clone(),
                    ),
                    &mut imports,
                ),
            };
            let totals = side.entry(key).or_default();
            totals.value_usd += record.value_usd;
            if let Some(tons) = record.quantity_tons {
                totals.tons += tons;
                totals.has_tons = true;
            }
        }

        let keys: Vec<Key> = exports
            .keys()
            .chain(imports.keys())
            .cloned()
            .sorted()
            .dedup()
            .collect();

        keys.into_iter()
            .map(|key| {
                let export = exports.get(&key).copied();
                let import = imports.get(&key).copied();

                let export_value = export.map(|s| s.value_usd);
                let import_value = import.map(|s| s.value_usd);

                let (abs_diff, pct_diff) = match (export_value, import_value) {
                    (Some(e), Some(i)) => {
                        let abs = (e - i).abs();
                        let pct = abs / e.max(i).max(f64::EPSILON) * 100.0;
                        (Some(abs), Some(pct))
                    }
                    _ => (None, None),
                };

                let (period, hs_code_6, country_a, country_b) = key;
                BalanceEntry {
                    period,
                    hs_code_6,
                    country_a,
                    country_b,
                    export_value_usd: export_value,
                    import_value_usd: import_value,
                    export_tons: export.filter(|s| s.has_tons).map(|s| s.tons),
                    import_tons: import.filter(|s| s.has_tons).map(|s| s.tons),
                    abs_diff_value: abs_diff,
                    flagged: pct_diff.is_some_and(|p| p > self.threshold_pct),
                    pct_diff_value: pct_diff,
                }
            })
            .collect()
    }

    pub fn discrepancies<'a>(&self, entries: &'a [BalanceEntry]) -> Vec<&'a BalanceEntry> {
        entries.iter().filter(|e| e.flagged).collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn record(
        reporter: &str,
        partner: &str,
        flow: Flow,
        tons: f64,
        value: f64,
    ) -> TradeRecord {
        TradeRecord {
            data_source: "TEST".into(),
            reporter_country: reporter.into(),
            flow,
            year: 2024,
            month: 8,
            period: "2024-08".into(),
            hs_code: "10059010".into(),
            hs_level: 8,
            hs_code_6: Some("100590".into()),
            partner_country: partner.into(),
            quantity_kg: Some(tons * 1000.0),
            quantity_tons: Some(tons),
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
    fn four_percent_discrepancy_is_not_flagged_at_default_threshold() {
        let builder = BalanceMatrixBuilder::default();
        let records = vec![
            record("BRA", "CHN", Flow::Export, 1000.0, 250_000.0),
            record("CHN", "BRA", Flow::Import, 950.0, 240_000.0),
        ];
        let entries = builder.build(&records);
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.country_a, "BRA");
        assert_eq!(entry.country_b, "CHN");
        assert_eq!(entry.export_value_usd, Some(250_000.0));
        assert_eq!(entry.import_value_usd, Some(240_000.0));
        assert!((entry.pct_diff_value.unwrap() - 4.0).abs() < 1e-9);
        assert!(!entry.flagged);
        assert!(builder.discrepancies(&entries).is_empty());
    }

    #[test]
    fn one_sided_entries_keep_the_missing_side_null() {
        let builder = BalanceMatrixBuilder::default();
        let records = vec![record("BRA", "EGY", Flow::Export, 500.0, 120_000.0)];
        let entries = builder.build(&records);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].import_value_usd, None);
        assert_eq!(entries[0].pct_diff_value, None);
        assert!(!entries[0].flagged);
    }

    #[test]
    fn large_discrepancies_are_flagged() {
        let builder = BalanceMatrixBuilder::default();
        let records = vec![
            record("BRA", "CHN", Flow::Export, 1000.0, 250_000.0),
            record("CHN", "BRA", Flow::Import, 700.0, 150_000.0),
        ];
        let entries = builder.build(&records);
        assert!(entries[0].flagged);
        assert_eq!(builder.discrepancies(&entries).len(), 1);
    }

    #[test]
    fn provisional_rows_are_excluded() {
        let builder = BalanceMatrixBuilder::default();
        let mut provisional = record("BRA", "CHN", Flow::Export, 100.0, 10_000.0);
        provisional.provisional = true;
        assert!(builder.build(&[provisional]).is_empty());
    }
}
