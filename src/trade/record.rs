use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::store::TableRef;

/// Direction of a trade flow, seen from the reporter.
///
/// The flow determines which valuation is authoritative: exports are valued
/// FOB, imports CIF (with FOB fallback).
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    Export,
    Import,
}

/// One monthly (or annual) trade flow line in canonical silver form.
///
/// Every per-country collector transforms into this shape; the harmonizer
/// then fills the derived fields (`hs_code_6`, `quantity_tons`, `value_usd`)
/// and resolves partner names to ISO-3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub data_source: String,
    /// ISO-3 code of the reporting country.
    pub reporter_country: String,
    pub flow: Flow,
    pub year: i32,
    pub month: u32,
    /// `YYYY-MM`.
    pub period: String,
    /// Full national code (NCM, HTS, ...) with separators stripped.
    pub hs_code: String,
    pub hs_level: u8,
    /// Left-6 canonical stem; `None` when the national code is shorter.
    pub hs_code_6: Option<String>,
    pub partner_country: String,
    pub quantity_kg: Option<f64>,
    pub quantity_tons: Option<f64>,
    pub value_usd: f64,
    pub value_fob_usd: Option<f64>,
    pub value_cif_usd: Option<f64>,
    pub hs_description: Option<String>,
    pub state_region: Option<String>,
    pub customs_office: Option<String>,
    /// Set for rows recovered through lossy parsing (e.g. the PDF regex
    /// fallback). Provisional rows are excluded from balance matrices.
    #[serde(default)]
    pub provisional: bool,
    pub ingested_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn table() -> TableRef {
        TableRef::silver("trade_flows")
    }

    /// Upsert key of the silver trade table.
    pub const UNIQUE_COLUMNS: [&'static str; 8] = [
        "data_source",
        "reporter_country",
        "flow",
        "year",
        "month",
        "hs_code",
        "partner_country",
        "state_region",
    ];

    pub fn period_of(year: i32, month: u32) -> String {
        format!("{year}-{month:02}")
    }

    /// Implied unit price in USD per metric ton, when computable.
    pub fn unit_price(&self) -> Option<f64> {
        match self.quantity_tons {
            Some(tons) if tons > 0.0 => Some(self.value_usd / tons),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Flow::Export).unwrap(), "\"export\"");
        assert_eq!("import".parse::<Flow>().unwrap(), Flow::Import);
    }

    #[test]
    fn period_formatting_pads_month() {
        assert_eq!(TradeRecord::period_of(2024, 8), "2024-08");
        assert_eq!(TradeRecord::period_of(2024, 11), "2024-11");
    }
}
