#![allow(dead_code)]

use std::sync::Arc;

use chrono::Utc;
use cropcast::{
    config::Config,
    store::MemoryStore,
    trade::{Flow, TradeRecord},
};
use tempfile::TempDir;

/// A config rooted in a fresh temp directory, plus the guard keeping it alive.
pub fn test_config() -> (Arc<Config>, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let config = Config::builtin(dir.path());
    config.dirs.ensure().expect("create layout");
    (config, dir)
}

pub fn memory_store() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

pub fn trade_record(
    reporter: &str,
    partner: &str,
    flow: Flow,
    hs_code: &str,
    tons: f64,
    value_usd: f64,
) -> TradeRecord {
    let code: String = hs_code.chars().filter(|c| c.is_ascii_digit()).collect();
    TradeRecord {
        data_source: format!("{reporter}_TEST"),
        reporter_country: reporter.to_string(),
        flow,
        year: 2024,
        month: 8,
        period: "2024-08".to_string(),
        hs_level: code.len() as u8,
        hs_code_6: (code.len() >= 6).then(|| code[..6].to_string()),
        hs_code: code,
        partner_country: partner.to_string(),
        quantity_kg: Some(tons * 1000.0),
        quantity_tons: Some(tons),
        value_usd,
        value_fob_usd: (flow == Flow::Export).then_some(value_usd),
        value_cif_usd: (flow == Flow::Import).then_some(value_usd),
        hs_description: None,
        state_region: None,
        customs_office: None,
        provisional: false,
        ingested_at: Utc::now(),
    }
}
