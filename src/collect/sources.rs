pub mod ams;
pub mod anec;
pub mod census;
pub mod comex;
pub mod dane;
pub mod dna;
pub mod eia;
pub mod epa_echo;
pub mod fas_psd;
pub mod futures;
pub mod indec;
pub mod mpob;
pub mod nass;
pub mod wits;

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    collect::contract::{Collector, FetchOutput},
    config::Config,
    error::CropcastResult,
    store::Store,
    trade::record::{Flow, TradeRecord},
};

/// Per-flow totals used by the consistency check and the pipeline
/// cross-reference step.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TradeTotals {
    pub records: usize,
    pub value_usd: f64,
    pub quantity_tons: f64,
}

impl TradeTotals {
    pub fn of(records: &[TradeRecord]) -> Self {
        Self {
            records: records.len(),
            value_usd: records.iter().map(|r| r.value_usd).sum(),
            quantity_tons: records.iter().filter_map(|r| r.quantity_tons).sum(),
        }
    }
}

/// The trade contract layered on top of the collector lifecycle: fetch one
/// (year, month, flow) slice and transform it into canonical records.
#[async_trait]
pub trait TradeCollector: Collector {
    /// ISO-3 code of the reporting country.
    fn reporter(&self) -> &'static str;

    async fn fetch_trade(&self, year: i32, month: u32, flow: Flow) -> CropcastResult<FetchOutput>;

    fn transform_trade(&self, data: &Value, flow: Flow) -> CropcastResult<Vec<TradeRecord>>;

    /// Fetch a period and keep only records matching a set of 6-digit stems.
    async fn fetch_trade_by_hs6(
        &self,
        year: i32,
        month: u32,
        flow: Flow,
        hs6_codes: &[String],
    ) -> CropcastResult<Vec<TradeRecord>> {
        let output = self.fetch_trade(year, month, flow).await?;
        let records = self.transform_trade(&output.data, flow)?;
        let wanted: Vec<String> = hs6_codes
            .iter()
            .map(|code| {
                code.chars()
                    .filter(|c| c.is_ascii_digit())
                    .take(6)
                    .collect()
            })
            .collect();
        Ok(records
            .into_iter()
            .filter(|r| {
                r.hs_code_6
                    .as_ref()
                    .is_some_and(|h| wanted.iter().any(|w| w == h))
            })
            .collect())
    }
}

/// Instantiate the standard set of trade collectors, keyed by reporter ISO-3.
pub fn trade_collectors(
    app: Arc<Config>,
    store: Arc<dyn Store>,
) -> CropcastResult<BTreeMap<String, Arc<dyn TradeCollector>>> {
    let mut collectors: BTreeMap<String, Arc<dyn TradeCollector>> = BTreeMap::new();
    collectors.insert(
        "BRA".to_string(),
        Arc::new(comex::ComexStatCollector::new(Arc::clone(&app), Arc::clone(&store))?),
    );
    collectors.insert(
        "ARG".to_string(),
        Arc::new(indec::IndecCollector::new(Arc::clone(&app), Arc::clone(&store))?),
    );
    collectors.insert(
        "COL".to_string(),
        Arc::new(dane::DaneCollector::new(Arc::clone(&app), Arc::clone(&store))?),
    );
    collectors.insert(
        "URY".to_string(),
        Arc::new(dna::DnaCollector::new(Arc::clone(&app), Arc::clone(&store))?),
    );
    collectors.insert(
        "PRY".to_string(),
        Arc::new(wits::WitsCollector::new(Arc::clone(&app), Arc::clone(&store))?),
    );
    collectors.insert(
        "USA".to_string(),
        Arc::new(census::CensusTradeCollector::new(app, store)?),
    );
    Ok(collectors)
}
