mod common;

use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use cropcast::{
    collect::{
        contract::{Collector, CollectorConfig, FetchOutput, FetchRequest, SourceContext},
        sources::TradeCollector,
    },
    error::CropcastResult,
    pipeline::TradePipeline,
    store::{Row, Store, TableRef, from_rows, to_rows},
    trade::{Flow, TradeRecord},
};
use serde_json::{Value, json};

/// A canned collector that serves a fixed record set for its reporter.
struct CannedCollector {
    config: CollectorConfig,
    ctx: SourceContext,
    reporter: &'static str,
    records: Vec<TradeRecord>,
}

impl CannedCollector {
    fn new(
        app: Arc<cropcast::config::Config>,
        store: Arc<dyn Store>,
        reporter: &'static str,
        records: Vec<TradeRecord>,
    ) -> Self {
        let config = CollectorConfig::new(
            &format!("{}_canned", reporter.to_lowercase()),
            "https://example.invalid",
        );
        let ctx = SourceContext::ephemeral(app, store, &config);
        Self {
            config,
            ctx,
            reporter,
            records,
        }
    }
}

#[async_trait]
impl Collector for CannedCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
        let flow: Flow = request.param("flow").unwrap_or("export").parse()?;
        self.fetch_trade(2024, 8, flow).await
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let records = self.transform_trade(data, Flow::Export)?;
        Ok(BTreeMap::from([(TradeRecord::table(), to_rows(&records)?)]))
    }
}

#[async_trait]
impl TradeCollector for CannedCollector {
    fn reporter(&self) -> &'static str {
        self.reporter
    }

    async fn fetch_trade(&self, _year: i32, _month: u32, flow: Flow) -> CropcastResult<FetchOutput> {
        let matching: Vec<&TradeRecord> =
            self.records.iter().filter(|r| r.flow == flow).collect();
        let data = json!({"records": serde_json::to_value(&matching)?});
        Ok(FetchOutput::new(data, matching.len(), &FetchRequest::month(2024, 8)))
    }

    fn transform_trade(&self, data: &Value, flow: Flow) -> CropcastResult<Vec<TradeRecord>> {
        let records: Vec<TradeRecord> =
            serde_json::from_value(data.get("records").cloned().unwrap_or(json!([])))?;
        Ok(records.into_iter().filter(|r| r.flow == flow).collect())
    }
}

fn pipeline_with_canned_data(
    app: Arc<cropcast::config::Config>,
    store: Arc<dyn Store>,
) -> TradePipeline {
    let bra_records = vec![
        common::trade_record("BRA", "China", Flow::Export, "1005.90.10", 1000.0, 250_000.0),
        common::trade_record("BRA", "Egypt", Flow::Export, "1005.90.10", 500.0, 120_000.0),
    ];
    let chn_records = vec![common::trade_record(
        "CHN",
        "Brasil",
        Flow::Import,
        "1005.90.10",
        950.0,
        240_000.0,
    )];

    let mut collectors: BTreeMap<String, Arc<dyn TradeCollector>> = BTreeMap::new();
    collectors.insert(
        "BRA".to_string(),
        Arc::new(CannedCollector::new(
            Arc::clone(&app),
            Arc::clone(&store),
            "BRA",
            bra_records,
        )),
    );
    collectors.insert(
        "CHN".to_string(),
        Arc::new(CannedCollector::new(
            Arc::clone(&app),
            Arc::clone(&store),
            "CHN",
            chn_records,
        )),
    );
    TradePipeline::with_collectors(app, store, collectors)
}

/// Scenario: a monthly pass over canned Brazilian exports produces a
/// successful result, harmonized silver rows, and a balance matrix whose
/// 4% discrepancy stays unflagged at the default threshold.
#[tokio::test]
async fn monthly_pipeline_end_to_end() {
    let (app, _dir) = common::test_config();
    let store: Arc<dyn Store> = common::memory_store();
    let pipeline = pipeline_with_canned_data(Arc::clone(&app), Arc::clone(&store));

    let result = pipeline
        .run_monthly(2024, 8, Some(vec!["BRA".into()]), Some(vec![Flow::Export]), true)
        .await;

    assert!(result.success, "errors: {:?}", result.country_results);
    assert_eq!(result.periods_processed, vec!["2024-08".to_string()]);
    assert!(result.total_records_fetched > 0);

    let harmonization = result.harmonization.expect("harmonization ran");
    assert_eq!(harmonization.harmonized_records, 2);

    let silver: Vec<TradeRecord> = from_rows(store.scan(&TradeRecord::table()).unwrap());
    assert_eq!(silver.len(), 2);
    for record in &silver {
        assert_eq!(record.reporter_country, "BRA");
        assert_eq!(record.flow, Flow::Export);
        assert_eq!(record.period, "2024-08");
        // Partner names resolved to ISO-3 by harmonization.
        assert!(record.partner_country.len() == 3);
        assert_eq!(record.hs_code_6.as_deref(), Some("100590"));
    }
}

/// Both sides reporting produces one matrix entry per (A, B) pair; the
/// 250k vs 240k pair sits at 4% and is not flagged.
#[tokio::test]
async fn balance_matrix_reconciles_both_reporters() {
    let (app, _dir) = common::test_config();
    let store: Arc<dyn Store> = common::memory_store();
    let pipeline = pipeline_with_canned_data(Arc::clone(&app), Arc::clone(&store));

    let result = pipeline.run_monthly(2024, 8, None, None, true).await;
    let harmonization = result.harmonization.expect("harmonization ran");
    // (BRA -> CHN) reconciled pair plus the export-only (BRA -> EGY).
    assert_eq!(harmonization.balance_entries, 2);
    assert_eq!(harmonization.discrepancies, 0);

    let matrix = store
        .scan(&TableRef::gold("trade_balance_matrix"))
        .unwrap();
    let reconciled = matrix
        .iter()
        .find(|row| row["country_b"] == json!("CHN"))
        .expect("BRA->CHN entry");
    assert_eq!(reconciled["export_value_usd"], json!(250_000.0));
    assert_eq!(reconciled["import_value_usd"], json!(240_000.0));
    assert!((reconciled["pct_diff_value"].as_f64().unwrap() - 4.0).abs() < 1e-9);
    assert_eq!(reconciled["flagged"], json!(false));

    let one_sided = matrix
        .iter()
        .find(|row| row["country_b"] == json!("EGY"))
        .expect("BRA->EGY entry");
    assert_eq!(one_sided["import_value_usd"], Value::Null);
}

/// The filtered fetch keeps only records whose canonical stem matches.
#[tokio::test]
async fn hs6_filtered_fetch_narrows_the_record_set() {
    let (app, _dir) = common::test_config();
    let store: Arc<dyn Store> = common::memory_store();
    let records = vec![
        common::trade_record("BRA", "China", Flow::Export, "1005.90.10", 1000.0, 250_000.0),
        common::trade_record("BRA", "China", Flow::Export, "1201.90.00", 2000.0, 900_000.0),
    ];
    let collector = CannedCollector::new(app, store, "BRA", records);

    let filtered = collector
        .fetch_trade_by_hs6(2024, 8, Flow::Export, &["1201.90".to_string()])
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].hs_code_6.as_deref(), Some("120190"));
}

/// Running the same period twice leaves the silver set unchanged (pure
/// upserts, no duplicates).
#[tokio::test]
async fn reruns_are_idempotent() {
    let (app, _dir) = common::test_config();
    let store: Arc<dyn Store> = common::memory_store();
    let pipeline = pipeline_with_canned_data(Arc::clone(&app), Arc::clone(&store));

    pipeline.run_monthly(2024, 8, None, None, true).await;
    let first = store.count(&TradeRecord::table()).unwrap();

    pipeline.run_monthly(2024, 8, None, None, false).await;
    let second = store.count(&TradeRecord::table()).unwrap();

    assert_eq!(first, second);
}
