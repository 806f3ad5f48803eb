use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::future::join_all;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tokio::sync::Semaphore;

use crate::{
    collect::{
        contract::Collector,
        sources::{self, TradeCollector, TradeTotals},
        state::RunStateRegistry,
    },
    config::Config,
    error::{CollectError, CropcastError, CropcastResult},
    schedule::{ScheduledTask, TaskOutcome, TaskRunner},
    store::{Store, to_rows},
    trade::{
        balance::{BalanceEntry, BalanceMatrixBuilder},
        harmonize::Harmonizer,
        quality::{QualityAlert, QualityValidator},
        record::{Flow, TradeRecord},
    },
};

/// Concurrent collector bound for a parallel pass.
const MAX_WORKERS: usize = 4;

// ================================================================================================
// Results
// ================================================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct CountryFlowResult {
    pub success: bool,
    pub records_fetched: usize,
    pub records_loaded: usize,
    pub not_published: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HarmonizationSummary {
    pub input_records: usize,
    pub harmonized_records: usize,
    pub balance_entries: usize,
    pub discrepancies: usize,
}

/// Structured outcome of one dated pipeline pass.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub periods_processed: Vec<String>,
    pub countries_processed: Vec<String>,
    pub total_records_fetched: usize,
    pub total_records_loaded: usize,
    pub total_errors: usize,
    pub country_results: BTreeMap<String, BTreeMap<String, CountryFlowResult>>,
    pub harmonization: Option<HarmonizationSummary>,
    pub quality_alerts: Vec<QualityAlert>,
    pub error_message: Option<String>,
}

impl PipelineResult {
    fn start(period: String) -> Self {
        Self {
            success: true,
            start_time: Utc::now(),
            end_time: None,
            periods_processed: vec![period],
            countries_processed: Vec::new(),
            total_records_fetched: 0,
            total_records_loaded: 0,
            total_errors: 0,
            country_results: BTreeMap::new(),
            harmonization: None,
            quality_alerts: Vec::new(),
            error_message: None,
        }
    }
}

/// Aggregated health surface across collectors (`status` CLI verb).
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub enabled_countries: Vec<String>,
    pub collector_states: Vec<crate::collect::state::CollectorRunState>,
}

// ================================================================================================
// Pipeline
// ================================================================================================

/// Drives a dated trade pass: collect (parallel), harmonize, reconcile,
/// validate, persist.
pub struct TradePipeline {
    collectors: BTreeMap<String, Arc<dyn TradeCollector>>,
    store: Arc<dyn Store>,
    harmonizer: Harmonizer,
    balance_builder: BalanceMatrixBuilder,
    validator: QualityValidator,
    run_states: Arc<RunStateRegistry>,
}

impl TradePipeline {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let collectors = sources::trade_collectors(Arc::clone(&app), Arc::clone(&store))?;
        let run_states = Arc::new(RunStateRegistry::persistent(
            app.dirs.data_dir.join("collector_run_state.json"),
        ));
        Ok(Self {
            harmonizer: Harmonizer::new(app.synonyms.clone()),
            balance_builder: BalanceMatrixBuilder::default(),
            validator: QualityValidator::default(),
            collectors,
            store,
            run_states,
        })
    }

    /// Assemble a pipeline over explicit collectors. Used by tests and by
    /// deployments that enable a subset of countries.
    pub fn with_collectors(
        app: Arc<Config>,
        store: Arc<dyn Store>,
        collectors: BTreeMap<String, Arc<dyn TradeCollector>>,
    ) -> Self {
        Self {
            harmonizer: Harmonizer::new(app.synonyms.clone()),
            balance_builder: BalanceMatrixBuilder::default(),
            validator: QualityValidator::default(),
            collectors,
            store,
            run_states: Arc::new(RunStateRegistry::in_memory()),
        }
    }

    pub fn countries(&self) -> Vec<String> {
        self.collectors.keys().cloned().collect()
    }

    /// Run the complete monthly pipeline for one period.
    pub async fn run_monthly(
        &self,
        year: i32,
        month: u32,
        countries: Option<Vec<String>>,
        flows: Option<Vec<Flow>>,
        parallel: bool,
    ) -> PipelineResult {
        let period = TradeRecord::period_of(year, month);
        let mut result = PipelineResult::start(period.clone());

        let countries = countries.unwrap_or_else(|| self.countries());
        let flows = flows.unwrap_or_else(|| vec![Flow::Export, Flow::Import]);
        result.countries_processed = countries.clone();

        tracing::info!(%period, ?countries, ?flows, "starting monthly pipeline");

        // Fan out per country; each country walks its flows sequentially.
        let semaphore = Arc::new(Semaphore::new(if parallel {
            countries.len().clamp(1, MAX_WORKERS)
        } else {
            1
        }));

        let fetches = countries.iter().map(|country| {
            let semaphore = Arc::clone(&semaphore);
            let flows = flows.clone();
            let collector = self.collectors.get(country).cloned();
            let country = country.clone();
            async move {
                let _permit = semaphore.acquire().await.ok();
                let mut flow_results: BTreeMap<String, CountryFlowResult> = BTreeMap::new();
                let mut records = Vec::new();

                let Some(collector) = collector else {
                    for flow in &flows {
                        flow_results.insert(
                            flow.to_string(),
                            CountryFlowResult {
                                error: Some("collector not configured".to_string()),
                                ..CountryFlowResult::default()
                            },
                        );
                    }
                    return (country, flow_results, records, 0u64);
                };

                for flow in &flows {
                    let outcome = Self::fetch_one(collector.as_ref(), year, month, *flow).await;
                    match outcome {
                        Ok(flow_records) => {
                            flow_results.insert(
                                flow.to_string(),
                                CountryFlowResult {
                                    success: true,
                                    records_fetched: flow_records.len(),
                                    records_loaded: flow_records.len(),
                                    ..CountryFlowResult::default()
                                },
                            );
                            records.extend(flow_records);
                        }
                        Err(error) => {
                            let not_published = matches!(
                                &error,
                                CropcastError::Collect(CollectError::NotPublished { .. })
                            );
                            flow_results.insert(
                                flow.to_string(),
                                CountryFlowResult {
                                    not_published,
                                    error: Some(error.to_string()),
                                    ..CountryFlowResult::default()
                                },
                            );
                        }
                    }
                }
                let requests = collector.ctx().http.request_count();
                (country, flow_results, records, requests)
            }
        });

        let mut all_records: Vec<TradeRecord> = Vec::new();
        for (country, flow_results, records, requests) in join_all(fetches).await {
            let success = flow_results.values().any(|r| r.success);
            let not_published_only = !success && flow_results.values().all(|r| r.not_published);
            if let Some(collector) = self.collectors.get(&country) {
                self.run_states.record_run(
                    &collector.config().source_name,
                    success,
                    !not_published_only,
                    requests,
                );
            }

            for flow_result in flow_results.values() {
                result.total_records_fetched += flow_result.records_fetched;
                result.total_records_loaded += flow_result.records_loaded;
                if !flow_result.success {
                    result.total_errors += 1;
                    result.success = false;
                }
            }
            result.country_results.insert(country, flow_results);
            all_records.extend(records);
        }

        // Harmonize, persist, reconcile.
        if !all_records.is_empty() {
            let input_records = all_records.len();
            let (harmonized, warnings) = self.harmonizer.harmonize_records(all_records);
            for warning in &warnings {
                tracing::warn!("harmonization: {warning}");
            }

            let mut summary = HarmonizationSummary {
                input_records,
                harmonized_records: harmonized.len(),
                ..HarmonizationSummary::default()
            };

            if let Err(e) = self.persist_silver(&harmonized) {
                result.success = false;
                result.error_message = Some(e.to_string());
            }

            let entries = self.balance_builder.build(&harmonized);
            summary.balance_entries = entries.len();
            summary.discrepancies = self.balance_builder.discrepancies(&entries).len();
            if let Err(e) = self.persist_balance(&entries) {
                result.success = false;
                result.error_message = Some(e.to_string());
            }

            // Quality pass over the harmonized batch.
            let expected: Vec<(String, Flow)> = result
                .countries_processed
                .iter()
                .flat_map(|c| flows.iter().map(move |f| (c.clone(), *f)))
                .collect();
            let report = self.validator.validate(&harmonized, &expected);
            if !report.passed() {
                result.success = false;
            }
            result.quality_alerts = report.alerts.into_iter().take(100).collect();
            result.harmonization = Some(summary);
        }

        result.end_time = Some(Utc::now());
        let duration = result
            .end_time
            .map(|end| (end - result.start_time).num_milliseconds() as f64 / 1000.0)
            .unwrap_or_default();
        tracing::info!(
            %period,
            loaded = result.total_records_loaded,
            errors = result.total_errors,
            "pipeline complete in {duration:.1}s"
        );
        result
    }

    async fn fetch_one(
        collector: &dyn TradeCollector,
        year: i32,
        month: u32,
        flow: Flow,
    ) -> CropcastResult<Vec<TradeRecord>> {
        let output = collector.fetch_trade(year, month, flow).await?;
        let records = collector.transform_trade(&output.data, flow)?;
        let totals = TradeTotals::of(&records);
        tracing::debug!(
            reporter = collector.reporter(),
            %flow,
            records = totals.records,
            value_usd = totals.value_usd,
            "fetched flow slice"
        );
        Ok(records)
    }

    fn persist_silver(&self, records: &[TradeRecord]) -> CropcastResult<()> {
        let rows = to_rows(records)?;
        self.store
            .upsert(&TradeRecord::table(), &TradeRecord::UNIQUE_COLUMNS, &rows)?;
        Ok(())
    }

    fn persist_balance(&self, entries: &[BalanceEntry]) -> CropcastResult<()> {
        let rows = to_rows(entries)?;
        self.store
            .upsert(&BalanceEntry::table(), &BalanceEntry::UNIQUE_COLUMNS, &rows)?;
        Ok(())
    }

    /// Iterate month by month from the start period to the end period.
    pub async fn run_backfill(
        &self,
        start_year: i32,
        start_month: u32,
        end_year: Option<i32>,
        end_month: Option<u32>,
        countries: Option<Vec<String>>,
    ) -> Vec<PipelineResult> {
        use chrono::Datelike;
        let today = Utc::now().date_naive();
        let end_year = end_year.unwrap_or_else(|| today.year());
        let end_month = end_month.unwrap_or_else(|| today.month().saturating_sub(2).max(1));

        let mut months: Vec<(i32, u32)> = Vec::new();
        let mut cursor = (start_year, start_month);
        while cursor <= (end_year, end_month) {
            months.push(cursor);
            cursor = if cursor.1 == 12 {
                (cursor.0 + 1, 1)
            } else {
                (cursor.0, cursor.1 + 1)
            };
        }

        let bar = ProgressBar::new(months.len() as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")
        {
            bar.set_style(style);
        }

        let mut results = Vec::with_capacity(months.len());
        for (year, month) in months {
            bar.set_message(TradeRecord::period_of(year, month));
            let result = self
                .run_monthly(year, month, countries.clone(), None, true)
                .await;
            results.push(result);
            bar.inc(1);
        }
        bar.finish_and_clear();
        results
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            enabled_countries: self.countries(),
            collector_states: self.run_states.snapshot(),
        }
    }
}

#[async_trait]
impl TaskRunner for TradePipeline {
    async fn run(&self, task: &ScheduledTask, year: i32, month: u32) -> TaskOutcome {
        let result = self
            .run_monthly(year, month, Some(vec![task.source.clone()]), None, false)
            .await;

        let not_published = result
            .country_results
            .values()
            .flat_map(|flows| flows.values())
            .all(|r| r.not_published);

        TaskOutcome {
            success: result.success,
            not_published: !result.success && not_published,
            records_loaded: result.total_records_loaded,
        }
    }
}

/// Derive the target window for an ad-hoc monthly run.
pub fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let end = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    }
    .pred_opt()?;
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_bounds_cover_the_month() {
        let (start, end) = month_bounds(2024, 2).unwrap();
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }
}
