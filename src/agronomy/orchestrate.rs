use std::{collections::BTreeMap, sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};

use crate::{
    agronomy::{
        calendar::{Crop, date_to_nass_week},
        features::FeatureEngine,
        model::{YieldModel, YieldPrediction},
    },
    audit::generate_run_id,
    config::Config,
    error::CropcastResult,
    store::{Layer, Store, TableRef},
};

/// Bronze sources whose freshness the weekly pass reports on.
const WATCHED_SOURCES: [&str; 5] = [
    "nass_crop_condition",
    "nass_crop_progress",
    "nass_state_yields",
    "weather_email_extract",
    "ndvi_observation",
];

/// A table is called stale when its newest row is older than this.
const STALE_AFTER_DAYS: i64 = 14;

#[derive(Debug, Clone, Serialize)]
pub struct FreshnessEntry {
    pub table: String,
    pub rows: usize,
    pub latest: Option<DateTime<Utc>>,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct YieldAlert {
    pub commodity: String,
    pub state: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CropRunSummary {
    pub crop: Crop,
    pub predictions: usize,
    pub avg_vs_trend_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct YieldRunSummary {
    pub run_id: String,
    pub success: bool,
    pub forecast_week: u32,
    pub year: i32,
    pub freshness: Vec<FreshnessEntry>,
    pub feature_rows_built: usize,
    pub crops: Vec<CropRunSummary>,
    pub predictions_saved: usize,
    pub alerts: Vec<YieldAlert>,
    pub duration_seconds: f64,
    pub errors: Vec<String>,
}

/// The weekly forecasting pass: freshness check → feature build → predict →
/// persist → alerts.
pub struct YieldOrchestrator {
    app: Arc<Config>,
    store: Arc<dyn Store>,
    engine: FeatureEngine,
    model: YieldModel,
}

impl YieldOrchestrator {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> Self {
        let engine = FeatureEngine::new(Arc::clone(&app), Arc::clone(&store));
        let model = YieldModel::new(Arc::clone(&app), Arc::clone(&store));
        Self {
            app: Arc::clone(&app),
            store,
            engine,
            model,
        }
    }

    pub fn run(
        &self,
        week: Option<u32>,
        year: Option<i32>,
        crops: Option<Vec<Crop>>,
        states: Option<Vec<String>>,
    ) -> CropcastResult<YieldRunSummary> {
        use chrono::Datelike;
        let started = Instant::now();
        let run_id = generate_run_id();
        let today = Utc::now().date_naive();
        let year = year.unwrap_or_else(|| today.year());
        let week = week.unwrap_or_else(|| date_to_nass_week(today));
        let crops = crops.unwrap_or_else(|| {
            vec![Crop::Corn, Crop::Soybeans, Crop::WinterWheat, Crop::Cotton]
        });

        tracing::info!(run_id, year, week, "starting weekly yield pass");
        let mut errors = Vec::new();

        // 1. Freshness over bronze sources plus the derived layers.
        let freshness = self.freshness()?;
        for entry in freshness.iter().filter(|f| f.stale) {
            tracing::warn!(table = %entry.table, "input table is stale");
        }

        // 2. Feature build over the trailing three weeks.
        let week_start = week.saturating_sub(2).max(1);
        let mut feature_rows = 0usize;
        for crop in &crops {
            match self.build_crop_features(*crop, year, week_start, week, states.as_deref()) {
                Ok(rows) => feature_rows += rows,
                Err(e) => errors.push(format!("{crop}: feature build failed: {e}")),
            }
        }

        // 3. Predict per crop.
        let mut crop_summaries = Vec::new();
        let mut all_predictions: Vec<YieldPrediction> = Vec::new();
        for crop in &crops {
            match self.model.predict(*crop, year, week, states.as_deref()) {
                Ok(predictions) => {
                    let avg = if predictions.is_empty() {
                        None
                    } else {
                        Some(
                            predictions.iter().map(|p| p.vs_trend_pct).sum::<f64>()
                                / predictions.len() as f64,
                        )
                    };
                    crop_summaries.push(CropRunSummary {
                        crop: *crop,
                        predictions: predictions.len(),
                        avg_vs_trend_pct: avg,
                    });
                    all_predictions.extend(predictions);
                }
                Err(e) => errors.push(format!("{crop}: prediction failed: {e}")),
            }
        }

        // 4. Persist and derive alerts.
        let predictions_saved = if all_predictions.is_empty() {
            0
        } else {
            self.model.save_predictions(&all_predictions, &run_id)?
        };
        let alerts = Self::alerts(&all_predictions);

        // 5. Model-run bookkeeping row.
        let duration = started.elapsed().as_secs_f64();
        let crops_processed = crops
            .iter()
            .map(Crop::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut run_row = serde_json::Map::new();
        run_row.insert("run_id".into(), json!(run_id));
        run_row.insert("model_version".into(), json!("v1"));
        run_row.insert("model_type".into(), json!("ensemble"));
        run_row.insert("crops_processed".into(), json!(crops_processed));
        run_row.insert("forecast_week".into(), json!(week));
        run_row.insert("feature_count".into(), json!(feature_rows));
        run_row.insert("duration_sec".into(), json!((duration * 10.0).round() / 10.0));
        run_row.insert("created_at".into(), json!(Utc::now()));
        self.store.upsert(
            &TableRef::silver("yield_model_run"),
            &["run_id"],
            std::slice::from_ref(&run_row),
        )?;

        Ok(YieldRunSummary {
            success: errors.is_empty(),
            run_id,
            forecast_week: week,
            year,
            freshness,
            feature_rows_built: feature_rows,
            crops: crop_summaries,
            predictions_saved,
            alerts,
            duration_seconds: duration,
            errors,
        })
    }

    fn build_crop_features(
        &self,
        crop: Crop,
        year: i32,
        week_start: u32,
        week_end: u32,
        states: Option<&[String]>,
    ) -> CropcastResult<usize> {
        // Respect an explicit state list; otherwise discover from yields.
        if let Some(states) = states {
            let mut rows = 0;
            for state in states {
                rows += self
                    .engine
                    .build_features(state, crop, year, week_start, week_end)?;
            }
            return Ok(rows);
        }
        let summary = self
            .engine
            .build_all_features(year, Some(vec![crop]), None)?;
        Ok(summary.get(&crop).map(|(rows, _)| *rows).unwrap_or(0))
    }

    /// Alerts for forecasts far from trend or driven by acute stress, deduped
    /// per (commodity, state) and capped at 20.
    fn alerts(predictions: &[YieldPrediction]) -> Vec<YieldAlert> {
        let mut seen: BTreeMap<(String, String), ()> = BTreeMap::new();
        let mut alerts = Vec::new();

        for p in predictions {
            let stress_driver =
                p.primary_driver == "Drought stress" || p.primary_driver == "Heat stress";
            if p.vs_trend_pct.abs() <= 10.0 && !stress_driver {
                continue;
            }
            let key = (p.commodity.clone(), p.state.clone());
            if seen.contains_key(&key) {
                continue;
            }
            seen.insert(key, ());
            alerts.push(YieldAlert {
                commodity: p.commodity.clone(),
                state: p.state.clone(),
                message: format!(
                    "{} {}: forecast {:.1} ({:+.1}% vs trend) — {}",
                    p.commodity, p.state, p.yield_forecast, p.vs_trend_pct, p.primary_driver
                ),
            });
            if alerts.len() >= 20 {
                break;
            }
        }
        alerts
    }

    /// Latest-row ages across the watched bronze sources and derived tables.
    pub fn freshness(&self) -> CropcastResult<Vec<FreshnessEntry>> {
        let mut tables: Vec<TableRef> = WATCHED_SOURCES
            .iter()
            .map(|name| TableRef::new(Layer::Bronze, name))
            .collect();
        tables.push(TableRef::silver("yield_features"));
        tables.push(TableRef::gold("yield_forecast"));

        let now = Utc::now();
        let mut entries = Vec::with_capacity(tables.len());
        for table in tables {
            let rows = self.store.scan(&table)?;
            let latest = rows
                .iter()
                .filter_map(|row| {
                    row.get("ingested_at")
                        .or_else(|| row.get("updated_at"))
                        .or_else(|| row.get("created_at"))
                        .and_then(Value::as_str)
                        .and_then(|s| s.parse::<DateTime<Utc>>().ok())
                })
                .max();
            let stale = latest
                .map(|l| (now - l).num_days() > STALE_AFTER_DAYS)
                .unwrap_or(true);
            entries.push(FreshnessEntry {
                table: table.to_string(),
                rows: rows.len(),
                latest,
                stale,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use crate::{agronomy::calendar::nass_week_to_date, store::MemoryStore};

    use super::*;

    fn prediction(state: &str, vs_trend: f64, driver: &str) -> YieldPrediction {
        YieldPrediction {
            commodity: "CORN".into(),
            state: state.into(),
            year: 2025,
            forecast_week: 30,
            forecast_date: nass_week_to_date(2025, 30),
            yield_forecast: 180.0 * (1.0 + vs_trend / 100.0),
            yield_low: 160.0,
            yield_high: 200.0,
            trend_yield: 180.0,
            vs_trend_pct: vs_trend,
            last_year_yield: None,
            vs_last_year_pct: None,
            model_type: "ensemble".into(),
            confidence: 0.8,
            primary_driver: driver.into(),
            analog_years: String::new(),
        }
    }

    #[test]
    fn alerts_fire_on_trend_departure_or_stress() {
        let predictions = vec![
            prediction("IA", -12.0, "Drought stress"),
            prediction("IL", 2.0, "Normal conditions"),
            prediction("NE", 3.0, "Heat stress"),
            prediction("NE", 3.0, "Heat stress"),
        ];
        let alerts = YieldOrchestrator::alerts(&predictions);
        // IA (trend departure + drought), NE (heat) — IL quiet, NE deduped.
        assert_eq!(alerts.len(), 2);
        assert!(alerts[0].message.contains("Drought stress"));
    }

    #[test]
    fn alert_cap_is_twenty() {
        let predictions: Vec<YieldPrediction> = (0..30)
            .map(|i| prediction(&format!("S{i}"), -15.0, "Drought stress"))
            .collect();
        assert_eq!(YieldOrchestrator::alerts(&predictions).len(), 20);
    }

    #[test]
    fn empty_store_reports_everything_stale() {
        let orchestrator = YieldOrchestrator::new(
            Config::builtin("/tmp/cropcast-test"),
            Arc::new(MemoryStore::new()),
        );
        let freshness = orchestrator.freshness().unwrap();
        assert!(!freshness.is_empty());
        assert!(freshness.iter().all(|f| f.stale));
    }
}
