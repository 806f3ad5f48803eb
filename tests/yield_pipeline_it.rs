mod common;

use std::sync::Arc;

use chrono::Utc;
use cropcast::{
    agronomy::{
        Crop, GrowthStage, YieldModel, nass_week_to_date,
        features::YieldFeatureRow,
        model::YieldPrediction,
    },
    store::{Store, TableRef, to_rows},
};
use serde_json::json;

const STATES: [(&str, f64); 3] = [("IA", 180.0), ("IL", 176.0), ("NE", 168.0)];

fn feature_row(state: &str, year: i32, week: u32, drought_days: f64) -> YieldFeatureRow {
    YieldFeatureRow {
        state: state.to_string(),
        crop: Crop::Corn,
        year,
        week,
        week_ending_date: nass_week_to_date(year, week),
        gdd_cum: Some(1400.0 + drought_days * 10.0),
        gdd_vs_normal_pct: Some(drought_days),
        precip_cum_mm: Some(400.0 - drought_days * 20.0),
        precip_vs_normal_pct: Some(-drought_days * 3.0),
        stress_days_heat: (drought_days / 2.0).floor(),
        stress_days_drought: drought_days,
        excess_moisture_days: 0.0,
        frost_events: 0.0,
        tmax_weekly_avg: Some(30.0),
        tmin_weekly_avg: Some(18.0),
        tavg_weekly: Some(24.0),
        ndvi_mean: None,
        ndvi_anomaly: None,
        ndvi_trend_4wk: None,
        condition_index: Some(72.0 - drought_days * 2.5),
        condition_vs_5yr: None,
        progress_index: None,
        progress_vs_normal: None,
        pct_planted: Some(100.0),
        pct_emerged: Some(100.0),
        pct_silking: Some(80.0),
        pct_dough: None,
        pct_mature: None,
        pct_harvested: None,
        good_excellent_pct: Some(70.0 - drought_days * 2.0),
        ww_risk_score: Some((drought_days / 2.0).min(10.0)),
        ww_outlook_sentiment: Some(0.0),
        growth_stage: GrowthStage::Reproductive,
        feature_version: "v1".to_string(),
        updated_at: Utc::now(),
    }
}

/// Seed features at week 30 for 2005-2023 plus the 2025 row under test, and
/// the matching yield history where each drought day costs 4 bu/ac.
fn seed_store(store: &dyn Store, drought_2025: f64) {
    let mut features = Vec::new();
    let mut yields = Vec::new();

    for year in 2005..=2023 {
        let drought_days = ((year - 2005) % 6) as f64 * 1.8;
        for (state, base) in STATES {
            features.push(feature_row(state, year, 30, drought_days));
            let trendish = base + (year - 2005) as f64 * 1.5;
            let mut row = serde_json::Map::new();
            row.insert("commodity".into(), json!("CORN"));
            row.insert("state_abbrev".into(), json!(state));
            row.insert("year".into(), json!(year));
            row.insert("yield_per_acre".into(), json!(trendish - 4.0 * drought_days));
            row.insert("ingested_at".into(), json!(Utc::now()));
            yields.push(row);
        }
    }
    // Last-year actuals for the vs_last_year fields.
    for (state, base) in STATES {
        let mut row = serde_json::Map::new();
        row.insert("commodity".into(), json!("CORN"));
        row.insert("state_abbrev".into(), json!(state));
        row.insert("year".into(), json!(2024));
        row.insert("yield_per_acre".into(), json!(base + 28.0));
        row.insert("ingested_at".into(), json!(Utc::now()));
        yields.push(row);
    }

    features.push(feature_row("IA", 2025, 30, drought_2025));

    store
        .upsert(
            &YieldFeatureRow::table(),
            &YieldFeatureRow::UNIQUE_COLUMNS,
            &to_rows(&features).unwrap(),
        )
        .unwrap();
    store
        .upsert(
            &TableRef::bronze("nass_state_yields"),
            &["commodity", "state_abbrev", "year"],
            &yields,
        )
        .unwrap();
}

/// Scenario: corn, IA, 2025 week 30, nine drought-stress days. The ensemble
/// must call out drought as the driver, sit at or below trend, and produce a
/// well-ordered interval with mid-season confidence.
#[test]
fn drought_year_prediction_scenario() {
    let (app, _dir) = common::test_config();
    let store: Arc<dyn Store> = common::memory_store();
    seed_store(store.as_ref(), 9.0);

    let model = YieldModel::new(Arc::clone(&app), Arc::clone(&store));
    let metadata = model.train(Crop::Corn, 2005..=2023, 30).unwrap();
    assert!(metadata.n_samples >= 50);
    assert!(metadata.rmse_cv.is_some());

    let predictions = model.predict(Crop::Corn, 2025, 30, None).unwrap();
    let ia = predictions
        .iter()
        .find(|p| p.state == "IA")
        .expect("IA prediction");

    assert_eq!(ia.primary_driver, "Drought stress");
    assert!(
        ia.yield_forecast <= ia.trend_yield,
        "forecast {} above trend {}",
        ia.yield_forecast,
        ia.trend_yield
    );
    assert!((0.75..=0.85).contains(&ia.confidence));
    assert!(ia.yield_low < ia.yield_forecast && ia.yield_forecast < ia.yield_high);
    assert_eq!(ia.commodity, "CORN");
    assert!(ia.last_year_yield.is_some());
}

/// Persisted forecasts honor the gold-table invariants, and a second week's
/// save fills `prev_week_forecast` / `wow_change`.
#[test]
fn forecasts_persist_with_week_over_week_deltas() {
    let (app, _dir) = common::test_config();
    let store: Arc<dyn Store> = common::memory_store();
    seed_store(store.as_ref(), 4.0);
    // A week-29 row so the week-30 save has a predecessor.
    store
        .upsert(
            &YieldFeatureRow::table(),
            &YieldFeatureRow::UNIQUE_COLUMNS,
            &to_rows(&[feature_row("IA", 2025, 29, 4.0)]).unwrap(),
        )
        .unwrap();

    let model = YieldModel::new(Arc::clone(&app), Arc::clone(&store));
    model.train(Crop::Corn, 2005..=2023, 30).unwrap();

    let week29 = model.predict(Crop::Corn, 2025, 29, None).unwrap();
    assert!(!week29.is_empty());
    model.save_predictions(&week29, "run-w29").unwrap();

    let week30 = model.predict(Crop::Corn, 2025, 30, None).unwrap();
    let saved = model.save_predictions(&week30, "run-w30").unwrap();
    assert!(saved > 0);

    let gold = store.scan(&YieldPrediction::table()).unwrap();
    assert!(!gold.is_empty());
    for row in &gold {
        let low = row["yield_low"].as_f64().unwrap();
        let mid = row["yield_forecast"].as_f64().unwrap();
        let high = row["yield_high"].as_f64().unwrap();
        assert!(low <= mid && mid <= high);

        let confidence = row["confidence"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&confidence));
    }

    let w30_row = gold
        .iter()
        .find(|row| row["forecast_week"] == json!(30) && row["state"] == json!("IA"))
        .expect("week 30 row");
    assert_eq!(w30_row["run_id"], json!("run-w30"));
    assert!(w30_row["prev_week_forecast"].as_f64().is_some());
    assert!(w30_row["wow_change"].as_f64().is_some());
}
