use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    agronomy::calendar::{Crop, GrowthStage, nass_week_to_date, state_abbrev},
    config::{Config, CropThresholds},
    error::{ConfigError, CropcastResult},
    store::{Row, Store, TableRef, from_rows, to_rows},
};

// ================================================================================================
// Feature Row
// ================================================================================================

/// One weekly feature vector per (state, crop, year, week) — the input row of
/// the prediction models. The engine upserts; `updated_at` advances on every
/// rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YieldFeatureRow {
    pub state: String,
    pub crop: Crop,
    pub year: i32,
    pub week: u32,
    pub week_ending_date: NaiveDate,

    // Cumulative-from-planting weather.
    pub gdd_cum: Option<f64>,
    pub gdd_vs_normal_pct: Option<f64>,
    pub precip_cum_mm: Option<f64>,
    pub precip_vs_normal_pct: Option<f64>,
    pub stress_days_heat: f64,
    pub stress_days_drought: f64,
    pub excess_moisture_days: f64,
    pub frost_events: f64,
    pub tmax_weekly_avg: Option<f64>,
    pub tmin_weekly_avg: Option<f64>,
    pub tavg_weekly: Option<f64>,

    // NDVI (optional; null when the satellite pipeline has no rows).
    pub ndvi_mean: Option<f64>,
    pub ndvi_anomaly: Option<f64>,
    pub ndvi_trend_4wk: Option<f64>,

    // CPC gridded condition/progress (national).
    pub condition_index: Option<f64>,
    pub condition_vs_5yr: Option<f64>,
    pub progress_index: Option<f64>,
    pub progress_vs_normal: Option<f64>,

    // NASS tabular progress/condition.
    pub pct_planted: Option<f64>,
    pub pct_emerged: Option<f64>,
    pub pct_silking: Option<f64>,
    pub pct_dough: Option<f64>,
    pub pct_mature: Option<f64>,
    pub pct_harvested: Option<f64>,
    pub good_excellent_pct: Option<f64>,

    // World Weather email signals.
    pub ww_risk_score: Option<f64>,
    pub ww_outlook_sentiment: Option<f64>,

    pub growth_stage: GrowthStage,
    pub feature_version: String,
    pub updated_at: DateTime<Utc>,
}

impl YieldFeatureRow {
    pub fn table() -> TableRef {
        TableRef::silver("yield_features")
    }

    pub const UNIQUE_COLUMNS: [&'static str; 4] = ["state", "crop", "year", "week"];
}

// ================================================================================================
// Bronze/Silver Input Shapes
// ================================================================================================

#[derive(Debug, Deserialize)]
struct WeatherObs {
    observation_date: NaiveDate,
    location_id: String,
    temp_high_f: Option<f64>,
    temp_low_f: Option<f64>,
    temp_avg_f: Option<f64>,
    precipitation_mm: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ClimatologyRow {
    region_code: String,
    month: u32,
    gdd_normal: Option<f64>,
    precip_normal_mm: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CpcWeeklyRow {
    crop: String,
    year: i32,
    nass_week: u32,
    region_id: String,
    #[serde(default)]
    condition_mean: Option<f64>,
    #[serde(default)]
    progress_mean: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct CpcYoyRow {
    crop: String,
    nass_week: u32,
    vs_5yr_avg: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct NassConditionRow {
    commodity: String,
    week_ending: NaiveDate,
    condition_category: String,
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct NassProgressRow {
    commodity: String,
    week_ending: NaiveDate,
    #[serde(default)]
    category: Option<String>,
    value: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct NdviRow {
    region_code: String,
    observation_date: NaiveDate,
    ndvi_value: Option<f64>,
    ndvi_anomaly: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WeatherEmailRow {
    email_date: NaiveDate,
    weather_summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StateYieldRow {
    commodity: String,
    state_abbrev: Option<String>,
    yield_per_acre: Option<f64>,
}

const CLIMATOLOGY_REGIONS: [&str; 4] = [
    "US_CORN_BELT",
    "US_SOY_BELT",
    "US_WHEAT_WINTER",
    "US_WHEAT_SPRING",
];

// ================================================================================================
// Engine
// ================================================================================================

/// Joins weather observations, climatology normals, CPC gridded indices,
/// NASS tabular progress/condition, optional NDVI, and World-Weather email
/// signals into weekly feature rows.
pub struct FeatureEngine {
    app: Arc<Config>,
    store: Arc<dyn Store>,
}

impl FeatureEngine {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> Self {
        Self { app, store }
    }

    /// Build feature rows for one (state, crop, year) across a week span.
    /// Weeks ending after today are skipped. Returns the row count written.
    pub fn build_features(
        &self,
        state: &str,
        crop: Crop,
        year: i32,
        week_start: u32,
        week_end: u32,
    ) -> CropcastResult<usize> {
        let state = state_abbrev(state)
            .ok_or_else(|| ConfigError::InvalidValue(format!("unknown state '{state}'")))?;
        let thresholds = self
            .app
            .thresholds
            .for_crop(&crop.to_string())
            .ok_or_else(|| ConfigError::UnknownCrop(crop.to_string()))?;

        // One scan per input table for the whole span.
        let weather: Vec<WeatherObs> =
            from_rows(self.store.scan(&TableRef::silver("weather_observation"))?);
        let climatology: Vec<ClimatologyRow> =
            from_rows(self.store.scan(&TableRef::reference("weather_climatology"))?);
        let cpc_condition: Vec<CpcWeeklyRow> =
            from_rows(self.store.scan(&TableRef::gold("cpc_condition_weekly"))?);
        let cpc_yoy: Vec<CpcYoyRow> =
            from_rows(self.store.scan(&TableRef::gold("cpc_condition_yoy"))?);
        let cpc_progress: Vec<CpcWeeklyRow> =
            from_rows(self.store.scan(&TableRef::gold("cpc_progress_weekly"))?);
        let nass_condition: Vec<NassConditionRow> =
            from_rows(self.store.scan(&TableRef::bronze("nass_crop_condition"))?);
        let nass_progress: Vec<NassProgressRow> =
            from_rows(self.store.scan(&TableRef::bronze("nass_crop_progress"))?);
        let ndvi: Vec<NdviRow> =
            from_rows(self.store.scan(&TableRef::bronze("ndvi_observation"))?);
        let emails: Vec<WeatherEmailRow> =
            from_rows(self.store.scan(&TableRef::bronze("weather_email_extract"))?);

        let today = Utc::now().date_naive();
        let mut rows: Vec<Row> = Vec::new();

        for week in week_start..=week_end.max(week_start) {
            let week_date = nass_week_to_date(year, week);
            if week_date > today {
                break;
            }

            let mut row = self.weather_features(
                &weather,
                &climatology,
                thresholds,
                state,
                year,
                week,
                week_date,
            );
            row.crop = crop;
            self.cpc_features(&cpc_condition, &cpc_yoy, &cpc_progress, crop, year, week, &mut row);
            self.nass_features(&nass_condition, &nass_progress, crop, week_date, &mut row);
            self.ndvi_features(&ndvi, state, week_date, &mut row);
            self.ww_signals(&emails, week_date, &mut row);
            row.growth_stage = self.growth_stage(thresholds, week);

            rows.push(
                to_rows(std::slice::from_ref(&row))?
                    .pop()
                    .expect("one row serializes to one map"),
            );
        }

        let count = rows.len();
        if count > 0 {
            self.store.upsert(
                &YieldFeatureRow::table(),
                &YieldFeatureRow::UNIQUE_COLUMNS,
                &rows,
            )?;
        }
        tracing::info!(state, %crop, year, count, "built feature rows");
        Ok(count)
    }

    /// Build features for every (crop, state) combination that actually has
    /// yield history, discovered from the bronze yield table.
    pub fn build_all_features(
        &self,
        year: i32,
        crops: Option<Vec<Crop>>,
        states: Option<Vec<String>>,
    ) -> CropcastResult<BTreeMap<Crop, (usize, usize)>> {
        let crops = crops.unwrap_or_else(|| {
            vec![Crop::Corn, Crop::Soybeans, Crop::WinterWheat, Crop::Cotton]
        });
        let yields: Vec<StateYieldRow> =
            from_rows(self.store.scan(&TableRef::bronze("nass_state_yields"))?);

        let mut summary = BTreeMap::new();
        for crop in crops {
            let commodity = crop.nass_commodity();
            let mut crop_states: Vec<String> = yields
                .iter()
                .filter(|r| r.commodity == commodity && r.yield_per_acre.is_some())
                .filter_map(|r| r.state_abbrev.clone())
                .collect();
            crop_states.sort();
            crop_states.dedup();

            if let Some(wanted) = &states {
                crop_states.retain(|s| wanted.iter().any(|w| w.eq_ignore_ascii_case(s)));
            }

            let mut rows = 0;
            for state in &crop_states {
                rows += self.build_features(state, crop, year, 1, 40)?;
            }
            summary.insert(crop, (rows, crop_states.len()));
            tracing::info!(%crop, rows, states = crop_states.len(), "feature build complete");
        }
        Ok(summary)
    }

    // --------------------------------------------------------------------------------------------
    // Per-source extractors
    // --------------------------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn weather_features(
        &self,
        weather: &[WeatherObs],
        climatology: &[ClimatologyRow],
        thresholds: &CropThresholds,
        state: &str,
        year: i32,
        week: u32,
        week_date: NaiveDate,
    ) -> YieldFeatureRow {
        let mut row = empty_row(state, year, week, week_date);
        let suffix = format!("_{}", state.to_lowercase());

        let planting = thresholds
            .growth_stages
            .get("planting")
            .map(|w| (w.start_month, w.start_day))
            .unwrap_or((4, 15));
        let planting_date =
            NaiveDate::from_ymd_opt(year, planting.0, planting.1).unwrap_or(week_date);

        // Daily aggregates from planting through the week-ending date,
        // averaged across the state's stations.
        let mut daily: BTreeMap<NaiveDate, (Vec<f64>, Vec<f64>, Vec<f64>, f64)> = BTreeMap::new();
        for obs in weather {
            if !obs.location_id.ends_with(&suffix) {
                continue;
            }
            if obs.observation_date < planting_date || obs.observation_date > week_date {
                continue;
            }
            let entry = daily.entry(obs.observation_date).or_default();
            if let Some(high) = obs.temp_high_f {
                entry.0.push(high);
            }
            if let Some(low) = obs.temp_low_f {
                entry.1.push(low);
            }
            if let Some(avg) = obs.temp_avg_f {
                entry.2.push(avg);
            }
            entry.3 += obs.precipitation_mm.unwrap_or(0.0);
        }

        if daily.is_empty() {
            return row;
        }

        let mut gdd_cum = 0.0;
        let mut precip_cum = 0.0;
        let mut heat_days = 0u32;
        let mut frost_events = 0u32;
        let mut excess_days = 0u32;
        let mut consecutive_dry = 0u32;
        let mut max_consecutive_dry = 0u32;

        let week_window_start = week_date - chrono::Duration::days(6);
        let mut weekly_highs = Vec::new();
        let mut weekly_lows = Vec::new();
        let mut weekly_avgs = Vec::new();

        for (date, (highs, lows, avgs, precip_mm)) in &daily {
            let max_c = mean(highs).map(fahrenheit_to_celsius).unwrap_or(0.0);
            let min_c = mean(lows).map(fahrenheit_to_celsius).unwrap_or(0.0);

            // GDD with the crop's cap and base.
            let tmax_adj = match thresholds.gdd_cap_c {
                Some(cap) => max_c.min(cap),
                None => max_c,
            };
            gdd_cum += ((min_c + tmax_adj) / 2.0 - thresholds.gdd_base_c).max(0.0);
            precip_cum += precip_mm;

            if max_c > thresholds.severe_heat_threshold_c {
                heat_days += 1;
            }
            if min_c < thresholds.frost_threshold_c {
                frost_events += 1;
            }
            if *precip_mm > thresholds.excess_moisture_mm_week / 7.0 {
                excess_days += 1;
            }
            if *precip_mm < 1.0 {
                consecutive_dry += 1;
                max_consecutive_dry = max_consecutive_dry.max(consecutive_dry);
            } else {
                consecutive_dry = 0;
            }

            if *date >= week_window_start {
                if let Some(high) = mean(highs) {
                    weekly_highs.push(high);
                }
                if let Some(low) = mean(lows) {
                    weekly_lows.push(low);
                }
                if let Some(avg) = mean(avgs) {
                    weekly_avgs.push(avg);
                }
            }
        }

        row.gdd_cum = Some(round1(gdd_cum));
        row.precip_cum_mm = Some(round1(precip_cum));
        row.stress_days_heat = heat_days as f64;
        row.frost_events = frost_events as f64;
        row.excess_moisture_days = excess_days as f64;
        row.stress_days_drought = max_consecutive_dry as f64;
        row.tmax_weekly_avg = mean(&weekly_highs).map(|f| round1(fahrenheit_to_celsius(f)));
        row.tmin_weekly_avg = mean(&weekly_lows).map(|f| round1(fahrenheit_to_celsius(f)));
        row.tavg_weekly = mean(&weekly_avgs).map(|f| round1(fahrenheit_to_celsius(f)));

        // vs-normal deltas from the first matching belt region.
        let months = planting.0..=week_date.month();
        let mut normals: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
        for clim in climatology {
            if !CLIMATOLOGY_REGIONS.contains(&clim.region_code.as_str()) {
                continue;
            }
            if !months.contains(&clim.month) {
                continue;
            }
            let region = CLIMATOLOGY_REGIONS
                .iter()
                .find(|r| **r == clim.region_code)
                .copied()
                .unwrap_or("US_CORN_BELT");
            let entry = normals.entry(region).or_default();
            entry.0 += clim.gdd_normal.unwrap_or(0.0);
            entry.1 += clim.precip_normal_mm.unwrap_or(0.0);
        }
        if let Some((gdd_normal, precip_normal)) = CLIMATOLOGY_REGIONS
            .iter()
            .find_map(|region| normals.get(region))
        {
            if *gdd_normal > 0.0 {
                row.gdd_vs_normal_pct = Some(round1((gdd_cum - gdd_normal) / gdd_normal * 100.0));
            }
            if *precip_normal > 0.0 {
                row.precip_vs_normal_pct =
                    Some(round1((precip_cum - precip_normal) / precip_normal * 100.0));
            }
        }

        row
    }

    #[allow(clippy::too_many_arguments)]
    fn cpc_features(
        &self,
        condition: &[CpcWeeklyRow],
        yoy: &[CpcYoyRow],
        progress: &[CpcWeeklyRow],
        crop: Crop,
        year: i32,
        week: u32,
        row: &mut YieldFeatureRow,
    ) {
        let cpc_crop = crop.cpc_name();

        row.condition_index = condition
            .iter()
            .find(|r| r.crop == cpc_crop && r.year == year && r.nass_week == week && r.region_id == "US")
            .and_then(|r| r.condition_mean);

        row.condition_vs_5yr = yoy
            .iter()
            .find(|r| r.crop == cpc_crop && r.nass_week == week)
            .and_then(|r| r.vs_5yr_avg);

        row.progress_index = progress
            .iter()
            .find(|r| r.crop == cpc_crop && r.year == year && r.nass_week == week && r.region_id == "US")
            .and_then(|r| r.progress_mean);

        if let Some(current) = row.progress_index {
            let history: Vec<f64> = progress
                .iter()
                .filter(|r| {
                    r.crop == cpc_crop
                        && r.nass_week == week
                        && r.region_id == "US"
                        && r.year >= year - 5
                        && r.year <= year - 1
                })
                .filter_map(|r| r.progress_mean)
                .collect();
            if let Some(avg) = mean(&history) {
                row.progress_vs_normal = Some(((current - avg) * 1000.0).round() / 1000.0);
            }
        }
    }

    fn nass_features(
        &self,
        condition: &[NassConditionRow],
        progress: &[NassProgressRow],
        crop: Crop,
        week_date: NaiveDate,
        row: &mut YieldFeatureRow,
    ) {
        let commodity = crop.nass_commodity().to_lowercase();
        let window_start = week_date - chrono::Duration::days(6);

        // Most recent value per condition category within the week window.
        let mut by_category: BTreeMap<String, (NaiveDate, f64)> = BTreeMap::new();
        for r in condition {
            if r.commodity != commodity {
                continue;
            }
            if r.week_ending < window_start || r.week_ending > week_date {
                continue;
            }
            let Some(value) = r.value else { continue };
            let entry = by_category
                .entry(r.condition_category.to_uppercase())
                .or_insert((r.week_ending, value));
            if r.week_ending > entry.0 {
                *entry = (r.week_ending, value);
            }
        }
        let excellent = by_category.get("EXCELLENT").map(|(_, v)| *v).unwrap_or(0.0);
        let good = by_category.get("GOOD").map(|(_, v)| *v).unwrap_or(0.0);
        if excellent > 0.0 || good > 0.0 {
            row.good_excellent_pct = Some(excellent + good);
        }

        // Latest progress values by category.
        let mut latest: BTreeMap<String, (NaiveDate, f64)> = BTreeMap::new();
        for r in progress {
            if r.commodity != commodity {
                continue;
            }
            if r.week_ending < window_start || r.week_ending > week_date {
                continue;
            }
            let Some(value) = r.value else { continue };
            let category = r
                .category
                .clone()
                .unwrap_or_else(|| "PLANTED".to_string())
                .to_uppercase();
            let entry = latest.entry(category).or_insert((r.week_ending, value));
            if r.week_ending > entry.0 {
                *entry = (r.week_ending, value);
            }
        }
        let pick = |name: &str| latest.get(name).map(|(_, v)| *v);
        row.pct_planted = pick("PLANTED");
        row.pct_emerged = pick("EMERGED");
        row.pct_silking = pick("SILKING");
        row.pct_dough = pick("DOUGH");
        row.pct_mature = pick("MATURE");
        row.pct_harvested = pick("HARVESTED");
    }

    fn ndvi_features(
        &self,
        ndvi: &[NdviRow],
        state: &str,
        week_date: NaiveDate,
        row: &mut YieldFeatureRow,
    ) {
        // The NDVI pipeline may not be populated; every path here degrades to
        // nulls.
        let lookback = week_date - chrono::Duration::days(10);
        let latest = ndvi
            .iter()
            .filter(|r| r.region_code == state)
            .filter(|r| r.observation_date >= lookback && r.observation_date <= week_date)
            .max_by_key(|r| r.observation_date);

        let Some(latest) = latest else {
            return;
        };
        row.ndvi_mean = latest.ndvi_value;
        row.ndvi_anomaly = latest.ndvi_anomaly;

        let four_weeks_ago = week_date - chrono::Duration::weeks(4);
        let mut series: Vec<(NaiveDate, f64)> = ndvi
            .iter()
            .filter(|r| r.region_code == state)
            .filter(|r| r.observation_date >= four_weeks_ago && r.observation_date <= week_date)
            .filter_map(|r| r.ndvi_value.map(|v| (r.observation_date, v)))
            .collect();
        series.sort_by_key(|(d, _)| *d);

        if series.len() >= 2 {
            let values: Vec<f64> = series.iter().map(|(_, v)| *v).collect();
            row.ndvi_trend_4wk = slope(&values).map(|s| (s * 10_000.0).round() / 10_000.0);
        }
    }

    fn ww_signals(&self, emails: &[WeatherEmailRow], week_date: NaiveDate, row: &mut YieldFeatureRow) {
        let window_start = week_date - chrono::Duration::days(6);
        let window_end = week_date + chrono::Duration::days(1);

        let mut bodies: Vec<&WeatherEmailRow> = emails
            .iter()
            .filter(|r| r.email_date >= window_start && r.email_date <= window_end)
            .collect();
        bodies.sort_by_key(|r| std::cmp::Reverse(r.email_date));
        bodies.truncate(5);

        let mut risk_total = 0.0;
        let mut sentiment_total = 0.0;
        let mut email_count = 0usize;

        for body in bodies {
            let Some(text) = &body.weather_summary else {
                continue;
            };
            let lower = text.to_lowercase();
            email_count += 1;
            for (keyword, weight) in &self.app.thresholds.ww_risk_keywords {
                if lower.contains(keyword) {
                    risk_total += weight;
                }
            }
            for (keyword, weight) in &self.app.thresholds.ww_favorable_keywords {
                if lower.contains(keyword) {
                    sentiment_total += weight;
                }
            }
        }

        if email_count > 0 {
            row.ww_risk_score = Some((risk_total / email_count as f64).min(10.0).max(0.0));
            // Flip so positive sentiment means a bullish (favorable) outlook.
            let raw = -sentiment_total / email_count as f64;
            row.ww_outlook_sentiment = Some((raw / 3.0).clamp(-1.0, 1.0));
        }
    }

    fn growth_stage(&self, thresholds: &CropThresholds, week: u32) -> GrowthStage {
        growth_stage_for(thresholds, week)
    }

    /// Coverage summary of the feature table per (crop, year).
    pub fn verify_summary(&self) -> CropcastResult<Vec<FeatureCoverage>> {
        let rows: Vec<YieldFeatureRow> = from_rows(self.store.scan(&YieldFeatureRow::table())?);

        let mut groups: BTreeMap<(Crop, i32), Vec<&YieldFeatureRow>> = BTreeMap::new();
        for row in &rows {
            groups.entry((row.crop, row.year)).or_default().push(row);
        }

        Ok(groups
            .into_iter()
            .map(|((crop, year), group)| {
                let mut states: Vec<&str> = group.iter().map(|r| r.state.as_str()).collect();
                states.sort();
                states.dedup();
                FeatureCoverage {
                    crop,
                    year,
                    rows: group.len(),
                    states: states.len(),
                    min_week: group.iter().map(|r| r.week).min().unwrap_or(0),
                    max_week: group.iter().map(|r| r.week).max().unwrap_or(0),
                    with_gdd: group.iter().filter(|r| r.gdd_cum.is_some()).count(),
                    with_condition: group.iter().filter(|r| r.condition_index.is_some()).count(),
                    with_good_excellent: group
                        .iter()
                        .filter(|r| r.good_excellent_pct.is_some())
                        .count(),
                }
            })
            .collect())
    }
}

/// Map a NASS week onto the crop's growth stage via the configured calendar
/// windows. Month/day windows are year-independent.
pub fn growth_stage_for(thresholds: &CropThresholds, week: u32) -> GrowthStage {
    let probe = nass_week_to_date(2024, week);
    for (name, window) in &thresholds.growth_stages {
        if window.contains(probe.month(), probe.day()) {
            if let Some(stage) = GrowthStage::from_config_stage(name) {
                return stage;
            }
        }
    }
    GrowthStage::from_month(probe.month())
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureCoverage {
    pub crop: Crop,
    pub year: i32,
    pub rows: usize,
    pub states: usize,
    pub min_week: u32,
    pub max_week: u32,
    pub with_gdd: usize,
    pub with_condition: usize,
    pub with_good_excellent: usize,
}

// ================================================================================================
// Small math helpers
// ================================================================================================

fn empty_row(state: &str, year: i32, week: u32, week_date: NaiveDate) -> YieldFeatureRow {
    YieldFeatureRow {
        state: state.to_string(),
        crop: Crop::Corn,
        year,
        week,
        week_ending_date: week_date,
        gdd_cum: None,
        gdd_vs_normal_pct: None,
        precip_cum_mm: None,
        precip_vs_normal_pct: None,
        stress_days_heat: 0.0,
        stress_days_drought: 0.0,
        excess_moisture_days: 0.0,
        frost_events: 0.0,
        tmax_weekly_avg: None,
        tmin_weekly_avg: None,
        tavg_weekly: None,
        ndvi_mean: None,
        ndvi_anomaly: None,
        ndvi_trend_4wk: None,
        condition_index: None,
        condition_vs_5yr: None,
        progress_index: None,
        progress_vs_normal: None,
        pct_planted: None,
        pct_emerged: None,
        pct_silking: None,
        pct_dough: None,
        pct_mature: None,
        pct_harvested: None,
        good_excellent_pct: None,
        ww_risk_score: None,
        ww_outlook_sentiment: None,
        growth_stage: GrowthStage::Vegetative,
        feature_version: "v1".to_string(),
        updated_at: Utc::now(),
    }
}

fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Least-squares slope of a series against its index.
fn slope(values: &[f64]) -> Option<f64> {
    let n = values.len() as f64;
    if values.len() < 2 {
        return None;
    }
    let x_mean = (n - 1.0) / 2.0;
    let y_mean = values.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den.abs() < f64::EPSILON {
        None
    } else {
        Some(num / den)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use crate::store::MemoryStore;

    use super::*;

    fn fixture(crop_field: Crop) -> YieldFeatureRow {
        let mut row = empty_row("IA", 2025, 30, nass_week_to_date(2025, 30));
        row.crop = crop_field;
        row
    }

    fn engine_with(rows_by_table: &[(TableRef, Vec<Value>)]) -> FeatureEngine {
        let store = Arc::new(MemoryStore::new());
        for (table, rows) in rows_by_table {
            let maps: Vec<Row> = rows
                .iter()
                .map(|v| v.as_object().unwrap().clone())
                .collect();
            // A synthetic key column keeps fixture rows distinct.
            let keyed: Vec<Row> = maps
                .into_iter()
                .enumerate()
                .map(|(i, mut m)| {
                    m.insert("fixture_id".into(), json!(i));
                    m
                })
                .collect();
            store.upsert(table, &["fixture_id"], &keyed).unwrap();
        }
        FeatureEngine::new(Config::builtin("/tmp/cropcast-test"), store)
    }

    #[test]
    fn gdd_formula_caps_tmax_and_floors_at_zero() {
        // One hot day: high 95F (35C), low 68F (20C); corn cap 30C, base 10C.
        // GDD = ((20 + 30)/2) - 10 = 15.
        let engine = engine_with(&[(
            TableRef::silver("weather_observation"),
            vec![json!({
                "observation_date": "2025-07-20",
                "location_id": "des_moines_ia",
                "temp_high_f": 95.0,
                "temp_low_f": 68.0,
                "temp_avg_f": 81.5,
                "precipitation_mm": 0.0
            })],
        )]);

        let thresholds = engine.app.thresholds.for_crop("corn").unwrap().clone();
        let weather: Vec<WeatherObs> = from_rows(
            engine
                .store
                .scan(&TableRef::silver("weather_observation"))
                .unwrap(),
        );
        let week_date = NaiveDate::from_ymd_opt(2025, 7, 20).unwrap();
        let row = engine.weather_features(&weather, &[], &thresholds, "IA", 2025, 15, week_date);

        assert_eq!(row.gdd_cum, Some(15.0));
        assert_eq!(row.stress_days_heat, 0.0);
        assert_eq!(row.stress_days_drought, 1.0);
    }

    #[test]
    fn ww_signals_score_and_clip() {
        let engine = engine_with(&[]);
        let mut row = fixture(Crop::Corn);
        let week_date = row.week_ending_date;
        let emails = vec![
            WeatherEmailRow {
                email_date: week_date,
                weather_summary: Some(
                    "Drought persists in the west; severe stress for corn.".to_string(),
                ),
            },
            WeatherEmailRow {
                email_date: week_date - chrono::Duration::days(2),
                weather_summary: Some("Conditions mostly favorable and adequate.".to_string()),
            },
        ];
        engine.ww_signals(&emails, week_date, &mut row);

        let risk = row.ww_risk_score.unwrap();
        assert!(risk > 0.0 && risk <= 10.0);
        let sentiment = row.ww_outlook_sentiment.unwrap();
        assert!((-1.0..=1.0).contains(&sentiment));
    }

    #[test]
    fn growth_stage_follows_config_windows() {
        let engine = engine_with(&[]);
        let thresholds = engine.app.thresholds.for_crop("corn").unwrap();
        // Week 15 ends late July: corn pollination -> reproductive.
        assert_eq!(engine.growth_stage(thresholds, 15), GrowthStage::Reproductive);
        // Week 1 ends early April: before planting.
        assert_eq!(engine.growth_stage(thresholds, 1), GrowthStage::PrePlanting);
    }

    #[test]
    fn slope_is_least_squares() {
        assert_eq!(slope(&[1.0, 2.0, 3.0]), Some(1.0));
        assert_eq!(slope(&[5.0]), None);
        let s = slope(&[0.30, 0.32, 0.35, 0.39]).unwrap();
        assert!(s > 0.0);
    }

    #[test]
    fn ndvi_missing_rows_leave_nulls() {
        let engine = engine_with(&[]);
        let mut row = fixture(Crop::Corn);
        engine.ndvi_features(&[], "IA", row.week_ending_date, &mut row);
        assert_eq!(row.ndvi_mean, None);
        assert_eq!(row.ndvi_anomaly, None);
        assert_eq!(row.ndvi_trend_4wk, None);
    }
}
