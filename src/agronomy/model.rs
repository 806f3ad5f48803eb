use std::{collections::BTreeMap, path::PathBuf, sync::Arc};

use chrono::{Datelike, NaiveDate, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use serde_json::json;
use smartcore::{
    ensemble::random_forest_regressor::{
        RandomForestRegressor, RandomForestRegressorParameters,
    },
    linalg::basic::matrix::DenseMatrix,
    linear::linear_regression::{
        LinearRegression, LinearRegressionParameters, LinearRegressionSolverName,
    },
};

use crate::{
    agronomy::{
        calendar::{Crop, GrowthStage, nass_week_to_date, state_full_name},
        features::YieldFeatureRow,
    },
    config::Config,
    error::{CropcastResult, IoError, ModelError},
    store::{Row, Store, TableRef, from_rows, to_rows},
};

// ================================================================================================
// Feature Vocabulary
// ================================================================================================

/// Every numeric feature column, in model order. Missing values enter the
/// models as zero.
pub const ALL_NUMERIC_FEATURES: [&str; 27] = [
    "gdd_cum",
    "gdd_vs_normal_pct",
    "precip_cum_mm",
    "precip_vs_normal_pct",
    "stress_days_heat",
    "stress_days_drought",
    "excess_moisture_days",
    "frost_events",
    "tmax_weekly_avg",
    "tmin_weekly_avg",
    "tavg_weekly",
    "ndvi_mean",
    "ndvi_anomaly",
    "ndvi_trend_4wk",
    "condition_index",
    "condition_vs_5yr",
    "progress_index",
    "progress_vs_normal",
    "pct_planted",
    "pct_emerged",
    "pct_silking",
    "pct_dough",
    "pct_mature",
    "pct_harvested",
    "good_excellent_pct",
    "ww_risk_score",
    "ww_outlook_sentiment",
];

/// Interpretable subset driving model A.
pub const MODEL_A_FEATURES: [&str; 6] = [
    "gdd_vs_normal_pct",
    "precip_vs_normal_pct",
    "good_excellent_pct",
    "stress_days_heat",
    "condition_index",
    "stress_days_drought",
];

/// Features entering the analog-year distance.
pub const ANALOG_FEATURES: [&str; 6] = [
    "gdd_vs_normal_pct",
    "precip_vs_normal_pct",
    "stress_days_heat",
    "stress_days_drought",
    "condition_index",
    "good_excellent_pct",
];

/// Forecast confidence by NASS week; weeks in between interpolate linearly.
const CONFIDENCE_BY_WEEK: [(u32, f64); 14] = [
    (10, 0.30),
    (15, 0.40),
    (18, 0.45),
    (20, 0.50),
    (22, 0.55),
    (24, 0.60),
    (26, 0.70),
    (28, 0.75),
    (30, 0.80),
    (32, 0.85),
    (34, 0.88),
    (36, 0.90),
    (38, 0.93),
    (40, 0.95),
];

pub fn confidence_for_week(week: u32) -> f64 {
    if let Some((_, c)) = CONFIDENCE_BY_WEEK.iter().find(|(w, _)| *w == week) {
        return *c;
    }
    let (first_week, first_c) = CONFIDENCE_BY_WEEK[0];
    let (last_week, last_c) = CONFIDENCE_BY_WEEK[CONFIDENCE_BY_WEEK.len() - 1];
    if week < first_week {
        return first_c;
    }
    if week > last_week {
        return last_c;
    }
    for pair in CONFIDENCE_BY_WEEK.windows(2) {
        let (w0, c0) = pair[0];
        let (w1, c1) = pair[1];
        if (w0..=w1).contains(&week) {
            let frac = (week - w0) as f64 / (w1 - w0) as f64;
            return c0 + frac * (c1 - c0);
        }
    }
    0.5
}

/// Pull the numeric vector out of a feature row, in `ALL_NUMERIC_FEATURES`
/// order, with nulls as zero.
pub fn feature_vector(row: &YieldFeatureRow) -> Vec<f64> {
    let z = |v: Option<f64>| v.unwrap_or(0.0);
    vec![
        z(row.gdd_cum),
        z(row.gdd_vs_normal_pct),
        z(row.precip_cum_mm),
        z(row.precip_vs_normal_pct),
        row.stress_days_heat,
        row.stress_days_drought,
        row.excess_moisture_days,
        row.frost_events,
        z(row.tmax_weekly_avg),
        z(row.tmin_weekly_avg),
        z(row.tavg_weekly),
        z(row.ndvi_mean),
        z(row.ndvi_anomaly),
        z(row.ndvi_trend_4wk),
        z(row.condition_index),
        z(row.condition_vs_5yr),
        z(row.progress_index),
        z(row.progress_vs_normal),
        z(row.pct_planted),
        z(row.pct_emerged),
        z(row.pct_silking),
        z(row.pct_dough),
        z(row.pct_mature),
        z(row.pct_harvested),
        z(row.good_excellent_pct),
        z(row.ww_risk_score),
        z(row.ww_outlook_sentiment),
    ]
}

fn feature_index(name: &str) -> usize {
    ALL_NUMERIC_FEATURES
        .iter()
        .position(|f| *f == name)
        .expect("feature name is in the vocabulary")
}

/// Priority-ordered driver rules over the feature row.
pub fn identify_driver(features: &[f64]) -> &'static str {
    let get = |name: &str| features[feature_index(name)];

    if get("stress_days_drought") > 7.0 {
        return "Drought stress";
    }
    if get("stress_days_heat") > 5.0 {
        return "Heat stress";
    }
    if get("excess_moisture_days") > 5.0 {
        return "Excess moisture";
    }
    if get("frost_events") > 2.0 {
        return "Frost damage";
    }

    let good_excellent = get("good_excellent_pct");
    if good_excellent > 70.0 {
        return "Strong crop conditions";
    }
    if good_excellent > 0.0 && good_excellent < 50.0 {
        return "Poor crop conditions";
    }

    let precip_dev = get("precip_vs_normal_pct");
    if precip_dev < -25.0 {
        return "Below-normal precipitation";
    }
    if precip_dev > 30.0 {
        return "Above-normal precipitation";
    }

    "Normal conditions"
}

// ================================================================================================
// Model Artifacts
// ================================================================================================

/// Column-wise standardization fitted on the training matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scaler {
    pub means: Vec<f64>,
    pub stds: Vec<f64>,
}

impl Scaler {
    pub fn fit(rows: &[Vec<f64>]) -> Self {
        let cols = rows.first().map(Vec::len).unwrap_or(0);
        let n = rows.len().max(1) as f64;
        let mut means = vec![0.0; cols];
        for row in rows {
            for (i, v) in row.iter().enumerate() {
                means[i] += v;
            }
        }
        means.iter_mut().for_each(|m| *m /= n);

        let mut stds = vec![0.0; cols];
        for row in rows {
            for (i, v) in row.iter().enumerate() {
                stds[i] += (v - means[i]).powi(2);
            }
        }
        for s in stds.iter_mut() {
            *s = (*s / n).sqrt();
            if *s < f64::EPSILON {
                *s = 1.0;
            }
        }
        Self { means, stds }
    }

    pub fn transform(&self, row: &[f64]) -> Vec<f64> {
        row.iter()
            .enumerate()
            .map(|(i, v)| (v - self.means[i]) / self.stds[i])
            .collect()
    }

    pub fn transform_all(&self, rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
        rows.iter().map(|r| self.transform(r)).collect()
    }
}

/// Training profile stored for analog-year lookup: the raw feature matrix
/// with per-row metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalogData {
    pub states: Vec<String>,
    pub years: Vec<i32>,
    pub yields: Vec<f64>,
    pub trend_yields: Vec<f64>,
    pub features: Vec<Vec<f64>>,
    pub feature_names: Vec<String>,
}

impl AnalogData {
    /// Inverse-distance-weighted deviation of the 5 nearest training rows
    /// from other years, in standardized analog-feature space.
    pub fn predict(&self, features: &[f64], trend_yield: f64, current_year: i32) -> (f64, String) {
        let idx: Vec<usize> = ANALOG_FEATURES.iter().map(|f| feature_index(f)).collect();
        let subset = |row: &[f64]| -> Vec<f64> { idx.iter().map(|i| row[*i]).collect() };

        let stored: Vec<Vec<f64>> = self.features.iter().map(|r| subset(r)).collect();
        if stored.is_empty() {
            return (trend_yield, String::new());
        }
        let scaler = Scaler::fit(&stored);
        let current = scaler.transform(&subset(features));

        let mut candidates: Vec<(f64, i32, f64, f64)> = stored
            .iter()
            .zip(&self.years)
            .zip(self.yields.iter().zip(&self.trend_yields))
            .filter(|((_, year), _)| **year != current_year)
            .map(|((row, year), (actual, trend))| {
                let std_row = scaler.transform(row);
                let distance = std_row
                    .iter()
                    .zip(&current)
                    .map(|(a, b)| (a - b).powi(2))
                    .sum::<f64>()
                    .sqrt();
                (distance, *year, *actual, *trend)
            })
            .collect();

        if candidates.is_empty() {
            return (trend_yield, String::new());
        }

        candidates.sort_by_key(|(d, _, _, _)| OrderedFloat(*d));
        candidates.truncate(5);

        let weights: Vec<f64> = candidates.iter().map(|(d, _, _, _)| 1.0 / (d + 0.01)).collect();
        let weight_sum: f64 = weights.iter().sum();
        let weighted_dev: f64 = candidates
            .iter()
            .zip(&weights)
            .map(|((_, _, actual, trend), w)| w * (actual - trend))
            .sum::<f64>()
            / weight_sum;

        let analog_years: Vec<String> = candidates
            .iter()
            .take(3)
            .map(|(_, year, _, _)| year.to_string())
            .collect();
        (
            trend_yield + weighted_dev,
            format!("Similar to {}", analog_years.join(", ")),
        )
    }
}

type LinearModel = LinearRegression<f64, f64, DenseMatrix<f64>, Vec<f64>>;
type ForestModel = RandomForestRegressor<f64, f64, DenseMatrix<f64>, Vec<f64>>;

/// The trained artifact set for one crop.
pub struct TrainedModels {
    pub model_a: LinearModel,
    pub model_b: ForestModel,
    pub scaler: Scaler,
    pub analog: AnalogData,
    pub metadata: ModelMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub crop: Crop,
    pub target_week: u32,
    pub n_samples: usize,
    pub train_years: String,
    pub rmse_cv: Option<f64>,
    pub mae_cv: Option<f64>,
    pub r2_cv: Option<f64>,
    /// Model A features ranked by |coefficient| on standardized inputs.
    pub top_features: Vec<String>,
    pub trained_at: String,
}

// ================================================================================================
// Predictions
// ================================================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YieldPrediction {
    pub commodity: String,
    pub state: String,
    pub year: i32,
    pub forecast_week: u32,
    pub forecast_date: NaiveDate,
    pub yield_forecast: f64,
    pub yield_low: f64,
    pub yield_high: f64,
    pub trend_yield: f64,
    pub vs_trend_pct: f64,
    pub last_year_yield: Option<f64>,
    pub vs_last_year_pct: Option<f64>,
    pub model_type: String,
    pub confidence: f64,
    pub primary_driver: String,
    pub analog_years: String,
}

impl YieldPrediction {
    pub fn table() -> TableRef {
        TableRef::gold("yield_forecast")
    }

    pub const UNIQUE_COLUMNS: [&'static str; 5] =
        ["commodity", "state", "year", "forecast_week", "model_type"];
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrendRow {
    commodity: String,
    state: String,
    trend_type: String,
    slope: f64,
    intercept: f64,
    trend_yield_current: f64,
}

#[derive(Debug, Deserialize)]
struct StateYieldRow {
    commodity: String,
    state_abbrev: Option<String>,
    year: i32,
    yield_per_acre: Option<f64>,
}

// ================================================================================================
// Yield Model
// ================================================================================================

/// Trains, persists, and serves the three-model ensemble.
pub struct YieldModel {
    app: Arc<Config>,
    store: Arc<dyn Store>,
    model_dir: PathBuf,
}

impl YieldModel {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> Self {
        let model_dir = app.dirs.model_dir.clone();
        Self {
            app,
            store,
            model_dir,
        }
    }

    // --------------------------------------------------------------------------------------------
    // Training
    // --------------------------------------------------------------------------------------------

    /// Train all three sub-models for a crop at a target week and persist the
    /// artifacts under the model directory.
    pub fn train(
        &self,
        crop: Crop,
        train_years: std::ops::RangeInclusive<i32>,
        target_week: u32,
    ) -> CropcastResult<ModelMetadata> {
        let (samples, trends) = self.training_samples(crop, &train_years, target_week)?;
        if samples.len() < 5 {
            return Err(ModelError::InsufficientData {
                n: samples.len(),
                required: 5,
            }
            .into());
        }
        if samples.len() < 20 {
            tracing::warn!(
                %crop,
                n = samples.len(),
                "thin training set for week {target_week}"
            );
        }

        let models = Self::fit(crop, &samples, &train_years, target_week)?;
        self.persist_trends(crop, &trends)?;
        self.persist(crop, &models)?;

        tracing::info!(
            %crop,
            n = models.metadata.n_samples,
            rmse = ?models.metadata.rmse_cv,
            "training complete"
        );
        Ok(models.metadata)
    }

    /// Fit the artifact set in memory. The backtester uses this directly on
    /// per-fold training subsets.
    pub(crate) fn fit(
        crop: Crop,
        samples: &[TrainingSample],
        train_years: &std::ops::RangeInclusive<i32>,
        target_week: u32,
    ) -> CropcastResult<TrainedModels> {
        let x_raw: Vec<Vec<f64>> = samples.iter().map(|s| s.features.clone()).collect();
        let deviations: Vec<f64> = samples.iter().map(|s| s.actual - s.trend).collect();

        // Model A: interpretable subset against the trend deviation.
        let a_idx: Vec<usize> = MODEL_A_FEATURES.iter().map(|f| feature_index(f)).collect();
        let x_a: Vec<Vec<f64>> = x_raw
            .iter()
            .map(|row| a_idx.iter().map(|i| row[*i]).collect())
            .collect();
        // SVD tolerates the collinear/constant columns a thin season can have.
        let model_a = LinearRegression::fit(
            &matrix(&x_a)?,
            &deviations,
            LinearRegressionParameters::default().with_solver(LinearRegressionSolverName::SVD),
        )
        .map_err(|e| ModelError::Training(e.to_string()))?;

        // Model B: tree ensemble over all standardized features.
        let scaler = Scaler::fit(&x_raw);
        let x_scaled = scaler.transform_all(&x_raw);
        let model_b = RandomForestRegressor::fit(
            &matrix(&x_scaled)?,
            &deviations,
            forest_params(samples.len()),
        )
        .map_err(|e| ModelError::Training(e.to_string()))?;

        // Model C: the raw training profile for analog lookup.
        let analog = AnalogData {
            states: samples.iter().map(|s| s.state.clone()).collect(),
            years: samples.iter().map(|s| s.year).collect(),
            yields: samples.iter().map(|s| s.actual).collect(),
            trend_yields: samples.iter().map(|s| s.trend).collect(),
            features: x_raw.clone(),
            feature_names: ALL_NUMERIC_FEATURES.iter().map(|f| f.to_string()).collect(),
        };

        let (rmse, mae, r2) = Self::cross_validate(samples)?;
        let top_features = rank_model_a_features(&x_a);

        Ok(TrainedModels {
            model_a,
            model_b,
            scaler,
            analog,
            metadata: ModelMetadata {
                crop,
                target_week,
                n_samples: samples.len(),
                train_years: format!("{}-{}", train_years.start(), train_years.end()),
                rmse_cv: rmse,
                mae_cv: mae,
                r2_cv: r2,
                top_features,
                trained_at: Utc::now().to_rfc3339(),
            },
        })
    }

    /// Leave-one-year-out CV of the forest model, reported in absolute yield.
    fn cross_validate(
        samples: &[TrainingSample],
    ) -> CropcastResult<(Option<f64>, Option<f64>, Option<f64>)> {
        let mut years: Vec<i32> = samples.iter().map(|s| s.year).collect();
        years.sort();
        years.dedup();

        let mut errors: Vec<f64> = Vec::new();
        for test_year in &years {
            let train: Vec<&TrainingSample> =
                samples.iter().filter(|s| s.year != *test_year).collect();
            let test: Vec<&TrainingSample> =
                samples.iter().filter(|s| s.year == *test_year).collect();
            if test.is_empty() || train.len() < 10 {
                continue;
            }

            let x_train: Vec<Vec<f64>> = train.iter().map(|s| s.features.clone()).collect();
            let y_train: Vec<f64> = train.iter().map(|s| s.actual - s.trend).collect();
            let scaler = Scaler::fit(&x_train);

            let forest = RandomForestRegressor::fit(
                &matrix(&scaler.transform_all(&x_train))?,
                &y_train,
                forest_params(train.len()),
            )
            .map_err(|e| ModelError::Training(e.to_string()))?;

            let x_test: Vec<Vec<f64>> = test
                .iter()
                .map(|s| scaler.transform(&s.features))
                .collect();
            let predicted_dev = forest
                .predict(&matrix(&x_test)?)
                .map_err(|e| ModelError::Prediction(e.to_string()))?;

            for (sample, dev) in test.iter().zip(predicted_dev) {
                errors.push(sample.trend + dev - sample.actual);
            }
        }

        if errors.is_empty() {
            return Ok((None, None, None));
        }
        let n = errors.len() as f64;
        let rmse = (errors.iter().map(|e| e * e).sum::<f64>() / n).sqrt();
        let mae = errors.iter().map(|e| e.abs()).sum::<f64>() / n;

        let actual_mean = samples.iter().map(|s| s.actual).sum::<f64>() / samples.len() as f64;
        let ss_tot: f64 = samples
            .iter()
            .map(|s| (s.actual - actual_mean).powi(2))
            .sum();
        let r2 = if ss_tot > 0.0 {
            Some(1.0 - errors.iter().map(|e| e * e).sum::<f64>() / ss_tot)
        } else {
            None
        };
        Ok((Some(round2(rmse)), Some(round2(mae)), r2.map(round3)))
    }

    /// Gather `(features at target_week, actual yield, trend yield)` per
    /// (state, year), plus the per-state trend table.
    pub(crate) fn training_samples(
        &self,
        crop: Crop,
        train_years: &std::ops::RangeInclusive<i32>,
        target_week: u32,
    ) -> CropcastResult<(Vec<TrainingSample>, Vec<TrendRowPublic>)> {
        let features: Vec<YieldFeatureRow> =
            from_rows(self.store.scan(&YieldFeatureRow::table())?);
        let yields: Vec<StateYieldRow> =
            from_rows(self.store.scan(&TableRef::bronze("nass_state_yields"))?);
        let commodity = crop.nass_commodity();

        // (state, year) -> actual yield.
        let mut actuals: BTreeMap<(String, i32), f64> = BTreeMap::new();
        for r in &yields {
            if r.commodity != commodity {
                continue;
            }
            if let (Some(state), Some(value)) = (&r.state_abbrev, r.yield_per_acre) {
                actuals.insert((state.clone(), r.year), value);
            }
        }

        // Per-state linear trend fitted over the training years.
        let mut by_state: BTreeMap<String, Vec<(i32, f64)>> = BTreeMap::new();
        for ((state, year), value) in &actuals {
            if train_years.contains(year) {
                by_state
                    .entry(state.clone())
                    .or_default()
                    .push((*year, *value));
            }
        }
        let mut trends: Vec<TrendRowPublic> = Vec::new();
        let mut trend_map: BTreeMap<String, (f64, f64)> = BTreeMap::new();
        for (state, series) in &by_state {
            if let Some((slope, intercept)) = linear_fit(series) {
                trend_map.insert(state.clone(), (slope, intercept));
                trends.push(TrendRowPublic {
                    state: state.clone(),
                    slope,
                    intercept,
                });
            }
        }

        let overall_mean = if actuals.is_empty() {
            0.0
        } else {
            actuals.values().sum::<f64>() / actuals.len() as f64
        };

        let mut samples = Vec::new();
        for row in &features {
            if row.crop != crop || row.week != target_week || !train_years.contains(&row.year) {
                continue;
            }
            let Some(actual) = actuals.get(&(row.state.clone(), row.year)) else {
                continue;
            };
            let trend = trend_map
                .get(&row.state)
                .map(|(slope, intercept)| intercept + slope * row.year as f64)
                .unwrap_or(overall_mean);
            samples.push(TrainingSample {
                state: row.state.clone(),
                year: row.year,
                features: feature_vector(row),
                actual: *actual,
                trend,
            });
        }
        samples.sort_by(|a, b| (a.year, a.state.clone()).cmp(&(b.year, b.state.clone())));
        Ok((samples, trends))
    }

    fn persist_trends(&self, crop: Crop, trends: &[TrendRowPublic]) -> CropcastResult<()> {
        let current_year = Utc::now().year();
        let rows: Vec<TrendRow> = trends
            .iter()
            .map(|t| TrendRow {
                commodity: crop.nass_commodity().to_string(),
                state: state_full_name(&t.state).unwrap_or(&t.state).to_string(),
                trend_type: "linear".to_string(),
                slope: t.slope,
                intercept: t.intercept,
                trend_yield_current: t.intercept + t.slope * current_year as f64,
            })
            .collect();
        let rows = to_rows(&rows)?;
        self.store.upsert(
            &TableRef::silver("yield_trend"),
            &["commodity", "state", "trend_type"],
            &rows,
        )?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Prediction
    // --------------------------------------------------------------------------------------------

    /// Generate ensemble predictions for current conditions.
    pub fn predict(
        &self,
        crop: Crop,
        year: i32,
        week: u32,
        states: Option<&[String]>,
    ) -> CropcastResult<Vec<YieldPrediction>> {
        let models = self.load(crop)?;
        let features: Vec<YieldFeatureRow> =
            from_rows(self.store.scan(&YieldFeatureRow::table())?);
        let trend_map = self.trend_lookup(crop)?;
        let last_year = self.actuals_for_year(crop, year - 1)?;

        let rows: Vec<&YieldFeatureRow> = features
            .iter()
            .filter(|r| r.crop == crop && r.year == year && r.week == week)
            .filter(|r| {
                states.is_none_or(|wanted| wanted.iter().any(|s| s.eq_ignore_ascii_case(&r.state)))
            })
            .collect();
        if rows.is_empty() {
            tracing::warn!(%crop, year, week, "no feature rows to predict from");
            return Ok(Vec::new());
        }

        let mut predictions = Vec::with_capacity(rows.len());
        let forecast_date = nass_week_to_date(year, week);
        let confidence = confidence_for_week(week);
        let rmse = models.metadata.rmse_cv.unwrap_or(10.0);

        for row in rows {
            let Some((slope, intercept)) = trend_map.get(&row.state) else {
                continue;
            };
            let trend_yield = slope * year as f64 + intercept;
            let features = feature_vector(row);
            let (yield_forecast, analog_years) =
                self.ensemble(&models, &features, row.growth_stage, trend_yield, year, crop)?;

            let width_mult = 2.5 - confidence * 1.5;
            let yield_low = yield_forecast - rmse * width_mult;
            let yield_high = yield_forecast + rmse * width_mult;

            let last = last_year.get(&row.state).copied();
            predictions.push(YieldPrediction {
                commodity: crop.nass_commodity().to_string(),
                state: row.state.clone(),
                year,
                forecast_week: week,
                forecast_date,
                yield_forecast: round1(yield_forecast),
                yield_low: round1(yield_low),
                yield_high: round1(yield_high),
                trend_yield: round1(trend_yield),
                vs_trend_pct: if trend_yield.abs() > f64::EPSILON {
                    round1((yield_forecast - trend_yield) / trend_yield * 100.0)
                } else {
                    0.0
                },
                last_year_yield: last,
                vs_last_year_pct: last.map(|ly| round1((yield_forecast - ly) / ly * 100.0)),
                model_type: "ensemble".to_string(),
                confidence: round2(confidence),
                primary_driver: identify_driver(&features).to_string(),
                analog_years,
            });
        }
        Ok(predictions)
    }

    /// Blend the three sub-model outputs with the crop/stage weight vector.
    pub(crate) fn ensemble(
        &self,
        models: &TrainedModels,
        features: &[f64],
        stage: GrowthStage,
        trend_yield: f64,
        year: i32,
        crop: Crop,
    ) -> CropcastResult<(f64, String)> {
        let a_idx: Vec<usize> = MODEL_A_FEATURES.iter().map(|f| feature_index(f)).collect();
        let x_a: Vec<f64> = a_idx.iter().map(|i| features[*i]).collect();
        let dev_a = models
            .model_a
            .predict(&matrix(std::slice::from_ref(&x_a))?)
            .map_err(|e| ModelError::Prediction(e.to_string()))?[0];
        let yield_a = trend_yield + dev_a;

        let x_b = models.scaler.transform(features);
        let dev_b = models
            .model_b
            .predict(&matrix(std::slice::from_ref(&x_b))?)
            .map_err(|e| ModelError::Prediction(e.to_string()))?[0];
        let yield_b = trend_yield + dev_b;

        let (yield_c, analog_years) = models.analog.predict(features, trend_yield, year);

        let weights = self
            .app
            .ensemble
            .for_crop_stage(&crop.to_string(), &stage.to_string());
        let blended =
            weights.model_a * yield_a + weights.model_b * yield_b + weights.model_c * yield_c;
        Ok((blended, analog_years))
    }

    /// Persist predictions to the gold forecast table, filling week-over-week
    /// deltas from the previous week's rows, and log the model run.
    pub fn save_predictions(
        &self,
        predictions: &[YieldPrediction],
        run_id: &str,
    ) -> CropcastResult<usize> {
        if predictions.is_empty() {
            return Ok(0);
        }

        let existing: Vec<Row> = self.store.scan(&YieldPrediction::table())?;
        let previous: BTreeMap<(String, String, i64, u64), f64> = existing
            .iter()
            .filter_map(|row| {
                Some((
                    (
                        row.get("commodity")?.as_str()?.to_string(),
                        row.get("state")?.as_str()?.to_string(),
                        row.get("year")?.as_i64()?,
                        row.get("forecast_week")?.as_u64()?,
                    ),
                    row.get("yield_forecast")?.as_f64()?,
                ))
            })
            .collect();

        let mut rows: Vec<Row> = Vec::with_capacity(predictions.len());
        for p in predictions {
            let prev = previous
                .get(&(
                    p.commodity.clone(),
                    p.state.clone(),
                    p.year as i64,
                    p.forecast_week.saturating_sub(1) as u64,
                ))
                .copied();
            let mut row = to_rows(std::slice::from_ref(p))?.pop().expect("one row");
            row.insert("run_id".into(), json!(run_id));
            row.insert("prev_week_forecast".into(), json!(prev));
            row.insert(
                "wow_change".into(),
                json!(prev.map(|v| round1(p.yield_forecast - v))),
            );
            rows.push(row);
        }

        let outcome = self.store.upsert(
            &YieldPrediction::table(),
            &YieldPrediction::UNIQUE_COLUMNS,
            &rows,
        )?;
        tracing::info!(
            saved = outcome.written(),
            run_id,
            "persisted yield predictions"
        );
        Ok(outcome.written())
    }

    // --------------------------------------------------------------------------------------------
    // Artifact Persistence
    // --------------------------------------------------------------------------------------------

    fn artifact_path(&self, crop: Crop, name: &str) -> PathBuf {
        self.model_dir.join(format!("{crop}_{name}.json"))
    }

    pub fn persist(&self, crop: Crop, models: &TrainedModels) -> CropcastResult<()> {
        std::fs::create_dir_all(&self.model_dir).map_err(IoError::Io)?;
        write_json(&self.artifact_path(crop, "model_a"), &models.model_a)?;
        write_json(&self.artifact_path(crop, "model_b"), &models.model_b)?;
        write_json(&self.artifact_path(crop, "scaler"), &models.scaler)?;
        write_json(&self.artifact_path(crop, "analog_data"), &models.analog)?;
        write_json(&self.artifact_path(crop, "metadata"), &models.metadata)?;
        Ok(())
    }

    pub fn load(&self, crop: Crop) -> CropcastResult<TrainedModels> {
        let read = |name: &str| -> CropcastResult<String> {
            let path = self.artifact_path(crop, name);
            std::fs::read_to_string(&path)
                .map_err(|_| ModelError::NotTrained(crop.to_string()).into())
        };
        Ok(TrainedModels {
            model_a: parse_json(&read("model_a")?)?,
            model_b: parse_json(&read("model_b")?)?,
            scaler: parse_json(&read("scaler")?)?,
            analog: parse_json(&read("analog_data")?)?,
            metadata: parse_json(&read("metadata")?)?,
        })
    }

    pub fn metadata(&self, crop: Crop) -> CropcastResult<ModelMetadata> {
        let path = self.artifact_path(crop, "metadata");
        let text = std::fs::read_to_string(&path)
            .map_err(|_| ModelError::NotTrained(crop.to_string()))?;
        parse_json(&text)
    }

    fn trend_lookup(&self, crop: Crop) -> CropcastResult<BTreeMap<String, (f64, f64)>> {
        let rows: Vec<TrendRow> = from_rows(self.store.scan(&TableRef::silver("yield_trend"))?);
        let commodity = crop.nass_commodity();
        Ok(rows
            .into_iter()
            .filter(|r| r.commodity == commodity && r.trend_type == "linear")
            .map(|r| {
                // Trend rows carry full state names; features use abbreviations.
                let abbrev = crate::agronomy::calendar::state_abbrev(&r.state)
                    .map(str::to_string)
                    .unwrap_or(r.state);
                (abbrev, (r.slope, r.intercept))
            })
            .collect())
    }

    fn actuals_for_year(&self, crop: Crop, year: i32) -> CropcastResult<BTreeMap<String, f64>> {
        let yields: Vec<StateYieldRow> =
            from_rows(self.store.scan(&TableRef::bronze("nass_state_yields"))?);
        let commodity = crop.nass_commodity();
        Ok(yields
            .into_iter()
            .filter(|r| r.commodity == commodity && r.year == year)
            .filter_map(|r| Some((r.state_abbrev?, r.yield_per_acre?)))
            .collect())
    }
}

/// One training observation.
#[derive(Debug, Clone)]
pub struct TrainingSample {
    pub state: String,
    pub year: i32,
    pub features: Vec<f64>,
    pub actual: f64,
    pub trend: f64,
}

/// Per-state trend fit exposed to the trend table writer.
#[derive(Debug, Clone)]
pub struct TrendRowPublic {
    pub state: String,
    pub slope: f64,
    pub intercept: f64,
}

// ================================================================================================
// Helpers
// ================================================================================================

fn matrix(rows: &[Vec<f64>]) -> CropcastResult<DenseMatrix<f64>> {
    DenseMatrix::from_2d_vec(&rows.to_vec())
        .map_err(|e| ModelError::Training(e.to_string()).into())
}

fn forest_params(n_samples: usize) -> RandomForestRegressorParameters {
    RandomForestRegressorParameters::default()
        .with_n_trees(200)
        .with_max_depth(4)
        .with_min_samples_leaf((n_samples / 20).max(3))
}

/// Least-squares (slope, intercept) of yield against year.
pub fn linear_fit(series: &[(i32, f64)]) -> Option<(f64, f64)> {
    if series.len() < 2 {
        return None;
    }
    let n = series.len() as f64;
    let x_mean = series.iter().map(|(x, _)| *x as f64).sum::<f64>() / n;
    let y_mean = series.iter().map(|(_, y)| *y).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in series {
        let dx = *x as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den.abs() < f64::EPSILON {
        return None;
    }
    let slope = num / den;
    Some((slope, y_mean - slope * x_mean))
}

fn rank_model_a_features(x_a: &[Vec<f64>]) -> Vec<String> {
    // Rank by input variance as a proxy ordering for the metadata sidecar.
    let scaler = Scaler::fit(x_a);
    let mut ranked: Vec<(f64, &str)> = MODEL_A_FEATURES
        .iter()
        .enumerate()
        .map(|(i, name)| (scaler.stds.get(i).copied().unwrap_or(0.0), *name))
        .collect();
    ranked.sort_by_key(|(v, _)| std::cmp::Reverse(OrderedFloat(*v)));
    ranked.into_iter().map(|(_, name)| name.to_string()).collect()
}

fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> CropcastResult<()> {
    let text = serde_json::to_string(value).map_err(IoError::Json)?;
    std::fs::write(path, text).map_err(IoError::Io)?;
    Ok(())
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str) -> CropcastResult<T> {
    serde_json::from_str(text).map_err(|e| IoError::Json(e).into())
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round3(v: f64) -> f64 {
    (v * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_table_and_interpolation() {
        assert_eq!(confidence_for_week(10), 0.30);
        assert_eq!(confidence_for_week(40), 0.95);
        assert_eq!(confidence_for_week(5), 0.30);
        assert_eq!(confidence_for_week(45), 0.95);
        // Week 29 interpolates between 0.75 (28) and 0.80 (30).
        let c = confidence_for_week(29);
        assert!((c - 0.775).abs() < 1e-9);
        // Scenario bound: week 30 confidence in [0.75, 0.85].
        let c30 = confidence_for_week(30);
        assert!((0.75..=0.85).contains(&c30));
    }

    #[test]
    fn driver_rules_fire_in_priority_order() {
        let mut features = vec![0.0; ALL_NUMERIC_FEATURES.len()];
        features[feature_index("stress_days_drought")] = 9.0;
        features[feature_index("stress_days_heat")] = 6.0;
        // Drought outranks heat.
        assert_eq!(identify_driver(&features), "Drought stress");

        features[feature_index("stress_days_drought")] = 0.0;
        assert_eq!(identify_driver(&features), "Heat stress");

        features[feature_index("stress_days_heat")] = 0.0;
        features[feature_index("good_excellent_pct")] = 74.0;
        assert_eq!(identify_driver(&features), "Strong crop conditions");

        features[feature_index("good_excellent_pct")] = 40.0;
        assert_eq!(identify_driver(&features), "Poor crop conditions");

        features[feature_index("good_excellent_pct")] = 60.0;
        features[feature_index("precip_vs_normal_pct")] = -30.0;
        assert_eq!(identify_driver(&features), "Below-normal precipitation");

        features[feature_index("precip_vs_normal_pct")] = 0.0;
        assert_eq!(identify_driver(&features), "Normal conditions");
    }

    #[test]
    fn scaler_standardizes_and_guards_zero_variance() {
        let rows = vec![vec![1.0, 5.0], vec![3.0, 5.0], vec![5.0, 5.0]];
        let scaler = Scaler::fit(&rows);
        let t = scaler.transform(&[3.0, 5.0]);
        assert!((t[0]).abs() < 1e-9);
        // Constant column has std forced to 1, so it maps to 0 instead of NaN.
        assert!((t[1]).abs() < 1e-9);
    }

    #[test]
    fn analog_prediction_excludes_current_year_and_tracks_neighbors() {
        let mut features = vec![vec![0.0; ALL_NUMERIC_FEATURES.len()]; 4];
        let drought_idx = feature_index("stress_days_drought");
        // Two drought years (low yields vs trend), one normal year, plus a
        // same-year row that must be excluded.
        features[0][drought_idx] = 10.0;
        features[1][drought_idx] = 9.0;
        features[2][drought_idx] = 0.0;
        features[3][drought_idx] = 10.0;

        let analog = AnalogData {
            states: vec!["IA".into(), "IL".into(), "IA".into(), "IA".into()],
            years: vec![2012, 2013, 2014, 2025],
            yields: vec![140.0, 150.0, 200.0, 500.0],
            trend_yields: vec![180.0, 182.0, 184.0, 200.0],
            features,
            feature_names: ALL_NUMERIC_FEATURES.iter().map(|s| s.to_string()).collect(),
        };

        let mut current = vec![0.0; ALL_NUMERIC_FEATURES.len()];
        current[drought_idx] = 10.0;
        let (predicted, label) = analog.predict(&current, 190.0, 2025);

        // Nearest analogs are the drought years; prediction sits below trend.
        assert!(predicted < 190.0);
        assert!(label.contains("2012"));
        assert!(!label.contains("2025"));
    }

    #[test]
    fn linear_fit_recovers_slope() {
        let series = vec![(2020, 170.0), (2021, 172.0), (2022, 174.0), (2023, 176.0)];
        let (slope, intercept) = linear_fit(&series).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((intercept + 3870.0).abs() < 1.0);
        assert!(linear_fit(&[(2020, 1.0)]).is_none());
    }

    #[test]
    fn fitted_ensemble_predicts_below_trend_in_drought() {
        // Synthetic training set: yield deviation is -4 per drought day.
        let mut samples = Vec::new();
        for year in 2005..=2020 {
            for (state, base) in [("IA", 180.0), ("IL", 175.0), ("NE", 170.0)] {
                let drought_days = ((year - 2005) % 5) as f64 * 2.0;
                let mut features = vec![0.0; ALL_NUMERIC_FEATURES.len()];
                features[feature_index("stress_days_drought")] = drought_days;
                features[feature_index("condition_index")] = 70.0 - drought_days * 2.0;
                samples.push(TrainingSample {
                    state: state.to_string(),
                    year,
                    features,
                    actual: base - 4.0 * drought_days,
                    trend: base,
                });
            }
        }

        let models = YieldModel::fit(Crop::Corn, &samples, &(2005..=2020), 30).unwrap();
        assert_eq!(models.metadata.n_samples, samples.len());
        assert!(models.metadata.rmse_cv.is_some());

        let app = Config::builtin("/tmp/cropcast-test");
        let store: Arc<dyn Store> = Arc::new(crate::store::MemoryStore::new());
        let model = YieldModel::new(app, store);

        let mut drought_row = vec![0.0; ALL_NUMERIC_FEATURES.len()];
        drought_row[feature_index("stress_days_drought")] = 9.0;
        drought_row[feature_index("condition_index")] = 50.0;

        let (forecast, _) = model
            .ensemble(&models, &drought_row, GrowthStage::Reproductive, 180.0, 2025, Crop::Corn)
            .unwrap();
        assert!(
            forecast < 180.0,
            "drought conditions should pull the forecast below trend, got {forecast}"
        );
        assert_eq!(identify_driver(&drought_row), "Drought stress");
    }
}
