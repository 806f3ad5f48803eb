use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::{
    collect::{
        contract::{AuthKind, Collector, CollectorConfig, FetchOutput, FetchRequest, SourceContext},
        parse,
    },
    config::{Config, credentials},
    error::{CollectError, CropcastResult},
    http::ArchiveFormat,
    store::{Row, Store, TableRef},
};

const BASE_URL: &str = "https://quickstats.nass.usda.gov/api";

/// USDA NASS Quick Stats collector: weekly crop condition and progress plus
/// annual state yields. These bronze tables feed the yield feature engine.
pub struct NassCollector {
    config: CollectorConfig,
    ctx: SourceContext,
    api_key: Option<String>,
}

impl NassCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("usda_nass", BASE_URL)
            .with_auth(AuthKind::ApiKey)
            .with_rate_limit(30.0)
            .with_cache(6);
        let ctx = SourceContext::new(app, store, &config)?;
        Ok(Self {
            config,
            ctx,
            api_key: credentials::nass_api_key().ok(),
        })
    }

    pub fn with_context(mut config: CollectorConfig, ctx: SourceContext) -> Self {
        if config.source_url.is_empty() {
            config.source_url = BASE_URL.to_string();
        }
        Self {
            config,
            ctx,
            api_key: None,
        }
    }

    pub fn condition_table() -> TableRef {
        TableRef::bronze("nass_crop_condition")
    }

    pub fn progress_table() -> TableRef {
        TableRef::bronze("nass_crop_progress")
    }

    pub fn yields_table() -> TableRef {
        TableRef::bronze("nass_state_yields")
    }

    /// `"PCT GOOD"` → `"GOOD"`, `"PCT PLANTED"` → `"PLANTED"`.
    fn category_from_unit(unit: &str) -> String {
        unit.trim()
            .strip_prefix("PCT ")
            .unwrap_or(unit.trim())
            .to_uppercase()
    }

    fn quickstats_params(&self, statistic: &str, commodity: &str, year: i32) -> Vec<(&str, String)> {
        let mut params = vec![
            ("commodity_desc", commodity.to_uppercase()),
            ("year", year.to_string()),
            ("format", "JSON".to_string()),
        ];
        match statistic {
            "condition" => {
                params.push(("statisticcat_desc", "CONDITION".to_string()));
                params.push(("agg_level_desc", "NATIONAL".to_string()));
            }
            "progress" => {
                params.push(("statisticcat_desc", "PROGRESS".to_string()));
                params.push(("agg_level_desc", "NATIONAL".to_string()));
            }
            _ => {
                params.push(("statisticcat_desc", "YIELD".to_string()));
                params.push(("agg_level_desc", "STATE".to_string()));
            }
        }
        if let Some(key) = &self.api_key {
            params.push(("key", key.clone()));
        }
        params
    }
}

#[async_trait]
impl Collector for NassCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn authenticate(&self) -> CropcastResult<()> {
        if self.api_key.is_none() {
            return Err(CollectError::MissingCredential("NASS_API_KEY".to_string()).into());
        }
        Ok(())
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
        let statistic = request.param("statistic").unwrap_or("condition").to_string();
        let commodity = request.param("commodity").unwrap_or("CORN").to_string();
        let year = request
            .start
            .map(|d| {
                use chrono::Datelike;
                d.year()
            })
            .unwrap_or_else(|| {
                use chrono::Datelike;
                Utc::now().year()
            });

        let url = format!("{}/api_GET/", self.config.source_url);
        let params = self.quickstats_params(&statistic, &commodity, year);
        let response = self.ctx.http.get(&url, &params).await?;

        if !response.is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "HTTP {} from Quick Stats",
                response.status
            ))
            .into());
        }

        self.ctx.http.archive(
            "nass_quickstats",
            &format!("{statistic}_{commodity}_{year}"),
            ArchiveFormat::Json,
            &response.body,
        )?;

        let body: Value = response.json()?;
        let rows = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let count = rows.len();

        Ok(FetchOutput::new(
            json!({"statistic": statistic, "rows": rows}),
            count,
            request,
        ))
    }

    fn validate_data(&self, data: &Value) -> CropcastResult<()> {
        match data.get("rows").and_then(Value::as_array) {
            Some(rows) if !rows.is_empty() => Ok(()),
            _ => Err(CollectError::Validation {
                source_name: self.config.source_name.clone(),
                msg: "Quick Stats returned no rows".to_string(),
            }
            .into()),
        }
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let statistic = data.get("statistic").and_then(Value::as_str).unwrap_or("");
        let rows = data
            .get("rows")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out: Vec<Row> = Vec::new();
        for row in &rows {
            let Some(commodity) = parse::field_str(row, &["commodity_desc", "commodity"]) else {
                continue;
            };
            // Quick Stats encodes values with thousands separators.
            let value = parse::field_str(row, &["Value", "value"])
                .map(|v| v.replace(',', ""))
                .and_then(|v| v.trim().parse::<f64>().ok());

            let mut record = serde_json::Map::new();
            record.insert("data_source".into(), json!("NASS_QUICKSTATS"));
            record.insert("commodity".into(), json!(commodity.to_lowercase()));
            record.insert("ingested_at".into(), json!(Utc::now()));

            match statistic {
                "condition" => {
                    let Some(unit) = parse::field_str(row, &["unit_desc"]) else {
                        continue;
                    };
                    record.insert("state".into(), json!(parse::field_str(row, &["state_alpha"]).unwrap_or_else(|| "US".into())));
                    record.insert(
                        "week_ending".into(),
                        json!(parse::field_str(row, &["week_ending"]).unwrap_or_default()),
                    );
                    record.insert("condition_category".into(), json!(Self::category_from_unit(&unit)));
                    record.insert("value".into(), json!(value));
                }
                "progress" => {
                    let Some(unit) = parse::field_str(row, &["unit_desc"]) else {
                        continue;
                    };
                    record.insert("state".into(), json!(parse::field_str(row, &["state_alpha"]).unwrap_or_else(|| "US".into())));
                    record.insert(
                        "week_ending".into(),
                        json!(parse::field_str(row, &["week_ending"]).unwrap_or_default()),
                    );
                    record.insert("category".into(), json!(Self::category_from_unit(&unit)));
                    record.insert("value".into(), json!(value));
                }
                _ => {
                    let Some(state) = parse::field_str(row, &["state_alpha"]) else {
                        continue;
                    };
                    let Some(year) = parse::field_i64(row, &["year"]) else {
                        continue;
                    };
                    record.insert("state_abbrev".into(), json!(state));
                    record.insert("year".into(), json!(year));
                    record.insert("yield_per_acre".into(), json!(value));
                }
            }
            out.push(record);
        }

        let table = match statistic {
            "condition" => Self::condition_table(),
            "progress" => Self::progress_table(),
            _ => Self::yields_table(),
        };
        Ok(BTreeMap::from([(table, out)]))
    }

    fn unique_columns(&self, table: &TableRef, _rows: &[Row]) -> Vec<String> {
        let cols: &[&str] = if table == &Self::condition_table() {
            &["commodity", "state", "week_ending", "condition_category"]
        } else if table == &Self::progress_table() {
            &["commodity", "state", "week_ending", "category"]
        } else {
            &["commodity", "state_abbrev", "year"]
        };
        cols.iter().map(|c| c.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    fn collector() -> NassCollector {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("usda_nass", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        NassCollector::with_context(config, ctx)
    }

    #[test]
    fn condition_rows_pivot_on_unit_desc() {
        let c = collector();
        let data = json!({"statistic": "condition", "rows": [
            {"commodity_desc": "CORN", "unit_desc": "PCT EXCELLENT", "week_ending": "2024-07-21", "Value": "18"},
            {"commodity_desc": "CORN", "unit_desc": "PCT GOOD", "week_ending": "2024-07-21", "Value": "49"}
        ]});
        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&NassCollector::condition_table()];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["condition_category"], "EXCELLENT");
        assert_eq!(rows[1]["value"], json!(49.0));
    }

    #[test]
    fn yield_rows_keep_state_and_year() {
        let c = collector();
        let data = json!({"statistic": "yield", "rows": [
            {"commodity_desc": "CORN", "state_alpha": "IA", "year": 2023, "Value": "1,201"}
        ]});
        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&NassCollector::yields_table()];
        assert_eq!(rows[0]["state_abbrev"], "IA");
        assert_eq!(rows[0]["yield_per_acre"], json!(1201.0));
    }

    #[test]
    fn unique_columns_per_table() {
        let c = collector();
        assert_eq!(
            c.unique_columns(&NassCollector::yields_table(), &[]),
            vec!["commodity", "state_abbrev", "year"]
        );
    }
}
