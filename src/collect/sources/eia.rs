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

const BASE_URL: &str = "https://api.eia.gov/v2";

/// Weekly fuel-ethanol production and stocks from the EIA v2 API.
///
/// Ethanol demand is the swing factor for corn balance sheets; the weekly
/// series lands in bronze for the monitor views.
pub struct EiaEthanolCollector {
    config: CollectorConfig,
    ctx: SourceContext,
    api_key: Option<String>,
}

impl EiaEthanolCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("eia_ethanol", BASE_URL)
            .with_auth(AuthKind::ApiKey)
            .with_frequency(crate::collect::contract::Frequency::Weekly)
            .with_rate_limit(30.0);
        let ctx = SourceContext::new(app, store, &config)?;
        Ok(Self {
            config,
            ctx,
            api_key: credentials::eia_api_key().ok(),
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

    pub fn table() -> TableRef {
        TableRef::bronze("eia_ethanol_weekly")
    }
}

#[async_trait]
impl Collector for EiaEthanolCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn authenticate(&self) -> CropcastResult<()> {
        if self.api_key.is_none() {
            return Err(CollectError::MissingCredential("EIA_API_KEY".to_string()).into());
        }
        Ok(())
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
        let url = format!(
            "{}/petroleum/pnp/wprodeb/data/",
            self.config.source_url
        );
        let mut params = vec![
            ("frequency", "weekly".to_string()),
            ("data[0]", "value".to_string()),
            ("sort[0][column]", "period".to_string()),
            ("sort[0][direction]", "desc".to_string()),
            ("length", "500".to_string()),
        ];
        if let Some(start) = request.start {
            params.push(("start", start.to_string()));
        }
        if let Some(end) = request.end {
            params.push(("end", end.to_string()));
        }
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let response = self.ctx.http.get(&url, &params).await?;
        if !response.is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "HTTP {} from EIA",
                response.status
            ))
            .into());
        }

        self.ctx
            .http
            .archive("eia_ethanol", "weekly", ArchiveFormat::Json, &response.body)?;

        let body: Value = response.json()?;
        let rows = body
            .pointer("/response/data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let count = rows.len();
        Ok(FetchOutput::new(json!({"rows": rows}), count, request))
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let rows = data
            .get("rows")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for row in &rows {
            let Some(period) = parse::field_str(row, &["period"]) else {
                continue;
            };
            let Some(value) = parse::field_f64(row, &["value"]) else {
                continue;
            };
            let mut record = serde_json::Map::new();
            record.insert("data_source".into(), json!("EIA"));
            record.insert("week_ending".into(), json!(period));
            record.insert(
                "series".into(),
                json!(parse::field_str(row, &["series", "seriesId", "series-description"])
                    .unwrap_or_else(|| "ethanol_production".to_string())),
            );
            record.insert("area".into(), json!(parse::field_str(row, &["area-name", "duoarea"])));
            // Thousand barrels per day.
            record.insert("value_mbbl_d".into(), json!(value));
            record.insert(
                "unit".into(),
                json!(parse::field_str(row, &["units", "unit"])),
            );
            record.insert("ingested_at".into(), json!(Utc::now()));
            out.push(record);
        }
        Ok(BTreeMap::from([(Self::table(), out)]))
    }

    fn unique_columns(&self, _table: &TableRef, _rows: &[Row]) -> Vec<String> {
        ["week_ending", "series", "area"].map(String::from).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    #[test]
    fn ethanol_rows_carry_period_and_value() {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("eia_ethanol", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        let c = EiaEthanolCollector::with_context(config, ctx);

        let data = json!({"rows": [
            {"period": "2024-08-02", "value": "1067", "units": "MBBL/D", "duoarea": "NUS"}
        ]});
        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&EiaEthanolCollector::table()];
        assert_eq!(rows[0]["week_ending"], "2024-08-02");
        assert_eq!(rows[0]["value_mbbl_d"], json!(1067.0));
    }
}
