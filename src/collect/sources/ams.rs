use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, stream};
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

const BASE_URL: &str = "https://marsapi.ams.usda.gov/services/v1.2";
/// Concurrent in-flight report fetches. The session rate gate still spaces
/// the individual requests.
const FANOUT_LIMIT: usize = 4;

const DEFAULT_REPORTS: [&str; 4] = [
    "grain-daily-cash",
    "national-daily-ethanol",
    "soybean-processor-bids",
    "feedstuffs-weekly",
];

/// USDA AMS market price reports via the MyMarketNews API.
///
/// One HTTP request per report slug, fanned out with a bounded concurrency
/// limiter and joined into a single payload.
pub struct AmsCollector {
    config: CollectorConfig,
    ctx: SourceContext,
    api_key: Option<String>,
}

impl AmsCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("usda_ams", BASE_URL)
            .with_auth(AuthKind::ApiKey)
            .with_frequency(crate::collect::contract::Frequency::Daily)
            .with_rate_limit(60.0);
        let ctx = SourceContext::new(app, store, &config)?;
        Ok(Self {
            config,
            ctx,
            api_key: credentials::usda_ams_api_key().ok(),
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

    pub fn prices_table() -> TableRef {
        TableRef::bronze("ams_market_prices")
    }

    async fn fetch_report(&self, slug: &str, date: &str) -> (String, CropcastResult<Vec<Value>>) {
        let url = format!("{}/reports/{slug}", self.config.source_url);
        let mut params = vec![("q", format!("report_begin_date={date}"))];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let outcome = async {
            let response = self.ctx.http.get(&url, &params).await?;
            if !response.is_success() {
                return Err(CollectError::SourceUnavailable(format!(
                    "HTTP {} for report {slug}",
                    response.status
                ))
                .into());
            }
            self.ctx
                .http
                .archive("ams", slug, ArchiveFormat::Json, &response.body)?;
            let body: Value = response.json()?;
            Ok(body
                .get("results")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default())
        }
        .await;

        (slug.to_string(), outcome)
    }
}

#[async_trait]
impl Collector for AmsCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn authenticate(&self) -> CropcastResult<()> {
        if self.api_key.is_none() {
            return Err(CollectError::MissingCredential("USDA_AMS_API_KEY".to_string()).into());
        }
        Ok(())
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
        let date = request
            .start
            .map(|d| d.to_string())
            .unwrap_or_else(|| Utc::now().date_naive().to_string());
        let slugs: Vec<String> = request
            .param("reports")
            .map(|list| list.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| DEFAULT_REPORTS.iter().map(|s| s.to_string()).collect());

        let mut futures_list = Vec::with_capacity(slugs.len());
        for slug in &slugs {
            futures_list.push(self.fetch_report(slug, &date));
        }
        let fetches = stream::iter(futures_list)
            .buffer_unordered(FANOUT_LIMIT)
            .collect::<Vec<_>>()
            .await;

        let mut reports = serde_json::Map::new();
        let mut warnings = Vec::new();
        let mut count = 0usize;
        for (slug, outcome) in fetches {
            match outcome {
                Ok(rows) => {
                    count += rows.len();
                    reports.insert(slug, Value::Array(rows));
                }
                Err(e) => warnings.push(format!("{slug}: {e}")),
            }
        }

        if reports.is_empty() {
            return Err(CollectError::SourceUnavailable(
                "every AMS report fetch failed".to_string(),
            )
            .into());
        }

        let mut output = FetchOutput::new(json!({"reports": reports, "date": date}), count, request);
        output.warnings = warnings;
        Ok(output)
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let date = data.get("date").and_then(Value::as_str).unwrap_or_default();
        let empty = serde_json::Map::new();
        let reports = data
            .get("reports")
            .and_then(Value::as_object)
            .unwrap_or(&empty);

        let mut out = Vec::new();
        for (slug, rows) in reports {
            for row in rows.as_array().cloned().unwrap_or_default() {
                let Some(commodity) = parse::field_str(&row, &["commodity", "commodity_name"])
                else {
                    continue;
                };
                let mut record = serde_json::Map::new();
                record.insert("data_source".into(), json!("USDA_AMS"));
                record.insert("report_slug".into(), json!(slug));
                record.insert(
                    "report_date".into(),
                    json!(parse::field_str(&row, &["report_date", "report_begin_date"])
                        .unwrap_or_else(|| date.to_string())),
                );
                record.insert("commodity".into(), json!(commodity));
                record.insert(
                    "market_location".into(),
                    json!(parse::field_str(&row, &["market_location_name", "location", "office_name"])),
                );
                record.insert(
                    "price_avg".into(),
                    json!(parse::field_f64(&row, &["avg_price", "price_avg", "wtd_avg_price"])),
                );
                record.insert(
                    "price_low".into(),
                    json!(parse::field_f64(&row, &["low_price", "price_low"])),
                );
                record.insert(
                    "price_high".into(),
                    json!(parse::field_f64(&row, &["high_price", "price_high"])),
                );
                record.insert(
                    "unit".into(),
                    json!(parse::field_str(&row, &["unit", "price_unit"])),
                );
                record.insert("ingested_at".into(), json!(Utc::now()));
                out.push(record);
            }
        }
        Ok(BTreeMap::from([(Self::prices_table(), out)]))
    }

    fn unique_columns(&self, _table: &TableRef, _rows: &[Row]) -> Vec<String> {
        ["report_slug", "report_date", "commodity", "market_location"]
            .map(String::from)
            .to_vec()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    #[test]
    fn joins_reports_into_price_rows() {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("usda_ams", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        let c = AmsCollector::with_context(config, ctx);

        let data = json!({"date": "2024-08-05", "reports": {
            "grain-daily-cash": [
                {"commodity": "Corn", "market_location_name": "Omaha", "avg_price": 4.15, "unit": "bu"},
                {"commodity": "Soybeans", "avg_price": 10.42}
            ]
        }});
        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&AmsCollector::prices_table()];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["report_slug"], "grain-daily-cash");
        assert_eq!(rows[0]["price_avg"], json!(4.15));
        assert_eq!(rows[1]["report_date"], "2024-08-05");
    }
}
