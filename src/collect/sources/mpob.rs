use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::{
    collect::{
        contract::{Collector, CollectorConfig, FetchOutput, FetchRequest, SourceContext},
        parse,
    },
    config::Config,
    error::{CollectError, CropcastResult},
    http::ArchiveFormat,
    store::{Row, Store, TableRef},
};

const BASE_URL: &str = "https://bepi.mpob.gov.my";

/// Malaysian Palm Oil Board monthly statistics, scraped from the published
/// HTML tables. The stats page carries one table per indicator; the one whose
/// header mentions production and stocks is the monthly balance.
pub struct MpobCollector {
    config: CollectorConfig,
    ctx: SourceContext,
}

impl MpobCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("mpob", BASE_URL)
            .with_rate_limit(10.0)
            .with_cache(24)
            .with_per_record_audit();
        let ctx = SourceContext::new(app, store, &config)?;
        Ok(Self { config, ctx })
    }

    pub fn with_context(mut config: CollectorConfig, ctx: SourceContext) -> Self {
        if config.source_url.is_empty() {
            config.source_url = BASE_URL.to_string();
        }
        Self { config, ctx }
    }

    pub fn table() -> TableRef {
        TableRef::bronze("mpob_palm_stats")
    }

    fn rows_from_html(&self, html: &str, year: i32) -> Vec<Row> {
        let Some(table) = parse::find_table_by_headers(html, &["month", "production"]) else {
            return Vec::new();
        };

        // Column positions from the header row; anything else is carried
        // under its header name.
        let headers: Vec<String> = table
            .headers
            .iter()
            .map(|h| h.to_lowercase().replace([' ', '(', ')'], "_"))
            .collect();

        table
            .rows
            .iter()
            .filter(|cells| cells.len() == headers.len() && !cells[0].is_empty())
            .map(|cells| {
                let mut record = serde_json::Map::new();
                record.insert("data_source".into(), json!("MPOB"));
                record.insert("year".into(), json!(year));
                for (header, cell) in headers.iter().zip(cells.iter()) {
                    let value = match parse::parse_decimal(cell) {
                        Ok(n) => json!(n),
                        Err(_) => json!(cell),
                    };
                    record.insert(header.clone(), value);
                }
                record.insert("ingested_at".into(), json!(Utc::now()));
                record
            })
            .collect()
    }
}

#[async_trait]
impl Collector for MpobCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
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

        let url = format!(
            "{}/index.php/statistics/production/{year}",
            self.config.source_url
        );
        let response = self.ctx.http.get(&url, &[]).await?;
        if !response.is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "HTTP {} from MPOB",
                response.status
            ))
            .into());
        }

        self.ctx.http.archive(
            "mpob_stats",
            &year.to_string(),
            ArchiveFormat::Html,
            &response.body,
        )?;

        Ok(FetchOutput::new(
            json!({"year": year, "html": response.text()}),
            0,
            request,
        ))
    }

    fn validate_data(&self, data: &Value) -> CropcastResult<()> {
        let html = data.get("html").and_then(Value::as_str).unwrap_or_default();
        if parse::find_table_by_headers(html, &["month", "production"]).is_none() {
            return Err(CollectError::Validation {
                source_name: self.config.source_name.clone(),
                msg: "no statistics table found in page".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let year = data.get("year").and_then(Value::as_i64).unwrap_or(0) as i32;
        let html = data.get("html").and_then(Value::as_str).unwrap_or_default();
        Ok(BTreeMap::from([(
            Self::table(),
            self.rows_from_html(html, year),
        )]))
    }

    fn unique_columns(&self, _table: &TableRef, _rows: &[Row]) -> Vec<String> {
        ["year", "month"].map(String::from).to_vec()
    }

    fn entity_label(&self, row: &Row) -> String {
        format!(
            "MPOB {} {}",
            row.get("year").and_then(Value::as_i64).unwrap_or_default(),
            row.get("month").and_then(Value::as_str).unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    #[test]
    fn scrapes_the_monthly_balance_table() {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("mpob", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        let c = MpobCollector::with_context(config, ctx);

        let html = r#"
            <table>
              <tr><th>Month</th><th>Production</th><th>Exports</th><th>Closing Stocks</th></tr>
              <tr><td>January</td><td>1.402.381</td><td>1.201.114</td><td>2.020.550</td></tr>
              <tr><td>February</td><td>1.260.555</td><td>1.110.899</td><td>1.919.223</td></tr>
            </table>
        "#;
        let data = json!({"year": 2024, "html": html});
        assert!(c.validate_data(&data).is_ok());

        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&MpobCollector::table()];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["month"], "January");
        assert_eq!(rows[0]["production"], json!(1_402_381.0));
        assert_eq!(rows[1]["closing_stocks"], json!(1_919_223.0));
    }
}
