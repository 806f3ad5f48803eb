use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::{Datelike, Utc};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::OnceLock;

use crate::{
    collect::{
        contract::{Collector, CollectorConfig, FetchOutput, FetchRequest, SourceContext},
        parse::{self, PdfExtraction},
    },
    config::Config,
    error::{CollectError, CropcastResult},
    http::ArchiveFormat,
    store::{Row, Store, TableRef},
};

const BASE_URL: &str = "https://anec.com.br";

const COMMODITIES: [&str; 5] = ["SOYBEANS", "SOYBEAN MEAL", "CORN", "WHEAT", "SORGHUM"];

/// Weekly ANEC port line-up PDF: accumulated grain exports by port.
///
/// The PDF is cached per ISO week; re-runs within the week skip the download.
/// Parsing runs the three-step chain: structured layout rows, then a regex
/// over the extracted text (rows marked provisional), then falling back to
/// recording the raw file path for manual processing.
pub struct AnecLineupCollector {
    config: CollectorConfig,
    ctx: SourceContext,
}

fn lineup_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^\s*([A-ZÇÃÕÁÉÍÓÚÂÊ][A-ZÇÃÕÁÉÍÓÚÂÊ\s]{2,30}?)\s{2,}(SOYBEANS|SOYBEAN MEAL|CORN|WHEAT|SORGHUM)\s{2,}([\d.,]+)")
            .expect("valid lineup pattern")
    })
}

impl AnecLineupCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("anec_lineup", BASE_URL)
            .with_frequency(crate::collect::contract::Frequency::Weekly)
            .with_rate_limit(10.0);
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
        TableRef::bronze("anec_lineup")
    }

    /// Structured rows: `[port, commodity, volume, destination?]` shapes only.
    fn rows_from_table(
        &self,
        table_rows: &[Vec<String>],
        year: i32,
        week: u32,
    ) -> Vec<Row> {
        let mut out = Vec::new();
        for cells in table_rows {
            if cells.len() < 3 {
                continue;
            }
            let commodity_idx = cells
                .iter()
                .position(|c| COMMODITIES.contains(&c.to_uppercase().as_str()));
            let Some(idx) = commodity_idx else {
                continue;
            };
            if idx == 0 || idx + 1 >= cells.len() {
                continue;
            }
            let Ok(volume) = parse::parse_decimal(&cells[idx + 1]) else {
                continue;
            };

            let mut record = serde_json::Map::new();
            record.insert("data_source".into(), json!("ANEC"));
            record.insert("year".into(), json!(year));
            record.insert("week".into(), json!(week));
            record.insert("port".into(), json!(cells[idx - 1].clone()));
            record.insert("commodity".into(), json!(cells[idx].to_uppercase()));
            record.insert("volume_tons".into(), json!(volume));
            record.insert(
                "destination".into(),
                json!(cells.get(idx + 2).cloned()),
            );
            record.insert("provisional".into(), json!(false));
            record.insert("ingested_at".into(), json!(Utc::now()));
            out.push(record);
        }
        out
    }

    /// Regex fallback over raw text. Everything recovered here is marked
    /// provisional and kept out of balance aggregation downstream.
    fn rows_from_text(&self, text: &str, year: i32, week: u32) -> Vec<Row> {
        lineup_regex()
            .captures_iter(text)
            .filter_map(|caps| {
                let volume = parse::parse_decimal(caps.get(3)?.as_str()).ok()?;
                let mut record = serde_json::Map::new();
                record.insert("data_source".into(), json!("ANEC"));
                record.insert("year".into(), json!(year));
                record.insert("week".into(), json!(week));
                record.insert("port".into(), json!(caps.get(1)?.as_str().trim()));
                record.insert("commodity".into(), json!(caps.get(2)?.as_str()));
                record.insert("volume_tons".into(), json!(volume));
                record.insert("destination".into(), Value::Null);
                record.insert("provisional".into(), json!(true));
                record.insert("ingested_at".into(), json!(Utc::now()));
                Some(record)
            })
            .collect()
    }
}

#[async_trait]
impl Collector for AnecLineupCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
        let reference = request.start.unwrap_or_else(|| Utc::now().date_naive());
        let iso = reference.iso_week();
        let (year, week) = (iso.year(), iso.week());

        let cached_pdf = self.ctx.cache.lineup_pdf_path(week, year);
        let body: Vec<u8> = if cached_pdf.exists() {
            std::fs::read(&cached_pdf)?
        } else {
            let url = format!(
                "{}/wp-content/uploads/lineup/anec_exports_w{week:02}_{year}.pdf",
                self.config.source_url
            );
            let response = self.ctx.http.get(&url, &[]).await?;
            if response.status == 404 {
                return Err(CollectError::NotPublished {
                    source_name: self.config.source_name.clone(),
                    period: format!("{year}-W{week:02}"),
                }
                .into());
            }
            if !response.is_success() {
                return Err(CollectError::SourceUnavailable(format!(
                    "HTTP {} from ANEC",
                    response.status
                ))
                .into());
            }
            if let Some(parent) = cached_pdf.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&cached_pdf, &response.body)?;
            response.body.to_vec()
        };

        let archived = self
            .ctx
            .http
            .archive("anec_exports", &format!("w{week:02}_{year}"), ArchiveFormat::Pdf, &body)?
            .unwrap_or_else(|| cached_pdf.clone());

        let outcome = match parse::extract_pdf(&body, archived) {
            PdfExtraction::Table(rows) => json!({"table": rows}),
            PdfExtraction::Text(text) => json!({"text": text}),
            PdfExtraction::Unparsed(path) => json!({"unparsed": path.display().to_string()}),
        };

        let request_out = FetchRequest::default();
        let mut output = FetchOutput::new(
            json!({"year": year, "week": week, "outcome": outcome}),
            0,
            &request_out,
        );
        output.period_start = request.start;
        output.period_end = request.start;
        Ok(output)
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let year = data.get("year").and_then(Value::as_i64).unwrap_or(0) as i32;
        let week = data.get("week").and_then(Value::as_u64).unwrap_or(0) as u32;
        let outcome = data.get("outcome").cloned().unwrap_or(Value::Null);

        let rows = if let Some(table) = outcome.get("table").and_then(Value::as_array) {
            let cells: Vec<Vec<String>> = table
                .iter()
                .filter_map(Value::as_array)
                .map(|row| {
                    row.iter()
                        .map(|c| c.as_str().unwrap_or_default().to_string())
                        .collect()
                })
                .collect();
            let structured = self.rows_from_table(&cells, year, week);
            if structured.is_empty() {
                // The layout parse produced nothing useful; join the cells
                // back into lines and run the regex fallback.
                let text: String = cells
                    .iter()
                    .map(|r| r.join("  "))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.rows_from_text(&text, year, week)
            } else {
                structured
            }
        } else if let Some(text) = outcome.get("text").and_then(Value::as_str) {
            self.rows_from_text(text, year, week)
        } else if let Some(path) = outcome.get("unparsed").and_then(Value::as_str) {
            // Nothing machine-readable; keep the pointer so the week can be
            // processed manually and re-ingested.
            let mut record = serde_json::Map::new();
            record.insert("data_source".into(), json!("ANEC"));
            record.insert("year".into(), json!(year));
            record.insert("week".into(), json!(week));
            record.insert("port".into(), json!("UNPARSED"));
            record.insert("commodity".into(), json!("UNPARSED"));
            record.insert("volume_tons".into(), Value::Null);
            record.insert("raw_path".into(), json!(path));
            record.insert("provisional".into(), json!(true));
            record.insert("ingested_at".into(), json!(Utc::now()));
            vec![record]
        } else {
            Vec::new()
        };

        Ok(BTreeMap::from([(Self::table(), rows)]))
    }

    fn unique_columns(&self, _table: &TableRef, _rows: &[Row]) -> Vec<String> {
        ["year", "week", "port", "commodity"].map(String::from).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    fn collector() -> AnecLineupCollector {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("anec_lineup", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        AnecLineupCollector::with_context(config, ctx)
    }

    #[test]
    fn structured_rows_parse_port_commodity_volume() {
        let c = collector();
        let data = json!({"year": 2025, "week": 7, "outcome": {"table": [
            ["PORT", "COMMODITY", "VOLUME", "DESTINATION"],
            ["SANTOS", "SOYBEANS", "820.500,25", "CHINA"],
            ["PARANAGUA", "CORN", "310.000", "IRAN"],
            ["footer text", "ignored"]
        ]}});
        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&AnecLineupCollector::table()];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["port"], "SANTOS");
        assert_eq!(rows[0]["volume_tons"], json!(820_500.25));
        assert_eq!(rows[0]["provisional"], json!(false));
        assert_eq!(rows[1]["destination"], json!("IRAN"));
    }

    #[test]
    fn text_fallback_marks_rows_provisional() {
        let c = collector();
        let text = "WEEKLY LINE-UP\nSANTOS    SOYBEANS   120.500\nRIO GRANDE    CORN   45.250\n";
        let data = json!({"year": 2025, "week": 7, "outcome": {"text": text}});
        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&AnecLineupCollector::table()];
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r["provisional"] == json!(true)));
        assert_eq!(rows[1]["port"], "RIO GRANDE");
    }

    #[test]
    fn unparsed_pdf_records_the_raw_path() {
        let c = collector();
        let data = json!({"year": 2025, "week": 7, "outcome": {"unparsed": "/data/raw/anec_w07.pdf"}});
        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&AnecLineupCollector::table()];
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["raw_path"], "/data/raw/anec_w07.pdf");
    }
}
