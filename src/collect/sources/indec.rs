use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::{
    collect::{
        contract::{Collector, CollectorConfig, FetchOutput, FetchRequest, SourceContext},
        parse,
        sources::TradeCollector,
    },
    config::Config,
    error::{CollectError, CropcastResult},
    http::ArchiveFormat,
    store::{Row, Store, TableRef, to_rows},
    trade::record::{Flow, TradeRecord},
};

const BASE_URL: &str = "https://comex.indec.gob.ar";

/// Argentina trade data from INDEC monthly CSV downloads.
///
/// Semicolon-delimited, Spanish headers, comma-decimal numbers. Monthly
/// release mid-month for the previous month; a missing file (404) means the
/// period is not published yet.
pub struct IndecCollector {
    config: CollectorConfig,
    ctx: SourceContext,
}

impl IndecCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("indec", BASE_URL)
            .with_rate_limit(20.0)
            .with_cache(24);
        let ctx = SourceContext::new(app, store, &config)?;
        Ok(Self { config, ctx })
    }

    pub fn with_context(mut config: CollectorConfig, ctx: SourceContext) -> Self {
        if config.source_url.is_empty() {
            config.source_url = BASE_URL.to_string();
        }
        Self { config, ctx }
    }

    fn download_url(&self, year: i32, month: u32, flow: Flow) -> String {
        let kind = match flow {
            Flow::Export => "exponcm",
            Flow::Import => "imponcm",
        };
        format!(
            "{}/files/{kind}/{kind}_{year}_{month:02}.csv",
            self.config.source_url
        )
    }

    /// Parse the semicolon CSV body into JSON rows keyed by header name.
    fn csv_to_rows(body: &[u8]) -> CropcastResult<Vec<Value>> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .flexible(true)
            .from_reader(body);

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| CollectError::Parse(e.to_string()))?
            .iter()
            .map(|h| h.trim().to_lowercase())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let Ok(record) = record else {
                continue;
            };
            let mut obj = serde_json::Map::new();
            for (header, field) in headers.iter().zip(record.iter()) {
                obj.insert(header.clone(), Value::String(field.trim().to_string()));
            }
            rows.push(Value::Object(obj));
        }
        Ok(rows)
    }

    fn transform_row(&self, row: &Value, flow: Flow) -> Option<TradeRecord> {
        let year = parse::field_i64(row, &["anio", "año", "year"])? as i32;
        let month = parse::field_i64(row, &["mes", "month"])? as u32;
        let ncm = parse::field_str(row, &["ncm", "posicion", "posicion_ncm"])?.replace('.', "");

        let kg = parse::field_str(row, &["pnet_kg", "peso_neto_kg", "kilos"])
            .and_then(|s| parse::parse_decimal(&s).ok());
        let fob = parse::field_str(row, &["fob_usd", "valor_fob", "fob"])
            .and_then(|s| parse::parse_decimal(&s).ok());
        let cif = parse::field_str(row, &["cif_usd", "valor_cif", "cif"])
            .and_then(|s| parse::parse_decimal(&s).ok());

        let value_usd = match flow {
            Flow::Export => fob.unwrap_or(0.0),
            Flow::Import => cif.or(fob).unwrap_or(0.0),
        };

        Some(TradeRecord {
            data_source: "INDEC".to_string(),
            reporter_country: "ARG".to_string(),
            flow,
            year,
            month,
            period: TradeRecord::period_of(year, month),
            hs_level: ncm.len() as u8,
            hs_code_6: (ncm.len() >= 6).then(|| ncm[..6].to_string()),
            hs_code: ncm,
            partner_country: parse::field_str(row, &["pais", "pais_destino", "pais_origen"])
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            quantity_kg: kg,
            quantity_tons: kg.map(|v| v * 1e-3),
            value_usd,
            value_fob_usd: fob,
            value_cif_usd: cif,
            hs_description: parse::field_str(row, &["descripcion", "descripción"]),
            state_region: None,
            customs_office: parse::field_str(row, &["aduana"]),
            provisional: false,
            ingested_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Collector for IndecCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
        let (year, month) = request
            .start
            .map(|d| {
                use chrono::Datelike;
                (d.year(), d.month())
            })
            .ok_or_else(|| CollectError::Parse("fetch requires a period".to_string()))?;
        let flow: Flow = request
            .param("flow")
            .unwrap_or("export")
            .parse()
            .map_err(CollectError::ParseEnum)?;
        self.fetch_trade(year, month, flow).await
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let flow: Flow = data
            .get("flow")
            .and_then(Value::as_str)
            .unwrap_or("export")
            .parse()
            .map_err(CollectError::ParseEnum)?;
        let records = self.transform_trade(data, flow)?;
        Ok(BTreeMap::from([(TradeRecord::table(), to_rows(&records)?)]))
    }

    fn unique_columns(&self, _table: &TableRef, _rows: &[Row]) -> Vec<String> {
        TradeRecord::UNIQUE_COLUMNS.map(String::from).to_vec()
    }
}

#[async_trait]
impl TradeCollector for IndecCollector {
    fn reporter(&self) -> &'static str {
        "ARG"
    }

    async fn fetch_trade(&self, year: i32, month: u32, flow: Flow) -> CropcastResult<FetchOutput> {
        let url = self.download_url(year, month, flow);
        let response = self.ctx.http.get(&url, &[]).await?;

        if response.status == 404 {
            return Err(CollectError::NotPublished {
                source_name: self.config.source_name.clone(),
                period: TradeRecord::period_of(year, month),
            }
            .into());
        }
        if !response.is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "HTTP {} from {url}",
                response.status
            ))
            .into());
        }

        self.ctx.http.archive(
            "indec",
            &format!("{flow}_{year}{month:02}"),
            ArchiveFormat::Csv,
            &response.body,
        )?;

        let rows = Self::csv_to_rows(&response.body)?;
        let count = rows.len();
        let request = FetchRequest::month(year, month);
        Ok(FetchOutput::new(
            json!({"flow": flow, "records": rows}),
            count,
            &request,
        ))
    }

    fn transform_trade(&self, data: &Value, flow: Flow) -> CropcastResult<Vec<TradeRecord>> {
        let rows = data
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = rows.len();
        let records: Vec<TradeRecord> = rows
            .iter()
            .filter_map(|row| self.transform_row(row, flow))
            .collect();

        let failed = total - records.len();
        if total > 0 && failed * 5 > total {
            return Err(CollectError::ParseRateExceeded { failed, total }.into());
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    fn collector() -> IndecCollector {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("indec", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        IndecCollector::with_context(config, ctx)
    }

    #[test]
    fn parses_semicolon_csv_with_spanish_decimals() {
        let body = b"anio;mes;ncm;pais;pnet_kg;fob_usd\n2024;7;1201.90.00;China;1.500.000,5;750.250,25\n";
        let rows = IndecCollector::csv_to_rows(body).unwrap();
        assert_eq!(rows.len(), 1);

        let c = collector();
        let data = json!({"flow": "export", "records": rows});
        let records = c.transform_trade(&data, Flow::Export).unwrap();
        assert_eq!(records.len(), 1);

        let r = &records[0];
        assert_eq!(r.hs_code, "12019000");
        assert_eq!(r.hs_code_6.as_deref(), Some("120190"));
        assert_eq!(r.quantity_kg, Some(1_500_000.5));
        assert!((r.value_usd - 750_250.25).abs() < 1e-9);
        assert_eq!(r.period, "2024-07");
    }

    #[test]
    fn download_url_per_flow() {
        let c = collector();
        assert!(c.download_url(2024, 3, Flow::Export).ends_with("exponcm_2024_03.csv"));
        assert!(c.download_url(2024, 3, Flow::Import).ends_with("imponcm_2024_03.csv"));
    }
}
