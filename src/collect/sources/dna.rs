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

const BASE_URL: &str = "https://catalogodatos.gub.uy";
const PAGE_SIZE: usize = 5000;

/// Uruguay customs (DNA) trade data via the national CKAN datastore.
///
/// `datastore_search` with `limit`/`offset` and a JSON `filters` object; the
/// cursor ends when a page comes back shorter than the limit.
pub struct DnaCollector {
    config: CollectorConfig,
    ctx: SourceContext,
}

impl DnaCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("dna_uruguay", BASE_URL)
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

    fn resource_id(flow: Flow) -> &'static str {
        match flow {
            Flow::Export => "dna-exportaciones-mensual",
            Flow::Import => "dna-importaciones-mensual",
        }
    }

    fn transform_row(&self, row: &Value, flow: Flow) -> Option<TradeRecord> {
        let year = parse::field_i64(row, &["anio", "año", "year"])? as i32;
        let month = parse::field_i64(row, &["mes", "month"])? as u32;
        let code =
            parse::field_str(row, &["ncm", "item", "codigo_ncm", "hs_code"])?.replace('.', "");

        let kg = parse::field_f64(row, &["peso_kg", "kilos", "peso_neto"]);
        let fob = parse::field_f64(row, &["fob_usd", "valor_fob", "monto_fob"]);
        let cif = parse::field_f64(row, &["cif_usd", "valor_cif", "monto_cif"]);
        let value_usd = match flow {
            Flow::Export => fob.unwrap_or(0.0),
            Flow::Import => cif.or(fob).unwrap_or(0.0),
        };

        Some(TradeRecord {
            data_source: "DNA_URUGUAY".to_string(),
            reporter_country: "URY".to_string(),
            flow,
            year,
            month,
            period: TradeRecord::period_of(year, month),
            hs_level: code.len() as u8,
            hs_code_6: (code.len() >= 6).then(|| code[..6].to_string()),
            hs_code: code,
            partner_country: parse::field_str(row, &["pais", "pais_destino", "pais_origen"])
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            quantity_kg: kg,
            quantity_tons: kg.map(|v| v * 1e-3),
            value_usd,
            value_fob_usd: fob,
            value_cif_usd: cif,
            hs_description: parse::field_str(row, &["descripcion", "glosa"]),
            state_region: None,
            customs_office: parse::field_str(row, &["aduana"]),
            provisional: false,
            ingested_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Collector for DnaCollector {
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
        let flow: Flow = request.param("flow").unwrap_or("export").parse()?;
        self.fetch_trade(year, month, flow).await
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let flow: Flow = data
            .get("flow")
            .and_then(Value::as_str)
            .unwrap_or("export")
            .parse()?;
        let records = self.transform_trade(data, flow)?;
        Ok(BTreeMap::from([(TradeRecord::table(), to_rows(&records)?)]))
    }

    fn unique_columns(&self, _table: &TableRef, _rows: &[Row]) -> Vec<String> {
        TradeRecord::UNIQUE_COLUMNS.map(String::from).to_vec()
    }
}

#[async_trait]
impl TradeCollector for DnaCollector {
    fn reporter(&self) -> &'static str {
        "URY"
    }

    async fn fetch_trade(&self, year: i32, month: u32, flow: Flow) -> CropcastResult<FetchOutput> {
        let url = format!("{}/api/3/action/datastore_search", self.config.source_url);
        let filters = json!({"anio": year, "mes": month}).to_string();

        let mut records: Vec<Value> = Vec::new();
        let mut offset = 0usize;

        loop {
            let params = [
                ("resource_id", Self::resource_id(flow).to_string()),
                ("limit", PAGE_SIZE.to_string()),
                ("offset", offset.to_string()),
                ("filters", filters.clone()),
            ];
            let response = self.ctx.http.get(&url, &params).await?;

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

            let body: Value = response.json().unwrap_or(Value::Null);
            if body.get("success").and_then(Value::as_bool) != Some(true) {
                return Err(CollectError::SourceUnavailable(
                    "CKAN datastore_search returned success=false".to_string(),
                )
                .into());
            }

            let page: Vec<Value> = body
                .pointer("/result/records")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            if offset == 0 {
                self.ctx.http.archive(
                    "dna",
                    &format!("{flow}_{year}{month:02}"),
                    ArchiveFormat::Json,
                    &response.body,
                )?;
            }
            if page.is_empty() {
                break;
            }

            let page_len = page.len();
            records.extend(page);
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }

        let count = records.len();
        let request = FetchRequest::month(year, month);
        Ok(FetchOutput::new(
            json!({"flow": flow, "records": records}),
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

    #[test]
    fn transforms_ckan_rows() {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("dna_uruguay", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        let c = DnaCollector::with_context(config, ctx);

        let data = json!({"flow": "export", "records": [{
            "anio": 2024, "mes": 5, "ncm": "0201.30.00",
            "pais": "China", "peso_kg": 48_000.0, "fob_usd": 260_000.0
        }]});
        let records = c.transform_trade(&data, Flow::Export).unwrap();
        let r = &records[0];
        assert_eq!(r.reporter_country, "URY");
        assert_eq!(r.hs_code, "02013000");
        assert_eq!(r.quantity_tons, Some(48.0));
    }
}
