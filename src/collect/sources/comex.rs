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
    error::{CollectError, CropcastError, CropcastResult, HttpError},
    http::ArchiveFormat,
    store::{Row, Store, TableRef, to_rows},
    trade::record::{Flow, TradeRecord},
};

const BASE_URL: &str = "https://api-comex.stat.gov.br";
const PAGE_SIZE: usize = 5000;
/// Hard cap on records per period to bound runtime on a runaway cursor.
const SAFETY_CAP: usize = 1_000_000;

/// Brazil trade data from the Comex Stat API (MDIC/SECEX).
///
/// NCM (8-digit) codes, monthly releases around the 5th-10th for the previous
/// month, no auth, paginated cursor with a page-size stop condition. Multiple
/// API versions are tried in a fixed order; an auth refusal from one version
/// falls through to the next.
pub struct ComexStatCollector {
    config: CollectorConfig,
    ctx: SourceContext,
}

impl ComexStatCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("comex_stat", BASE_URL)
            .with_rate_limit(30.0)
            .with_cache(12);
        let ctx = SourceContext::new(app, store, &config)?;
        Ok(Self { config, ctx })
    }

    /// Construct against an existing context (tests, alternate endpoints).
    pub fn with_context(mut config: CollectorConfig, ctx: SourceContext) -> Self {
        if config.source_url.is_empty() {
            config.source_url = BASE_URL.to_string();
        }
        Self { config, ctx }
    }

    fn api_paths(&self, flow: Flow) -> [String; 2] {
        [
            format!("{}/comexstat/{flow}", self.config.source_url),
            format!("{}/api/v1/{flow}", self.config.source_url),
        ]
    }

    /// Pull out record arrays from the response formats Comex Stat has used
    /// over the years.
    fn extract_records(data: &Value) -> Vec<Value> {
        match data {
            Value::Array(items) => items.clone(),
            Value::Object(map) => {
                for key in ["data", "records", "result", "results", "items", "content"] {
                    if let Some(Value::Array(items)) = map.get(key) {
                        return items.clone();
                    }
                }
                if let Some(nested @ Value::Object(_)) = map.get("response") {
                    return Self::extract_records(nested);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    async fn fetch_pages(&self, year: i32, month: u32, flow: Flow) -> CropcastResult<Vec<Value>> {
        let mut saw_not_published = false;

        for (version_idx, url) in self.api_paths(flow).iter().enumerate() {
            let mut records: Vec<Value> = Vec::new();
            let mut offset = 0usize;

            loop {
                let params = [
                    ("freq", "M".to_string()),
                    ("type", flow.to_string()),
                    ("year", year.to_string()),
                    ("month", month.to_string()),
                    ("hs_level", "8".to_string()),
                    ("partner", "all".to_string()),
                    ("offset", offset.to_string()),
                    ("limit", PAGE_SIZE.to_string()),
                ];

                let response = match self.ctx.http.get(url, &params).await {
                    Ok(response) => response,
                    Err(CropcastError::Http(HttpError::AuthRejected { .. })) => {
                        // Version-level refusal: fall through to the next API
                        // version without retrying this one.
                        tracing::warn!(url = %url, "API version refused auth, trying next");
                        break;
                    }
                    Err(e) => return Err(e),
                };

                if response.status == 404 {
                    saw_not_published = true;
                    break;
                }
                if !response.is_success() {
                    tracing::warn!(url = %url, status = response.status, "non-success page");
                    break;
                }

                let data: Value = match response.json() {
                    Ok(data) => data,
                    Err(_) => break,
                };
                let page = Self::extract_records(&data);
                if page.is_empty() {
                    break;
                }

                if offset == 0 {
                    let identifier = format!("{flow}_{year}{month:02}_v{version_idx}");
                    self.ctx.http.archive(
                        "comexstat",
                        &identifier,
                        ArchiveFormat::Json,
                        &response.body,
                    )?;
                }

                let page_len = page.len();
                records.extend(page);

                if page_len < PAGE_SIZE {
                    break;
                }
                offset += PAGE_SIZE;
                if offset > SAFETY_CAP {
                    tracing::warn!("reached safety cap of {SAFETY_CAP} records");
                    break;
                }
            }

            if !records.is_empty() {
                return Ok(records);
            }
        }

        if saw_not_published {
            return Err(CollectError::NotPublished {
                source_name: self.config.source_name.clone(),
                period: TradeRecord::period_of(year, month),
            }
            .into());
        }
        Err(CollectError::SourceUnavailable(
            "No data fetched from any Comex Stat endpoint".to_string(),
        )
        .into())
    }

    fn transform_row(&self, row: &Value, flow: Flow) -> Option<TradeRecord> {
        let year = parse::field_i64(row, &["year", "ano", "Year", "ANO", "co_ano", "CO_ANO"])? as i32;
        let month = parse::field_i64(row, &["month", "mes", "Month", "MES", "co_mes", "CO_MES"])? as u32;
        let ncm = parse::field_str(row, &["ncm", "NCM", "co_ncm", "CO_NCM", "product", "hs_code"])?;
        let ncm = ncm.replace('.', "");

        let kg_net = parse::field_f64(
            row,
            &["kg_net", "kg_liquido", "KG_LIQUIDO", "weight_net_kg", "quantity"],
        );
        let value_fob = parse::field_f64(
            row,
            &["value_fob_usd", "vl_fob", "VL_FOB", "fob_value", "trade_value_fob"],
        );
        let value_cif = parse::field_f64(
            row,
            &["value_cif_usd", "vl_cif", "VL_CIF", "cif_value", "trade_value_cif"],
        );
        let value_usd = match flow {
            Flow::Export => value_fob.unwrap_or(0.0),
            Flow::Import => value_cif.or(value_fob).unwrap_or(0.0),
        };

        let partner = parse::field_str(row, &["country", "pais", "partner", "no_pais", "NO_PAIS"])
            .unwrap_or_else(|| "UNKNOWN".to_string());

        Some(TradeRecord {
            data_source: "COMEX_STAT".to_string(),
            reporter_country: "BRA".to_string(),
            flow,
            year,
            month,
            period: TradeRecord::period_of(year, month),
            hs_level: ncm.len() as u8,
            hs_code_6: (ncm.len() >= 6).then(|| ncm[..6].to_string()),
            hs_code: ncm,
            partner_country: partner,
            quantity_kg: kg_net,
            quantity_tons: kg_net.map(|kg| kg * 1e-3),
            value_usd,
            value_fob_usd: value_fob,
            value_cif_usd: value_cif,
            hs_description: parse::field_str(
                row,
                &["ncm_description", "no_ncm", "NO_NCM", "description"],
            ),
            state_region: parse::field_str(row, &["state", "uf", "sg_uf", "SG_UF"]),
            customs_office: parse::field_str(row, &["port", "urf", "no_urf", "NO_URF"]),
            provisional: false,
            ingested_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Collector for ComexStatCollector {
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

    fn validate_data(&self, data: &Value) -> CropcastResult<()> {
        let records = data.get("records").and_then(Value::as_array);
        match records {
            Some(records) if !records.is_empty() => Ok(()),
            _ => Err(CollectError::Validation {
                source_name: self.config.source_name.clone(),
                msg: "empty record set".to_string(),
            }
            .into()),
        }
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
impl TradeCollector for ComexStatCollector {
    fn reporter(&self) -> &'static str {
        "BRA"
    }

    async fn fetch_trade(&self, year: i32, month: u32, flow: Flow) -> CropcastResult<FetchOutput> {
        let records = self.fetch_pages(year, month, flow).await?;
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

    fn collector() -> ComexStatCollector {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("comex_stat", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        ComexStatCollector::with_context(config, ctx)
    }

    #[test]
    fn extracts_records_from_known_shapes() {
        let flat = json!([{"a": 1}]);
        assert_eq!(ComexStatCollector::extract_records(&flat).len(), 1);

        let keyed = json!({"data": [{"a": 1}, {"a": 2}]});
        assert_eq!(ComexStatCollector::extract_records(&keyed).len(), 2);

        let nested = json!({"response": {"results": [{"a": 1}]}});
        assert_eq!(ComexStatCollector::extract_records(&nested).len(), 1);

        assert!(ComexStatCollector::extract_records(&json!({"x": 1})).is_empty());
    }

    #[test]
    fn transforms_portuguese_column_names() {
        let c = collector();
        let data = json!({"flow": "export", "records": [{
            "ano": 2024, "mes": 8, "co_ncm": "10059010",
            "kg_liquido": 1000000.0, "vl_fob": 250000.0,
            "no_pais": "China", "sg_uf": "MT", "no_urf": "Santos"
        }]});
        let records = c.transform_trade(&data, Flow::Export).unwrap();
        assert_eq!(records.len(), 1);

        let r = &records[0];
        assert_eq!(r.reporter_country, "BRA");
        assert_eq!(r.period, "2024-08");
        assert_eq!(r.hs_code, "10059010");
        assert_eq!(r.hs_code_6.as_deref(), Some("100590"));
        assert_eq!(r.quantity_tons, Some(1000.0));
        assert!((r.value_usd - 250000.0).abs() < f64::EPSILON);
        assert_eq!(r.state_region.as_deref(), Some("MT"));
    }

    #[test]
    fn high_parse_failure_rate_fails_the_batch() {
        let c = collector();
        let mut rows = vec![json!({"ano": 2024, "mes": 8, "co_ncm": "12019000", "vl_fob": 10.0})];
        for _ in 0..4 {
            rows.push(json!({"garbage": true}));
        }
        let data = json!({"flow": "export", "records": rows});
        let err = c.transform_trade(&data, Flow::Export).unwrap_err();
        assert!(err.to_string().contains("exceeds 20%"));
    }
}
