use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value, json};

use crate::{
    collect::{
        contract::{AuthKind, Collector, CollectorConfig, FetchOutput, FetchRequest, SourceContext},
        parse,
        sources::TradeCollector,
    },
    config::{Config, env_chain},
    error::{CollectError, CropcastResult},
    http::ArchiveFormat,
    store::{Row, Store, TableRef, to_rows},
    trade::record::{Flow, TradeRecord},
};

const BASE_URL: &str = "https://api.census.gov/data/timeseries/intltrade";

/// US trade data from the Census International Trade API.
///
/// Responses are arrays of arrays: the first row is the header, every value a
/// string. Exports are valued `ALL_VAL_MO` (FOB basis), imports `GEN_VAL_MO`
/// (CIF-adjacent customs value).
pub struct CensusTradeCollector {
    config: CollectorConfig,
    ctx: SourceContext,
    api_key: Option<String>,
}

impl CensusTradeCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("census_trade", BASE_URL)
            .with_auth(AuthKind::ApiKey)
            .with_rate_limit(30.0)
            .with_cache(24);
        let ctx = SourceContext::new(app, store, &config)?;
        // The Census API works unauthenticated at reduced quota.
        let api_key = env_chain(&["CENSUS_API_KEY"]).ok();
        Ok(Self {
            config,
            ctx,
            api_key,
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

    /// Convert the array-of-arrays payload into JSON objects keyed by the
    /// lowercased header row.
    pub(crate) fn tabular_to_rows(data: &Value) -> Vec<Value> {
        let Some(rows) = data.as_array() else {
            return Vec::new();
        };
        let Some(headers) = rows.first().and_then(Value::as_array) else {
            return Vec::new();
        };
        let headers: Vec<String> = headers
            .iter()
            .map(|h| h.as_str().unwrap_or_default().to_lowercase())
            .collect();

        rows[1..]
            .iter()
            .filter_map(Value::as_array)
            .map(|cells| {
                let obj: Map<String, Value> = headers
                    .iter()
                    .cloned()
                    .zip(cells.iter().cloned())
                    .collect();
                Value::Object(obj)
            })
            .collect()
    }

    fn transform_row(&self, row: &Value, flow: Flow) -> Option<TradeRecord> {
        let time = parse::field_str(row, &["time"])?;
        let (year, month) = time.split_once('-')?;
        let year: i32 = year.parse().ok()?;
        let month: u32 = month.parse().ok()?;

        let code = parse::field_str(row, &["e_commodity", "i_commodity", "commodity"])?;
        let value = parse::field_f64(row, &["all_val_mo", "gen_val_mo", "val_mo"])?;
        let kg = parse::field_f64(row, &["qty_1_mo", "qty_mo"]);

        Some(TradeRecord {
            data_source: "CENSUS".to_string(),
            reporter_country: "USA".to_string(),
            flow,
            year,
            month,
            period: TradeRecord::period_of(year, month),
            hs_level: code.len() as u8,
            hs_code_6: (code.len() >= 6).then(|| code[..6].to_string()),
            hs_code: code,
            partner_country: parse::field_str(row, &["cty_name", "cty_code"])
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            quantity_kg: kg,
            quantity_tons: kg.map(|v| v * 1e-3),
            value_usd: value,
            value_fob_usd: (flow == Flow::Export).then_some(value),
            value_cif_usd: (flow == Flow::Import).then_some(value),
            hs_description: None,
            state_region: None,
            customs_office: None,
            provisional: false,
            ingested_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Collector for CensusTradeCollector {
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
impl TradeCollector for CensusTradeCollector {
    fn reporter(&self) -> &'static str {
        "USA"
    }

    async fn fetch_trade(&self, year: i32, month: u32, flow: Flow) -> CropcastResult<FetchOutput> {
        let (path, value_field) = match flow {
            Flow::Export => ("exports/hs", "ALL_VAL_MO"),
            Flow::Import => ("imports/hs", "GEN_VAL_MO"),
        };
        let url = format!("{}/{path}", self.config.source_url);

        let mut params = vec![
            (
                "get",
                format!("CTY_CODE,CTY_NAME,E_COMMODITY,{value_field},QTY_1_MO"),
            ),
            ("time", format!("{year}-{month:02}")),
            ("COMM_LVL", "HS6".to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("key", key.clone()));
        }

        let response = self.ctx.http.get(&url, &params).await?;
        if response.status == 404 || response.status == 204 {
            return Err(CollectError::NotPublished {
                source_name: self.config.source_name.clone(),
                period: TradeRecord::period_of(year, month),
            }
            .into());
        }
        if !response.is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "HTTP {} from Census",
                response.status
            ))
            .into());
        }

        self.ctx.http.archive(
            "census",
            &format!("{flow}_{year}{month:02}"),
            ArchiveFormat::Json,
            &response.body,
        )?;

        let raw: Value = response.json()?;
        let rows = Self::tabular_to_rows(&raw);
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
