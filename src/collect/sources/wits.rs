use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use quick_xml::{Reader, events::Event};
use serde_json::{Map, Value, json};

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

const BASE_URL: &str = "https://wits.worldbank.org/API/V1/SDMX/V21/rest";

/// Paraguay trade data mirrored through the World Bank WITS SDMX API.
///
/// Paraguay has no monthly national API; WITS carries its customs data with a
/// 1-2 month lag. Responses are SDMX XML: `<Series>` carries the reporter,
/// partner, and product dimensions, nested `<Obs>` the period and values.
/// WITS trade values are expressed in thousands of USD.
pub struct WitsCollector {
    config: CollectorConfig,
    ctx: SourceContext,
}

impl WitsCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("wits_paraguay", BASE_URL)
            .with_rate_limit(12.0)
            .with_cache(48);
        let ctx = SourceContext::new(app, store, &config)?;
        Ok(Self { config, ctx })
    }

    pub fn with_context(mut config: CollectorConfig, ctx: SourceContext) -> Self {
        if config.source_url.is_empty() {
            config.source_url = BASE_URL.to_string();
        }
        Self { config, ctx }
    }

    /// Flatten SDMX series/observation structure into one JSON row per `<Obs>`,
    /// merging the enclosing `<Series>` attributes into each.
    pub(crate) fn xml_to_rows(body: &str) -> Vec<Value> {
        let mut reader = Reader::from_str(body);
        let mut rows = Vec::new();
        let mut series_ctx: Map<String, Value> = Map::new();
        let mut buf = Vec::new();

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_lowercase();
                    let local = name.rsplit(':').next().unwrap_or(&name).to_string();

                    let attrs: Map<String, Value> = e
                        .attributes()
                        .flatten()
                        .map(|attr| {
                            (
                                String::from_utf8_lossy(attr.key.as_ref()).to_lowercase(),
                                Value::String(String::from_utf8_lossy(&attr.value).to_string()),
                            )
                        })
                        .collect();

                    if local == "series" {
                        series_ctx = attrs;
                    } else if local == "obs" {
                        let mut row = series_ctx.clone();
                        row.extend(attrs);
                        rows.push(Value::Object(row));
                    }
                }
                Ok(Event::Eof) | Err(_) => break,
                _ => {}
            }
            buf.clear();
        }
        rows
    }

    fn transform_row(&self, row: &Value, flow: Flow, fallback_month: u32) -> Option<TradeRecord> {
        let code = parse::field_str(row, &["productcode", "product_code", "product"])?
            .replace('.', "");
        if !code.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let time = parse::field_str(row, &["time_period", "time", "period"])?;
        let (year, month) = match time.split_once('-') {
            Some((y, m)) => (y.parse().ok()?, m.parse().unwrap_or(fallback_month)),
            None => (time.parse().ok()?, fallback_month),
        };

        // WITS reports values in thousands of USD.
        let value_usd = parse::field_f64(row, &["obs_value", "tradevalue", "trade_value"])
            .map(|v| v * 1000.0)
            .unwrap_or(0.0);
        let kg = parse::field_f64(row, &["quantity", "qty"]);

        Some(TradeRecord {
            data_source: "WITS".to_string(),
            reporter_country: "PRY".to_string(),
            flow,
            year,
            month,
            period: TradeRecord::period_of(year, month),
            hs_level: code.len() as u8,
            hs_code_6: (code.len() >= 6).then(|| code[..6].to_string()),
            hs_code: code,
            partner_country: parse::field_str(row, &["partner", "partneriso3", "partner_country"])
                .unwrap_or_else(|| "UNKNOWN".to_string()),
            quantity_kg: kg,
            quantity_tons: kg.map(|v| v * 1e-3),
            value_usd,
            value_fob_usd: (flow == Flow::Export).then_some(value_usd),
            value_cif_usd: (flow == Flow::Import).then_some(value_usd),
            hs_description: None,
            state_region: None,
            customs_office: None,
            provisional: false,
            ingested_at: Utc::now(),
        })
    }
}

#[async_trait]
impl Collector for WitsCollector {
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
impl TradeCollector for WitsCollector {
    fn reporter(&self) -> &'static str {
        "PRY"
    }

    async fn fetch_trade(&self, year: i32, month: u32, flow: Flow) -> CropcastResult<FetchOutput> {
        let direction = match flow {
            Flow::Export => "X",
            Flow::Import => "M",
        };
        let url = format!(
            "{}/data/DF_WITS_MonthlyTrade/.PRY..{direction}/?startPeriod={year}-{month:02}&endPeriod={year}-{month:02}",
            self.config.source_url
        );

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
                "HTTP {} from WITS",
                response.status
            ))
            .into());
        }

        self.ctx.http.archive(
            "wits",
            &format!("{flow}_{year}{month:02}"),
            ArchiveFormat::Xml,
            &response.body,
        )?;

        let rows = Self::xml_to_rows(&response.text());
        let count = rows.len();
        let request = FetchRequest::month(year, month);
        Ok(FetchOutput::new(
            json!({"flow": flow, "records": rows, "month": month}),
            count,
            &request,
        ))
    }

    fn transform_trade(&self, data: &Value, flow: Flow) -> CropcastResult<Vec<TradeRecord>> {
        let fallback_month = data.get("month").and_then(Value::as_u64).unwrap_or(1) as u32;
        let rows = data
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let total = rows.len();
        let records: Vec<TradeRecord> = rows
            .iter()
            .filter_map(|row| self.transform_row(row, flow, fallback_month))
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

    const SAMPLE_XML: &str = r#"<?xml version="1.0"?>
        <message:DataSet xmlns:message="http://sdmx.org">
          <Series REPORTER="PRY" PARTNER="BRA" PRODUCTCODE="120190">
            <Obs TIME_PERIOD="2024-06" OBS_VALUE="1250.5" QUANTITY="2400000"/>
            <Obs TIME_PERIOD="2024-07" OBS_VALUE="980" QUANTITY="1900000"/>
          </Series>
          <Series REPORTER="PRY" PARTNER="ARG" PRODUCTCODE="100590">
            <Obs TIME_PERIOD="2024-06" OBS_VALUE="310"/>
          </Series>
        </message:DataSet>"#;

    #[test]
    fn xml_rows_merge_series_and_obs_attributes() {
        let rows = WitsCollector::xml_to_rows(SAMPLE_XML);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0]["partner"], "BRA");
        assert_eq!(rows[0]["time_period"], "2024-06");
        assert_eq!(rows[2]["productcode"], "100590");
    }

    #[test]
    fn values_scale_from_usd_thousands() {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("wits_paraguay", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        let c = WitsCollector::with_context(config, ctx);

        let rows = WitsCollector::xml_to_rows(SAMPLE_XML);
        let data = json!({"flow": "export", "records": rows, "month": 6});
        let records = c.transform_trade(&data, Flow::Export).unwrap();

        assert_eq!(records.len(), 3);
        let r = &records[0];
        assert!((r.value_usd - 1_250_500.0).abs() < 1e-6);
        assert_eq!(r.quantity_tons, Some(2400.0));
        assert_eq!(r.period, "2024-06");
        assert_eq!(r.value_fob_usd, Some(r.value_usd));
    }
}
