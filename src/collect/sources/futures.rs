use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use strum::{Display, EnumString, IntoStaticStr};

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

const IBKR_URL: &str = "https://localhost:5000/v1/api";
const TRADESTATION_URL: &str = "https://api.tradestation.com/v3";

/// Grain futures symbols tracked by default (CME Globex roots).
const DEFAULT_SYMBOLS: [&str; 5] = ["ZC", "ZS", "ZW", "ZM", "ZL"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum QuoteSource {
    Ibkr,
    Tradestation,
}

/// Futures settlement quotes with multi-source fallback.
///
/// Sources are tried in declared preference order; a source is eligible only
/// when its credentials are present and its connectivity check passes. Every
/// record is annotated with the source that produced it.
pub struct FuturesCollector {
    config: CollectorConfig,
    ctx: SourceContext,
    preference: Vec<QuoteSource>,
}

impl FuturesCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("futures_quotes", IBKR_URL)
            .with_auth(AuthKind::Paid)
            .with_frequency(crate::collect::contract::Frequency::Daily)
            .with_rate_limit(30.0);
        let ctx = SourceContext::new(app, store, &config)?;
        Ok(Self {
            config,
            ctx,
            preference: vec![QuoteSource::Ibkr, QuoteSource::Tradestation],
        })
    }

    pub fn with_context(mut config: CollectorConfig, ctx: SourceContext) -> Self {
        if config.source_url.is_empty() {
            config.source_url = IBKR_URL.to_string();
        }
        Self {
            config,
            ctx,
            preference: vec![QuoteSource::Ibkr, QuoteSource::Tradestation],
        }
    }

    pub fn table() -> TableRef {
        TableRef::bronze("futures_quotes")
    }

    fn base_url(&self, source: QuoteSource) -> String {
        match source {
            QuoteSource::Ibkr => self.config.source_url.clone(),
            QuoteSource::Tradestation => TRADESTATION_URL.to_string(),
        }
    }

    fn has_credentials(source: QuoteSource) -> bool {
        match source {
            QuoteSource::Ibkr => credentials::ibkr_login().is_ok(),
            QuoteSource::Tradestation => credentials::tradestation_login().is_ok(),
        }
    }

    async fn connectivity_ok(&self, source: QuoteSource) -> bool {
        let url = self.base_url(source);
        match self.ctx.http.get(&url, &[]).await {
            Ok(response) => response.status < 500,
            Err(_) => false,
        }
    }

    async fn fetch_from(
        &self,
        source: QuoteSource,
        symbols: &[String],
    ) -> CropcastResult<Vec<Value>> {
        let base = self.base_url(source);
        let url = match source {
            QuoteSource::Ibkr => format!("{base}/iserver/marketdata/snapshot"),
            QuoteSource::Tradestation => {
                format!("{base}/marketdata/quotes/{}", symbols.join(","))
            }
        };
        let params = match source {
            QuoteSource::Ibkr => vec![("symbols", symbols.join(","))],
            QuoteSource::Tradestation => Vec::new(),
        };

        let response = self.ctx.http.get(&url, &params).await?;
        if !response.is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "HTTP {} from {source}",
                response.status
            ))
            .into());
        }

        self.ctx.http.archive(
            "futures",
            &source.to_string(),
            ArchiveFormat::Json,
            &response.body,
        )?;

        let body: Value = response.json()?;
        let quotes = match &body {
            Value::Array(items) => items.clone(),
            Value::Object(map) => map
                .get("Quotes")
                .or_else(|| map.get("quotes"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(quotes)
    }
}

#[async_trait]
impl Collector for FuturesCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
        let symbols: Vec<String> = request
            .param("symbols")
            .map(|list| list.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect());

        let mut warnings = Vec::new();
        for source in &self.preference {
            if !Self::has_credentials(*source) {
                warnings.push(format!("{source}: credentials not configured"));
                continue;
            }
            if !self.connectivity_ok(*source).await {
                warnings.push(format!("{source}: connectivity check failed"));
                continue;
            }
            match self.fetch_from(*source, &symbols).await {
                Ok(quotes) => {
                    let count = quotes.len();
                    let mut output = FetchOutput::new(
                        json!({"source": source.to_string(), "quotes": quotes}),
                        count,
                        request,
                    );
                    output.warnings = warnings;
                    return Ok(output);
                }
                Err(e) => warnings.push(format!("{source}: {e}")),
            }
        }

        Err(CollectError::SourceUnavailable(format!(
            "no futures source eligible: {}",
            warnings.join("; ")
        ))
        .into())
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let source = data
            .get("source")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let quotes = data
            .get("quotes")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for quote in &quotes {
            let Some(symbol) = parse::field_str(quote, &["Symbol", "symbol", "conid"]) else {
                continue;
            };
            let mut record = serde_json::Map::new();
            record.insert("data_source".into(), json!(source));
            record.insert("symbol".into(), json!(symbol));
            record.insert(
                "quote_date".into(),
                json!(parse::field_str(quote, &["TradeTime", "quote_date", "lastUpdated"])
                    .unwrap_or_else(|| Utc::now().date_naive().to_string())),
            );
            record.insert(
                "last".into(),
                json!(parse::field_f64(quote, &["Last", "last", "lastPrice"])),
            );
            record.insert(
                "settlement".into(),
                json!(parse::field_f64(quote, &["Close", "close", "settlement"])),
            );
            record.insert(
                "volume".into(),
                json!(parse::field_f64(quote, &["Volume", "volume"])),
            );
            record.insert(
                "open_interest".into(),
                json!(parse::field_f64(quote, &["OpenInterest", "open_interest"])),
            );
            record.insert("ingested_at".into(), json!(Utc::now()));
            out.push(record);
        }
        Ok(BTreeMap::from([(Self::table(), out)]))
    }

    fn unique_columns(&self, _table: &TableRef, _rows: &[Row]) -> Vec<String> {
        ["symbol", "quote_date"].map(String::from).to_vec()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    #[test]
    fn quotes_are_annotated_with_their_source() {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("futures_quotes", IBKR_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        let c = FuturesCollector::with_context(config, ctx);

        let data = json!({"source": "tradestation", "quotes": [
            {"Symbol": "ZC", "Last": 412.25, "Close": 410.5, "Volume": 185000, "TradeTime": "2024-08-05"},
            {"Symbol": "ZS", "Last": 1042.0}
        ]});
        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&FuturesCollector::table()];
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["data_source"], "tradestation");
        assert_eq!(rows[0]["settlement"], json!(410.5));
        assert_eq!(rows[1]["symbol"], "ZS");
    }
}
