use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};

use crate::{
    collect::{
        contract::{AuthKind, Collector, CollectorConfig, FetchOutput, FetchRequest, SourceContext},
        parse,
    },
    config::{Config, env_chain},
    error::{CollectError, CropcastResult},
    http::ArchiveFormat,
    store::{Row, Store, TableRef},
};

const BASE_URL: &str = "https://apps.fas.usda.gov/PSDOnlineDataServices/api";

/// World supply & demand balances from USDA FAS PSD Online.
///
/// One request per (commodity, market year); values arrive in thousand metric
/// tons and are stored as-is with the unit recorded.
pub struct FasPsdCollector {
    config: CollectorConfig,
    ctx: SourceContext,
    api_key: Option<String>,
}

impl FasPsdCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("usda_fas_psd", BASE_URL)
            .with_auth(AuthKind::ApiKey)
            .with_frequency(crate::collect::contract::Frequency::Monthly)
            .with_rate_limit(20.0)
            .with_cache(24);
        let ctx = SourceContext::new(app, store, &config)?;
        Ok(Self {
            config,
            ctx,
            api_key: env_chain(&["FAS_PSD_API_KEY", "PSD_API_KEY"]).ok(),
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
        TableRef::bronze("psd_supply_demand")
    }
}

#[async_trait]
impl Collector for FasPsdCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn authenticate(&self) -> CropcastResult<()> {
        if self.api_key.is_none() {
            return Err(CollectError::MissingCredential("FAS_PSD_API_KEY".to_string()).into());
        }
        Ok(())
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
        // PSD commodity codes: 0440000 corn, 2222000 soybeans, 0410000 wheat.
        let commodity_code = request.param("commodity_code").unwrap_or("0440000").to_string();
        let market_year = request
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
            "{}/CommodityData/GetCommodityDataByYear",
            self.config.source_url
        );
        let mut params = vec![
            ("commodityCode", commodity_code.clone()),
            ("marketYear", market_year.to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let response = self.ctx.http.get(&url, &params).await?;
        if !response.is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "HTTP {} from PSD",
                response.status
            ))
            .into());
        }

        self.ctx.http.archive(
            "fas_psd",
            &format!("{commodity_code}_{market_year}"),
            ArchiveFormat::Json,
            &response.body,
        )?;

        let rows: Vec<Value> = response.json().unwrap_or_default();
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
            let Some(commodity_code) = parse::field_str(row, &["commodityCode", "commodity_code"])
            else {
                continue;
            };
            let Some(attribute) =
                parse::field_str(row, &["attributeDescription", "attribute_description"])
            else {
                continue;
            };
            let mut record = serde_json::Map::new();
            record.insert("data_source".into(), json!("USDA_FAS_PSD"));
            record.insert("commodity_code".into(), json!(commodity_code));
            record.insert(
                "country_code".into(),
                json!(parse::field_str(row, &["countryCode", "country_code"]).unwrap_or_default()),
            );
            record.insert(
                "country_name".into(),
                json!(parse::field_str(row, &["countryName", "country_name"])),
            );
            record.insert(
                "market_year".into(),
                json!(parse::field_i64(row, &["marketYear", "market_year"])),
            );
            record.insert("attribute".into(), json!(attribute));
            record.insert(
                "value_1000mt".into(),
                json!(parse::field_f64(row, &["value", "Value"])),
            );
            record.insert("ingested_at".into(), json!(Utc::now()));
            out.push(record);
        }
        Ok(BTreeMap::from([(Self::table(), out)]))
    }

    fn unique_columns(&self, _table: &TableRef, _rows: &[Row]) -> Vec<String> {
        ["commodity_code", "country_code", "market_year", "attribute"]
            .map(String::from)
            .to_vec()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    #[test]
    fn psd_rows_keyed_by_attribute() {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("usda_fas_psd", BASE_URL);
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        let c = FasPsdCollector::with_context(config, ctx);

        let data = json!({"rows": [
            {"commodityCode": "0440000", "countryCode": "BR", "countryName": "Brazil",
             "marketYear": 2024, "attributeDescription": "Exports", "value": 49500.0}
        ]});
        let tables = c.transform_data(&data).unwrap();
        let rows = &tables[&FasPsdCollector::table()];
        assert_eq!(rows[0]["attribute"], "Exports");
        assert_eq!(rows[0]["value_1000mt"], json!(49500.0));
    }
}
