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

const BASE_URL: &str = "https://echo.epa.gov/tools/web-services";

/// NAICS axes searched by default: corn milling, soybean processing, and
/// ethanol production.
const DEFAULT_NAICS: [&str; 4] = ["311221", "311222", "311224", "325193"];

/// EPA ECHO air-program facilities, the two-step query-then-download shape.
///
/// Each search axis issues a facility search that returns a `QueryID` and row
/// count, then downloads the CSV keyed by that ID. Facilities found by
/// multiple axes are deduplicated on their registry ID; a coverage table
/// records which axis surfaced each facility. Rows are audited per record so
/// the checker can re-verify them field by field.
pub struct EpaEchoCollector {
    config: CollectorConfig,
    ctx: SourceContext,
}

impl EpaEchoCollector {
    pub fn new(app: Arc<Config>, store: Arc<dyn Store>) -> CropcastResult<Self> {
        let config = CollectorConfig::new("epa_echo", BASE_URL)
            .with_frequency(crate::collect::contract::Frequency::Quarterly)
            .with_rate_limit(30.0)
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

    pub fn facilities_table() -> TableRef {
        TableRef::bronze("epa_air_facilities")
    }

    pub fn coverage_table() -> TableRef {
        TableRef::bronze("epa_echo_coverage")
    }

    async fn search_axis(&self, naics: &str) -> CropcastResult<Vec<Value>> {
        // Step 1: search, yielding a QueryID and row count.
        let search_url = format!(
            "{}/echo/air_rest_services.get_facilities",
            self.config.source_url
        );
        let params = [
            ("output", "JSON".to_string()),
            ("p_naics", naics.to_string()),
        ];
        let response = self.ctx.http.get(&search_url, &params).await?;
        if !response.is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "HTTP {} from ECHO search (naics {naics})",
                response.status
            ))
            .into());
        }

        let body: Value = response.json()?;
        let qid = body
            .pointer("/Results/QueryID")
            .and_then(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .ok_or_else(|| CollectError::Parse("ECHO search returned no QueryID".to_string()))?;
        let expected_rows = body
            .pointer("/Results/QueryRows")
            .and_then(|v| v.as_str().and_then(|s| s.parse::<usize>().ok()).or(v.as_u64().map(|n| n as usize)))
            .unwrap_or(0);

        // Step 2: download the CSV keyed by the QueryID.
        let download_url = format!(
            "{}/echo/air_rest_services.get_download",
            self.config.source_url
        );
        let params = [("output", "CSV".to_string()), ("qid", qid.clone())];
        let response = self.ctx.http.get(&download_url, &params).await?;
        if !response.is_success() {
            return Err(CollectError::SourceUnavailable(format!(
                "HTTP {} downloading ECHO qid {qid}",
                response.status
            ))
            .into());
        }

        self.ctx.http.archive(
            "epa_echo",
            &format!("naics{naics}"),
            ArchiveFormat::Csv,
            &response.body,
        )?;

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(response.body.as_ref());
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| CollectError::Parse(e.to_string()))?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for record in reader.records().flatten() {
            let mut obj = serde_json::Map::new();
            for (header, field) in headers.iter().zip(record.iter()) {
                obj.insert(header.clone(), Value::String(field.trim().to_string()));
            }
            obj.insert("search_axis".into(), json!(format!("naics:{naics}")));
            rows.push(Value::Object(obj));
        }

        if expected_rows > 0 && rows.len() < expected_rows / 2 {
            tracing::warn!(
                naics,
                expected = expected_rows,
                got = rows.len(),
                "ECHO download returned far fewer rows than the search reported"
            );
        }
        Ok(rows)
    }

    fn registry_id(row: &Value) -> Option<String> {
        parse::field_str(row, &["RegistryID", "REGISTRY_ID", "RegistryId", "SourceID", "AIRIDs"])
    }
}

#[async_trait]
impl Collector for EpaEchoCollector {
    fn config(&self) -> &CollectorConfig {
        &self.config
    }

    fn ctx(&self) -> &SourceContext {
        &self.ctx
    }

    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput> {
        let axes: Vec<String> = request
            .param("naics")
            .map(|list| list.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_else(|| DEFAULT_NAICS.iter().map(|s| s.to_string()).collect());

        let mut rows = Vec::new();
        let mut warnings = Vec::new();
        for naics in &axes {
            match self.search_axis(naics).await {
                Ok(mut axis_rows) => rows.append(&mut axis_rows),
                Err(e) => warnings.push(format!("naics {naics}: {e}")),
            }
        }

        if rows.is_empty() {
            return Err(CollectError::SourceUnavailable(
                "no ECHO axis returned facilities".to_string(),
            )
            .into());
        }

        let count = rows.len();
        let mut output = FetchOutput::new(json!({"rows": rows}), count, request);
        output.warnings = warnings;
        Ok(output)
    }

    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>> {
        let rows = data
            .get("rows")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        // Deduplicate facilities across axes on the registry id, keeping the
        // first row's fields and accumulating the axes that found it.
        let mut facilities: BTreeMap<String, Row> = BTreeMap::new();
        let mut coverage: Vec<Row> = Vec::new();

        for row in &rows {
            let Some(registry_id) = Self::registry_id(row) else {
                continue;
            };
            let axis = parse::field_str(row, &["search_axis"]).unwrap_or_default();

            let mut coverage_row = serde_json::Map::new();
            coverage_row.insert("registry_id".into(), json!(registry_id));
            coverage_row.insert("search_axis".into(), json!(axis));
            coverage_row.insert("ingested_at".into(), json!(Utc::now()));
            coverage.push(coverage_row);

            facilities.entry(registry_id.clone()).or_insert_with(|| {
                let mut record = serde_json::Map::new();
                record.insert("data_source".into(), json!("EPA_ECHO"));
                record.insert("registry_id".into(), json!(registry_id));
                record.insert(
                    "facility_name".into(),
                    json!(parse::field_str(row, &["AIRName", "FacName", "CWPName"])
                        .unwrap_or_default()),
                );
                record.insert(
                    "street".into(),
                    json!(parse::field_str(row, &["AIRStreet", "FacStreet"])),
                );
                record.insert(
                    "city".into(),
                    json!(parse::field_str(row, &["AIRCity", "FacCity"])),
                );
                record.insert(
                    "state".into(),
                    json!(parse::field_str(row, &["AIRState", "FacState"])),
                );
                record.insert(
                    "naics_codes".into(),
                    json!(parse::field_str(row, &["AIRNAICS", "FacNAICS"])),
                );
                record.insert(
                    "compliance_status".into(),
                    json!(parse::field_str(row, &["AIRComplStatus", "CurrVioFlag"])),
                );
                record.insert("ingested_at".into(), json!(Utc::now()));
                record
            });
        }

        Ok(BTreeMap::from([
            (Self::facilities_table(), facilities.into_values().collect()),
            (Self::coverage_table(), coverage),
        ]))
    }

    fn unique_columns(&self, table: &TableRef, _rows: &[Row]) -> Vec<String> {
        if table == &Self::coverage_table() {
            ["registry_id", "search_axis"].map(String::from).to_vec()
        } else {
            vec!["registry_id".to_string()]
        }
    }

    fn entity_label(&self, row: &Row) -> String {
        row.get("facility_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn verification_url(&self, table: &TableRef, row: &Row) -> String {
        if table == &Self::facilities_table() {
            if let Some(Value::String(id)) = row.get("registry_id") {
                return format!("https://echo.epa.gov/detailed-facility-report?fid={id}");
            }
        }
        self.config.source_url.clone()
    }
}

#[cfg(test)]
mod tests {
    use crate::store::MemoryStore;

    use super::*;

    fn collector() -> EpaEchoCollector {
        let app = Config::builtin("/tmp/cropcast-test");
        let config = CollectorConfig::new("epa_echo", BASE_URL).with_per_record_audit();
        let ctx = SourceContext::ephemeral(app, Arc::new(MemoryStore::new()), &config);
        EpaEchoCollector::with_context(config, ctx)
    }

    #[test]
    fn facilities_deduplicate_across_axes() {
        let c = collector();
        let data = json!({"rows": [
            {"RegistryID": "110001", "AIRName": "ACME PROCESSORS", "AIRState": "IA", "search_axis": "naics:311221"},
            {"RegistryID": "110001", "AIRName": "ACME PROCESSORS", "AIRState": "IA", "search_axis": "naics:325193"},
            {"RegistryID": "110002", "AIRName": "PRAIRIE ETHANOL", "AIRState": "NE", "search_axis": "naics:325193"}
        ]});
        let tables = c.transform_data(&data).unwrap();

        let facilities = &tables[&EpaEchoCollector::facilities_table()];
        assert_eq!(facilities.len(), 2);

        let coverage = &tables[&EpaEchoCollector::coverage_table()];
        assert_eq!(coverage.len(), 3);
    }

    #[test]
    fn verification_url_points_at_facility_report() {
        let c = collector();
        let mut row = serde_json::Map::new();
        row.insert("registry_id".into(), json!("110001"));
        let url = c.verification_url(&EpaEchoCollector::facilities_table(), &row);
        assert!(url.ends_with("fid=110001"));
    }
}
