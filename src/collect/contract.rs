use std::{collections::BTreeMap, sync::Arc, time::Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{Display, EnumString, IntoStaticStr};

use crate::{
    audit::{AuditLog, LogAction, LogLevel, generate_run_id},
    collect::cache::FetchCache,
    config::Config,
    error::{CollectError, CropcastError, CropcastResult},
    http::{HttpClient, HttpConfig},
    store::{Row, Store, TableRef},
};

// ================================================================================================
// Configuration
// ================================================================================================

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    None,
    ApiKey,
    Oauth,
    Paid,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Default,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Realtime,
    Daily,
    Weekly,
    #[default]
    Monthly,
    Quarterly,
    Annual,
}

/// Static configuration one source plugin declares about itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    pub source_name: String,
    pub source_version: String,
    pub source_url: String,
    pub auth: AuthKind,
    pub frequency: Frequency,
    pub timeout_secs: u64,
    pub retry_attempts: u32,
    pub retry_delay_base: f64,
    pub rate_limit_per_minute: f64,
    pub cache_enabled: bool,
    pub cache_ttl_hours: u64,
    /// Emit one DATA_SAVE/DATA_UPDATE per row (verifiable collectors) instead
    /// of one per table batch (bulk collectors).
    pub audit_per_record: bool,
}

impl CollectorConfig {
    pub fn new(source_name: &str, source_url: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            source_version: "1.0.0".to_string(),
            source_url: source_url.to_string(),
            auth: AuthKind::None,
            frequency: Frequency::Monthly,
            timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_base: 1.0,
            rate_limit_per_minute: 60.0,
            cache_enabled: false,
            cache_ttl_hours: 12,
            audit_per_record: false,
        }
    }

    pub fn with_auth(mut self, auth: AuthKind) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_frequency(mut self, frequency: Frequency) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn with_rate_limit(mut self, per_minute: f64) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    pub fn with_retries(mut self, attempts: u32, delay_base: f64) -> Self {
        self.retry_attempts = attempts;
        self.retry_delay_base = delay_base;
        self
    }

    pub fn with_cache(mut self, ttl_hours: u64) -> Self {
        self.cache_enabled = true;
        self.cache_ttl_hours = ttl_hours;
        self
    }

    pub fn with_per_record_audit(mut self) -> Self {
        self.audit_per_record = true;
        self
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            retry_attempts: self.retry_attempts,
            retry_delay_base: self.retry_delay_base,
            timeout_secs: self.timeout_secs,
            rate_limit_per_minute: self.rate_limit_per_minute,
            ..HttpConfig::default()
        }
    }

    /// Config snapshot for the STARTUP record. Never includes credentials.
    fn startup_snapshot(&self) -> Value {
        json!({
            "base_url": self.source_url,
            "auth_type": self.auth.to_string(),
            "frequency": self.frequency.to_string(),
            "rate_limit_per_minute": self.rate_limit_per_minute,
            "max_retries": self.retry_attempts,
            "timeout": self.timeout_secs,
            "cache_enabled": self.cache_enabled,
        })
    }
}

// ================================================================================================
// Request / Result Envelopes
// ================================================================================================

/// Parameters for one fetch: an optional period window plus free-form params.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
    pub params: BTreeMap<String, String>,
}

impl FetchRequest {
    /// Request a single calendar month.
    pub fn month(year: i32, month: u32) -> Self {
        let start = NaiveDate::from_ymd_opt(year, month, 1);
        let end = start.and_then(|d| {
            let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
            NaiveDate::from_ymd_opt(ny, nm, 1)?.pred_opt()
        });
        Self {
            start,
            end,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Stable cache key material: period plus sorted params.
    pub fn cache_parts(&self) -> Vec<String> {
        let mut parts = vec![
            self.start.map(|d| d.to_string()).unwrap_or_default(),
            self.end.map(|d| d.to_string()).unwrap_or_default(),
        ];
        parts.extend(self.params.iter().map(|(k, v)| format!("{k}={v}")));
        parts
    }
}

/// Raw payload(s) returned by `fetch_data`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOutput {
    pub data: Value,
    pub records_fetched: usize,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    #[serde(default)]
    pub from_cache: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl FetchOutput {
    pub fn new(data: Value, records_fetched: usize, request: &FetchRequest) -> Self {
        Self {
            data,
            records_fetched,
            period_start: request.start,
            period_end: request.end,
            from_cache: false,
            warnings: Vec::new(),
        }
    }

    pub fn with_warning(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display, IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Success,
    PartialSuccess,
    Failure,
}

/// Aggregate outcome of one collector lifecycle. `run()` never fails across
/// its boundary; failures land in `errors` with `success = false`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorResult {
    pub success: bool,
    pub status: RunStatus,
    pub run_id: String,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub records_fetched: usize,
    pub records_saved: usize,
    pub records_updated: usize,
    pub api_calls_made: u64,
    pub from_cache: bool,
    /// Release-day miss: the upstream has not published the period yet. The
    /// scheduler treats this as a retry reason, not a failure to count.
    pub not_published: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl CollectorResult {
    fn empty(source_name: &str, run_id: &str) -> Self {
        let now = Utc::now();
        Self {
            success: false,
            status: RunStatus::Failure,
            run_id: run_id.to_string(),
            source_name: source_name.to_string(),
            started_at: now,
            completed_at: now,
            records_fetched: 0,
            records_saved: 0,
            records_updated: 0,
            api_calls_made: 0,
            from_cache: false,
            not_published: false,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }
}

// ================================================================================================
// Shared Context
// ================================================================================================

/// Per-collector-instance runtime: audit log, HTTP session, store handle,
/// fetch cache. Sessions are not shared across collectors.
pub struct SourceContext {
    pub app: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub audit: Arc<AuditLog>,
    pub http: Arc<HttpClient>,
    pub cache: FetchCache,
    pub run_id: String,
}

impl SourceContext {
    pub fn new(
        app: Arc<Config>,
        store: Arc<dyn Store>,
        collector: &CollectorConfig,
    ) -> CropcastResult<Self> {
        let run_id = generate_run_id();
        let audit = Arc::new(AuditLog::create(
            &app.dirs.log_dir,
            &collector.source_name,
            &run_id,
        )?);
        let http = Arc::new(HttpClient::new(
            collector.http_config(),
            Arc::clone(&audit),
            Some(app.dirs.raw_dir.clone()),
        ));
        let cache = FetchCache::new(app.dirs.cache_dir.clone());
        Ok(Self {
            app,
            store,
            audit,
            http,
            cache,
            run_id,
        })
    }

    /// Context with an in-memory audit sink and no raw archive. For tests.
    pub fn ephemeral(
        app: Arc<Config>,
        store: Arc<dyn Store>,
        collector: &CollectorConfig,
    ) -> Self {
        let run_id = generate_run_id();
        let audit = Arc::new(AuditLog::in_memory(&collector.source_name, &run_id));
        let http = Arc::new(HttpClient::new(
            collector.http_config(),
            Arc::clone(&audit),
            None,
        ));
        let cache = FetchCache::new(app.dirs.cache_dir.clone());
        Self {
            app,
            store,
            audit,
            http,
            cache,
            run_id,
        }
    }
}

// ================================================================================================
// Collector Contract
// ================================================================================================

/// The lifecycle every source plugin implements.
///
/// `run()` drives STARTUP → authenticate → fetch (cache-aware) → validate →
/// transform → save → SHUTDOWN and is provided; plugins implement the fetch
/// and transform steps plus whatever per-source validation applies.
#[async_trait]
pub trait Collector: Send + Sync {
    fn config(&self) -> &CollectorConfig;

    fn ctx(&self) -> &SourceContext;

    /// Acquire whatever credentials/session the source needs. A failure here
    /// fails the run fatally (no retry).
    async fn authenticate(&self) -> CropcastResult<()> {
        Ok(())
    }

    /// Fetch the raw payload(s) for the requested period.
    async fn fetch_data(&self, request: &FetchRequest) -> CropcastResult<FetchOutput>;

    /// Per-source sanity checks over the raw payload.
    fn validate_data(&self, data: &Value) -> CropcastResult<()> {
        let _ = data;
        Ok(())
    }

    /// Normalize the raw payload into rows per destination table.
    fn transform_data(&self, data: &Value) -> CropcastResult<BTreeMap<TableRef, Vec<Row>>>;

    /// Unique columns used for the upsert into `table`.
    ///
    /// Default heuristic: `date` when the rows carry one, otherwise the first
    /// two columns of the first row.
    fn unique_columns(&self, table: &TableRef, rows: &[Row]) -> Vec<String> {
        let _ = table;
        match rows.first() {
            Some(first) if first.contains_key("date") => vec!["date".to_string()],
            Some(first) => first.keys().take(2).cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Human-facing label for a saved row (facility name, entity, period).
    fn entity_label(&self, row: &Row) -> String {
        for key in ["facility_name", "entity", "name", "period"] {
            if let Some(Value::String(s)) = row.get(key) {
                return s.clone();
            }
        }
        String::new()
    }

    /// URL a verifier can re-fetch this row from.
    fn verification_url(&self, table: &TableRef, row: &Row) -> String {
        let _ = (table, row);
        self.config().source_url.clone()
    }

    /// Execute the full lifecycle. Never propagates an error; the outcome is
    /// always a `CollectorResult`.
    async fn run(&self, request: FetchRequest) -> CollectorResult {
        let config = self.config();
        let ctx = self.ctx();
        let started = Instant::now();

        let mut result = CollectorResult::empty(&config.source_name, &ctx.run_id);
        result.started_at = Utc::now();

        ctx.audit.record(
            LogLevel::Info,
            LogAction::Startup,
            json!({
                "description": format!(
                    "Starting {} v{} (run: {})",
                    config.source_name, config.source_version, ctx.run_id
                ),
                "collector_version": config.source_version,
                "config": config.startup_snapshot(),
            }),
        );

        match self.execute(config, &request, &mut result).await {
            Ok(()) => {}
            Err(error) => {
                let message = error.to_string();
                let level = match &error {
                    CropcastError::Collect(CollectError::NotPublished { .. }) => LogLevel::Warn,
                    _ => LogLevel::Critical,
                };
                if let CropcastError::Collect(CollectError::NotPublished { .. }) = &error {
                    result.not_published = true;
                    result.warnings.push(message.clone());
                } else {
                    result.errors.push(message.clone());
                }
                ctx.audit.record(
                    level,
                    LogAction::Error,
                    json!({
                        "description": format!("Fatal error: {message}"),
                        "error_message": message,
                    }),
                );
            }
        }

        result.completed_at = Utc::now();
        result.api_calls_made = ctx.http.request_count();
        result.success = result.errors.is_empty() && !result.not_published;
        result.status = if result.success {
            RunStatus::Success
        } else if result.records_saved + result.records_updated > 0 {
            RunStatus::PartialSuccess
        } else {
            RunStatus::Failure
        };

        let duration = started.elapsed().as_secs_f64();
        ctx.audit.record_timed(
            LogLevel::Info,
            LogAction::Shutdown,
            json!({
                "description": format!(
                    "COMPLETE: {} fetched, {} saved, {} API calls, {:.0}s runtime — {}",
                    result.records_fetched,
                    result.records_saved + result.records_updated,
                    result.api_calls_made,
                    duration,
                    result.status,
                ),
                "records_fetched": result.records_fetched,
                "records_new": result.records_saved,
                "records_updated": result.records_updated,
                "api_calls_made": result.api_calls_made,
                "errors_count": result.errors.len(),
                "status": result.status.to_string(),
            }),
            Some((duration * 10.0).round() / 10.0),
        );

        result
    }

    /// The fallible middle of the lifecycle, factored out so `run()` can
    /// convert any error into the result envelope.
    async fn execute(
        &self,
        config: &CollectorConfig,
        request: &FetchRequest,
        result: &mut CollectorResult,
    ) -> CropcastResult<()> {
        let ctx = self.ctx();

        self.authenticate().await.map_err(|e| {
            CollectError::Authentication {
                source_name: config.source_name.clone(),
                msg: e.to_string(),
            }
        })?;

        let output = self.fetch_cached(config, request).await?;
        result.records_fetched = output.records_fetched;
        result.from_cache = output.from_cache;
        result.warnings.extend(output.warnings.iter().cloned());

        self.validate_data(&output.data)?;
        ctx.audit.record(
            LogLevel::Info,
            LogAction::Validation,
            json!({
                "description": format!("Validated {} fetched records", output.records_fetched),
                "records": output.records_fetched,
            }),
        );

        let tables = self.transform_data(&output.data)?;
        let (saved, updated) = self.save_tables(&tables)?;
        result.records_saved = saved;
        result.records_updated = updated;
        Ok(())
    }

    /// Cache-aware fetch: a cache file younger than the TTL short-circuits the
    /// network; a successful live fetch is written back.
    async fn fetch_cached(
        &self,
        config: &CollectorConfig,
        request: &FetchRequest,
    ) -> CropcastResult<FetchOutput> {
        let ctx = self.ctx();
        if !config.cache_enabled {
            return self.fetch_data(request).await;
        }

        let mut parts = vec![config.source_name.clone()];
        parts.extend(request.cache_parts());
        let key = FetchCache::key(&parts);

        if let Some(cached) = ctx
            .cache
            .load::<FetchOutput>(&key, config.cache_ttl_hours * 3600)
        {
            let mut output = cached;
            output.from_cache = true;
            return Ok(output);
        }

        let output = self.fetch_data(request).await?;
        if let Err(e) = ctx.cache.store(&key, &output) {
            tracing::warn!(source = %config.source_name, "cache write failed: {e}");
        }
        Ok(output)
    }

    /// Upsert every table batch and emit the matching audit records.
    fn save_tables(&self, tables: &BTreeMap<TableRef, Vec<Row>>) -> CropcastResult<(usize, usize)> {
        let config = self.config();
        let ctx = self.ctx();
        let mut saved = 0;
        let mut updated = 0;

        for (table, rows) in tables {
            if rows.is_empty() {
                continue;
            }
            let unique = self.unique_columns(table, rows);
            let unique_refs: Vec<&str> = unique.iter().map(String::as_str).collect();

            if config.audit_per_record {
                for row in rows {
                    let outcome = ctx.store.upsert(table, &unique_refs, std::slice::from_ref(row))?;
                    saved += outcome.inserted;
                    updated += outcome.updated;
                    let action = if outcome.updated > 0 {
                        LogAction::DataUpdate
                    } else {
                        LogAction::DataSave
                    };
                    ctx.audit.record(
                        LogLevel::Info,
                        action,
                        json!({
                            "description": format!("Saved 1 record to {table}"),
                            "table": table.to_string(),
                            "affected_record_ids": outcome.affected_ids,
                            "facility_name": self.entity_label(row),
                            "source_endpoint": config.source_url,
                            "verification_url": self.verification_url(table, row),
                            "new_values": Value::Object(row.clone()),
                        }),
                    );
                }
            } else {
                let outcome = ctx.store.upsert(table, &unique_refs, rows)?;
                saved += outcome.inserted;
                updated += outcome.updated;
                let action = if outcome.inserted == 0 && outcome.updated > 0 {
                    LogAction::DataUpdate
                } else {
                    LogAction::DataSave
                };
                let first = rows.first().cloned().unwrap_or_default();
                ctx.audit.record(
                    LogLevel::Info,
                    action,
                    json!({
                        "description": format!(
                            "Saved {} records to {table} ({} new, {} updated)",
                            outcome.written(), outcome.inserted, outcome.updated
                        ),
                        "table": table.to_string(),
                        "affected_record_ids": outcome.affected_ids,
                        "facility_name": self.entity_label(&first),
                        "source_endpoint": config.source_url,
                        "verification_url": self.verification_url(table, &first),
                        "new_values": Value::Object(first),
                    }),
                );
            }
        }
        Ok((saved, updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_request_month_window() {
        let request = FetchRequest::month(2024, 8);
        assert_eq!(request.start, NaiveDate::from_ymd_opt(2024, 8, 1));
        assert_eq!(request.end, NaiveDate::from_ymd_opt(2024, 8, 31));

        let december = FetchRequest::month(2023, 12);
        assert_eq!(december.end, NaiveDate::from_ymd_opt(2023, 12, 31));
    }

    #[test]
    fn cache_parts_are_stable() {
        let a = FetchRequest::month(2024, 8)
            .with_param("flow", "export")
            .with_param("country", "BRA");
        let b = FetchRequest::month(2024, 8)
            .with_param("country", "BRA")
            .with_param("flow", "export");
        assert_eq!(a.cache_parts(), b.cache_parts());
    }

    #[test]
    fn run_status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&RunStatus::PartialSuccess).unwrap(),
            "\"PARTIAL_SUCCESS\""
        );
    }
}
