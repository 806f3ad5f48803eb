use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::Bytes;
use chrono::Local;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString, IntoStaticStr};
use tokio::sync::Mutex;

use crate::{
    audit::{AuditLog, LogAction, LogLevel},
    error::{CropcastResult, HttpError, IoError},
};

// ================================================================================================
// Configuration
// ================================================================================================

/// Retry, backoff, and rate-limit policy for one HTTP session.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Maximum request attempts before `MaxRetries` (default 3).
    pub retry_attempts: u32,
    /// Base backoff delay in seconds (default 1.0).
    pub retry_delay_base: f64,
    /// Backoff multiplier per attempt (default 2.0).
    pub backoff_multiplier: f64,
    /// Hard cap on a single backoff sleep in seconds.
    pub backoff_cap_secs: f64,
    /// Per-request timeout in seconds (default 30).
    pub timeout_secs: u64,
    /// Requests per minute; the session enforces a minimum inter-request gap
    /// of `60 / rate_limit_per_minute` seconds.
    pub rate_limit_per_minute: f64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_base: 1.0,
            backoff_multiplier: 2.0,
            backoff_cap_secs: 120.0,
            timeout_secs: 30,
            rate_limit_per_minute: 60.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, IntoStaticStr)]
#[strum(serialize_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
}

/// File extension for archived raw responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ArchiveFormat {
    Json,
    Csv,
    Pdf,
    Xml,
    Html,
}

// ================================================================================================
// Response Envelope
// ================================================================================================

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
    pub retry_after: Option<u64>,
}

impl HttpResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> CropcastResult<T> {
        serde_json::from_slice(&self.body).map_err(|e| IoError::Json(e).into())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// `sha256:` prefix plus the first 16 hex characters of the body digest.
    pub fn body_hash(&self) -> String {
        hash_body(&self.body)
    }
}

pub fn hash_body(body: &[u8]) -> String {
    let digest = Sha256::digest(body);
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256:{}", &hex[..16])
}

// ================================================================================================
// Client
// ================================================================================================

/// HTTP session with retry/backoff, rate limiting, response hashing, audit
/// logging, and raw-body archiving.
///
/// One instance per collector; sessions are not shared across collectors. The
/// underlying `reqwest` client is recreated after connection errors.
pub struct HttpClient {
    config: HttpConfig,
    client: Mutex<reqwest::Client>,
    last_request: Mutex<Option<Instant>>,
    audit: Arc<AuditLog>,
    raw_dir: Option<PathBuf>,
    request_count: AtomicU64,
    default_headers: Vec<(String, String)>,
}

impl HttpClient {
    pub fn new(config: HttpConfig, audit: Arc<AuditLog>, raw_dir: Option<PathBuf>) -> Self {
        let client = build_client(config.timeout_secs);
        Self {
            config,
            client: Mutex::new(client),
            last_request: Mutex::new(None),
            audit,
            raw_dir,
            request_count: AtomicU64::new(0),
            default_headers: Vec::new(),
        }
    }

    /// Headers attached to every request (e.g. `Accept: application/json`).
    pub fn with_default_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub async fn get(&self, url: &str, params: &[(&str, String)]) -> CropcastResult<HttpResponse> {
        self.request(Method::Get, url, params, None).await
    }

    pub async fn post_json(&self, url: &str, body: Value) -> CropcastResult<HttpResponse> {
        self.request(Method::Post, url, &[], Some(body)).await
    }

    /// Issue a request with the full retry/backoff/rate-limit policy.
    ///
    /// Returns the response for any terminal status (including 4xx other than
    /// auth) so callers can interpret e.g. a release-day 404 themselves.
    /// 429 and 5xx are retried with exponential backoff; timeouts and
    /// connection errors recreate the session and retry; 401/403 fail
    /// immediately without retry.
    pub async fn request(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> CropcastResult<HttpResponse> {
        for attempt in 0..self.config.retry_attempts {
            self.acquire_rate_slot().await;

            let started = Instant::now();
            let outcome = self.send_once(method, url, params, body.clone()).await;
            let elapsed = started.elapsed().as_secs_f64();

            match outcome {
                Ok(response) => {
                    self.request_count.fetch_add(1, Ordering::Relaxed);
                    self.log_api_call(method, url, params, &response, elapsed);

                    match response.status {
                        429 => {
                            let wait = response
                                .retry_after
                                .map(|s| s as f64)
                                .unwrap_or_else(|| self.backoff_delay(attempt));
                            self.audit.record(
                                LogLevel::Warn,
                                LogAction::ApiCall,
                                json!({"description": format!("Rate limited (429), waiting {wait:.0}s")}),
                            );
                            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                        }
                        status if status >= 500 => {
                            let wait = self.backoff_delay(attempt);
                            self.audit.record(
                                LogLevel::Warn,
                                LogAction::ApiCall,
                                json!({"description": format!("Server error ({status}), waiting {wait:.0}s")}),
                            );
                            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                        }
                        401 | 403 => {
                            return Err(HttpError::AuthRejected {
                                status: response.status,
                                url: url.to_string(),
                            }
                            .into());
                        }
                        _ => return Ok(response),
                    }
                }
                Err(RequestFailure::Timeout) => {
                    let wait = self.backoff_delay(attempt);
                    self.audit.record(
                        LogLevel::Warn,
                        LogAction::Error,
                        json!({"description": format!(
                            "Request timeout after {elapsed:.1}s, retry {}/{}",
                            attempt + 1,
                            self.config.retry_attempts
                        )}),
                    );
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                Err(RequestFailure::Connection(msg)) => {
                    let wait = self.backoff_delay(attempt);
                    self.audit.record(
                        LogLevel::Warn,
                        LogAction::Error,
                        json!({"description": format!(
                            "Connection error: {}, retry {}/{}",
                            truncate(&msg, 200),
                            attempt + 1,
                            self.config.retry_attempts
                        )}),
                    );
                    self.recreate_session().await;
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                }
                Err(RequestFailure::Other(msg)) => {
                    self.audit.record(
                        LogLevel::Error,
                        LogAction::Error,
                        json!({"description": format!("Unexpected error: {}", truncate(&msg, 300))}),
                    );
                    return Err(HttpError::Connection(msg).into());
                }
            }
        }

        let error = HttpError::MaxRetries {
            attempts: self.config.retry_attempts,
            url: url.to_string(),
        };
        self.audit.record(
            LogLevel::Error,
            LogAction::Error,
            json!({"description": error.to_string()}),
        );
        Err(error.into())
    }

    /// Persist a raw response body to the archive directory as
    /// `{endpoint}_{identifier}_{YYYYMMDD_HHMMSS}.{ext}`.
    pub fn archive(
        &self,
        endpoint_name: &str,
        identifier: &str,
        format: ArchiveFormat,
        body: &[u8],
    ) -> CropcastResult<Option<PathBuf>> {
        let Some(raw_dir) = &self.raw_dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(raw_dir)
            .map_err(|e| IoError::FileSystem(format!("Failed to create {raw_dir:?}: {e}")))?;

        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = raw_dir.join(format!("{endpoint_name}_{identifier}_{stamp}.{format}"));
        std::fs::write(&path, body).map_err(IoError::Io)?;
        Ok(Some(path))
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    async fn send_once(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<HttpResponse, RequestFailure> {
        let client = self.client.lock().await.clone();

        let mut builder = match method {
            Method::Get => client.get(url),
            Method::Post => client.post(url),
        };
        if !params.is_empty() {
            builder = builder.query(params);
        }
        for (name, value) in &self.default_headers {
            builder = builder.header(name, value);
        }
        if let Some(json_body) = body {
            builder = builder.json(&json_body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                RequestFailure::Timeout
            } else if e.is_connect() || e.is_request() {
                RequestFailure::Connection(e.to_string())
            } else {
                RequestFailure::Other(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get("Retry-After")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                RequestFailure::Timeout
            } else {
                RequestFailure::Connection(e.to_string())
            }
        })?;

        Ok(HttpResponse {
            status,
            body: bytes,
            retry_after,
        })
    }

    async fn acquire_rate_slot(&self) {
        let min_gap = Duration::from_secs_f64(60.0 / self.config.rate_limit_per_minute.max(0.001));
        let mut last = self.last_request.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < min_gap {
                tokio::time::sleep(min_gap - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn recreate_session(&self) {
        let mut client = self.client.lock().await;
        *client = build_client(self.config.timeout_secs);
    }

    fn backoff_delay(&self, attempt: u32) -> f64 {
        let delay = self.config.retry_delay_base * self.config.backoff_multiplier.powi(attempt as i32);
        delay.min(self.config.backoff_cap_secs)
    }

    fn log_api_call(
        &self,
        method: Method,
        url: &str,
        params: &[(&str, String)],
        response: &HttpResponse,
        elapsed: f64,
    ) {
        let endpoint_tail = url.rsplit('/').next().unwrap_or(url);
        let params_map: serde_json::Map<String, Value> = params
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.clone())))
            .collect();

        self.audit.record_timed(
            LogLevel::Info,
            LogAction::ApiCall,
            json!({
                "description": format!("{method} {endpoint_tail} ({elapsed:.1}s)"),
                "source_type": "API",
                "source_endpoint": url,
                "source_params": params_map,
                "http_status": response.status,
                "response_size_bytes": response.body.len(),
                "response_hash": response.body_hash(),
            }),
            Some((elapsed * 100.0).round() / 100.0),
        );
    }
}

enum RequestFailure {
    Timeout,
    Connection(String),
    Other(String),
}

fn build_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .unwrap_or_default()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_hash_is_prefixed_and_short() {
        let hash = hash_body(b"{\"ok\":true}");
        assert!(hash.starts_with("sha256:"));
        assert_eq!(hash.len(), "sha256:".len() + 16);
        // Deterministic for identical bodies.
        assert_eq!(hash, hash_body(b"{\"ok\":true}"));
        assert_ne!(hash, hash_body(b"{\"ok\":false}"));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let audit = Arc::new(AuditLog::in_memory("t", "r"));
        let client = HttpClient::new(HttpConfig::default(), audit, None);
        assert!((client.backoff_delay(0) - 1.0).abs() < f64::EPSILON);
        assert!((client.backoff_delay(1) - 2.0).abs() < f64::EPSILON);
        assert!((client.backoff_delay(2) - 4.0).abs() < f64::EPSILON);
        assert!((client.backoff_delay(20) - 120.0).abs() < f64::EPSILON);
    }

    #[test]
    fn archive_format_extension() {
        assert_eq!(ArchiveFormat::Json.to_string(), "json");
        assert_eq!(ArchiveFormat::Pdf.to_string(), "pdf");
    }
}
