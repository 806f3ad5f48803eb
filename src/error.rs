use std::num::{ParseFloatError, ParseIntError};

use thiserror::Error;

pub type CropcastResult<T> = Result<T, CropcastError>;

#[derive(Debug, Error)]
pub enum CropcastError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Collect(#[from] CollectError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Trade(#[from] TradeError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] IoError),
}

// Common leaf errors funnel into their owning subsystem so call sites can use
// `?` without restating the routing.
impl From<strum::ParseError> for CropcastError {
    fn from(e: strum::ParseError) -> Self {
        CropcastError::Collect(CollectError::ParseEnum(e))
    }
}

impl From<std::io::Error> for CropcastError {
    fn from(e: std::io::Error) -> Self {
        CropcastError::Io(IoError::Io(e))
    }
}

impl From<serde_json::Error> for CropcastError {
    fn from(e: serde_json::Error) -> Self {
        CropcastError::Io(IoError::Json(e))
    }
}

/// Errors raised by the HTTP core (retry, rate limiting, transport).
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: '{0}'")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Request timeout after {seconds}s: {url}")]
    Timeout { url: String, seconds: u64 },

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("Authentication rejected (HTTP {status}) by {url} — check credentials")]
    AuthRejected { status: u16, url: String },

    #[error("Max retries ({attempts}) exceeded for {url}")]
    MaxRetries { attempts: u32, url: String },

    #[error("Failed to read response body: {0}")]
    Body(String),
}

/// Errors occurring inside a collector lifecycle.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("Authentication failed for '{source_name}': {msg}")]
    Authentication { source_name: String, msg: String },

    #[error("Validation failed for '{source_name}': {msg}")]
    Validation { source_name: String, msg: String },

    #[error("Failed to parse payload: {0}")]
    Parse(String),

    #[error("Parse failure rate {failed}/{total} exceeds 20% — failing the run")]
    ParseRateExceeded { failed: usize, total: usize },

    #[error("No eligible source available: {0}")]
    SourceUnavailable(String),

    #[error("'{source_name}' has not published {period} yet")]
    NotPublished { source_name: String, period: String },

    #[error("Missing credential: set {0}")]
    MissingCredential(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Failed to parse enum: {0}")]
    ParseEnum(#[from] strum::ParseError),

    #[error("Failed to parse integer: {0}")]
    ParseInt(#[from] ParseIntError),

    #[error("Failed to parse float: {0}")]
    ParseFloat(#[from] ParseFloatError),
}

/// Errors from the layered store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unknown table: '{0}'")]
    TableNotFound(String),

    #[error("Row in '{table}' is missing unique column '{column}'")]
    MissingKeyColumn { table: String, column: String },

    #[error("Row in '{table}' is not a JSON object")]
    NotAnObject { table: String },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Errors from harmonization and the balance matrix.
#[derive(Debug, Error)]
pub enum TradeError {
    #[error("Invalid HS code: '{0}'")]
    InvalidHsCode(String),

    #[error("Unknown quantity unit: '{0}'")]
    UnknownUnit(String),

    #[error("No bushel factor for commodity '{0}'")]
    NoBushelFactor(String),

    #[error("Invalid number format: '{0}'")]
    NumberFormat(String),

    #[error("Record is missing required field '{0}'")]
    MissingField(String),
}

/// Errors from the release-calendar scheduler.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Unknown scheduled task: '{0}'")]
    UnknownTask(String),

    #[error("Task '{0}' is disabled")]
    TaskDisabled(String),

    #[error("Invalid release calendar: {0}")]
    InvalidCalendar(String),
}

/// Errors from the task queue and executor.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Task {0} not found")]
    TaskNotFound(i64),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Task {0} is not waiting for human input")]
    NotWaiting(i64),

    #[error("Security guard rejected task: {0}")]
    SecurityRejected(String),

    #[error("No handler registered for task type '{0}'")]
    HandlerNotFound(String),
}

/// Errors from the yield feature engine and prediction models.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Insufficient training data: {n} samples, need at least {required}")]
    InsufficientData { n: usize, required: usize },

    #[error("No trained models found for crop '{0}' — run train first")]
    NotTrained(String),

    #[error("Training failed: {0}")]
    Training(String),

    #[error("Prediction failed: {0}")]
    Prediction(String),

    #[error("Model persistence failed: {0}")]
    Persistence(String),
}

/// Errors from configuration loading and credential resolution.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: tried {0}")]
    MissingEnv(String),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),

    #[error("Failed to read config file '{path}': {msg}")]
    FileRead { path: String, msg: String },

    #[error("Unknown crop: '{0}'")]
    UnknownCrop(String),
}

/// Errors related to file I/O and serialization.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("IO operation failed")]
    Io(#[from] std::io::Error),

    #[error("Serialization failed")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Failed to create writer: {0}")]
    WriterCreation(String),

    #[error("Failed to create reader: {0}")]
    ReaderCreation(String),
}
