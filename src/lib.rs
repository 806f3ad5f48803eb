// === Public Modules (The Canonical Paths) ===
pub mod agronomy;
pub mod audit;
pub mod collect;
pub mod config;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod queue;
pub mod report;
pub mod schedule;
pub mod store;
pub mod trade;
pub mod verify;

// === Facades (Re-exporting internals) ===
// Expose the collector contract without forcing callers through the module path.
pub use crate::collect::contract::{Collector, CollectorConfig, CollectorResult, RunStatus};
pub use crate::error::{CropcastError, CropcastResult};
pub use crate::store::{Layer, Store, TableRef};
