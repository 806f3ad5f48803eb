pub mod cache;
pub mod contract;
pub mod parse;
pub mod sources;
pub mod state;

pub use contract::{
    Collector, CollectorConfig, CollectorResult, FetchOutput, FetchRequest, RunStatus,
    SourceContext,
};
pub use state::{CollectorRunState, RunStateRegistry};
