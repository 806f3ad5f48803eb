pub mod balance;
pub mod harmonize;
pub mod quality;
pub mod record;

pub use balance::{BalanceEntry, BalanceMatrixBuilder};
pub use harmonize::Harmonizer;
pub use quality::{AlertSeverity, QualityAlert, QualityReport, QualityValidator};
pub use record::{Flow, TradeRecord};
