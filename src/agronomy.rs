pub mod calendar;
pub mod features;
pub mod model;
pub mod orchestrate;
pub mod validate;

pub use calendar::{Crop, GrowthStage, date_to_nass_week, nass_week_to_date};
pub use features::{FeatureEngine, YieldFeatureRow};
pub use model::{YieldModel, YieldPrediction};
pub use orchestrate::YieldOrchestrator;
pub use validate::YieldValidator;
