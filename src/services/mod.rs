pub mod contracts;
pub mod registry;

pub use contracts::{Cleaner, CleanerOutcome, CleanerReport, Extractor, ExtractorResult, UnitContext};
pub use registry::{discover_services, CleanerStage, ServiceSpec, UnitSpec};
