pub mod archive;
pub mod engine;
pub mod hashes;
pub mod layout;

pub use engine::{PromotionEngine, ValidationVerdict};
pub use layout::{FileRecord, Zone, ZoneLayout};
