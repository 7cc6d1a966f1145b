pub mod monitor;
pub mod remediator;

pub use monitor::HealthMonitor;
pub use remediator::Remediator;
