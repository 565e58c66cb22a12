pub mod base;
pub mod types;

pub use base::{PlannerError, build_plan};
pub use types::{PortPreset, ScanConfig, ScanOptions, ScanPlan};
