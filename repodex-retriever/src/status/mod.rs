//! Index health: orphan detection, repair and per-repository validation.

pub mod health;
pub mod types;


pub use health::HealthChecker;
pub use types::{HealthReport, RepairReport};
