//! Shared domain types, configuration, errors, targeting rules, and the event
//! sink used by every placement engine crate.

pub mod config;
pub mod error;
pub mod event_bus;
pub mod performance;
pub mod rules;
pub mod types;

pub use config::AppConfig;
pub use error::{PlacementError, PlacementResult};
pub use performance::{PerformanceHistory, PerformanceMetrics, PerformanceRecorder};
