//! Performance counters and campaign reports.

pub mod performance;
pub mod report;

pub use performance::{DailyMetrics, PerformanceAggregator};
pub use report::{CampaignReport, CampaignReporter};
