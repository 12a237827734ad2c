//! Campaign report query: counters and derived rates over a date range,
//! joined with the campaign's current budget standing.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use placement_core::performance::DerivedRates;
use placement_core::types::{BudgetStanding, BudgetView};
use placement_core::{PerformanceMetrics, PlacementError, PlacementResult};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::performance::{DailyMetrics, PerformanceAggregator};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignReport {
    pub campaign_id: Uuid,
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub totals: PerformanceMetrics,
    pub rates: DerivedRates,
    pub daily: Vec<DailyMetrics>,
    /// `None` for campaigns without a tracked budget.
    pub budget: Option<BudgetStanding>,
    pub generated_at: DateTime<Utc>,
}

pub struct CampaignReporter {
    performance: Arc<PerformanceAggregator>,
    budgets: Arc<dyn BudgetView>,
}

impl CampaignReporter {
    pub fn new(performance: Arc<PerformanceAggregator>, budgets: Arc<dyn BudgetView>) -> Self {
        Self {
            performance,
            budgets,
        }
    }

    pub fn report(&self, campaign_id: Uuid, from: NaiveDate, to: NaiveDate) -> PlacementResult<CampaignReport> {
        if from > to {
            return Err(PlacementError::Validation(format!(
                "report range starts after it ends: {from} > {to}"
            )));
        }

        let daily = self.performance.daily(&campaign_id, from, to);
        let mut totals = PerformanceMetrics::default();
        for day in &daily {
            totals.merge(&day.metrics);
        }
        debug!(campaign_id = %campaign_id, %from, %to, days = daily.len(), "Campaign report built");

        Ok(CampaignReport {
            campaign_id,
            from,
            to,
            rates: totals.rates(),
            totals,
            daily,
            budget: self.budgets.budget_standing(&campaign_id),
            generated_at: Utc::now(),
        })
    }
}
