//! Campaign budget tracking with daily caps, threshold alerts, and the
//! point-in-time snapshot the eligibility filter reads.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use placement_core::config::BudgetConfig;
use placement_core::event_bus::{make_event, noop_sink, EventSink, PlacementEventType};
use placement_core::types::{BudgetSnapshot, BudgetStanding, BudgetStatus, BudgetView};
use placement_core::{PlacementError, PlacementResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub campaign_id: Uuid,
    pub total_budget: Decimal,
    pub daily_budget: Decimal,
    pub spent_amount: Decimal,
    pub spent_today: Decimal,
    /// UTC day `spent_today` belongs to.
    pub spend_day: NaiveDate,
    pub status: BudgetStatus,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl Budget {
    pub fn remaining_amount(&self) -> Decimal {
        (self.total_budget - self.spent_amount).max(Decimal::ZERO)
    }

    /// Daily headroom as of `day`. A day after `spend_day` starts fresh.
    pub fn daily_remaining_on(&self, day: NaiveDate) -> Decimal {
        let spent = if day > self.spend_day {
            Decimal::ZERO
        } else {
            self.spent_today
        };
        (self.daily_budget - spent).max(Decimal::ZERO)
    }

    /// Percent of the total budget spent, clamped to `[0, 100]`.
    pub fn utilization_percentage(&self) -> Decimal {
        if self.total_budget <= Decimal::ZERO {
            return HUNDRED;
        }
        (self.spent_amount / self.total_budget * HUNDRED).clamp(Decimal::ZERO, HUNDRED)
    }

    fn standing(&self, day: NaiveDate) -> BudgetStanding {
        BudgetStanding {
            campaign_id: self.campaign_id,
            remaining: self.remaining_amount(),
            daily_remaining: self.daily_remaining_on(day),
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAlertType {
    /// Utilization crossed the warning threshold.
    NearingLimit,
    /// Today's spend reached the daily budget.
    DailyCapReached,
    /// Total spend reached the total budget.
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub alert_type: BudgetAlertType,
    pub utilization_pct: Decimal,
    pub message: String,
    pub triggered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub trait BudgetStore: Send + Sync {
    fn load(&self, campaign_id: &Uuid) -> PlacementResult<Option<Budget>>;
    /// Inserts when `expected_version` is `None` and no budget exists yet,
    /// otherwise replaces only if the stored version matches. Returns
    /// `Ok(false)` on a lost race.
    fn commit(&self, expected_version: Option<u64>, budget: Budget) -> PlacementResult<bool>;
    fn all(&self) -> PlacementResult<Vec<Budget>>;
}

#[derive(Default)]
pub struct InMemoryBudgetStore {
    budgets: DashMap<Uuid, Budget>,
}

impl InMemoryBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BudgetStore for InMemoryBudgetStore {
    fn load(&self, campaign_id: &Uuid) -> PlacementResult<Option<Budget>> {
        Ok(self.budgets.get(campaign_id).map(|b| b.clone()))
    }

    fn commit(&self, expected_version: Option<u64>, budget: Budget) -> PlacementResult<bool> {
        use dashmap::mapref::entry::Entry;
        match (self.budgets.entry(budget.campaign_id), expected_version) {
            (Entry::Vacant(slot), None) => {
                slot.insert(budget);
                Ok(true)
            }
            (Entry::Occupied(mut current), Some(version)) if current.get().version == version => {
                current.insert(budget);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn all(&self) -> PlacementResult<Vec<Budget>> {
        Ok(self.budgets.iter().map(|e| e.value().clone()).collect())
    }
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

pub struct BudgetTracker {
    store: Arc<dyn BudgetStore>,
    warning_threshold_pct: Decimal,
    max_cas_retries: u32,
    /// campaign_id -> alerts, oldest first
    alerts: DashMap<Uuid, Vec<BudgetAlert>>,
    events: Arc<dyn EventSink>,
}

impl BudgetTracker {
    pub fn new(store: Arc<dyn BudgetStore>, config: &BudgetConfig) -> Self {
        info!(
            warning_threshold_pct = config.warning_threshold_pct,
            "BudgetTracker initialized"
        );
        Self {
            store,
            warning_threshold_pct: config.warning_threshold_decimal(),
            max_cas_retries: config.max_cas_retries.max(1),
            alerts: DashMap::new(),
            events: noop_sink(),
        }
    }

    pub fn in_memory(config: &BudgetConfig) -> Self {
        Self::new(Arc::new(InMemoryBudgetStore::new()), config)
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Creates a campaign budget, or changes the limits of an existing one
    /// while keeping what has already been spent.
    pub fn set_budget(
        &self,
        campaign_id: Uuid,
        total: Decimal,
        daily: Decimal,
    ) -> PlacementResult<Budget> {
        if total <= Decimal::ZERO || daily <= Decimal::ZERO {
            return Err(PlacementError::Validation(format!(
                "budget limits must be positive, got total {total} daily {daily}"
            )));
        }

        self.with_retry(campaign_id, |current| {
            let now = Utc::now();
            let mut next = match current {
                Some(existing) if total < existing.spent_amount => {
                    return Err(PlacementError::Validation(format!(
                        "total budget {total} is below spent amount {}",
                        existing.spent_amount
                    )));
                }
                Some(existing) => Budget {
                    total_budget: total,
                    daily_budget: daily,
                    version: existing.version + 1,
                    updated_at: now,
                    ..existing.clone()
                },
                None => Budget {
                    campaign_id,
                    total_budget: total,
                    daily_budget: daily,
                    spent_amount: Decimal::ZERO,
                    spent_today: Decimal::ZERO,
                    spend_day: now.date_naive(),
                    status: BudgetStatus::Ok,
                    version: 0,
                    updated_at: now,
                },
            };
            next.status = self.classify(&next);
            Ok(next)
        })
        .map(|(_, budget)| {
            info!(campaign_id = %campaign_id, total = %total, daily = %daily, "Budget set");
            budget
        })
    }

    /// Adds confirmed spend. Rejected without mutation if it would take the
    /// campaign past its total or daily budget.
    pub fn record_spend(
        &self,
        campaign_id: Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> PlacementResult<Budget> {
        if amount <= Decimal::ZERO {
            return Err(PlacementError::Validation(format!(
                "spend must be positive, got {amount}"
            )));
        }

        let (previous, next) = self.with_retry(campaign_id, |current| {
            let Some(current) = current else {
                return Err(PlacementError::NotFound(format!("budget for campaign {campaign_id}")));
            };
            let mut next = current.clone();
            let day = at.date_naive();
            if day > next.spend_day {
                next.spend_day = day;
                next.spent_today = Decimal::ZERO;
            }
            let spent_after = next.spent_amount.checked_add(amount).ok_or_else(|| {
                PlacementError::Validation(format!("spend {amount} overflows campaign total"))
            })?;
            let today_after = next.spent_today.checked_add(amount).ok_or_else(|| {
                PlacementError::Validation(format!("spend {amount} overflows daily total"))
            })?;
            if spent_after > next.total_budget {
                return Err(PlacementError::BudgetExceeded {
                    campaign_id,
                    detail: format!(
                        "spend {amount} exceeds remaining {}",
                        next.remaining_amount()
                    ),
                });
            }
            if today_after > next.daily_budget {
                return Err(PlacementError::BudgetExceeded {
                    campaign_id,
                    detail: format!(
                        "spend {amount} exceeds daily remaining {}",
                        next.daily_budget - next.spent_today
                    ),
                });
            }
            next.spent_amount = spent_after;
            next.spent_today = today_after;
            next.status = self.classify(&next);
            next.version += 1;
            next.updated_at = Utc::now();
            Ok(next)
        })?;

        debug!(
            campaign_id = %campaign_id,
            amount = %amount,
            spent = %next.spent_amount,
            status = ?next.status,
            "Budget spend recorded"
        );
        if let Some(previous) = previous {
            self.raise_alerts(&previous, &next);
        }
        Ok(next)
    }

    /// Whether `amount` could be recorded at `at` without exceeding either cap.
    pub fn has_headroom(
        &self,
        campaign_id: &Uuid,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> PlacementResult<bool> {
        Ok(match self.store.load(campaign_id)? {
            Some(b) => amount <= b.remaining_amount() && amount <= b.daily_remaining_on(at.date_naive()),
            None => true,
        })
    }

    pub fn budget(&self, campaign_id: &Uuid) -> PlacementResult<Option<Budget>> {
        self.store.load(campaign_id)
    }

    pub fn status(&self, campaign_id: &Uuid) -> PlacementResult<BudgetStatus> {
        self.store
            .load(campaign_id)?
            .map(|b| b.status)
            .ok_or_else(|| PlacementError::NotFound(format!("budget for campaign {campaign_id}")))
    }

    pub fn alerts(&self, campaign_id: &Uuid) -> Vec<BudgetAlert> {
        self.alerts
            .get(campaign_id)
            .map(|a| a.clone())
            .unwrap_or_default()
    }

    /// Point-in-time standings for every tracked campaign.
    pub fn snapshot(&self) -> PlacementResult<BudgetSnapshot> {
        let taken_at = Utc::now();
        let day = taken_at.date_naive();
        let standings: HashMap<Uuid, BudgetStanding> = self
            .store
            .all()?
            .iter()
            .map(|b| (b.campaign_id, b.standing(day)))
            .collect();
        Ok(BudgetSnapshot {
            standings,
            taken_at,
        })
    }

    fn classify(&self, budget: &Budget) -> BudgetStatus {
        let pct = budget.utilization_percentage();
        if pct >= HUNDRED {
            BudgetStatus::Exhausted
        } else if pct >= self.warning_threshold_pct {
            BudgetStatus::Warning
        } else {
            BudgetStatus::Ok
        }
    }

    /// Load, build the next state, and commit with CAS. Returns the state
    /// the winning attempt started from alongside the committed one.
    fn with_retry<F>(&self, campaign_id: Uuid, build: F) -> PlacementResult<(Option<Budget>, Budget)>
    where
        F: Fn(Option<&Budget>) -> PlacementResult<Budget>,
    {
        for attempt in 1..=self.max_cas_retries {
            let current = self.store.load(&campaign_id)?;
            let next = build(current.as_ref())?;
            let expected = current.as_ref().map(|b| b.version);
            if self.store.commit(expected, next.clone())? {
                return Ok((current, next));
            }
            debug!(campaign_id = %campaign_id, attempt, "Budget version conflict, retrying");
        }
        warn!(campaign_id = %campaign_id, "Budget update gave up after repeated conflicts");
        Err(PlacementError::ConcurrencyConflict {
            key: format!("budget:{campaign_id}"),
            attempts: self.max_cas_retries,
        })
    }

    fn raise_alerts(&self, before: &Budget, after: &Budget) {
        let before_pct = before.utilization_percentage();
        let after_pct = after.utilization_percentage();

        if before_pct < self.warning_threshold_pct && after_pct >= self.warning_threshold_pct {
            self.push_alert(
                after,
                BudgetAlertType::NearingLimit,
                format!("Campaign has used {after_pct:.1}% of its budget"),
            );
        }
        let daily_before = if after.spend_day > before.spend_day {
            Decimal::ZERO
        } else {
            before.spent_today
        };
        if daily_before < after.daily_budget && after.spent_today >= after.daily_budget {
            self.push_alert(
                after,
                BudgetAlertType::DailyCapReached,
                format!("Daily budget of {} reached", after.daily_budget),
            );
        }
        if before.status != BudgetStatus::Exhausted && after.status == BudgetStatus::Exhausted {
            metrics::counter!("budget.exhausted").increment(1);
            self.push_alert(
                after,
                BudgetAlertType::Exhausted,
                format!("Total budget of {} exhausted", after.total_budget),
            );
        }
    }

    fn push_alert(&self, budget: &Budget, alert_type: BudgetAlertType, message: String) {
        let alert = BudgetAlert {
            id: Uuid::new_v4(),
            campaign_id: budget.campaign_id,
            alert_type,
            utilization_pct: budget.utilization_percentage(),
            message,
            triggered_at: Utc::now(),
        };
        warn!(
            campaign_id = %alert.campaign_id,
            alert = ?alert.alert_type,
            utilization_pct = %alert.utilization_pct,
            "Budget alert"
        );
        self.events.emit(make_event(
            PlacementEventType::BudgetAlert,
            alert.campaign_id.to_string(),
            json!({
                "alert_type": alert.alert_type,
                "utilization_pct": alert.utilization_pct.to_string(),
                "message": alert.message,
            }),
        ));
        self.alerts.entry(budget.campaign_id).or_default().push(alert);
    }
}

impl BudgetView for BudgetTracker {
    fn budget_standing(&self, campaign_id: &Uuid) -> Option<BudgetStanding> {
        match self.store.load(campaign_id) {
            Ok(budget) => budget.map(|b| b.standing(Utc::now().date_naive())),
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "Budget lookup failed");
                None
            }
        }
    }
}
