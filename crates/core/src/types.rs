use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::rules::RuleExpr;

pub type AdId = String;

// ─── Ads ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AdStatus {
    Draft,
    Active,
    Paused,
    Rejected,
}

/// Which confirmed engagement debits the seller for a won placement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChargeModel {
    #[default]
    PerClick,
    PerImpression,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Targeting {
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

impl Targeting {
    pub fn is_empty(&self) -> bool {
        self.categories.is_empty() && self.keywords.is_empty()
    }
}

/// Flight window. An open `end` runs until the ad is paused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
}

impl Schedule {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && self.end.map(|end| at < end).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Creative {
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub landing_url: String,
}

/// An approved ad as handed over by the campaign store. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ad {
    pub id: AdId,
    pub campaign_id: Uuid,
    pub seller_id: Uuid,
    pub status: AdStatus,
    pub approved: bool,
    pub bid_amount: f64,
    pub max_bid_amount: f64,
    #[serde(default)]
    pub targeting: Targeting,
    pub schedule: Schedule,
    pub creative: Creative,
    #[serde(default)]
    pub charge_model: ChargeModel,
}

impl Ad {
    /// Active and inside its flight window.
    pub fn is_live(&self, at: DateTime<Utc>) -> bool {
        self.status == AdStatus::Active && self.schedule.contains(at)
    }
}

// ─── Slots ──────────────────────────────────────────────────────────────────

/// Slot types in page priority order; earlier variants win ties on position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotType {
    SearchTop,
    SearchSide,
    CategoryTop,
    CategorySide,
    ProductDetail,
    HomeBanner,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotTargeting {
    /// Categories this slot may show. Empty means any.
    #[serde(default)]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub slot_type: SlotType,
    pub position: u32,
    pub capacity: u32,
    pub min_bid_amount: f64,
    pub reserve_price: f64,
    #[serde(default)]
    pub targeting: SlotTargeting,
    #[serde(default)]
    pub rule: Option<RuleExpr>,
}

impl Slot {
    pub fn key(&self) -> SlotKey {
        SlotKey {
            slot_type: self.slot_type,
            position: self.position,
        }
    }

    /// Lowest price any winner of this slot can be charged.
    pub fn price_floor(&self) -> f64 {
        self.reserve_price.max(self.min_bid_amount)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotKey {
    pub slot_type: SlotType,
    pub position: u32,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.slot_type, self.position)
    }
}

// ─── Request context ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

/// Per page view. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdRequestContext {
    pub request_id: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub device: Option<DeviceType>,
    #[serde(default)]
    pub location: Location,
    #[serde(default)]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AdRequestContext {
    /// Lowercased alphanumeric tokens of the search query.
    pub fn query_terms(&self) -> Vec<String> {
        self.query
            .as_deref()
            .unwrap_or_default()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect()
    }
}

// ─── Auction output ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IneligibleReason {
    Inactive,
    Unapproved,
    BudgetExhausted,
    BelowMinBid,
    TargetingMismatch,
}

impl fmt::Display for IneligibleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            IneligibleReason::Inactive => "INACTIVE",
            IneligibleReason::Unapproved => "UNAPPROVED",
            IneligibleReason::BudgetExhausted => "BUDGET_EXHAUSTED",
            IneligibleReason::BelowMinBid => "BELOW_MIN_BID",
            IneligibleReason::TargetingMismatch => "TARGETING_MISMATCH",
        };
        f.write_str(code)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ExclusionReason {
    Ineligible(IneligibleReason),
    InternalScoringError(String),
}

/// An ad that was dropped from one auction. The rest of the auction proceeds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exclusion {
    pub ad_id: AdId,
    pub slot: SlotKey,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Winner {
    pub ad_id: AdId,
    pub campaign_id: Uuid,
    pub seller_id: Uuid,
    pub charge_model: ChargeModel,
    pub final_score: f64,
    pub quality_score: f64,
    /// Reserved price; only charged on a confirmed engagement.
    pub cost: f64,
    pub rank: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotPlacement {
    pub slot: SlotKey,
    pub winners: Vec<Winner>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationResult {
    pub request_id: String,
    pub placements: Vec<SlotPlacement>,
    pub exclusions: Vec<Exclusion>,
    pub latency_us: u64,
}

impl AllocationResult {
    pub fn winners_for(&self, slot_type: SlotType, position: u32) -> &[Winner] {
        self.placements
            .iter()
            .find(|p| p.slot.slot_type == slot_type && p.slot.position == position)
            .map(|p| p.winners.as_slice())
            .unwrap_or_default()
    }

    pub fn winner_count(&self) -> usize {
        self.placements.iter().map(|p| p.winners.len()).sum()
    }

    /// Every allocated ad id, in placement order.
    pub fn allocated_ad_ids(&self) -> Vec<&str> {
        self.placements
            .iter()
            .flat_map(|p| p.winners.iter().map(|w| w.ad_id.as_str()))
            .collect()
    }
}

// ─── Budget view ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BudgetStatus {
    Ok,
    Warning,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStanding {
    pub campaign_id: Uuid,
    pub remaining: Decimal,
    pub daily_remaining: Decimal,
    pub status: BudgetStatus,
}

/// Point-in-time copy of every campaign's budget standing. Eligibility reads
/// this instead of the live tracker, so it may lag by one refresh interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub standings: HashMap<Uuid, BudgetStanding>,
    pub taken_at: DateTime<Utc>,
}

impl Default for BudgetSnapshot {
    fn default() -> Self {
        Self {
            standings: HashMap::new(),
            taken_at: Utc::now(),
        }
    }
}

impl BudgetSnapshot {
    pub fn standing(&self, campaign_id: &Uuid) -> Option<&BudgetStanding> {
        self.standings.get(campaign_id)
    }

    /// Campaigns without a tracked budget are not budget-constrained.
    pub fn is_exhausted(&self, campaign_id: &Uuid, safety_margin: Decimal) -> bool {
        match self.standings.get(campaign_id) {
            Some(s) => {
                s.status == BudgetStatus::Exhausted
                    || s.remaining <= safety_margin
                    || s.daily_remaining <= Decimal::ZERO
            }
            None => false,
        }
    }
}

/// Read access to campaign budget standings.
pub trait BudgetView: Send + Sync {
    fn budget_standing(&self, campaign_id: &Uuid) -> Option<BudgetStanding>;
}

impl BudgetView for BudgetSnapshot {
    fn budget_standing(&self, campaign_id: &Uuid) -> Option<BudgetStanding> {
        self.standings.get(campaign_id).cloned()
    }
}

// ─── Confirmation events ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngagementKind {
    Impression,
    Click,
    Conversion,
}

impl EngagementKind {
    pub fn charges_under(&self, model: ChargeModel) -> bool {
        matches!(
            (self, model),
            (EngagementKind::Impression, ChargeModel::PerImpression)
                | (EngagementKind::Click, ChargeModel::PerClick)
        )
    }
}

/// Posted by the render layer once an allocated placement is actually seen,
/// clicked, or converts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationEvent {
    pub event_id: Uuid,
    pub request_id: String,
    pub ad_id: AdId,
    pub campaign_id: Uuid,
    pub seller_id: Uuid,
    pub kind: EngagementKind,
    pub charge_model: ChargeModel,
    /// The winner's reserved cost from the allocation.
    pub reserved_cost: f64,
    /// Attributed revenue, conversions only.
    #[serde(default)]
    pub revenue: Option<Decimal>,
    pub occurred_at: DateTime<Utc>,
}

impl ConfirmationEvent {
    pub fn from_winner(
        request_id: impl Into<String>,
        winner: &Winner,
        kind: EngagementKind,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            request_id: request_id.into(),
            ad_id: winner.ad_id.clone(),
            campaign_id: winner.campaign_id,
            seller_id: winner.seller_id,
            kind,
            charge_model: winner.charge_model,
            reserved_cost: winner.cost,
            revenue: None,
            occurred_at,
        }
    }

    pub fn is_chargeable(&self) -> bool {
        self.kind.charges_under(self.charge_model)
    }
}
