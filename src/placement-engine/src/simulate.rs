//! Replays a marketplace fixture: opens wallets and budgets, runs every
//! request through the allocator, settles the listed engagements through the
//! settlement worker, and reports where the money ended up.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use placement_auction::SlotAllocator;
use placement_billing::{spawn_settlement_worker, BudgetTracker, SettlementEngine, SettlementSummary, WalletLedger};
use placement_core::config::AppConfig;
use placement_core::event_bus::EventSink;
use placement_core::types::{
    Ad, AdId, AdRequestContext, AllocationResult, BudgetStatus, ConfirmationEvent, EngagementKind, Slot,
};
use placement_core::{PlacementError, PlacementResult};
use placement_reporting::{CampaignReport, CampaignReporter, PerformanceAggregator};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const SETTLEMENT_QUEUE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Deserialize)]
pub struct Fixture {
    pub ads: Vec<Ad>,
    pub slots: Vec<Slot>,
    #[serde(default)]
    pub wallets: Vec<WalletSeed>,
    #[serde(default)]
    pub budgets: Vec<BudgetSeed>,
    pub requests: Vec<RequestScript>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletSeed {
    pub seller_id: Uuid,
    pub deposit: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetSeed {
    pub campaign_id: Uuid,
    pub total: Decimal,
    pub daily: Decimal,
}

/// One page render and what the visitor then did with the allocated ads.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestScript {
    pub context: AdRequestContext,
    #[serde(default)]
    pub engagements: Vec<ScriptedEngagement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptedEngagement {
    pub ad_id: AdId,
    pub kind: EngagementKind,
    #[serde(default)]
    pub revenue: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletBalance {
    pub seller_id: Uuid,
    pub wallet_id: Uuid,
    pub balance: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetLine {
    pub campaign_id: Uuid,
    pub status: BudgetStatus,
    pub spent: Decimal,
    pub remaining: Decimal,
    pub utilization_pct: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationSummary {
    pub allocations: Vec<AllocationResult>,
    pub settlement: SettlementSummary,
    pub skipped_engagements: u64,
    pub balances: Vec<WalletBalance>,
    pub budgets: Vec<BudgetLine>,
    pub campaigns: Vec<CampaignReport>,
}

impl Fixture {
    pub fn from_json(raw: &str) -> PlacementResult<Self> {
        let fixture: Fixture = serde_json::from_str(raw)?;
        for slot in &fixture.slots {
            if slot.capacity == 0 || slot.position == 0 {
                return Err(PlacementError::Validation(format!(
                    "slot {} needs position and capacity of at least 1",
                    slot.key()
                )));
            }
            if let Some(rule) = &slot.rule {
                rule.validate()?;
            }
        }
        Ok(fixture)
    }
}

pub async fn run(
    fixture: Fixture,
    config: &AppConfig,
    events: Arc<dyn EventSink>,
) -> PlacementResult<SimulationSummary> {
    let wallets = Arc::new(WalletLedger::in_memory(&config.wallet).with_events(events.clone()));
    let budgets = Arc::new(BudgetTracker::in_memory(&config.budget).with_events(events.clone()));
    let performance = Arc::new(PerformanceAggregator::new());
    let settlement = Arc::new(
        SettlementEngine::new(wallets.clone(), budgets.clone(), performance.clone())
            .with_config(&config.settlement)
            .with_events(events.clone()),
    );
    let allocator = SlotAllocator::new(config).with_events(events);

    for seed in &fixture.wallets {
        let wallet = wallets.open_wallet(seed.seller_id)?;
        if seed.deposit > Decimal::ZERO {
            wallets.deposit(&wallet.id, seed.deposit, Some("fixture".into()))?;
        }
    }
    for seed in &fixture.budgets {
        budgets.set_budget(seed.campaign_id, seed.total, seed.daily)?;
    }

    let (queue, worker) = spawn_settlement_worker(settlement, SETTLEMENT_QUEUE_CAPACITY);
    let mut allocations = Vec::with_capacity(fixture.requests.len());
    let mut skipped_engagements = 0u64;
    let mut days = BTreeSet::new();

    for script in &fixture.requests {
        let ctx = &script.context;
        days.insert(ctx.timestamp.date_naive());
        let snapshot = budgets.snapshot()?;
        let result = allocator.allocate(ctx, &fixture.slots, &fixture.ads, &snapshot, performance.as_ref());

        for engagement in &script.engagements {
            let winner = result
                .placements
                .iter()
                .flat_map(|p| p.winners.iter())
                .find(|w| w.ad_id == engagement.ad_id);
            let Some(winner) = winner else {
                warn!(
                    request_id = %ctx.request_id,
                    ad_id = %engagement.ad_id,
                    "Engagement on an ad that was not allocated, skipped"
                );
                skipped_engagements += 1;
                continue;
            };
            let mut event =
                ConfirmationEvent::from_winner(result.request_id.clone(), winner, engagement.kind, ctx.timestamp);
            event.revenue = engagement.revenue;
            queue.send(event).await?;
        }
        allocations.push(result);
    }

    drop(queue);
    let settlement = worker
        .await
        .map_err(|e| PlacementError::Internal(anyhow::anyhow!("settlement worker failed: {e}")))?;

    let mut balances = Vec::new();
    for seed in &fixture.wallets {
        let wallet = wallets.wallet_for_seller(&seed.seller_id)?;
        balances.push(WalletBalance {
            seller_id: seed.seller_id,
            wallet_id: wallet.id,
            balance: wallet.balance,
        });
    }

    let mut budget_lines = Vec::new();
    for seed in &fixture.budgets {
        if let Some(b) = budgets.budget(&seed.campaign_id)? {
            budget_lines.push(BudgetLine {
                campaign_id: b.campaign_id,
                status: b.status,
                spent: b.spent_amount,
                remaining: b.remaining_amount(),
                utilization_pct: b.utilization_percentage(),
            });
        }
    }

    let campaigns = match (days.first(), days.last()) {
        (Some(from), Some(to)) => campaign_reports(&fixture.ads, &performance, budgets, *from, *to)?,
        _ => Vec::new(),
    };

    info!(
        requests = allocations.len(),
        charged = settlement.charged,
        failed = settlement.failed,
        skipped_engagements,
        "Simulation complete"
    );

    Ok(SimulationSummary {
        allocations,
        settlement,
        skipped_engagements,
        balances,
        budgets: budget_lines,
        campaigns,
    })
}

fn campaign_reports(
    ads: &[Ad],
    performance: &Arc<PerformanceAggregator>,
    budgets: Arc<BudgetTracker>,
    from: NaiveDate,
    to: NaiveDate,
) -> PlacementResult<Vec<CampaignReport>> {
    let reporter = CampaignReporter::new(performance.clone(), budgets);
    let campaigns: BTreeSet<Uuid> = ads.iter().map(|a| a.campaign_id).collect();
    campaigns
        .into_iter()
        .map(|campaign_id| reporter.report(campaign_id, from, to))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use placement_core::event_bus::{capture_sink, PlacementEventType};
    use rust_decimal_macros::dec;

    const MARKETPLACE: &str = include_str!("../fixtures/marketplace.json");

    #[tokio::test]
    async fn test_marketplace_fixture() {
        let fixture = Fixture::from_json(MARKETPLACE).unwrap();
        let sink = capture_sink();
        let summary = run(fixture, &AppConfig::default(), sink.clone()).await.unwrap();

        assert_eq!(summary.allocations.len(), 2);
        let first = &summary.allocations[0];
        assert_eq!(first.placements.len(), 2);
        assert_eq!(first.allocated_ad_ids(), vec!["ad-b", "ad-a"]);

        assert_eq!(summary.settlement.charged, 2);
        assert_eq!(summary.settlement.recorded, 2);
        assert_eq!(summary.skipped_engagements, 1);

        let total_spent: Decimal = summary.budgets.iter().map(|b| b.spent).sum();
        let total_deposits = dec!(300);
        let total_balance: Decimal = summary.balances.iter().map(|b| b.balance).sum();
        assert_eq!(total_balance + total_spent, total_deposits);

        assert_eq!(summary.campaigns.len(), 2);
        assert!(sink.count_type(PlacementEventType::AllocationCompleted) == 2);
    }

    #[test]
    fn test_fixture_rejects_invalid_rule() {
        let raw = r#"{
            "ads": [],
            "slots": [{
                "slot_type": "SEARCH_TOP", "position": 1, "capacity": 1,
                "min_bid_amount": 0.1, "reserve_price": 0.2,
                "rule": {"type": "logical", "op": "and", "children": []}
            }],
            "requests": []
        }"#;
        assert!(matches!(
            Fixture::from_json(raw),
            Err(PlacementError::Validation(_))
        ));
    }

    #[test]
    fn test_fixture_rejects_zero_capacity() {
        let raw = r#"{
            "ads": [],
            "slots": [{
                "slot_type": "HOME_BANNER", "position": 1, "capacity": 0,
                "min_bid_amount": 0.1, "reserve_price": 0.2
            }],
            "requests": []
        }"#;
        assert!(Fixture::from_json(raw).is_err());
    }
}
