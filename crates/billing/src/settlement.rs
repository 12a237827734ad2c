//! Turns confirmed engagements into performance counts and, when the ad's
//! charge model says so, a wallet debit plus budget spend.
//!
//! Allocation only reserves a price. Money moves here, once per confirmation
//! event id, with the wallet debit and budget spend for a campaign serialized
//! behind a per-campaign lock.
//!
//! Receipts are kept for `settlement.dedup_window_secs`. A charge that failed
//! leaves an unbilled receipt, so replaying the same event retries the charge
//! without counting the engagement again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use placement_core::config::SettlementConfig;
use placement_core::event_bus::{make_event, noop_sink, EventSink, PlacementEventType};
use placement_core::types::ConfirmationEvent;
use placement_core::{PlacementError, PlacementResult, PerformanceRecorder};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::budget::BudgetTracker;
use crate::wallet::WalletLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// Counted; nothing to charge for this engagement kind.
    Recorded,
    Charged {
        amount: Decimal,
        balance_after: Decimal,
    },
    /// The event id was already processed.
    Duplicate,
}

/// Converts a reserved auction price into ledger money, rounding toward zero
/// so the seller is never charged above the reserved price.
pub fn to_ledger_amount(reserved_cost: f64) -> PlacementResult<Decimal> {
    if !reserved_cost.is_finite() || reserved_cost < 0.0 {
        return Err(PlacementError::Validation(format!(
            "reserved cost {reserved_cost} is not a valid price"
        )));
    }
    let amount = Decimal::from_f64(reserved_cost).ok_or_else(|| {
        PlacementError::Validation(format!("reserved cost {reserved_cost} out of range"))
    })?;
    // Float noise below a micro-unit is dropped before truncating to cents.
    Ok(amount
        .round_dp(6)
        .round_dp_with_strategy(2, RoundingStrategy::ToZero))
}

/// Receipts are swept once every this many confirmations.
const EVICTION_INTERVAL: u64 = 1024;
/// Ten years; keeps the window inside chrono's range.
const MAX_DEDUP_WINDOW_SECS: u64 = 315_360_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiptState {
    InFlight,
    Settled,
    /// Counted, but the charge failed. A replay may retry it.
    Unbilled,
}

#[derive(Debug, Clone, Copy)]
struct Receipt {
    state: ReceiptState,
    first_seen: DateTime<Utc>,
}

enum Admission {
    First,
    Retry,
    Duplicate,
}

pub struct SettlementEngine {
    wallets: Arc<WalletLedger>,
    budgets: Arc<BudgetTracker>,
    performance: Arc<dyn PerformanceRecorder>,
    receipts: DashMap<Uuid, Receipt>,
    dedup_window: Duration,
    confirmations: AtomicU64,
    campaign_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    events: Arc<dyn EventSink>,
}

impl SettlementEngine {
    pub fn new(
        wallets: Arc<WalletLedger>,
        budgets: Arc<BudgetTracker>,
        performance: Arc<dyn PerformanceRecorder>,
    ) -> Self {
        info!("SettlementEngine initialized");
        Self {
            wallets,
            budgets,
            performance,
            receipts: DashMap::new(),
            dedup_window: window(&SettlementConfig::default()),
            confirmations: AtomicU64::new(0),
            campaign_locks: DashMap::new(),
            events: noop_sink(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_config(mut self, config: &SettlementConfig) -> Self {
        self.dedup_window = window(config);
        self
    }

    /// Applies one confirmation. An event id that was recorded or charged
    /// returns `Duplicate` and changes nothing. An event id whose charge
    /// failed is charged again, and the engagement is not re-counted.
    pub fn confirm(&self, event: &ConfirmationEvent) -> PlacementResult<SettlementOutcome> {
        let amount = to_ledger_amount(event.reserved_cost)?;
        let now = Utc::now();
        if self.confirmations.fetch_add(1, Ordering::Relaxed) % EVICTION_INTERVAL == EVICTION_INTERVAL - 1 {
            self.evict_expired(now);
        }

        let first = match self.admit(event.event_id, now) {
            Admission::Duplicate => {
                debug!(event_id = %event.event_id, "Duplicate confirmation ignored");
                metrics::counter!("settlement.confirmed", "outcome" => "duplicate").increment(1);
                return Ok(SettlementOutcome::Duplicate);
            }
            Admission::First => true,
            Admission::Retry => {
                debug!(event_id = %event.event_id, "Retrying charge for unbilled confirmation");
                false
            }
        };

        if !event.is_chargeable() || amount.is_zero() {
            self.performance.record(event, Decimal::ZERO);
            self.finish(event.event_id, ReceiptState::Settled);
            metrics::counter!("settlement.confirmed", "outcome" => "recorded").increment(1);
            self.publish_confirmed(event, Decimal::ZERO);
            return Ok(SettlementOutcome::Recorded);
        }

        match self.charge(event, amount) {
            Ok(balance_after) => {
                if first {
                    self.performance.record(event, amount);
                } else {
                    self.performance.record_late_charge(event, amount);
                }
                self.finish(event.event_id, ReceiptState::Settled);
                metrics::counter!("settlement.confirmed", "outcome" => "charged").increment(1);
                debug!(
                    event_id = %event.event_id,
                    ad_id = %event.ad_id,
                    amount = %amount,
                    "Engagement charged"
                );
                self.publish_confirmed(event, amount);
                Ok(SettlementOutcome::Charged {
                    amount,
                    balance_after,
                })
            }
            Err(e) => {
                // The engagement still happened even though it could not be billed.
                if first {
                    self.performance.record(event, Decimal::ZERO);
                }
                self.finish(event.event_id, ReceiptState::Unbilled);
                metrics::counter!("settlement.confirmed", "outcome" => "rejected").increment(1);
                warn!(
                    event_id = %event.event_id,
                    campaign_id = %event.campaign_id,
                    error = %e,
                    "Charge rejected"
                );
                self.events.emit(make_event(
                    PlacementEventType::ChargeRejected,
                    event.campaign_id.to_string(),
                    json!({
                        "event_id": event.event_id,
                        "ad_id": event.ad_id,
                        "amount": amount.to_string(),
                        "error": e.to_string(),
                    }),
                ));
                Err(e)
            }
        }
    }

    /// Drops receipts first seen before `now - dedup_window`, except ones
    /// still being charged. Returns how many were dropped.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.dedup_window;
        let mut evicted = 0;
        self.receipts.retain(|_, r| {
            let keep = r.state == ReceiptState::InFlight || r.first_seen >= cutoff;
            if !keep {
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            debug!(evicted, "Expired settlement receipts dropped");
        }
        evicted
    }

    fn admit(&self, event_id: Uuid, now: DateTime<Utc>) -> Admission {
        match self.receipts.entry(event_id) {
            Entry::Occupied(mut entry) => {
                let receipt = entry.get_mut();
                if receipt.state == ReceiptState::Unbilled {
                    receipt.state = ReceiptState::InFlight;
                    Admission::Retry
                } else {
                    Admission::Duplicate
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Receipt {
                    state: ReceiptState::InFlight,
                    first_seen: now,
                });
                Admission::First
            }
        }
    }

    fn finish(&self, event_id: Uuid, state: ReceiptState) {
        if let Some(mut receipt) = self.receipts.get_mut(&event_id) {
            receipt.state = state;
        }
    }

    fn charge(&self, event: &ConfirmationEvent, amount: Decimal) -> PlacementResult<Decimal> {
        let lock = self
            .campaign_locks
            .entry(event.campaign_id)
            .or_default()
            .clone();
        let _guard = lock.lock();

        let wallet = self.wallets.wallet_for_seller(&event.seller_id)?;
        let tracked = self.budgets.budget(&event.campaign_id)?.is_some();
        if tracked && !self.budgets.has_headroom(&event.campaign_id, amount, event.occurred_at)? {
            return Err(PlacementError::BudgetExceeded {
                campaign_id: event.campaign_id,
                detail: format!("no headroom for {amount}"),
            });
        }

        let reference = Some(event.event_id.to_string());
        let balance_after = self.wallets.spend(&wallet.id, amount, reference.clone())?;

        if tracked {
            if let Err(e) = self
                .budgets
                .record_spend(event.campaign_id, amount, event.occurred_at)
            {
                if let Err(refund_err) = self.wallets.refund(&wallet.id, amount, reference) {
                    error!(
                        wallet_id = %wallet.id,
                        event_id = %event.event_id,
                        error = %refund_err,
                        "Compensating refund failed"
                    );
                }
                return Err(e);
            }
        }
        Ok(balance_after)
    }

    fn publish_confirmed(&self, event: &ConfirmationEvent, charged: Decimal) {
        self.events.emit(make_event(
            PlacementEventType::EngagementConfirmed,
            event.request_id.as_str(),
            json!({
                "event_id": event.event_id,
                "ad_id": event.ad_id,
                "kind": event.kind,
                "charged": charged.to_string(),
            }),
        ));
    }
}

fn window(config: &SettlementConfig) -> Duration {
    Duration::seconds(config.dedup_window_secs.min(MAX_DEDUP_WINDOW_SECS) as i64)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementSummary {
    pub charged: u64,
    pub recorded: u64,
    pub duplicates: u64,
    pub failed: u64,
}

/// Sending half of the settlement worker's queue.
#[derive(Clone)]
pub struct SettlementQueue {
    sender: mpsc::Sender<ConfirmationEvent>,
}

impl SettlementQueue {
    /// Non-blocking enqueue. Returns false if the queue is full or closed.
    pub fn submit(&self, event: ConfirmationEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                metrics::counter!("settlement.dropped").increment(1);
                warn!("Confirmation event dropped: {}", e);
                false
            }
        }
    }

    /// Waits for queue space instead of dropping.
    pub async fn send(&self, event: ConfirmationEvent) -> PlacementResult<()> {
        self.sender
            .send(event)
            .await
            .map_err(|e| PlacementError::Internal(anyhow::anyhow!("settlement queue closed: {e}")))
    }
}

/// Spawns a task that settles queued confirmations in arrival order. The task
/// ends once every `SettlementQueue` clone is dropped and returns its tally.
pub fn spawn_settlement_worker(
    engine: Arc<SettlementEngine>,
    capacity: usize,
) -> (SettlementQueue, JoinHandle<SettlementSummary>) {
    let (sender, mut receiver) = mpsc::channel::<ConfirmationEvent>(capacity.max(1));

    let handle = tokio::spawn(async move {
        let mut summary = SettlementSummary::default();
        while let Some(event) = receiver.recv().await {
            match engine.confirm(&event) {
                Ok(SettlementOutcome::Charged { .. }) => summary.charged += 1,
                Ok(SettlementOutcome::Recorded) => summary.recorded += 1,
                Ok(SettlementOutcome::Duplicate) => summary.duplicates += 1,
                Err(_) => summary.failed += 1,
            }
        }
        info!(
            charged = summary.charged,
            recorded = summary.recorded,
            duplicates = summary.duplicates,
            failed = summary.failed,
            "Settlement worker drained"
        );
        summary
    });

    (SettlementQueue { sender }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use placement_core::config::{BudgetConfig, SettlementConfig, WalletConfig};
    use placement_core::event_bus::capture_sink;
    use placement_core::types::{ChargeModel, EngagementKind};
    use rust_decimal_macros::dec;

    #[derive(Default)]
    struct Tally {
        events: Mutex<Vec<(EngagementKind, Decimal)>>,
        late: Mutex<Vec<Decimal>>,
    }

    impl PerformanceRecorder for Tally {
        fn record(&self, event: &ConfirmationEvent, charged: Decimal) {
            self.events.lock().push((event.kind, charged));
        }

        fn record_late_charge(&self, _event: &ConfirmationEvent, charged: Decimal) {
            self.late.lock().push(charged);
        }
    }

    struct Fixture {
        engine: SettlementEngine,
        wallets: Arc<WalletLedger>,
        budgets: Arc<BudgetTracker>,
        tally: Arc<Tally>,
        wallet_id: Uuid,
        seller_id: Uuid,
        campaign_id: Uuid,
    }

    fn fixture(deposit: Decimal, budget: Option<(Decimal, Decimal)>) -> Fixture {
        let wallets = Arc::new(WalletLedger::in_memory(&WalletConfig::default()));
        let budgets = Arc::new(BudgetTracker::in_memory(&BudgetConfig::default()));
        let tally = Arc::new(Tally::default());
        let seller_id = Uuid::new_v4();
        let campaign_id = Uuid::new_v4();
        let wallet = wallets.open_wallet(seller_id).unwrap();
        wallets.deposit(&wallet.id, deposit, None).unwrap();
        if let Some((total, daily)) = budget {
            budgets.set_budget(campaign_id, total, daily).unwrap();
        }
        let engine = SettlementEngine::new(wallets.clone(), budgets.clone(), tally.clone());
        Fixture {
            engine,
            wallets,
            budgets,
            tally,
            wallet_id: wallet.id,
            seller_id,
            campaign_id,
        }
    }

    fn event(f: &Fixture, kind: EngagementKind, cost: f64) -> ConfirmationEvent {
        ConfirmationEvent {
            event_id: Uuid::new_v4(),
            request_id: "req-1".into(),
            ad_id: "ad-1".into(),
            campaign_id: f.campaign_id,
            seller_id: f.seller_id,
            kind,
            charge_model: ChargeModel::PerClick,
            reserved_cost: cost,
            revenue: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn test_ledger_amount_rounds_toward_zero() {
        assert_eq!(to_ledger_amount(1.239).unwrap(), dec!(1.23));
        assert_eq!(to_ledger_amount(0.004).unwrap(), dec!(0));
        assert_eq!(to_ledger_amount(2.9999999999999996).unwrap(), dec!(3));
        assert!(to_ledger_amount(f64::NAN).is_err());
        assert!(to_ledger_amount(-1.0).is_err());
    }

    #[test]
    fn test_click_charges_wallet_and_budget() {
        let f = fixture(dec!(100), Some((dec!(1000), dec!(100))));
        let outcome = f.engine.confirm(&event(&f, EngagementKind::Click, 2.499)).unwrap();
        assert_eq!(
            outcome,
            SettlementOutcome::Charged {
                amount: dec!(2.49),
                balance_after: dec!(97.51)
            }
        );
        assert_eq!(f.wallets.balance(&f.wallet_id).unwrap(), dec!(97.51));
        let budget = f.budgets.budget(&f.campaign_id).unwrap().unwrap();
        assert_eq!(budget.spent_amount, dec!(2.49));
        assert_eq!(
            *f.tally.events.lock(),
            vec![(EngagementKind::Click, dec!(2.49))]
        );
    }

    #[test]
    fn test_impression_under_per_click_only_counted() {
        let f = fixture(dec!(100), None);
        let outcome = f.engine.confirm(&event(&f, EngagementKind::Impression, 2.0)).unwrap();
        assert_eq!(outcome, SettlementOutcome::Recorded);
        assert_eq!(f.wallets.balance(&f.wallet_id).unwrap(), dec!(100));
        assert_eq!(f.tally.events.lock().len(), 1);
    }

    #[test]
    fn test_duplicate_event_not_charged_twice() {
        let f = fixture(dec!(100), None);
        let e = event(&f, EngagementKind::Click, 5.0);
        f.engine.confirm(&e).unwrap();
        assert_eq!(f.engine.confirm(&e).unwrap(), SettlementOutcome::Duplicate);
        assert_eq!(f.wallets.balance(&f.wallet_id).unwrap(), dec!(95));
        assert_eq!(f.wallets.transactions(&f.wallet_id).unwrap().len(), 2);
        assert_eq!(f.tally.events.lock().len(), 1);
    }

    #[test]
    fn test_insufficient_funds_rejected() {
        let sink = capture_sink();
        let mut f = fixture(dec!(1), None);
        f.engine = SettlementEngine::new(f.wallets.clone(), f.budgets.clone(), f.tally.clone())
            .with_events(sink.clone());
        let err = f.engine.confirm(&event(&f, EngagementKind::Click, 3.0)).unwrap_err();
        assert!(matches!(err, PlacementError::InsufficientFunds { .. }));
        assert_eq!(f.wallets.balance(&f.wallet_id).unwrap(), dec!(1));
        assert_eq!(*f.tally.events.lock(), vec![(EngagementKind::Click, dec!(0))]);
        assert_eq!(sink.count_type(PlacementEventType::ChargeRejected), 1);
    }

    #[test]
    fn test_unbilled_event_charged_on_replay_after_top_up() {
        let f = fixture(dec!(1), None);
        let click = event(&f, EngagementKind::Click, 3.0);
        assert!(matches!(
            f.engine.confirm(&click),
            Err(PlacementError::InsufficientFunds { .. })
        ));

        f.wallets.deposit(&f.wallet_id, dec!(10), None).unwrap();
        assert_eq!(
            f.engine.confirm(&click).unwrap(),
            SettlementOutcome::Charged {
                amount: dec!(3),
                balance_after: dec!(8)
            }
        );
        // Once charged, further replays are plain duplicates.
        assert_eq!(f.engine.confirm(&click).unwrap(), SettlementOutcome::Duplicate);

        assert_eq!(f.wallets.balance(&f.wallet_id).unwrap(), dec!(8));
        assert_eq!(*f.tally.events.lock(), vec![(EngagementKind::Click, dec!(0))]);
        assert_eq!(*f.tally.late.lock(), vec![dec!(3)]);
        assert!(f.wallets.verify(&f.wallet_id).unwrap());
    }

    #[test]
    fn test_unbilled_event_stays_retryable_while_failing() {
        let f = fixture(dec!(100), Some((dec!(2), dec!(2))));
        let click = event(&f, EngagementKind::Click, 3.0);
        for _ in 0..3 {
            assert!(matches!(
                f.engine.confirm(&click),
                Err(PlacementError::BudgetExceeded { .. })
            ));
        }
        assert_eq!(f.tally.events.lock().len(), 1);

        f.budgets.set_budget(f.campaign_id, dec!(10), dec!(10)).unwrap();
        assert!(matches!(
            f.engine.confirm(&click).unwrap(),
            SettlementOutcome::Charged { .. }
        ));
        assert_eq!(
            f.budgets.budget(&f.campaign_id).unwrap().unwrap().spent_amount,
            dec!(3)
        );
        assert_eq!(f.wallets.balance(&f.wallet_id).unwrap(), dec!(97));
    }

    #[test]
    fn test_receipts_expire_after_window() {
        let f = fixture(dec!(100), None);
        let engine = SettlementEngine::new(f.wallets.clone(), f.budgets.clone(), f.tally.clone())
            .with_config(&SettlementConfig {
                dedup_window_secs: 60,
            });
        let impression = event(&f, EngagementKind::Impression, 1.0);
        engine.confirm(&impression).unwrap();

        assert_eq!(engine.evict_expired(Utc::now()), 0);
        assert_eq!(engine.confirm(&impression).unwrap(), SettlementOutcome::Duplicate);
        assert_eq!(engine.evict_expired(Utc::now() + Duration::seconds(120)), 1);
        assert_eq!(engine.confirm(&impression).unwrap(), SettlementOutcome::Recorded);
    }

    #[test]
    fn test_budget_without_headroom_leaves_wallet_untouched() {
        let f = fixture(dec!(100), Some((dec!(10), dec!(10))));
        f.engine.confirm(&event(&f, EngagementKind::Click, 8.0)).unwrap();
        let err = f.engine.confirm(&event(&f, EngagementKind::Click, 3.0)).unwrap_err();
        assert!(matches!(err, PlacementError::BudgetExceeded { .. }));
        assert_eq!(f.wallets.balance(&f.wallet_id).unwrap(), dec!(92));
        assert_eq!(f.wallets.transactions(&f.wallet_id).unwrap().len(), 2);
    }

    #[test]
    fn test_missing_wallet_rejected() {
        let f = fixture(dec!(100), None);
        let mut e = event(&f, EngagementKind::Click, 1.0);
        e.seller_id = Uuid::new_v4();
        assert!(matches!(
            f.engine.confirm(&e),
            Err(PlacementError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_worker_drains_queue() {
        let f = fixture(dec!(100), Some((dec!(1000), dec!(1000))));
        let click = event(&f, EngagementKind::Click, 4.0);
        let impression = event(&f, EngagementKind::Impression, 4.0);
        let engine = Arc::new(f.engine);

        let (queue, handle) = spawn_settlement_worker(engine, 16);
        queue.send(click.clone()).await.unwrap();
        queue.send(click).await.unwrap();
        assert!(queue.submit(impression));
        drop(queue);

        let summary = handle.await.unwrap();
        assert_eq!(
            summary,
            SettlementSummary {
                charged: 1,
                recorded: 1,
                duplicates: 1,
                failed: 0
            }
        );
        assert_eq!(f.wallets.balance(&f.wallet_id).unwrap(), dec!(96));
    }
}
