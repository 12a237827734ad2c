//! Seller wallets: an append-only transaction log plus a cached balance.
//!
//! Every command validates, builds the next wallet state, and commits it with
//! a compare-and-swap on `version`. A lost race reloads and retries up to
//! `wallet.max_cas_retries` times. The stored balance never goes negative and
//! always equals the fold of the wallet's transactions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use placement_core::config::WalletConfig;
use placement_core::event_bus::{make_event, noop_sink, EventSink, PlacementEventType};
use placement_core::{PlacementError, PlacementResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub balance: Decimal,
    pub currency: String,
    /// Bumped on every committed transaction.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Spend,
    Withdrawal,
    Refund,
}

impl TransactionKind {
    fn is_credit(&self) -> bool {
        matches!(self, TransactionKind::Deposit | TransactionKind::Refund)
    }

    /// Signed effect of `amount` on the balance.
    pub fn apply(&self, amount: Decimal) -> Decimal {
        if self.is_credit() {
            amount
        } else {
            -amount
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub kind: TransactionKind,
    pub amount: Decimal,
    pub balance_after: Decimal,
    /// Free-form link to whatever caused the movement, e.g. a confirmation
    /// event id.
    pub reference: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Persistence seam for wallets. `commit` must apply the new wallet state and
/// append the transaction atomically, and only if the stored version still
/// equals `expected_version`.
pub trait WalletStore: Send + Sync {
    /// Stores a new wallet unless the seller already has one; returns
    /// whichever wallet the seller ends up with.
    fn insert(&self, wallet: Wallet) -> PlacementResult<Wallet>;
    fn load(&self, wallet_id: &Uuid) -> PlacementResult<Option<Wallet>>;
    fn find_by_seller(&self, seller_id: &Uuid) -> PlacementResult<Option<Wallet>>;
    /// Returns `Ok(false)` when the version check fails.
    fn commit(
        &self,
        expected_version: u64,
        wallet: Wallet,
        txn: WalletTransaction,
    ) -> PlacementResult<bool>;
    fn transactions(&self, wallet_id: &Uuid) -> PlacementResult<Vec<WalletTransaction>>;
}

/// In-memory store. The wallet entry's shard lock covers the version check,
/// the state write, and the log append.
#[derive(Default)]
pub struct InMemoryWalletStore {
    wallets: DashMap<Uuid, Wallet>,
    by_seller: DashMap<Uuid, Uuid>,
    log: DashMap<Uuid, Vec<WalletTransaction>>,
}

impl InMemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WalletStore for InMemoryWalletStore {
    fn insert(&self, wallet: Wallet) -> PlacementResult<Wallet> {
        match self.by_seller.entry(wallet.seller_id) {
            Entry::Occupied(existing) => {
                let wallet_id = *existing.get();
                drop(existing);
                self.load(&wallet_id)?
                    .ok_or_else(|| PlacementError::NotFound(format!("wallet {wallet_id}")))
            }
            Entry::Vacant(slot) => {
                self.log.entry(wallet.id).or_default();
                self.wallets.insert(wallet.id, wallet.clone());
                slot.insert(wallet.id);
                Ok(wallet)
            }
        }
    }

    fn load(&self, wallet_id: &Uuid) -> PlacementResult<Option<Wallet>> {
        Ok(self.wallets.get(wallet_id).map(|w| w.clone()))
    }

    fn find_by_seller(&self, seller_id: &Uuid) -> PlacementResult<Option<Wallet>> {
        let Some(wallet_id) = self.by_seller.get(seller_id).map(|id| *id) else {
            return Ok(None);
        };
        self.load(&wallet_id)
    }

    fn commit(
        &self,
        expected_version: u64,
        wallet: Wallet,
        txn: WalletTransaction,
    ) -> PlacementResult<bool> {
        let Some(mut current) = self.wallets.get_mut(&wallet.id) else {
            return Err(PlacementError::NotFound(format!("wallet {}", wallet.id)));
        };
        if current.version != expected_version {
            return Ok(false);
        }
        // Appended while the wallet entry is still held.
        self.log.entry(wallet.id).or_default().push(txn);
        *current = wallet;
        Ok(true)
    }

    fn transactions(&self, wallet_id: &Uuid) -> PlacementResult<Vec<WalletTransaction>> {
        Ok(self
            .log
            .get(wallet_id)
            .map(|l| l.clone())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct WalletLedger {
    store: Arc<dyn WalletStore>,
    max_cas_retries: u32,
    default_currency: String,
    events: Arc<dyn EventSink>,
}

impl WalletLedger {
    pub fn new(store: Arc<dyn WalletStore>, config: &WalletConfig) -> Self {
        info!(max_cas_retries = config.max_cas_retries, "WalletLedger initialized");
        Self {
            store,
            max_cas_retries: config.max_cas_retries,
            default_currency: config.default_currency.clone(),
            events: noop_sink(),
        }
    }

    pub fn in_memory(config: &WalletConfig) -> Self {
        Self::new(Arc::new(InMemoryWalletStore::new()), config)
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Returns the seller's wallet, creating an empty one on first use.
    pub fn open_wallet(&self, seller_id: Uuid) -> PlacementResult<Wallet> {
        if let Some(existing) = self.store.find_by_seller(&seller_id)? {
            return Ok(existing);
        }
        let now = Utc::now();
        let wallet = Wallet {
            id: Uuid::new_v4(),
            seller_id,
            balance: Decimal::ZERO,
            currency: self.default_currency.clone(),
            version: 0,
            created_at: now,
            updated_at: now,
        };
        let wallet = self.store.insert(wallet)?;
        info!(wallet_id = %wallet.id, seller_id = %seller_id, "Wallet opened");
        Ok(wallet)
    }

    pub fn wallet_for_seller(&self, seller_id: &Uuid) -> PlacementResult<Wallet> {
        self.store
            .find_by_seller(seller_id)?
            .ok_or_else(|| PlacementError::NotFound(format!("wallet for seller {seller_id}")))
    }

    pub fn balance(&self, wallet_id: &Uuid) -> PlacementResult<Decimal> {
        Ok(self.load(wallet_id)?.balance)
    }

    /// Transaction history, oldest first.
    pub fn transactions(&self, wallet_id: &Uuid) -> PlacementResult<Vec<WalletTransaction>> {
        self.load(wallet_id)?;
        self.store.transactions(wallet_id)
    }

    pub fn deposit(
        &self,
        wallet_id: &Uuid,
        amount: Decimal,
        reference: Option<String>,
    ) -> PlacementResult<Decimal> {
        self.apply(wallet_id, TransactionKind::Deposit, amount, reference)
    }

    pub fn spend(
        &self,
        wallet_id: &Uuid,
        amount: Decimal,
        reference: Option<String>,
    ) -> PlacementResult<Decimal> {
        self.apply(wallet_id, TransactionKind::Spend, amount, reference)
    }

    pub fn withdraw(
        &self,
        wallet_id: &Uuid,
        amount: Decimal,
        reference: Option<String>,
    ) -> PlacementResult<Decimal> {
        self.apply(wallet_id, TransactionKind::Withdrawal, amount, reference)
    }

    pub fn refund(
        &self,
        wallet_id: &Uuid,
        amount: Decimal,
        reference: Option<String>,
    ) -> PlacementResult<Decimal> {
        self.apply(wallet_id, TransactionKind::Refund, amount, reference)
    }

    /// Re-folds the transaction log and checks it against the stored balance.
    pub fn verify(&self, wallet_id: &Uuid) -> PlacementResult<bool> {
        let wallet = self.load(wallet_id)?;
        let txns = self.store.transactions(wallet_id)?;
        let mut running = Decimal::ZERO;
        for txn in &txns {
            running = match running.checked_add(txn.kind.apply(txn.amount)) {
                Some(next) => next,
                None => Decimal::MIN,
            };
            if running < Decimal::ZERO || running != txn.balance_after {
                warn!(wallet_id = %wallet_id, txn_id = %txn.id, "Wallet log inconsistent");
                return Ok(false);
            }
        }
        Ok(running == wallet.balance && txns.len() as u64 == wallet.version)
    }

    fn load(&self, wallet_id: &Uuid) -> PlacementResult<Wallet> {
        self.store
            .load(wallet_id)?
            .ok_or_else(|| PlacementError::NotFound(format!("wallet {wallet_id}")))
    }

    fn apply(
        &self,
        wallet_id: &Uuid,
        kind: TransactionKind,
        amount: Decimal,
        reference: Option<String>,
    ) -> PlacementResult<Decimal> {
        if amount <= Decimal::ZERO {
            return Err(PlacementError::Validation(format!(
                "{kind:?} amount must be positive, got {amount}"
            )));
        }

        let attempts = self.max_cas_retries.max(1);
        for attempt in 1..=attempts {
            let current = self.load(wallet_id)?;
            let balance_after = current.balance.checked_add(kind.apply(amount)).ok_or_else(|| {
                PlacementError::Validation(format!("{kind:?} of {amount} overflows wallet balance"))
            })?;
            if balance_after < Decimal::ZERO {
                return Err(PlacementError::InsufficientFunds {
                    wallet_id: *wallet_id,
                    requested: amount,
                    available: current.balance,
                });
            }

            let now = Utc::now();
            let txn = WalletTransaction {
                id: Uuid::new_v4(),
                wallet_id: *wallet_id,
                kind,
                amount,
                balance_after,
                reference: reference.clone(),
                created_at: now,
            };
            let next = Wallet {
                balance: balance_after,
                version: current.version + 1,
                updated_at: now,
                ..current.clone()
            };

            if self.store.commit(current.version, next, txn.clone())? {
                metrics::counter!("wallet.transactions").increment(1);
                debug!(
                    wallet_id = %wallet_id,
                    kind = ?kind,
                    amount = %amount,
                    balance = %balance_after,
                    "Wallet transaction committed"
                );
                self.events.emit(make_event(
                    PlacementEventType::WalletTransaction,
                    wallet_id.to_string(),
                    json!({
                        "txn_id": txn.id,
                        "kind": kind,
                        "amount": amount.to_string(),
                        "balance_after": balance_after.to_string(),
                        "reference": txn.reference,
                    }),
                ));
                return Ok(balance_after);
            }

            metrics::counter!("wallet.cas_conflicts").increment(1);
            debug!(wallet_id = %wallet_id, attempt, "Wallet version conflict, retrying");
        }

        warn!(wallet_id = %wallet_id, attempts, "Wallet update gave up after repeated conflicts");
        Err(PlacementError::ConcurrencyConflict {
            key: format!("wallet:{wallet_id}"),
            attempts,
        })
    }
}
