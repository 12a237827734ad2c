//! Money side of the placement engine: seller wallets, campaign budgets, and
//! settlement of confirmed engagements.
//!
//! Wallets and budgets persist through injected stores with optimistic
//! versioning. DashMap-backed stores are provided for development and tests.

pub mod budget;
pub mod settlement;
pub mod wallet;

pub use budget::{BudgetAlert, BudgetAlertType, BudgetStore, BudgetTracker, InMemoryBudgetStore};
pub use settlement::{
    spawn_settlement_worker, SettlementEngine, SettlementOutcome, SettlementQueue,
    SettlementSummary,
};
pub use wallet::{InMemoryWalletStore, TransactionKind, WalletLedger, WalletStore, WalletTransaction};
