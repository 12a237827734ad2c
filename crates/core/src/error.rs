use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::types::IneligibleReason;

pub type PlacementResult<T> = Result<T, PlacementError>;

#[derive(Error, Debug)]
pub enum PlacementError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Ad {ad_id} rejected: {reason}")]
    EligibilityRejected {
        ad_id: String,
        reason: IneligibleReason,
    },

    #[error("Insufficient funds in wallet {wallet_id}: requested {requested}, available {available}")]
    InsufficientFunds {
        wallet_id: Uuid,
        requested: Decimal,
        available: Decimal,
    },

    #[error("Concurrency conflict on {key} after {attempts} attempts")]
    ConcurrencyConflict { key: String, attempts: u32 },

    #[error("Scoring error for ad {ad_id}: {detail}")]
    InternalScoring { ad_id: String, detail: String },

    #[error("Budget exceeded for campaign {campaign_id}: {detail}")]
    BudgetExceeded { campaign_id: Uuid, detail: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl PlacementError {
    /// Errors that only exclude a single ad from an auction.
    pub fn is_per_ad(&self) -> bool {
        matches!(
            self,
            PlacementError::EligibilityRejected { .. } | PlacementError::InternalScoring { .. }
        )
    }
}
