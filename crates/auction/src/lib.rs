//! Per-request ad auction: eligibility, quality and bid scoring, the
//! single-position GSP auction, and the page-level slot allocator.

pub mod allocator;
pub mod eligibility;
pub mod engine;
pub mod quality;
pub mod scoring;

#[cfg(test)]
mod testutil;

pub use allocator::SlotAllocator;
pub use eligibility::EligibilityFilter;
pub use engine::{AuctionEngine, AuctionPhase, Candidate, PositionOutcome};
pub use quality::QualityScorer;
pub use scoring::{relevance_score, BidScorer, ScoredBid};
