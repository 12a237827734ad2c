//! Auction for a single (slot type, position).
//!
//! Each run moves through COLLECT → RANK → PRICE → ALLOCATE. Pricing is
//! generalized second price: a winner pays the smallest bid that still keeps
//! its rank over the next competitor, never less than the slot floor and
//! never more than its own bid or max bid.

use placement_core::config::AppConfig;
use placement_core::types::{
    Ad, AdRequestContext, BudgetSnapshot, Exclusion, ExclusionReason, Slot, SlotKey, Winner,
};
use serde::Serialize;
use tracing::debug;

use crate::eligibility::EligibilityFilter;
use crate::scoring::BidScorer;

/// One ad entering an auction, with its request-level scores already computed.
#[derive(Debug, Clone)]
pub struct Candidate<'a> {
    pub ad: &'a Ad,
    /// Quality score, or why it could not be computed.
    pub quality: Result<f64, String>,
    pub relevance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuctionPhase {
    Collect,
    Rank,
    Price,
    Allocate,
}

impl AuctionPhase {
    fn next(self) -> Option<Self> {
        match self {
            AuctionPhase::Collect => Some(AuctionPhase::Rank),
            AuctionPhase::Rank => Some(AuctionPhase::Price),
            AuctionPhase::Price => Some(AuctionPhase::Allocate),
            AuctionPhase::Allocate => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PositionOutcome {
    pub slot: SlotKey,
    pub winners: Vec<Winner>,
    pub exclusions: Vec<Exclusion>,
    /// Ads that passed COLLECT.
    pub competitors: usize,
    pub phase: AuctionPhase,
}

#[derive(Debug, Clone)]
struct Bidder<'a> {
    ad: &'a Ad,
    quality: f64,
    weighted_quality: f64,
    final_score: f64,
    cost: f64,
}

#[derive(Debug, Clone)]
pub struct AuctionEngine {
    filter: EligibilityFilter,
    scorer: BidScorer,
}

impl AuctionEngine {
    pub fn new(filter: EligibilityFilter, scorer: BidScorer) -> Self {
        Self { filter, scorer }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            EligibilityFilter::new(config.budget.safety_margin_decimal()),
            BidScorer::new(&config.auction),
        )
    }

    pub fn scorer(&self) -> &BidScorer {
        &self.scorer
    }

    pub fn run(
        &self,
        slot: &Slot,
        candidates: &[Candidate<'_>],
        ctx: &AdRequestContext,
        budget: &BudgetSnapshot,
    ) -> PositionOutcome {
        let mut auction = PositionAuction::new(slot);
        auction.collect(self, candidates, ctx, budget);
        auction.rank();
        auction.price();
        auction.allocate()
    }
}

struct PositionAuction<'a> {
    slot: &'a Slot,
    phase: AuctionPhase,
    bidders: Vec<Bidder<'a>>,
    exclusions: Vec<Exclusion>,
}

impl<'a> PositionAuction<'a> {
    fn new(slot: &'a Slot) -> Self {
        Self {
            slot,
            phase: AuctionPhase::Collect,
            bidders: Vec::new(),
            exclusions: Vec::new(),
        }
    }

    fn advance(&mut self) {
        if let Some(next) = self.phase.next() {
            self.phase = next;
        }
    }

    fn exclude(&mut self, ad: &Ad, reason: ExclusionReason) {
        self.exclusions.push(Exclusion {
            ad_id: ad.id.clone(),
            slot: self.slot.key(),
            reason,
        });
    }

    fn collect(
        &mut self,
        engine: &AuctionEngine,
        candidates: &[Candidate<'a>],
        ctx: &AdRequestContext,
        budget: &BudgetSnapshot,
    ) {
        debug_assert_eq!(self.phase, AuctionPhase::Collect);
        for candidate in candidates {
            let ad = candidate.ad;
            if let Err(reason) = engine.filter.check(ad, self.slot, ctx, budget) {
                self.exclude(ad, ExclusionReason::Ineligible(reason));
                continue;
            }
            let quality = match &candidate.quality {
                Ok(q) => *q,
                Err(detail) => {
                    self.exclude(ad, ExclusionReason::InternalScoringError(detail.clone()));
                    continue;
                }
            };
            match engine.scorer.score(ad, quality, candidate.relevance) {
                Ok(scored) => self.bidders.push(Bidder {
                    ad,
                    quality,
                    weighted_quality: scored.weighted_quality,
                    final_score: scored.final_score,
                    cost: 0.0,
                }),
                Err(e) => self.exclude(ad, ExclusionReason::InternalScoringError(e.to_string())),
            }
        }
        self.advance();
    }

    /// Score descending, then quality descending, then ad id ascending.
    fn rank(&mut self) {
        debug_assert_eq!(self.phase, AuctionPhase::Rank);
        self.bidders.sort_by(|a, b| {
            b.final_score
                .total_cmp(&a.final_score)
                .then_with(|| b.quality.total_cmp(&a.quality))
                .then_with(|| a.ad.id.cmp(&b.ad.id))
        });
        self.advance();
    }

    fn price(&mut self) {
        debug_assert_eq!(self.phase, AuctionPhase::Price);
        let floor = self.slot.price_floor();
        let winners = self.winner_count();
        for i in 0..winners {
            let next_score = self.bidders.get(i + 1).map(|b| b.final_score);
            let bidder = &self.bidders[i];
            let to_hold_rank = match next_score {
                Some(score) if bidder.weighted_quality > 0.0 => score / bidder.weighted_quality,
                _ => floor,
            };
            let cap = bidder.ad.bid_amount.min(bidder.ad.max_bid_amount);
            let cost = to_hold_rank.max(floor).min(cap);
            self.bidders[i].cost = cost;
        }
        self.advance();
    }

    fn allocate(mut self) -> PositionOutcome {
        debug_assert_eq!(self.phase, AuctionPhase::Allocate);
        let competitors = self.bidders.len();
        let winners_n = self.winner_count();
        let winners: Vec<Winner> = self
            .bidders
            .drain(..winners_n)
            .enumerate()
            .map(|(i, b)| Winner {
                ad_id: b.ad.id.clone(),
                campaign_id: b.ad.campaign_id,
                seller_id: b.ad.seller_id,
                charge_model: b.ad.charge_model,
                final_score: b.final_score,
                quality_score: b.quality,
                cost: b.cost,
                rank: i as u32 + 1,
            })
            .collect();

        debug!(
            slot = %self.slot.key(),
            competitors,
            winners = winners.len(),
            excluded = self.exclusions.len(),
            "Auction allocated"
        );

        PositionOutcome {
            slot: self.slot.key(),
            winners,
            exclusions: self.exclusions,
            competitors,
            phase: self.phase,
        }
    }

    fn winner_count(&self) -> usize {
        (self.slot.capacity as usize).min(self.bidders.len())
    }
}
