//! Page-level allocation: runs one auction per slot, best position first,
//! removing each winner from the pool before the next slot is decided.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use placement_core::config::AppConfig;
use placement_core::event_bus::{make_event, noop_sink, EventSink, PlacementEventType};
use placement_core::types::{
    Ad, AdRequestContext, AllocationResult, BudgetSnapshot, Slot, SlotPlacement,
};
use placement_core::PerformanceHistory;
use serde_json::json;
use tracing::{debug, warn};

use crate::engine::{AuctionEngine, Candidate};
use crate::quality::QualityScorer;
use crate::scoring::relevance_score;

pub struct SlotAllocator {
    engine: AuctionEngine,
    quality: QualityScorer,
    events: Arc<dyn EventSink>,
}

impl SlotAllocator {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            engine: AuctionEngine::from_config(config),
            quality: QualityScorer::new(&config.quality),
            events: noop_sink(),
        }
    }

    pub fn with_parts(engine: AuctionEngine, quality: QualityScorer) -> Self {
        Self {
            engine,
            quality,
            events: noop_sink(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Allocate every slot of one page render. Pure with respect to its
    /// inputs; safe to call concurrently for independent requests.
    pub fn allocate(
        &self,
        ctx: &AdRequestContext,
        slots: &[Slot],
        ads: &[Ad],
        budget: &BudgetSnapshot,
        history: &dyn PerformanceHistory,
    ) -> AllocationResult {
        let start = Instant::now();
        metrics::counter!("allocation.requests").increment(1);

        let working_set = self.working_set(ads, ctx, history);

        let mut seen_slots = HashSet::new();
        let mut ordered: Vec<&Slot> = Vec::with_capacity(slots.len());
        for slot in slots {
            if seen_slots.insert(slot.key()) {
                ordered.push(slot);
            } else {
                warn!(slot = %slot.key(), "Duplicate slot in page layout ignored");
            }
        }
        // Stable: equal keys cannot occur after dedup, input order is kept otherwise.
        ordered.sort_by_key(|s| (s.position, s.slot_type));

        let mut allocated: HashSet<String> = HashSet::new();
        let mut placements = Vec::with_capacity(ordered.len());
        let mut exclusions = Vec::new();

        for slot in ordered {
            let pool: Vec<Candidate<'_>> = working_set
                .iter()
                .filter(|c| !allocated.contains(&c.ad.id))
                .cloned()
                .collect();

            let outcome = self.engine.run(slot, &pool, ctx, budget);
            metrics::counter!("auction.runs").increment(1);
            metrics::counter!("auction.exclusions").increment(outcome.exclusions.len() as u64);

            allocated.extend(outcome.winners.iter().map(|w| w.ad_id.clone()));
            exclusions.extend(outcome.exclusions);
            placements.push(SlotPlacement {
                slot: outcome.slot,
                winners: outcome.winners,
            });
        }

        let latency_us = start.elapsed().as_micros() as u64;
        metrics::histogram!("allocation.latency_us").record(latency_us as f64);

        let result = AllocationResult {
            request_id: ctx.request_id.clone(),
            placements,
            exclusions,
            latency_us,
        };
        debug!(
            request_id = %result.request_id,
            slots = result.placements.len(),
            winners = result.winner_count(),
            excluded = result.exclusions.len(),
            latency_us,
            "Allocation complete"
        );
        self.publish(&result);
        result
    }

    fn publish(&self, result: &AllocationResult) {
        for exclusion in &result.exclusions {
            self.events.emit(make_event(
                PlacementEventType::AdExcluded,
                result.request_id.as_str(),
                json!({
                    "ad_id": exclusion.ad_id,
                    "slot": exclusion.slot.to_string(),
                    "reason": exclusion.reason,
                }),
            ));
        }
        self.events.emit(make_event(
            PlacementEventType::AllocationCompleted,
            result.request_id.as_str(),
            json!({
                "winners": result.allocated_ad_ids(),
                "latency_us": result.latency_us,
            }),
        ));
    }

    /// Quality and relevance do not depend on the slot, so each ad is scored
    /// once per request. A repeated ad id keeps its first occurrence.
    fn working_set<'a>(
        &self,
        ads: &'a [Ad],
        ctx: &AdRequestContext,
        history: &dyn PerformanceHistory,
    ) -> Vec<Candidate<'a>> {
        let mut seen = HashSet::new();
        ads.iter()
            .filter(|ad| {
                let fresh = seen.insert(ad.id.as_str());
                if !fresh {
                    warn!(ad_id = %ad.id, "Duplicate ad id in candidate list ignored");
                }
                fresh
            })
            .map(|ad| Candidate {
                ad,
                quality: self
                    .quality
                    .score(ad, &history.ad_history(&ad.id))
                    .map_err(|e| e.to_string()),
                relevance: relevance_score(ad, ctx),
            })
            .collect()
    }
}
