use chrono::{Duration, Utc};
use placement_auction::{BidScorer, QualityScorer, SlotAllocator};
use placement_core::config::{AppConfig, AuctionConfig, QualityConfig};
use placement_core::performance::NoHistory;
use placement_core::types::{
    Ad, AdRequestContext, AdStatus, BudgetSnapshot, ChargeModel, Creative, Location, Schedule,
    Slot, SlotTargeting, SlotType, Targeting,
};
use placement_core::PerformanceMetrics;
use proptest::prelude::*;
use std::collections::HashSet;
use uuid::Uuid;

fn make_ad(id: usize, bid: f64, headroom: f64, title_len: usize) -> Ad {
    Ad {
        id: format!("ad-{id:03}"),
        campaign_id: Uuid::new_v4(),
        seller_id: Uuid::new_v4(),
        status: AdStatus::Active,
        approved: true,
        bid_amount: bid,
        max_bid_amount: bid + headroom,
        targeting: Targeting {
            categories: vec!["shoes".into()],
            keywords: vec!["running shoes".into()],
        },
        schedule: Schedule {
            start: Utc::now() - Duration::hours(1),
            end: None,
        },
        creative: Creative {
            title: "x".repeat(title_len),
            description: "Lightweight trainers for daily miles".into(),
            landing_url: "https://shop.example.com/p/1".into(),
        },
        charge_model: ChargeModel::PerClick,
    }
}

fn request() -> AdRequestContext {
    AdRequestContext {
        request_id: "prop".into(),
        query: Some("running shoes".into()),
        category: Some("shoes".into()),
        device: None,
        location: Location::default(),
        session_id: None,
        timestamp: Utc::now(),
    }
}

fn make_slot(slot_type: SlotType, position: u32, capacity: u32) -> Slot {
    Slot {
        slot_type,
        position,
        capacity,
        min_bid_amount: 0.05,
        reserve_price: 0.20,
        targeting: SlotTargeting::default(),
        rule: None,
    }
}

proptest! {
    #[test]
    fn score_strictly_increases_with_bid(
        low in 0.01f64..100.0,
        step in 0.01f64..100.0,
        quality in 0.0f64..=10.0,
        relevance in 0.0f64..=1.0,
    ) {
        let scorer = BidScorer::new(&AuctionConfig::default());
        let high = low + step;
        prop_assert!(scorer.final_score(high, quality, relevance) > scorer.final_score(low, quality, relevance));
    }

    #[test]
    fn score_non_decreasing_in_quality_and_relevance(
        bid in 0.01f64..100.0,
        q1 in 0.0f64..=10.0,
        dq in 0.0f64..=10.0,
        r1 in 0.0f64..=1.0,
        dr in 0.0f64..=1.0,
    ) {
        let scorer = BidScorer::new(&AuctionConfig::default());
        let q2 = (q1 + dq).min(10.0);
        let r2 = (r1 + dr).min(1.0);
        let ad = make_ad(0, bid, 1.0, 40);

        let base = scorer.score(&ad, q1, r1).unwrap().final_score;
        let better_quality = scorer.score(&ad, q2, r1).unwrap().final_score;
        let better_relevance = scorer.score(&ad, q1, r2).unwrap().final_score;
        let better_both = scorer.score(&ad, q2, r2).unwrap().final_score;
        prop_assert!(base >= 0.0);
        prop_assert!(better_quality >= base);
        prop_assert!(better_relevance >= base);
        prop_assert!(better_both >= better_quality);
        prop_assert!(better_both >= better_relevance);
    }

    #[test]
    fn quality_stays_in_range(
        impressions in 0u64..10_000_000,
        click_share in 0.0f64..=1.0,
        conversion_share in 0.0f64..=1.0,
        title_len in 0usize..120,
    ) {
        let clicks = (impressions as f64 * click_share) as u64;
        let conversions = (clicks as f64 * conversion_share) as u64;
        let history = PerformanceMetrics {
            impressions,
            clicks,
            conversions,
            ..Default::default()
        };
        let scorer = QualityScorer::new(&QualityConfig::default());
        let q = scorer.score(&make_ad(0, 1.0, 1.0, title_len), &history).unwrap();
        prop_assert!((0.0..=10.0).contains(&q));
    }

    #[test]
    fn allocation_respects_ordering_capacity_and_price_bounds(
        bids in prop::collection::vec((0.01f64..20.0, 0.0f64..5.0, 0usize..80), 0..25),
        top_capacity in 1u32..4,
        side_capacity in 1u32..4,
    ) {
        let ads: Vec<Ad> = bids
            .iter()
            .enumerate()
            .map(|(i, (bid, headroom, title))| make_ad(i, *bid, *headroom, *title))
            .collect();
        let slots = vec![
            make_slot(SlotType::SearchSide, 1, side_capacity),
            make_slot(SlotType::SearchTop, 1, top_capacity),
            make_slot(SlotType::SearchTop, 2, 2),
        ];
        let allocator = SlotAllocator::new(&AppConfig::default());
        let result = allocator.allocate(&request(), &slots, &ads, &BudgetSnapshot::default(), &NoHistory);

        let mut seen = HashSet::new();
        for placement in &result.placements {
            let capacity = slots
                .iter()
                .find(|s| s.key() == placement.slot)
                .map(|s| s.capacity)
                .unwrap();
            prop_assert!(placement.winners.len() <= capacity as usize);

            for pair in placement.winners.windows(2) {
                prop_assert!(pair[0].final_score >= pair[1].final_score);
            }
            for winner in &placement.winners {
                prop_assert!(seen.insert(winner.ad_id.clone()), "{} allocated twice", winner.ad_id);
                let ad = ads.iter().find(|a| a.id == winner.ad_id).unwrap();
                prop_assert!(winner.cost <= ad.bid_amount + 1e-9);
                prop_assert!(winner.cost <= ad.max_bid_amount + 1e-9);
                prop_assert!(winner.cost >= 0.20 - 1e-9);
            }
        }
    }
}
