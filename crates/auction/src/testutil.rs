use chrono::{Duration, Utc};
use placement_core::types::{
    Ad, AdRequestContext, AdStatus, ChargeModel, Creative, DeviceType, Location, Schedule, Slot,
    SlotTargeting, SlotType, Targeting,
};
use uuid::Uuid;

/// Live, approved ad with a creative that earns full creative credit.
pub fn ad(id: &str, bid: f64, max_bid: f64) -> Ad {
    Ad {
        id: id.to_string(),
        campaign_id: Uuid::new_v4(),
        seller_id: Uuid::new_v4(),
        status: AdStatus::Active,
        approved: true,
        bid_amount: bid,
        max_bid_amount: max_bid,
        targeting: Targeting {
            categories: vec!["electronics".into()],
            keywords: vec!["headphones".into()],
        },
        schedule: Schedule {
            start: Utc::now() - Duration::days(1),
            end: None,
        },
        creative: Creative {
            title: "Studio Wireless Headphones".into(),
            description: "Noise cancelling over-ear headphones with 30h battery".into(),
            landing_url: "https://shop.example.com/p/studio-wireless".into(),
        },
        charge_model: ChargeModel::PerClick,
    }
}

pub fn ctx() -> AdRequestContext {
    AdRequestContext {
        request_id: "req-1".into(),
        query: Some("wireless headphones".into()),
        category: Some("electronics".into()),
        device: Some(DeviceType::Mobile),
        location: Location {
            country: Some("US".into()),
            region: Some("CA".into()),
        },
        session_id: Some("sess-1".into()),
        timestamp: Utc::now(),
    }
}

pub fn slot(position: u32, capacity: u32) -> Slot {
    Slot {
        slot_type: SlotType::SearchTop,
        position,
        capacity,
        min_bid_amount: 0.10,
        reserve_price: 0.25,
        targeting: SlotTargeting::default(),
        rule: None,
    }
}
