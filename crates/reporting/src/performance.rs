//! Engagement counters per (campaign, UTC day) and per ad lifetime.

use chrono::NaiveDate;
use dashmap::DashMap;
use placement_core::types::{AdId, ConfirmationEvent, EngagementKind};
use placement_core::{PerformanceHistory, PerformanceMetrics, PerformanceRecorder};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyMetrics {
    pub date: NaiveDate,
    pub metrics: PerformanceMetrics,
}

#[derive(Default)]
pub struct PerformanceAggregator {
    /// (campaign_id, day) -> counters
    daily: DashMap<(Uuid, NaiveDate), PerformanceMetrics>,
    /// ad_id -> lifetime counters
    ads: DashMap<AdId, PerformanceMetrics>,
}

impl PerformanceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one confirmed engagement. `charged` is added to spend.
    pub fn record(&self, event: &ConfirmationEvent, charged: Decimal) {
        let delta = delta_for(event, charged);
        let day = event.occurred_at.date_naive();
        self.daily
            .entry((event.campaign_id, day))
            .or_default()
            .merge(&delta);
        self.ads.entry(event.ad_id.clone()).or_default().merge(&delta);
        debug!(
            campaign_id = %event.campaign_id,
            ad_id = %event.ad_id,
            kind = ?event.kind,
            "Performance recorded"
        );
    }

    /// Spend only, no engagement count. Lands on the event's day.
    pub fn record_late_charge(&self, event: &ConfirmationEvent, charged: Decimal) {
        let delta = PerformanceMetrics {
            spend: charged,
            ..Default::default()
        };
        self.daily
            .entry((event.campaign_id, event.occurred_at.date_naive()))
            .or_default()
            .merge(&delta);
        self.ads.entry(event.ad_id.clone()).or_default().merge(&delta);
    }

    pub fn ad_history(&self, ad_id: &str) -> PerformanceMetrics {
        self.ads.get(ad_id).map(|m| *m).unwrap_or_default()
    }

    /// Totals over `from..=to`. An inverted range is empty.
    pub fn campaign_range(&self, campaign_id: &Uuid, from: NaiveDate, to: NaiveDate) -> PerformanceMetrics {
        let mut total = PerformanceMetrics::default();
        for day in self.daily(campaign_id, from, to) {
            total.merge(&day.metrics);
        }
        total
    }

    /// Days with activity in `from..=to`, oldest first.
    pub fn daily(&self, campaign_id: &Uuid, from: NaiveDate, to: NaiveDate) -> Vec<DailyMetrics> {
        let mut days: Vec<DailyMetrics> = self
            .daily
            .iter()
            .filter(|e| {
                let (campaign, day) = e.key();
                campaign == campaign_id && *day >= from && *day <= to
            })
            .map(|e| DailyMetrics {
                date: e.key().1,
                metrics: *e.value(),
            })
            .collect();
        days.sort_by_key(|d| d.date);
        days
    }
}

fn delta_for(event: &ConfirmationEvent, charged: Decimal) -> PerformanceMetrics {
    let mut delta = PerformanceMetrics {
        spend: charged,
        ..Default::default()
    };
    match event.kind {
        EngagementKind::Impression => delta.impressions = 1,
        EngagementKind::Click => delta.clicks = 1,
        EngagementKind::Conversion => {
            delta.conversions = 1;
            delta.revenue = event.revenue.unwrap_or_default();
        }
    }
    delta
}

impl PerformanceHistory for PerformanceAggregator {
    fn ad_history(&self, ad_id: &str) -> PerformanceMetrics {
        PerformanceAggregator::ad_history(self, ad_id)
    }
}

impl PerformanceRecorder for PerformanceAggregator {
    fn record(&self, event: &ConfirmationEvent, charged: Decimal) {
        PerformanceAggregator::record(self, event, charged)
    }

    fn record_late_charge(&self, event: &ConfirmationEvent, charged: Decimal) {
        PerformanceAggregator::record_late_charge(self, event, charged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use placement_core::types::ChargeModel;
    use rust_decimal_macros::dec;

    fn event(campaign_id: Uuid, ad_id: &str, kind: EngagementKind, day: u32) -> ConfirmationEvent {
        ConfirmationEvent {
            event_id: Uuid::new_v4(),
            request_id: "req".into(),
            ad_id: ad_id.into(),
            campaign_id,
            seller_id: Uuid::new_v4(),
            kind,
            charge_model: ChargeModel::PerClick,
            reserved_cost: 0.5,
            revenue: None,
            occurred_at: Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).unwrap(),
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    #[test]
    fn test_counters_per_kind() {
        let agg = PerformanceAggregator::new();
        let campaign = Uuid::new_v4();
        agg.record(&event(campaign, "ad-1", EngagementKind::Impression, 1), Decimal::ZERO);
        agg.record(&event(campaign, "ad-1", EngagementKind::Impression, 1), Decimal::ZERO);
        agg.record(&event(campaign, "ad-1", EngagementKind::Click, 1), dec!(0.50));
        let mut conversion = event(campaign, "ad-1", EngagementKind::Conversion, 1);
        conversion.revenue = Some(dec!(20));
        agg.record(&conversion, Decimal::ZERO);

        let m = agg.ad_history("ad-1");
        assert_eq!((m.impressions, m.clicks, m.conversions), (2, 1, 1));
        assert_eq!(m.spend, dec!(0.50));
        assert_eq!(m.revenue, dec!(20));
        assert!((m.ctr() - 50.0).abs() < 1e-9);
        assert!((m.roas() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_late_charge_adds_spend_only() {
        let agg = PerformanceAggregator::new();
        let campaign = Uuid::new_v4();
        let click = event(campaign, "ad-1", EngagementKind::Click, 4);
        agg.record(&click, Decimal::ZERO);
        agg.record_late_charge(&click, dec!(1.25));

        let m = agg.ad_history("ad-1");
        assert_eq!(m.clicks, 1);
        assert_eq!(m.spend, dec!(1.25));
        let day = agg.campaign_range(&campaign, date(4), date(4));
        assert_eq!((day.clicks, day.spend), (1, dec!(1.25)));
    }

    #[test]
    fn test_campaign_range_inclusive() {
        let agg = PerformanceAggregator::new();
        let campaign = Uuid::new_v4();
        let other = Uuid::new_v4();
        for day in [1, 2, 3, 5] {
            agg.record(&event(campaign, "ad-1", EngagementKind::Impression, day), Decimal::ZERO);
        }
        agg.record(&event(other, "ad-9", EngagementKind::Impression, 2), Decimal::ZERO);

        assert_eq!(agg.campaign_range(&campaign, date(2), date(5)).impressions, 3);
        assert_eq!(agg.campaign_range(&campaign, date(4), date(4)).impressions, 0);
        assert_eq!(agg.campaign_range(&campaign, date(5), date(1)).impressions, 0);

        let days: Vec<NaiveDate> = agg
            .daily(&campaign, date(1), date(31))
            .iter()
            .map(|d| d.date)
            .collect();
        assert_eq!(days, vec![date(1), date(2), date(3), date(5)]);
    }

    #[test]
    fn test_unknown_ad_has_empty_history() {
        let agg = PerformanceAggregator::new();
        let history: &dyn PerformanceHistory = &agg;
        assert_eq!(history.ad_history("nope"), PerformanceMetrics::default());
    }

    #[test]
    fn test_day_bucket_uses_utc_date() {
        let agg = PerformanceAggregator::new();
        let campaign = Uuid::new_v4();
        let mut late = event(campaign, "ad-1", EngagementKind::Click, 1);
        late.occurred_at = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 59).unwrap() + Duration::seconds(1);
        agg.record(&late, dec!(1));
        assert_eq!(agg.campaign_range(&campaign, date(2), date(2)).clicks, 1);
        assert_eq!(agg.campaign_range(&campaign, date(1), date(1)).clicks, 0);
    }

    #[test]
    fn test_concurrent_records() {
        let agg = PerformanceAggregator::new();
        let campaign = Uuid::new_v4();
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..250 {
                        agg.record(&event(campaign, "ad-1", EngagementKind::Impression, 7), Decimal::ZERO);
                    }
                });
            }
        });
        assert_eq!(agg.ad_history("ad-1").impressions, 1000);
        assert_eq!(agg.campaign_range(&campaign, date(7), date(7)).impressions, 1000);
    }
}
