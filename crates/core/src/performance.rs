//! Engagement counters and the rate metrics derived from them.

use std::collections::HashMap;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{AdId, ConfirmationEvent};

/// Monotonic counters. Rates are computed on read and are 0 whenever their
/// denominator is 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub spend: Decimal,
    pub revenue: Decimal,
}

impl PerformanceMetrics {
    /// Click-through rate, percent.
    pub fn ctr(&self) -> f64 {
        ratio(self.clicks as f64, self.impressions as f64) * 100.0
    }

    pub fn cpc(&self) -> f64 {
        ratio(money(self.spend), self.clicks as f64)
    }

    pub fn cpm(&self) -> f64 {
        ratio(money(self.spend), self.impressions as f64) * 1000.0
    }

    pub fn cpa(&self) -> f64 {
        ratio(money(self.spend), self.conversions as f64)
    }

    pub fn roas(&self) -> f64 {
        ratio(money(self.revenue), money(self.spend))
    }

    /// Conversions per click, percent.
    pub fn conversion_rate(&self) -> f64 {
        ratio(self.conversions as f64, self.clicks as f64) * 100.0
    }

    pub fn merge(&mut self, other: &PerformanceMetrics) {
        self.impressions += other.impressions;
        self.clicks += other.clicks;
        self.conversions += other.conversions;
        self.spend += other.spend;
        self.revenue += other.revenue;
    }

    pub fn rates(&self) -> DerivedRates {
        DerivedRates {
            ctr: self.ctr(),
            cpc: self.cpc(),
            cpm: self.cpm(),
            cpa: self.cpa(),
            roas: self.roas(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DerivedRates {
    pub ctr: f64,
    pub cpc: f64,
    pub cpm: f64,
    pub cpa: f64,
    pub roas: f64,
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator > 0.0 {
        let r = numerator / denominator;
        if r.is_finite() {
            r
        } else {
            0.0
        }
    } else {
        0.0
    }
}

fn money(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Historical per-ad performance, read by the quality scorer.
pub trait PerformanceHistory: Send + Sync {
    fn ad_history(&self, ad_id: &str) -> PerformanceMetrics;
}

/// Fixed history, for callers that preload metrics and for tests.
impl PerformanceHistory for HashMap<AdId, PerformanceMetrics> {
    fn ad_history(&self, ad_id: &str) -> PerformanceMetrics {
        self.get(ad_id).copied().unwrap_or_default()
    }
}

/// No history at all: every ad is scored on creative terms alone.
pub struct NoHistory;

impl PerformanceHistory for NoHistory {
    fn ad_history(&self, _ad_id: &str) -> PerformanceMetrics {
        PerformanceMetrics::default()
    }
}

/// Write side of the performance counters. `charged` is what the seller was
/// actually debited for this event, zero when nothing was charged.
pub trait PerformanceRecorder: Send + Sync {
    fn record(&self, event: &ConfirmationEvent, charged: Decimal);

    /// Adds spend for an event whose engagement was already counted by an
    /// earlier `record` that could not charge it.
    fn record_late_charge(&self, event: &ConfirmationEvent, charged: Decimal);
}
