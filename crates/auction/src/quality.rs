//! Quality score (0-10) from creative heuristics and smoothed history.
//!
//! The historical term uses Bayesian smoothing: every ad starts with
//! `prior_impressions` pseudo-impressions at the target CTR (and
//! `prior_clicks` pseudo-clicks at the target conversion rate), so an ad with
//! little delivery sits near the neutral score of 5 instead of 0. The two
//! terms are blended by how much real evidence exists; with no impressions
//! the score is the creative term alone.

use placement_core::config::QualityConfig;
use placement_core::types::Ad;
use placement_core::{PerformanceMetrics, PlacementError, PlacementResult};
use url::Url;

pub const MAX_QUALITY: f64 = 10.0;
const NEUTRAL_HISTORY: f64 = 5.0;

const BASE_CREDIT: f64 = 1.0;
const TITLE_CREDIT: f64 = 3.0;
const DESCRIPTION_CREDIT: f64 = 2.5;
const LANDING_CREDIT: f64 = 2.0;
const TARGETING_CREDIT: f64 = 1.5;

const CTR_SHARE: f64 = 0.6;
const CVR_SHARE: f64 = 0.4;

#[derive(Debug, Clone)]
pub struct QualityScorer {
    config: QualityConfig,
}

impl QualityScorer {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn score(&self, ad: &Ad, history: &PerformanceMetrics) -> PlacementResult<f64> {
        let creative = self.creative_score(ad);
        let historical = self.historical_score(history);
        let impressions = history.impressions as f64;
        let confidence = impressions / (impressions + self.config.confidence_impressions);

        let score = (1.0 - confidence) * creative + confidence * historical;
        if !score.is_finite() {
            return Err(PlacementError::InternalScoring {
                ad_id: ad.id.clone(),
                detail: format!("quality score is not finite ({score})"),
            });
        }
        Ok(score.clamp(0.0, MAX_QUALITY))
    }

    /// Heuristic creative quality in `[0, 10]`. An ad with any title gets at
    /// least the base credit plus a partial title credit.
    pub fn creative_score(&self, ad: &Ad) -> f64 {
        let creative = &ad.creative;
        let title_len = creative.title.trim().chars().count();
        let title = match title_len {
            0 => 0.0,
            10..=60 => TITLE_CREDIT,
            _ => TITLE_CREDIT / 2.0,
        };

        let description_len = creative.description.trim().chars().count();
        let description = match description_len {
            0 => 0.0,
            25..=150 => DESCRIPTION_CREDIT,
            _ => DESCRIPTION_CREDIT / 2.0,
        };

        let landing = match Url::parse(creative.landing_url.trim()) {
            Ok(url) if url.host_str().is_some() && url.scheme() == "https" => LANDING_CREDIT,
            Ok(url) if url.host_str().is_some() && url.scheme() == "http" => LANDING_CREDIT / 2.0,
            _ => 0.0,
        };

        let mut targeting = 0.0;
        if !ad.targeting.categories.is_empty() {
            targeting += TARGETING_CREDIT / 2.0;
        }
        if !ad.targeting.keywords.is_empty() {
            targeting += TARGETING_CREDIT / 2.0;
        }

        (BASE_CREDIT + title + description + landing + targeting).min(MAX_QUALITY)
    }

    /// Smoothed CTR and conversion rate mapped so that the target rate scores
    /// 5 and twice the target (or more) scores 10.
    pub fn historical_score(&self, history: &PerformanceMetrics) -> f64 {
        let c = &self.config;
        let smoothed_ctr = (history.clicks as f64 + c.target_ctr * c.prior_impressions)
            / (history.impressions as f64 + c.prior_impressions);
        let smoothed_cvr = (history.conversions as f64 + c.target_cvr * c.prior_clicks)
            / (history.clicks as f64 + c.prior_clicks);

        let ctr_score = (NEUTRAL_HISTORY * smoothed_ctr / c.target_ctr).min(MAX_QUALITY);
        let cvr_score = (NEUTRAL_HISTORY * smoothed_cvr / c.target_cvr).min(MAX_QUALITY);
        CTR_SHARE * ctr_score + CVR_SHARE * cvr_score
    }
}
