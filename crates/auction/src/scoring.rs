//! Rank score: `bid × weighted_quality(quality, relevance)`.

use placement_core::config::AuctionConfig;
use placement_core::types::{Ad, AdRequestContext};
use placement_core::{PlacementError, PlacementResult};

use crate::eligibility::tokenize;
use crate::quality::MAX_QUALITY;

const NEUTRAL_RELEVANCE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredBid {
    pub weighted_quality: f64,
    pub final_score: f64,
}

#[derive(Debug, Clone)]
pub struct BidScorer {
    quality_weight: f64,
    relevance_weight: f64,
    min_weighted_quality: f64,
}

impl BidScorer {
    pub fn new(config: &AuctionConfig) -> Self {
        Self {
            quality_weight: config.quality_weight,
            relevance_weight: config.relevance_weight,
            min_weighted_quality: config.min_weighted_quality,
        }
    }

    /// Blend of normalized quality and relevance, floored so that the rank
    /// score stays strictly increasing in bid.
    pub fn weighted_quality(&self, quality: f64, relevance: f64) -> f64 {
        let blended = self.quality_weight * (quality / MAX_QUALITY) + self.relevance_weight * relevance;
        blended.max(self.min_weighted_quality)
    }

    pub fn final_score(&self, bid: f64, quality: f64, relevance: f64) -> f64 {
        bid * self.weighted_quality(quality, relevance)
    }

    /// Validates the scoring inputs of one ad and computes its rank score.
    pub fn score(&self, ad: &Ad, quality: f64, relevance: f64) -> PlacementResult<ScoredBid> {
        let invalid = |detail: String| PlacementError::InternalScoring {
            ad_id: ad.id.clone(),
            detail,
        };
        if !ad.bid_amount.is_finite() || ad.bid_amount < 0.0 {
            return Err(invalid(format!("bid amount {} is not a valid price", ad.bid_amount)));
        }
        if !ad.max_bid_amount.is_finite() || ad.max_bid_amount < ad.bid_amount {
            return Err(invalid(format!(
                "max bid {} is below bid {}",
                ad.max_bid_amount, ad.bid_amount
            )));
        }
        if !quality.is_finite() || !(0.0..=MAX_QUALITY).contains(&quality) {
            return Err(invalid(format!("quality {quality} outside [0, 10]")));
        }
        if !relevance.is_finite() || !(0.0..=1.0).contains(&relevance) {
            return Err(invalid(format!("relevance {relevance} outside [0, 1]")));
        }

        let weighted_quality = self.weighted_quality(quality, relevance);
        let final_score = ad.bid_amount * weighted_quality;
        if !final_score.is_finite() {
            return Err(invalid("final score overflowed".into()));
        }
        Ok(ScoredBid {
            weighted_quality,
            final_score,
        })
    }
}

/// Contextual match in `[0, 1]`: half from the request category, half from
/// how much of the query the ad's keywords cover. Missing signals on either
/// side count as neutral.
pub fn relevance_score(ad: &Ad, ctx: &AdRequestContext) -> f64 {
    if ad.targeting.is_empty() {
        return NEUTRAL_RELEVANCE;
    }

    let category = match (&ctx.category, ad.targeting.categories.is_empty()) {
        (Some(c), false) => {
            if ad.targeting.categories.iter().any(|a| a.eq_ignore_ascii_case(c)) {
                1.0
            } else {
                0.0
            }
        }
        _ => NEUTRAL_RELEVANCE,
    };

    let terms = ctx.query_terms();
    let keywords = if terms.is_empty() || ad.targeting.keywords.is_empty() {
        NEUTRAL_RELEVANCE
    } else {
        let keyword_terms: Vec<String> = ad
            .targeting
            .keywords
            .iter()
            .flat_map(|k| tokenize(k))
            .collect();
        let covered = terms.iter().filter(|t| keyword_terms.contains(t)).count();
        covered as f64 / terms.len() as f64
    };

    (0.5 * category + 0.5 * keywords).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ad, ctx};

    fn scorer() -> BidScorer {
        BidScorer::new(&AuctionConfig::default())
    }

    #[test]
    fn test_final_score_formula() {
        let s = scorer();
        // 0.7 * 0.85 + 0.3 * 1.0 = 0.895
        assert!((s.final_score(2.0, 8.5, 1.0) - 1.79).abs() < 1e-9);
    }

    #[test]
    fn test_floor_keeps_score_growing_with_bid() {
        let s = scorer();
        assert!(s.final_score(2.0, 0.0, 0.0) > s.final_score(1.0, 0.0, 0.0));
        assert!(s.final_score(1.0, 0.0, 0.0) > 0.0);
    }

    #[test]
    fn test_score_rejects_non_finite_inputs() {
        let s = scorer();
        let mut a = ad("ad-1", 2.0, 5.0);
        a.bid_amount = f64::NAN;
        assert!(matches!(
            s.score(&a, 5.0, 0.5),
            Err(PlacementError::InternalScoring { .. })
        ));

        let b = ad("ad-2", 2.0, 5.0);
        assert!(s.score(&b, f64::INFINITY, 0.5).is_err());
        assert!(s.score(&b, 5.0, 1.5).is_err());
    }

    #[test]
    fn test_score_rejects_bid_above_max() {
        let a = ad("ad-1", 6.0, 5.0);
        assert!(scorer().score(&a, 5.0, 0.5).is_err());
    }

    #[test]
    fn test_relevance_partial_keyword_coverage() {
        // category electronics + keyword "headphones" covers one of two terms
        let r = relevance_score(&ad("ad-1", 2.0, 5.0), &ctx());
        assert!((r - 0.75).abs() < 1e-12, "got {r}");
    }

    #[test]
    fn test_relevance_untargeted_is_neutral() {
        let mut a = ad("ad-1", 2.0, 5.0);
        a.targeting = Default::default();
        assert_eq!(relevance_score(&a, &ctx()), NEUTRAL_RELEVANCE);
    }

    #[test]
    fn test_relevance_category_miss() {
        let mut a = ad("ad-1", 2.0, 5.0);
        a.targeting.categories = vec!["garden".into()];
        a.targeting.keywords = vec!["rake".into()];
        assert_eq!(relevance_score(&a, &ctx()), 0.0);
    }
}
