//! Pre-auction filter. Keeps ads that cannot legally compete for a slot out of
//! the scoring pool.

use placement_core::types::{Ad, AdRequestContext, BudgetSnapshot, IneligibleReason, Slot};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct EligibilityFilter {
    safety_margin: Decimal,
}

impl Default for EligibilityFilter {
    fn default() -> Self {
        Self::new(Decimal::ZERO)
    }
}

impl EligibilityFilter {
    pub fn new(safety_margin: Decimal) -> Self {
        Self { safety_margin }
    }

    /// Checks run in a fixed order and the first failure is reported.
    pub fn check(
        &self,
        ad: &Ad,
        slot: &Slot,
        ctx: &AdRequestContext,
        budget: &BudgetSnapshot,
    ) -> Result<(), IneligibleReason> {
        if !ad.is_live(ctx.timestamp) {
            return Err(IneligibleReason::Inactive);
        }
        if !ad.approved {
            return Err(IneligibleReason::Unapproved);
        }
        if budget.is_exhausted(&ad.campaign_id, self.safety_margin) {
            return Err(IneligibleReason::BudgetExhausted);
        }
        // A bid under the reserve could never be charged its floor.
        if ad.bid_amount < slot.price_floor() {
            return Err(IneligibleReason::BelowMinBid);
        }
        if !targeting_matches(ad, slot, ctx) {
            return Err(IneligibleReason::TargetingMismatch);
        }
        Ok(())
    }
}

fn targeting_matches(ad: &Ad, slot: &Slot, ctx: &AdRequestContext) -> bool {
    if !slot.targeting.categories.is_empty() {
        let allowed = |c: &String| {
            slot.targeting
                .categories
                .iter()
                .any(|s| s.eq_ignore_ascii_case(c))
        };
        let fits_slot = if ad.targeting.categories.is_empty() {
            ctx.category.as_ref().map(allowed).unwrap_or(false)
        } else {
            ad.targeting.categories.iter().any(allowed)
        };
        if !fits_slot {
            return false;
        }
    }

    if !ad.targeting.is_empty() && (ctx.category.is_some() || ctx.query.is_some()) {
        let category_hit = ctx
            .category
            .as_ref()
            .map(|c| {
                ad.targeting
                    .categories
                    .iter()
                    .any(|a| a.eq_ignore_ascii_case(c))
            })
            .unwrap_or(false);
        let terms = ctx.query_terms();
        let keyword_hit = ad
            .targeting
            .keywords
            .iter()
            .any(|k| keyword_in_query(k, &terms));
        if !category_hit && !keyword_hit {
            return false;
        }
    }

    slot.rule.as_ref().map(|r| r.evaluate(ctx)).unwrap_or(true)
}

/// Multi-word keywords must appear as a contiguous run of query terms.
pub(crate) fn keyword_in_query(keyword: &str, terms: &[String]) -> bool {
    let parts = tokenize(keyword);
    if parts.is_empty() || parts.len() > terms.len() {
        return false;
    }
    terms.windows(parts.len()).any(|w| w == parts.as_slice())
}

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}
