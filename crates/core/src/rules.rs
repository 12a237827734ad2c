//! Targeting rules as a small tagged expression tree.
//!
//! Rules are authored as JSON data, validated once when they are saved, and
//! then evaluated against an [`AdRequestContext`] on the auction path.
//! Evaluation is total. A field the request does not carry equals nothing,
//! so `eq`, ordering comparisons, and plain membership are false for it,
//! while `ne` and negated membership are true.

use chrono::Timelike;
use serde::{Deserialize, Serialize};

use crate::error::{PlacementError, PlacementResult};
use crate::types::{AdRequestContext, DeviceType};

pub const MAX_RULE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RuleField {
    Device,
    Country,
    Region,
    Category,
    /// Matches against individual query terms.
    Query,
    /// UTC hour of the request, 0-23.
    HourOfDay,
}

impl RuleField {
    fn is_numeric(&self) -> bool {
        matches!(self, RuleField::HourOfDay)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    fn is_ordering(&self) -> bool {
        !matches!(self, CompareOp::Eq | CompareOp::Ne)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RuleValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleExpr {
    Comparison {
        field: RuleField,
        op: CompareOp,
        value: RuleValue,
    },
    Logical {
        op: LogicalOp,
        children: Vec<RuleExpr>,
    },
    Membership {
        field: RuleField,
        values: Vec<RuleValue>,
        #[serde(default)]
        negate: bool,
    },
}

enum Resolved {
    Text(Vec<String>),
    Number(f64),
}

impl RuleExpr {
    /// Parse and validate a rule authored as JSON.
    pub fn from_json(raw: &str) -> PlacementResult<Self> {
        let expr: RuleExpr = serde_json::from_str(raw)?;
        expr.validate()?;
        Ok(expr)
    }

    pub fn validate(&self) -> PlacementResult<()> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> PlacementResult<()> {
        if depth > MAX_RULE_DEPTH {
            return Err(PlacementError::Validation(format!(
                "rule nesting exceeds {} levels",
                MAX_RULE_DEPTH
            )));
        }
        match self {
            RuleExpr::Comparison { field, op, value } => {
                check_value_type(*field, value)?;
                if op.is_ordering() && !field.is_numeric() {
                    return Err(PlacementError::Validation(format!(
                        "operator {:?} is not defined for text field {:?}",
                        op, field
                    )));
                }
                Ok(())
            }
            RuleExpr::Logical { op, children } => {
                match op {
                    LogicalOp::Not if children.len() != 1 => {
                        return Err(PlacementError::Validation(
                            "not takes exactly one child".into(),
                        ))
                    }
                    LogicalOp::And | LogicalOp::Or if children.is_empty() => {
                        return Err(PlacementError::Validation(format!(
                            "{:?} needs at least one child",
                            op
                        )))
                    }
                    _ => {}
                }
                children.iter().try_for_each(|c| c.validate_at(depth + 1))
            }
            RuleExpr::Membership { field, values, .. } => {
                if values.is_empty() {
                    return Err(PlacementError::Validation(format!(
                        "membership on {:?} has an empty value set",
                        field
                    )));
                }
                values.iter().try_for_each(|v| check_value_type(*field, v))
            }
        }
    }

    pub fn evaluate(&self, ctx: &AdRequestContext) -> bool {
        match self {
            RuleExpr::Comparison { field, op, value } => compare(&resolve(*field, ctx), *op, value),
            RuleExpr::Logical { op, children } => match op {
                LogicalOp::And => children.iter().all(|c| c.evaluate(ctx)),
                LogicalOp::Or => children.iter().any(|c| c.evaluate(ctx)),
                LogicalOp::Not => !children.iter().all(|c| c.evaluate(ctx)),
            },
            RuleExpr::Membership {
                field,
                values,
                negate,
            } => {
                let resolved = resolve(*field, ctx);
                let hit = values
                    .iter()
                    .any(|v| compare(&resolved, CompareOp::Eq, v));
                hit != *negate
            }
        }
    }
}

fn check_value_type(field: RuleField, value: &RuleValue) -> PlacementResult<()> {
    match (field.is_numeric(), value) {
        (true, RuleValue::Number(n)) if n.is_finite() => Ok(()),
        (false, RuleValue::Text(_)) => Ok(()),
        _ => Err(PlacementError::Validation(format!(
            "value {:?} does not fit field {:?}",
            value, field
        ))),
    }
}

fn resolve(field: RuleField, ctx: &AdRequestContext) -> Resolved {
    let single = |v: Option<&str>| Resolved::Text(v.map(|s| vec![s.to_lowercase()]).unwrap_or_default());
    match field {
        RuleField::Device => single(ctx.device.map(|d| match d {
            DeviceType::Desktop => "desktop",
            DeviceType::Mobile => "mobile",
            DeviceType::Tablet => "tablet",
        })),
        RuleField::Country => single(ctx.location.country.as_deref()),
        RuleField::Region => single(ctx.location.region.as_deref()),
        RuleField::Category => single(ctx.category.as_deref()),
        RuleField::Query => Resolved::Text(ctx.query_terms()),
        RuleField::HourOfDay => Resolved::Number(ctx.timestamp.hour() as f64),
    }
}

fn compare(resolved: &Resolved, op: CompareOp, value: &RuleValue) -> bool {
    match (resolved, value) {
        (Resolved::Text(candidates), RuleValue::Text(expected)) => {
            let expected = expected.to_lowercase();
            let any_eq = candidates.iter().any(|c| *c == expected);
            match op {
                CompareOp::Eq => any_eq,
                CompareOp::Ne => !any_eq,
                _ => false,
            }
        }
        (Resolved::Number(actual), RuleValue::Number(expected)) => match op {
            CompareOp::Eq => actual == expected,
            CompareOp::Ne => actual != expected,
            CompareOp::Gt => actual > expected,
            CompareOp::Gte => actual >= expected,
            CompareOp::Lt => actual < expected,
            CompareOp::Lte => actual <= expected,
        },
        _ => false,
    }
}
