use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Operator of a single billing rule.
///
/// Comparison operators add `price` to the total only when the extracted
/// value compares against `benchmark` as named; arithmetic operators apply
/// unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleOp {
    Ne,
    Gt,
    Lt,
    Eq,
    Ge,
    Le,
    Add,
    Sub,
    Mul,
    Div,
}

/// One node of a pricing rule tree.
///
/// Rules are stored as JSON on a forwarding address and evaluated against
/// the flattened request payload. `children` are evaluated recursively and
/// additively, whether or not the parent's own operator matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingRule {
    #[serde(default)]
    pub remark: String,
    pub field_path: String,
    pub operator: RuleOp,
    #[serde(default)]
    pub benchmark: Value,
    #[serde(default)]
    pub price: Decimal,
    #[serde(default)]
    pub children: Vec<BillingRule>,
}

/// Result of evaluating a rule tree: the itemized values worth auditing and
/// the total charge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Breakdown {
    pub itemized_funds: Map<String, Value>,
    pub total: Decimal,
}

/// Per-rule evaluation error. Always swallowed by [`evaluate`]; the failing
/// rule contributes zero and its siblings still run.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RuleError {
    #[error("extracted value is not numeric")]
    NotNumeric,
    #[error("division by zero")]
    DivisionByZero,
    #[error("value and benchmark are not comparable")]
    Incomparable,
}

/// Evaluate a billing rule tree against a request payload.
///
/// Never fails: rules whose field path does not resolve are skipped
/// (children included), and any per-rule error is logged and dropped.
pub fn evaluate(payload: &Value, rules: &[BillingRule]) -> Breakdown {
    let mut breakdown = Breakdown::default();
    for rule in rules {
        eval_rule(payload, rule, &mut breakdown);
    }
    breakdown
}

fn eval_rule(payload: &Value, rule: &BillingRule, breakdown: &mut Breakdown) {
    let Some(value) = lookup_path(payload, &rule.field_path) else {
        debug!(field_path = %rule.field_path, "billing rule path unresolved, skipping");
        return;
    };
    if value.is_null() {
        return;
    }

    if !rule.price.is_zero() && is_nonempty_sequence(value) {
        breakdown
            .itemized_funds
            .insert(rule.field_path.clone(), value.clone());
    }

    match apply_operator(rule, value) {
        Ok(Some(delta)) => breakdown.total += delta,
        Ok(None) => {}
        Err(e) => {
            debug!(field_path = %rule.field_path, error = %e, "billing rule dropped");
        }
    }

    // Children always run once the parent path resolved, matched or not.
    for child in &rule.children {
        eval_rule(payload, child, breakdown);
    }
}

/// The charge contribution of a single rule, or `None` when a comparison
/// does not hold.
fn apply_operator(rule: &BillingRule, value: &Value) -> Result<Option<Decimal>, RuleError> {
    match rule.operator {
        RuleOp::Add => Ok(Some(rule.price)),
        RuleOp::Sub => Ok(Some(-rule.price)),
        RuleOp::Mul => Ok(Some(rule.price * as_decimal(value)?)),
        RuleOp::Div => {
            let divisor = as_decimal(value)?;
            if divisor.is_zero() {
                return Err(RuleError::DivisionByZero);
            }
            Ok(Some(rule.price / divisor))
        }
        op => {
            let holds = compare(op, value, &rule.benchmark)?;
            Ok(holds.then_some(rule.price))
        }
    }
}

fn compare(op: RuleOp, value: &Value, benchmark: &Value) -> Result<bool, RuleError> {
    if let (Ok(v), Ok(b)) = (as_decimal(value), as_decimal(benchmark)) {
        return Ok(match op {
            RuleOp::Ne => v != b,
            RuleOp::Gt => v > b,
            RuleOp::Lt => v < b,
            RuleOp::Eq => v == b,
            RuleOp::Ge => v >= b,
            RuleOp::Le => v <= b,
            _ => unreachable!("arithmetic operator in compare"),
        });
    }

    // Non-numeric operands: equality falls back to raw value comparison,
    // ordering requires two strings.
    match op {
        RuleOp::Eq => Ok(value == benchmark),
        RuleOp::Ne => Ok(value != benchmark),
        _ => match (value, benchmark) {
            (Value::String(v), Value::String(b)) => Ok(match op {
                RuleOp::Gt => v > b,
                RuleOp::Lt => v < b,
                RuleOp::Ge => v >= b,
                RuleOp::Le => v <= b,
                _ => unreachable!(),
            }),
            _ => Err(RuleError::Incomparable),
        },
    }
}

/// Numeric coercion: JSON numbers and numeric strings both qualify, since
/// query and form parameters arrive as strings.
pub(crate) fn as_decimal(value: &Value) -> Result<Decimal, RuleError> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).map_err(|_| RuleError::NotNumeric),
        Value::String(s) => Decimal::from_str(s.trim()).map_err(|_| RuleError::NotNumeric),
        _ => Err(RuleError::NotNumeric),
    }
}

fn is_nonempty_sequence(value: &Value) -> bool {
    match value {
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        _ => false,
    }
}

/// Walk a dotted/bracketed path (`data.usage[0].tokens`) through nested
/// maps and sequences. `None` when any hop is missing or malformed.
fn lookup_path<'a>(payload: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = payload;
    for segment in path.split('.') {
        let (key, indices) = split_segment(segment)?;
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indices {
            current = current.get(index)?;
        }
    }
    Some(current)
}

/// `"usage[0][2]"` -> `("usage", [0, 2])`. `None` on malformed brackets.
fn split_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    let Some(open) = segment.find('[') else {
        return Some((segment, Vec::new()));
    };
    let key = &segment[..open];
    let mut indices = Vec::new();
    for part in segment[open..].split('[').skip(1) {
        let digits = part.strip_suffix(']')?;
        indices.push(digits.parse().ok()?);
    }
    Some((key, indices))
}
