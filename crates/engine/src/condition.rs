//! Condition evaluation shared by step gating, trigger pre-conditions and
//! automation rules.
//!
//! A condition list is folded left to right. The running result starts as
//! `true` and each condition's result is combined with it using the
//! `logical_operator` of the *previous* condition; the first condition
//! combines with AND. A condition's own `logical_operator` therefore only
//! affects how the next one joins in.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Comparison applied between the resolved field and `Condition::value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    In,
    NotIn,
    Exists,
    NotExists,
    /// Any operator name we do not know. Always evaluates to `false`.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Dot path into the data, e.g. `order.items.0.sku`.
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    /// How the *next* condition combines with the running result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_operator: Option<LogicalOperator>,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
            logical_operator: None,
        }
    }

    pub fn then(mut self, op: LogicalOperator) -> Self {
        self.logical_operator = Some(op);
        self
    }
}

/// Fold `conditions` against `data`. An empty list is `true`.
pub fn evaluate(conditions: &[Condition], data: &Value) -> bool {
    let mut result = true;
    let mut joiner = LogicalOperator::And;

    for condition in conditions {
        let current = evaluate_condition(condition, data);
        result = match joiner {
            LogicalOperator::And => result && current,
            LogicalOperator::Or => result || current,
        };
        joiner = condition.logical_operator.unwrap_or_default();
    }

    result
}

/// Evaluate a single condition, ignoring its logical operator.
pub fn evaluate_condition(condition: &Condition, data: &Value) -> bool {
    let field = resolve_path(data, &condition.field);
    let target = &condition.value;

    use ConditionOperator::*;
    match condition.operator {
        Equals => field.is_some_and(|v| loose_eq(v, target)),
        NotEquals => !field.is_some_and(|v| loose_eq(v, target)),
        GreaterThan => compare(field, target).is_some_and(|o| o.is_gt()),
        LessThan => compare(field, target).is_some_and(|o| o.is_lt()),
        GreaterThanOrEqual => compare(field, target).is_some_and(|o| o.is_ge()),
        LessThanOrEqual => compare(field, target).is_some_and(|o| o.is_le()),
        Contains => field.is_some_and(|v| stringify(v).contains(&stringify(target))),
        NotContains => !field.is_some_and(|v| stringify(v).contains(&stringify(target))),
        StartsWith => field.is_some_and(|v| stringify(v).starts_with(&stringify(target))),
        EndsWith => field.is_some_and(|v| stringify(v).ends_with(&stringify(target))),
        In => match (field, target) {
            (Some(v), Value::Array(items)) => items.iter().any(|i| loose_eq(v, i)),
            _ => false,
        },
        NotIn => match (field, target) {
            (Some(v), Value::Array(items)) => !items.iter().any(|i| loose_eq(v, i)),
            (None, Value::Array(_)) => true,
            _ => false,
        },
        Exists => field.is_some_and(|v| !v.is_null()),
        NotExists => !field.is_some_and(|v| !v.is_null()),
        Unknown => false,
    }
}

/// Walk a dot-separated path. Numeric segments index into arrays.
pub fn resolve_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(data);
    }

    path.split('.').try_fold(data, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// JSON equality where numbers compare by value (`5 == 5.0`).
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(field: Option<&Value>, target: &Value) -> Option<std::cmp::Ordering> {
    let field = field?;
    if let (Value::String(a), Value::String(b)) = (field, target) {
        if let (Ok(x), Ok(y)) = (a.parse::<f64>(), b.parse::<f64>()) {
            return x.partial_cmp(&y);
        }
        return Some(a.cmp(b));
    }
    as_number(field)?.partial_cmp(&as_number(target)?)
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".into(),
        other => other.to_string(),
    }
}
