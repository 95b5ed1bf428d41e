use crate::types::{ConditionOperator, LogicalOperator, VariableMap, WorkflowCondition};
use regex::Regex;
use serde_json::Value;

/// Look up a dotted path (`customer.address.city`) in the execution variables.
///
/// Array elements can be addressed by index (`items.0.sku`).
pub fn resolve_path<'a>(variables: &'a VariableMap, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = variables.get(segments.next()?)?;

    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(current)
}

/// Evaluate every gating condition of a step against the execution variables.
///
/// Conditions fold left to right: by default each one is AND-ed onto the running result,
/// a condition marked `or` is OR-ed instead. An empty list always passes.
pub fn evaluate_all(conditions: &[WorkflowCondition], variables: &VariableMap) -> bool {
    let mut iter = conditions.iter();
    let Some(first) = iter.next() else {
        return true;
    };

    let mut result = evaluate(first, resolve_path(variables, &first.field));
    for condition in iter {
        let op = condition.logical_operator.unwrap_or_default();
        result = match op {
            LogicalOperator::And => result && evaluate(condition, resolve_path(variables, &condition.field)),
            LogicalOperator::Or => result || evaluate(condition, resolve_path(variables, &condition.field)),
        };
    }

    result
}

/// Evaluate a single condition against a resolved runtime value (`None` when the field is absent)
pub fn evaluate(condition: &WorkflowCondition, value: Option<&Value>) -> bool {
    let actual = value.unwrap_or(&Value::Null);
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Equals => loosely_equal(actual, expected),
        ConditionOperator::NotEquals => !loosely_equal(actual, expected),
        ConditionOperator::Contains => contains(actual, expected),
        ConditionOperator::NotContains => !contains(actual, expected),
        ConditionOperator::StartsWith => {
            coerce_string(actual).starts_with(coerce_string(expected).as_str())
        }
        ConditionOperator::EndsWith => {
            coerce_string(actual).ends_with(coerce_string(expected).as_str())
        }
        ConditionOperator::GreaterThan => compare_numeric(actual, expected, |a, b| a > b),
        ConditionOperator::LessThan => compare_numeric(actual, expected, |a, b| a < b),
        ConditionOperator::GreaterThanOrEqual => compare_numeric(actual, expected, |a, b| a >= b),
        ConditionOperator::LessThanOrEqual => compare_numeric(actual, expected, |a, b| a <= b),
        ConditionOperator::In => match expected {
            Value::Array(items) => items.iter().any(|item| loosely_equal(actual, item)),
            _ => false,
        },
        ConditionOperator::NotIn => match expected {
            Value::Array(items) => !items.iter().any(|item| loosely_equal(actual, item)),
            _ => false,
        },
        ConditionOperator::IsNull => actual.is_null(),
        ConditionOperator::IsNotNull => !actual.is_null(),
        ConditionOperator::Regex => {
            let pattern = coerce_string(expected);
            match Regex::new(&pattern) {
                Ok(re) => re.is_match(&coerce_string(actual)),
                Err(e) => {
                    tracing::warn!("Invalid regex in condition on {}: {}", condition.field, e);
                    false
                }
            }
        }
    }
}

/// String form used by string operators: strings as-is, null as empty, everything else as JSON
pub fn coerce_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Numeric form used by numeric operators
pub fn coerce_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn compare_numeric(actual: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (coerce_number(actual), coerce_number(expected)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => false,
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (coerce_number(actual), coerce_number(expected)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        _ => coerce_string(actual) == coerce_string(expected),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, expected)),
        Value::Object(map) => map.contains_key(&coerce_string(expected)),
        Value::Null => false,
        other => coerce_string(other).contains(coerce_string(expected).as_str()),
    }
}
