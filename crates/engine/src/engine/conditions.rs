//! Step condition evaluation
//!
//! Deterministic and side-effect free: the same conditions over the same
//! variable bag always give the same answer.

use std::cmp::Ordering;

use fleetflow_core::{ConditionOperator, LogicalOperator, StepCondition};
use serde_json::{Map, Value};

/// Resolve `path` in the variable bag; dotted segments descend into objects and arrays
///
/// An exact key match wins over path traversal.
pub fn lookup<'a>(vars: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = vars.get(path) {
        return Some(value);
    }
    let mut segments = path.split('.');
    let mut current = vars.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// JSON equality, with numeric coercion when one side is a number
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    if actual.is_number() || expected.is_number() {
        if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
            return a == b;
        }
    }
    false
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => match expected {
            Value::String(needle) => haystack.contains(needle.as_str()),
            Value::Null => false,
            other => haystack.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

/// Evaluate one condition; a missing field reads as `null`
pub fn evaluate_condition(condition: &StepCondition, vars: &Map<String, Value>) -> bool {
    let actual = lookup(vars, &condition.field).unwrap_or(&Value::Null);
    let expected = &condition.value;

    match condition.operator {
        ConditionOperator::Eq => loose_eq(actual, expected),
        ConditionOperator::Ne => !loose_eq(actual, expected),
        ConditionOperator::Gt => compare(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::Gte => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOperator::Lt => compare(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Lte => matches!(
            compare(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ConditionOperator::In => match expected {
            Value::Array(members) => members.iter().any(|m| loose_eq(actual, m)),
            _ => false,
        },
        ConditionOperator::Contains => contains(actual, expected),
    }
}

/// Left-to-right fold of a condition list
///
/// The first condition seeds the result and its `logical_operator` is not
/// read (definitions that set it to `or` fail validation). Every later
/// condition combines its result with the running result through its own
/// logical operator. An empty list is true.
pub fn evaluate_conditions(conditions: &[StepCondition], vars: &Map<String, Value>) -> bool {
    let mut iter = conditions.iter();
    let Some(first) = iter.next() else {
        return true;
    };
    let mut result = evaluate_condition(first, vars);
    for condition in iter {
        let current = evaluate_condition(condition, vars);
        result = match condition.logical_operator {
            LogicalOperator::And => result && current,
            LogicalOperator::Or => result || current,
        };
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    fn conditions(value: Value) -> Vec<StepCondition> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_score_and_active() {
        let conds = conditions(json!([
            {"field": "score", "op": "gt", "value": 10, "logicalOperator": "and"},
            {"field": "active", "op": "eq", "value": true}
        ]));
        assert!(evaluate_conditions(&conds, &vars(json!({"score": 15, "active": true}))));
        assert!(!evaluate_conditions(&conds, &vars(json!({"score": 5, "active": true}))));
    }

    #[test]
    fn test_or_uses_the_conditions_own_operator() {
        let conds = vec![
            StepCondition::new("a", ConditionOperator::Eq, json!(1)),
            StepCondition::new("b", ConditionOperator::Eq, json!(1)).or(),
            StepCondition::new("c", ConditionOperator::Eq, json!(1)),
        ];
        // (false || true) && true
        assert!(evaluate_conditions(&conds, &vars(json!({"a": 0, "b": 1, "c": 1}))));
        // (false || true) && false
        assert!(!evaluate_conditions(&conds, &vars(json!({"a": 0, "b": 1, "c": 0}))));
    }

    #[test]
    fn test_numeric_coercion() {
        let v = vars(json!({"count": "42", "ratio": 0.5}));
        assert!(evaluate_condition(
            &StepCondition::new("count", ConditionOperator::Gte, json!(42)),
            &v
        ));
        assert!(evaluate_condition(
            &StepCondition::new("count", ConditionOperator::Eq, json!(42)),
            &v
        ));
        assert!(evaluate_condition(
            &StepCondition::new("ratio", ConditionOperator::Lt, json!("1")),
            &v
        ));
        assert!(!evaluate_condition(
            &StepCondition::new("missing", ConditionOperator::Gt, json!(0)),
            &v
        ));
    }

    #[test]
    fn test_in_and_contains() {
        let v = vars(json!({"channel": "blog", "tags": ["ai", "rust"], "title": "Hello world"}));
        assert!(evaluate_condition(
            &StepCondition::new("channel", ConditionOperator::In, json!(["blog", "news"])),
            &v
        ));
        assert!(evaluate_condition(
            &StepCondition::new("tags", ConditionOperator::Contains, json!("rust")),
            &v
        ));
        assert!(evaluate_condition(
            &StepCondition::new("title", ConditionOperator::Contains, json!("world")),
            &v
        ));
        assert!(!evaluate_condition(
            &StepCondition::new("channel", ConditionOperator::In, json!("blog")),
            &v
        ));
    }

    #[test]
    fn test_dotted_lookup() {
        let v = vars(json!({"review": {"scores": [3, 9]}, "a.b": 1}));
        assert_eq!(lookup(&v, "review.scores.1"), Some(&json!(9)));
        assert_eq!(lookup(&v, "a.b"), Some(&json!(1)));
        assert_eq!(lookup(&v, "review.missing"), None);
    }

    #[test]
    fn test_empty_list_is_true() {
        assert!(evaluate_conditions(&[], &Map::new()));
    }
}
