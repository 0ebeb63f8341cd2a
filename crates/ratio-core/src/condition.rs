//! Condition evaluation for step readiness gating.
//!
//! Evaluation is total: a predicate whose `param` (or `value`) cannot be
//! resolved evaluates to `false`. Operator names are checked up front by
//! [`validate_tree`]; an unknown name is a configuration error, never a
//! silent `false`.

use std::fmt;
use std::str::FromStr;

use ratio_types::condition::{ConditionTree, Logic, Predicate};
use ratio_types::value::Value;

use crate::error::EngineError;
use crate::reference::{Reference, Resolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    Exists,
    NotExists,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    NotContains,
    In,
    NotIn,
    StartsWith,
    EndsWith,
}

impl FromStr for Operator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "equals" => Operator::Equals,
            "not_equals" => Operator::NotEquals,
            "exists" => Operator::Exists,
            "not_exists" => Operator::NotExists,
            "greater_than" => Operator::GreaterThan,
            "less_than" => Operator::LessThan,
            "greater_than_or_equal" => Operator::GreaterThanOrEqual,
            "less_than_or_equal" => Operator::LessThanOrEqual,
            "contains" => Operator::Contains,
            "not_contains" => Operator::NotContains,
            "in" => Operator::In,
            "not_in" => Operator::NotIn,
            "starts_with" => Operator::StartsWith,
            "ends_with" => Operator::EndsWith,
            other => return Err(EngineError::UnknownOperator(other.to_string())),
        };
        Ok(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Exists => "exists",
            Operator::NotExists => "not_exists",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::GreaterThanOrEqual => "greater_than_or_equal",
            Operator::LessThanOrEqual => "less_than_or_equal",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::In => "in",
            Operator::NotIn => "not_in",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
        };
        f.write_str(s)
    }
}

impl Operator {
    /// Apply the operator. Type mismatches evaluate to `false`.
    pub fn apply(&self, actual: &Value, expected: &Value) -> bool {
        match self {
            Operator::Equals => actual == expected,
            Operator::NotEquals => actual != expected,
            Operator::Exists => !actual.is_null(),
            Operator::NotExists => actual.is_null(),
            Operator::GreaterThan => numeric(actual, expected, |a, b| a > b),
            Operator::LessThan => numeric(actual, expected, |a, b| a < b),
            Operator::GreaterThanOrEqual => numeric(actual, expected, |a, b| a >= b),
            Operator::LessThanOrEqual => numeric(actual, expected, |a, b| a <= b),
            Operator::Contains => contains(actual, expected).unwrap_or(false),
            Operator::NotContains => contains(actual, expected).map(|c| !c).unwrap_or(false),
            Operator::In => contains(expected, actual).unwrap_or(false),
            Operator::NotIn => contains(expected, actual).map(|c| !c).unwrap_or(false),
            Operator::StartsWith => actual
                .to_display_string()
                .starts_with(&expected.to_display_string()),
            Operator::EndsWith => actual
                .to_display_string()
                .ends_with(&expected.to_display_string()),
        }
    }
}

fn numeric(actual: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.as_f64(), expected.as_f64()) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

/// Substring test for strings, membership for lists, key test for objects.
/// `None` when the haystack supports none of these.
fn contains(haystack: &Value, needle: &Value) -> Option<bool> {
    match haystack {
        Value::String(s) => Some(s.contains(needle.as_str()?)),
        Value::List(items) => Some(items.contains(needle)),
        Value::Object(map) => Some(map.contains_key(needle.as_str()?)),
        _ => None,
    }
}

/// Check that every operator in the tree is known.
pub fn validate_tree(tree: &ConditionTree) -> Result<(), EngineError> {
    for predicate in tree.predicates() {
        predicate.operator.parse::<Operator>()?;
    }
    Ok(())
}

/// Evaluate a condition tree.
///
/// Parameters that are `REF:` strings are resolved through `resolver`; how
/// references into skipped siblings behave is decided by the resolver's
/// configuration.
pub fn evaluate(tree: &ConditionTree, resolver: &Resolver<'_>) -> Result<bool, EngineError> {
    let operand = |value: &Value| resolve_operand(value, resolver);
    evaluate_with(tree, &operand, &operand)
}

/// Evaluate a tree with caller-supplied operand lookups.
///
/// `param` resolves each predicate's `param`, `value` its expected value;
/// either returns `None` when the operand cannot be resolved.
pub fn evaluate_with(
    tree: &ConditionTree,
    param: &dyn Fn(&Value) -> Option<Value>,
    value: &dyn Fn(&Value) -> Option<Value>,
) -> Result<bool, EngineError> {
    match tree {
        ConditionTree::Predicate(p) => evaluate_predicate(p, param, value),
        ConditionTree::All(trees) => {
            for t in trees {
                if !evaluate_with(t, param, value)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        ConditionTree::Group(group) => {
            let mut results = Vec::with_capacity(group.conditions.len() + group.groups.len());
            for t in group.conditions.iter().chain(group.groups.iter()) {
                results.push(evaluate_with(t, param, value)?);
            }
            if results.is_empty() {
                return Ok(true);
            }
            Ok(match group.logic {
                Logic::And => results.iter().all(|r| *r),
                Logic::Or => results.iter().any(|r| *r),
            })
        }
    }
}

fn evaluate_predicate(
    predicate: &Predicate,
    param: &dyn Fn(&Value) -> Option<Value>,
    value: &dyn Fn(&Value) -> Option<Value>,
) -> Result<bool, EngineError> {
    let operator: Operator = predicate.operator.parse()?;

    let Some(actual) = param(&predicate.param) else {
        return Ok(false);
    };
    let expected = match &predicate.value {
        Some(v) => match value(v) {
            Some(resolved) => resolved,
            None => return Ok(false),
        },
        None => Value::Null,
    };

    let result = operator.apply(&actual, &expected);
    tracing::debug!(
        operator = %operator,
        actual = %actual,
        expected = %expected,
        result,
        "evaluated predicate"
    );
    Ok(result)
}

fn resolve_operand(operand: &Value, resolver: &Resolver<'_>) -> Option<Value> {
    match operand {
        Value::String(s) if Reference::is_reference(s) => match resolver.resolve(s) {
            Ok(v) => Some(v),
            Err(err) => {
                tracing::warn!(reference = %s, error = %err, "condition reference unresolved, predicate is false");
                None
            }
        },
        other => Some(other.clone()),
    }
}
