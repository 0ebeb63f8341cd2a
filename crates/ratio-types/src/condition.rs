//! Condition trees gating step readiness and conditional requiredness.
//!
//! Three document shapes are accepted:
//! - a single predicate `{param, operator, value?}`
//! - a list of trees (AND-combined)
//! - a group `{logic, conditions, groups}` with arbitrary nesting
//!
//! Operators stay strings here; `ratio-core` parses them so an unknown name
//! surfaces as a configuration error instead of a deserialization failure.

use serde::{Deserialize, Serialize};

use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionTree {
    Predicate(Predicate),
    All(Vec<ConditionTree>),
    Group(ConditionGroup),
}

/// A single `{param, operator, value?}` comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    /// Literal, or a `REF:` string resolved before comparison.
    pub param: Value,
    pub operator: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<ConditionTree>,
    #[serde(default)]
    pub groups: Vec<ConditionTree>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Logic {
    #[default]
    And,
    Or,
}

impl ConditionTree {
    /// Visit every predicate in the tree, depth first.
    pub fn predicates(&self) -> Vec<&Predicate> {
        let mut out = Vec::new();
        self.collect_predicates(&mut out);
        out
    }

    fn collect_predicates<'a>(&'a self, out: &mut Vec<&'a Predicate>) {
        match self {
            ConditionTree::Predicate(p) => out.push(p),
            ConditionTree::All(trees) => trees.iter().for_each(|t| t.collect_predicates(out)),
            ConditionTree::Group(group) => {
                group
                    .conditions
                    .iter()
                    .chain(group.groups.iter())
                    .for_each(|t| t.collect_predicates(out));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_predicate() {
        let tree: ConditionTree = serde_json::from_str(
            r#"{"param": "REF:fetch.status_code", "operator": "equals", "value": 200}"#,
        )
        .unwrap();
        match tree {
            ConditionTree::Predicate(p) => {
                assert_eq!(p.operator, "equals");
                assert_eq!(p.value, Some(Value::from(200_i64)));
            }
            other => panic!("expected predicate, got {other:?}"),
        }
    }

    #[test]
    fn parses_list_as_all() {
        let tree: ConditionTree = serde_json::from_str(
            r#"[{"param": "a", "operator": "exists"}, {"param": "b", "operator": "exists"}]"#,
        )
        .unwrap();
        assert!(matches!(tree, ConditionTree::All(ref t) if t.len() == 2));
        assert_eq!(tree.predicates().len(), 2);
    }

    #[test]
    fn parses_nested_group() {
        let tree: ConditionTree = serde_json::from_str(
            r#"{
                "logic": "OR",
                "conditions": [{"param": "x", "operator": "exists"}],
                "groups": [{"conditions": [{"param": "y", "operator": "not_exists"}]}]
            }"#,
        )
        .unwrap();
        match &tree {
            ConditionTree::Group(g) => {
                assert_eq!(g.logic, Logic::Or);
                assert_eq!(g.groups.len(), 1);
            }
            other => panic!("expected group, got {other:?}"),
        }
        let ops: Vec<_> = tree.predicates().iter().map(|p| p.operator.clone()).collect();
        assert_eq!(ops, vec!["exists", "not_exists"]);
    }

    #[test]
    fn group_rejects_unknown_fields() {
        let result: Result<ConditionTree, _> =
            serde_json::from_str(r#"{"logic": "AND", "whatever": 1}"#);
        assert!(result.is_err());
    }
}
