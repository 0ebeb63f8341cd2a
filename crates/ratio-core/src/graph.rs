//! Dependency graph builder and cycle detection.
//!
//! Each step's dependencies are the sibling ids named by references in its
//! argument tree, condition tree, transform variables, and `iterate_over`,
//! unioned with its declared `dependencies`. The graph is a `petgraph`
//! `DiGraph` with edges from dependency to dependent; topological sort
//! rejects cycles before anything is dispatched.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use ratio_types::definition::{FieldSpec, StepDocument};

use crate::error::EngineError;
use crate::reference::{self, RefContext, Reference, ReferenceError};

/// Dependencies of a single step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDependencies {
    /// Every sibling the step waits on.
    pub all: BTreeSet<String>,
    /// Siblings whose status the step's conditions branch on. A failure of one
    /// of these does not fail the step.
    pub status_branches: BTreeSet<String>,
    /// `REF:arguments.<key>` keys the step reads.
    pub argument_keys: BTreeSet<String>,
}

/// Scan one step for references.
pub fn scan_step(step: &StepDocument) -> Result<StepDependencies, EngineError> {
    let mut refs: Vec<Reference> = Vec::new();
    let mut condition_refs: Vec<Reference> = Vec::new();

    for value in step.arguments.values() {
        reference::scan(value, &mut refs)?;
    }
    if let Some(tree) = &step.conditions {
        for predicate in tree.predicates() {
            reference::scan(&predicate.param, &mut condition_refs)?;
            if let Some(value) = &predicate.value {
                reference::scan(value, &mut condition_refs)?;
            }
        }
    }
    for block in [&step.transform_arguments, &step.transform_responses]
        .into_iter()
        .flatten()
    {
        for value in block.variables.values() {
            reference::scan(value, &mut refs)?;
        }
        for expression in block.transforms.values() {
            if Reference::is_reference(expression) {
                refs.push(Reference::parse(expression)?);
            }
        }
    }
    if let Some(parallel) = &step.parallel_execution {
        reference::scan(&parallel.iterate_over, &mut refs)?;
    }

    let mut deps = StepDependencies::default();
    for r in refs.iter().chain(condition_refs.iter()) {
        if let Some(id) = r.sibling_dependency() {
            deps.all.insert(id.to_string());
        }
        if r.context == RefContext::Arguments {
            deps.argument_keys.insert(r.key.clone());
        }
    }
    for r in &condition_refs {
        if r.context == RefContext::Execution {
            deps.status_branches.insert(r.key.clone());
        }
    }
    deps.all.extend(step.dependencies.iter().cloned());

    Ok(deps)
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Validated, acyclic dependency graph over one composite's steps.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
    steps: BTreeMap<String, StepDependencies>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build and validate the graph.
    ///
    /// `declared_arguments` is the composite's argument schema; when it is
    /// non-empty, references to undeclared arguments are rejected.
    pub fn build(
        steps: &[StepDocument],
        declared_arguments: &[FieldSpec],
    ) -> Result<Self, EngineError> {
        let mut graph = DiGraph::<String, ()>::new();
        let mut indices = HashMap::new();
        for step in steps {
            let idx = graph.add_node(step.execution_id.clone());
            indices.insert(step.execution_id.clone(), idx);
        }

        let mut scanned = BTreeMap::new();
        for step in steps {
            let deps = scan_step(step)?;

            if !declared_arguments.is_empty() {
                if let Some(key) = deps
                    .argument_keys
                    .iter()
                    .find(|k| !declared_arguments.iter().any(|a| &a.name == *k))
                {
                    return Err(ReferenceError::UnknownKey {
                        context: "arguments".to_string(),
                        key: key.clone(),
                    }
                    .into());
                }
            }

            let to = indices[&step.execution_id];
            for dep in &deps.all {
                let from = indices
                    .get(dep)
                    .ok_or_else(|| ReferenceError::UnknownExecution(dep.clone()))?;
                graph.add_edge(*from, to, ());
            }
            scanned.insert(step.execution_id.clone(), deps);
        }

        let sorted = toposort(&graph, None).map_err(|_| EngineError::CycleDetected {
            ids: cycle_members(&graph),
        })?;
        let order = sorted.into_iter().map(|idx| graph[idx].clone()).collect();

        Ok(Self {
            graph,
            indices,
            steps: scanned,
            order,
        })
    }

    /// Steps in a dependency-respecting order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies(&self, execution_id: &str) -> Option<&StepDependencies> {
        self.steps.get(execution_id)
    }

    /// Steps that directly depend on `execution_id`.
    pub fn dependents(&self, execution_id: &str) -> Vec<&str> {
        let Some(idx) = self.indices.get(execution_id) else {
            return Vec::new();
        };
        let mut out: Vec<&str> = self
            .graph
            .neighbors(*idx)
            .map(|n| self.graph[n].as_str())
            .collect();
        out.sort_unstable();
        out
    }

    /// Steps with no dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.steps.get(*id).is_some_and(|d| d.all.is_empty()))
            .map(String::as_str)
            .collect()
    }

    /// Group steps by depth: level 0 has no dependencies, level n depends on
    /// something at level n - 1.
    pub fn levels(&self) -> Vec<Vec<&str>> {
        let mut depths: HashMap<&str, usize> = HashMap::new();
        for id in &self.order {
            let depth = self.steps[id]
                .all
                .iter()
                .map(|dep| depths.get(dep.as_str()).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depths.insert(id.as_str(), depth);
        }
        let max_depth = depths.values().copied().max().unwrap_or(0);
        let mut levels: Vec<Vec<&str>> = vec![Vec::new(); if self.order.is_empty() { 0 } else { max_depth + 1 }];
        for id in &self.order {
            levels[depths[id.as_str()]].push(id);
        }
        levels
    }
}

/// Ids on any cycle: members of non-trivial SCCs plus self-loops.
fn cycle_members(graph: &DiGraph<String, ()>) -> Vec<String> {
    let mut ids: Vec<String> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|idx| graph[idx].clone())
        .collect();
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use ratio_types::definition::TypeName;
    use serde_json::json;

    use super::*;

    fn steps(json: serde_json::Value) -> Vec<StepDocument> {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn chain_scans_arguments_conditions_and_variables() {
        let steps = steps(json!([
            {"execution_id": "fetch", "definition_path": "/f.json"},
            {"execution_id": "transform", "definition_path": "/t.json",
             "arguments": {"raw": "REF:fetch.data"}},
            {"execution_id": "report", "definition_path": "/r.json",
             "conditions": [{"param": "REF:execution.transform.status", "operator": "equals", "value": "completed"}],
             "transform_arguments": {"variables": {"x": "REF:fetch.data"}, "transforms": {}}}
        ]));
        let graph = DependencyGraph::build(&steps, &[]).unwrap();

        assert_eq!(graph.topological_order()[0], "fetch");
        assert_eq!(graph.roots(), vec!["fetch"]);
        let report = graph.dependencies("report").unwrap();
        assert_eq!(
            report.all.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["fetch", "transform"]
        );
        assert!(report.status_branches.contains("transform"));
        assert_eq!(graph.dependents("fetch"), vec!["report", "transform"]);
        assert_eq!(graph.levels(), vec![vec!["fetch"], vec!["transform"], vec!["report"]]);
    }

    #[test]
    fn declared_dependencies_are_unioned() {
        let steps = steps(json!([
            {"execution_id": "a", "definition_path": "/a.json"},
            {"execution_id": "b", "definition_path": "/b.json", "dependencies": ["a"]}
        ]));
        let graph = DependencyGraph::build(&steps, &[]).unwrap();
        assert!(graph.dependencies("b").unwrap().all.contains("a"));
    }

    #[test]
    fn reference_cycle_names_members() {
        let steps = steps(json!([
            {"execution_id": "a", "definition_path": "/a.json", "arguments": {"x": "REF:c.out"}},
            {"execution_id": "b", "definition_path": "/b.json", "arguments": {"x": "REF:a.out"}},
            {"execution_id": "c", "definition_path": "/c.json", "arguments": {"x": "REF:b.out"}},
            {"execution_id": "d", "definition_path": "/d.json"}
        ]));
        assert_eq!(
            DependencyGraph::build(&steps, &[]).unwrap_err(),
            EngineError::CycleDetected {
                ids: vec!["a".to_string(), "b".to_string(), "c".to_string()]
            }
        );
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let steps = steps(json!([
            {"execution_id": "loop", "definition_path": "/l.json",
             "parallel_execution": {"iterate_over": "REF:loop.items", "child_argument_name": "item"}}
        ]));
        assert_eq!(
            DependencyGraph::build(&steps, &[]).unwrap_err(),
            EngineError::CycleDetected { ids: vec!["loop".to_string()] }
        );
    }

    #[test]
    fn unknown_sibling_is_invalid_reference() {
        let steps = steps(json!([
            {"execution_id": "a", "definition_path": "/a.json", "arguments": {"x": "REF:nowhere.out"}}
        ]));
        assert!(matches!(
            DependencyGraph::build(&steps, &[]),
            Err(EngineError::InvalidReference(ReferenceError::UnknownExecution(_)))
        ));
    }

    #[test]
    fn undeclared_argument_is_invalid_reference() {
        let steps = steps(json!([
            {"execution_id": "a", "definition_path": "/a.json", "arguments": {"x": "REF:arguments.typo"}}
        ]));
        let declared = vec![FieldSpec::new("query", TypeName::String)];
        assert!(matches!(
            DependencyGraph::build(&steps, &declared),
            Err(EngineError::InvalidReference(ReferenceError::UnknownKey { .. }))
        ));
        // Without a declared schema, argument keys are not checked.
        assert!(DependencyGraph::build(&steps, &[]).is_ok());
    }

    #[test]
    fn malformed_reference_fails_build() {
        let steps = steps(json!([
            {"execution_id": "a", "definition_path": "/a.json", "arguments": {"x": "REF:broken"}}
        ]));
        assert!(matches!(
            DependencyGraph::build(&steps, &[]),
            Err(EngineError::InvalidReference(ReferenceError::Malformed { .. }))
        ));
    }
}
