//! The per-composite execution state machine.
//!
//! An [`Instance`] owns the nodes of one composite invocation. Its public
//! transitions ([`start`](Instance::start),
//! [`handle_completion`](Instance::handle_completion),
//! [`terminate`](Instance::terminate),
//! [`terminate_node`](Instance::terminate_node)) never perform I/O: they
//! update node state and return the [`Effect`]s the runtime must carry out.
//! Every transition ends by re-running readiness until no node changes, and
//! once every node is terminal the instance resolves its response map.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use ratio_types::config::EngineConfig;
use ratio_types::definition::{Definition, ParallelExecution, StepDocument};
use ratio_types::process::ProcessStatus;
use ratio_types::storage::AccessToken;
use ratio_types::value::Value;
use uuid::Uuid;

use super::node::{ChildNode, ExecutionNode, NodeReport, NodeStatus, parse_target_id};
use crate::condition;
use crate::error::{EngineError, TransformPhase};
use crate::executor::{CompletionEvent, CompletionStatus};
use crate::graph::DependencyGraph;
use crate::reference::{ReferenceError, Resolver, SiblingState, SiblingView};
use crate::schema;
use crate::storage::{FileAccess, FileStore};
use crate::transform::{self, Registry, TransformLimits};

/// A step's loaded target definition.
#[derive(Debug, Clone)]
pub struct Target {
    pub definition: Arc<Definition>,
    /// Path the definition was loaded from, or `<inline>`.
    pub label: String,
}

impl Target {
    pub fn new(definition: Arc<Definition>, label: impl Into<String>) -> Self {
        Self {
            definition,
            label: label.into(),
        }
    }
}

/// Everything needed to build an instance.
pub struct InstanceSpec {
    pub instance_id: Uuid,
    pub process_id: Uuid,
    pub definition: Arc<Definition>,
    pub label: String,
    pub arguments: BTreeMap<String, Value>,
    /// Loaded target per `execution_id`.
    pub targets: HashMap<String, Target>,
    pub credential: Option<AccessToken>,
    pub store: Option<Arc<dyn FileStore>>,
    pub registry: Arc<Registry>,
    pub config: EngineConfig,
}

/// A unit of work for a primitive executor or a nested instance.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub execution_id: String,
    /// `execution_id`, or `execution_id[i]` for a fan-out child.
    pub target_id: String,
    pub process_id: Uuid,
    pub definition: Arc<Definition>,
    pub label: String,
    pub arguments: BTreeMap<String, Value>,
}

/// A node or fan-out child reached a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeFinished {
    pub target_id: String,
    /// `None` for fan-out parents, which have no process of their own.
    pub process_id: Option<Uuid>,
    pub label: String,
    pub status: NodeStatus,
    pub response: Option<Value>,
    pub reason: Option<String>,
}

/// Final state of an instance.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceOutcome {
    pub instance_id: Uuid,
    pub process_id: Uuid,
    pub status: ProcessStatus,
    pub response: Option<BTreeMap<String, Value>>,
    pub error: Option<String>,
    /// Every node, in dependency order. Completed siblings of a failed
    /// instance stay inspectable here.
    pub nodes: Vec<NodeReport>,
}

/// Work the runtime must perform after a transition.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Hand a primitive target to the executor.
    Dispatch(Invocation),
    /// Start a nested composite instance.
    Spawn(Invocation),
    /// Cancel dispatched work.
    Cancel { target_id: String, process_id: Uuid },
    NodeFinished(NodeFinished),
    Skipped { execution_id: String },
    Finished(InstanceOutcome),
}

pub struct Instance {
    instance_id: Uuid,
    process_id: Uuid,
    definition: Arc<Definition>,
    label: String,
    arguments: BTreeMap<String, Value>,
    graph: DependencyGraph,
    step_index: HashMap<String, usize>,
    nodes: HashMap<String, ExecutionNode>,
    targets: HashMap<String, Target>,
    credential: Option<AccessToken>,
    store: Option<Arc<dyn FileStore>>,
    registry: Arc<Registry>,
    config: EngineConfig,
    /// Failed or terminated nodes, in the order they ended.
    failures: Vec<String>,
    outcome: Option<InstanceOutcome>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("instance_id", &self.instance_id)
            .field("label", &self.label)
            .field("nodes", &self.nodes.len())
            .field("finished", &self.outcome.is_some())
            .finish()
    }
}

impl Instance {
    /// Validate the composite and its arguments and build the node set.
    ///
    /// Cycles, unknown siblings, unknown operators, and invalid arguments are
    /// reported here, before anything is dispatched.
    pub fn new(spec: InstanceSpec) -> Result<Self, EngineError> {
        let definition = spec.definition;
        if !definition.is_composite() {
            return Err(EngineError::InvalidDefinition(format!(
                "'{}' is not a composite definition",
                spec.label
            )));
        }
        let steps = definition.steps();
        let graph = DependencyGraph::build(steps, &definition.arguments)?;

        let mut step_index = HashMap::new();
        let mut nodes = HashMap::new();
        for (idx, step) in steps.iter().enumerate() {
            if let Some(tree) = &step.conditions {
                condition::validate_tree(tree)?;
            }
            if !spec.targets.contains_key(&step.execution_id) {
                return Err(EngineError::InvalidDefinition(format!(
                    "no target definition loaded for step '{}'",
                    step.execution_id
                )));
            }
            step_index.insert(step.execution_id.clone(), idx);
            nodes.insert(step.execution_id.clone(), ExecutionNode::new(&step.execution_id));
        }

        let arguments = schema::validate(&definition.arguments, spec.arguments)?;

        Ok(Self {
            instance_id: spec.instance_id,
            process_id: spec.process_id,
            definition,
            label: spec.label,
            arguments,
            graph,
            step_index,
            nodes,
            targets: spec.targets,
            credential: spec.credential,
            store: spec.store,
            registry: spec.registry,
            config: spec.config,
            failures: Vec::new(),
            outcome: None,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn process_id(&self) -> Uuid {
        self.process_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn node(&self, execution_id: &str) -> Option<&ExecutionNode> {
        self.nodes.get(execution_id)
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn outcome(&self) -> Option<&InstanceOutcome> {
        self.outcome.as_ref()
    }

    /// Dispatch every step whose dependencies are already satisfied.
    pub fn start(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.advance(&mut effects);
        effects
    }

    /// Apply an executor (or nested instance) report.
    ///
    /// Completions for unknown targets, for targets that are not currently
    /// dispatched, or for a finished instance are ignored, which makes
    /// redelivery harmless.
    pub fn handle_completion(&mut self, event: CompletionEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.outcome.is_some() {
            tracing::debug!(
                instance_id = %self.instance_id,
                target_id = %event.target_id,
                "completion after instance finished ignored"
            );
            return effects;
        }

        let (execution_id, index) = parse_target_id(&event.target_id);
        let execution_id = execution_id.to_string();
        let Some(node) = self.nodes.get(&execution_id) else {
            tracing::warn!(
                instance_id = %self.instance_id,
                target_id = %event.target_id,
                "completion for unknown target ignored"
            );
            return effects;
        };

        let dispatched = match index {
            None => !node.is_parallel() && node.status == NodeStatus::Dispatched,
            Some(i) => node.children.get(i).is_some_and(|child| {
                child.status == NodeStatus::Dispatched && child.target_id == event.target_id
            }),
        };
        if !dispatched {
            tracing::debug!(
                instance_id = %self.instance_id,
                target_id = %event.target_id,
                "duplicate or unexpected completion ignored"
            );
            return effects;
        }

        let result = self.finalize_output(&execution_id, &event);
        match index {
            None => match result {
                Ok(output) => self.complete_node(&execution_id, output, &mut effects),
                Err(err) => self.fail_node(&execution_id, err.to_string(), &mut effects),
            },
            Some(i) => {
                self.finish_child(&execution_id, i, result, &mut effects);
                self.settle_fan_out(&execution_id, &mut effects);
            }
        }

        self.advance(&mut effects);
        effects
    }

    /// Terminate every non-terminal node and finish the instance.
    pub fn terminate(&mut self, reason: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        if self.outcome.is_some() {
            return effects;
        }
        tracing::info!(instance_id = %self.instance_id, reason, "terminating instance");

        for id in self.graph.topological_order().to_vec() {
            self.terminate_one(&id, &mut effects);
        }
        self.finish(ProcessStatus::Terminated, None, Some(reason.to_string()), &mut effects);
        effects
    }

    /// Terminate one node. Its dependents then fail unless they branch on
    /// its status.
    pub fn terminate_node(&mut self, execution_id: &str) -> Result<Vec<Effect>, EngineError> {
        if !self.nodes.contains_key(execution_id) {
            return Err(ReferenceError::UnknownExecution(execution_id.to_string()).into());
        }
        let mut effects = Vec::new();
        if self.outcome.is_some() {
            return Ok(effects);
        }
        self.terminate_one(execution_id, &mut effects);
        self.advance(&mut effects);
        Ok(effects)
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    /// Promote, gate, and dispatch pending nodes until nothing changes, then
    /// check for the fixed point.
    fn advance(&mut self, effects: &mut Vec<Effect>) {
        if self.outcome.is_some() {
            return;
        }
        loop {
            let mut progressed = false;
            for id in self.graph.topological_order().to_vec() {
                if self.nodes[&id].status != NodeStatus::Pending {
                    continue;
                }
                let Some(deps) = self.graph.dependencies(&id).cloned() else {
                    continue;
                };
                if deps.all.iter().any(|d| !self.nodes[d].status.is_terminal()) {
                    continue;
                }
                progressed = true;
                self.set_status(&id, NodeStatus::Ready);

                let unhandled = deps.all.iter().find(|d| {
                    self.nodes[*d].status.is_unsuccessful() && !deps.status_branches.contains(*d)
                });
                if let Some(dep) = unhandled {
                    let reason = format!("dependency '{dep}' did not complete");
                    self.fail_node(&id, reason, effects);
                    continue;
                }
                for dep in &deps.status_branches {
                    if let Some(node) = self.nodes.get_mut(dep) {
                        if node.status.is_unsuccessful() {
                            node.failure_handled = true;
                        }
                    }
                }

                self.activate(&id, effects);
            }
            if !progressed {
                break;
            }
        }
        self.check_fixed_point(effects);
    }

    /// Gate a READY node on its conditions and dispatch it.
    fn activate(&mut self, id: &str, effects: &mut Vec<Effect>) {
        let definition = Arc::clone(&self.definition);
        let step = &definition.steps()[self.step_index[id]];
        let Some(target) = self.targets.get(id).cloned() else {
            self.fail_node(id, format!("no target definition loaded for step '{id}'"), effects);
            return;
        };

        if let Some(tree) = &step.conditions {
            let verdict = {
                let files = self.file_access();
                let resolver = Resolver::new(&self.arguments, self, &files).absent_outputs_as_null();
                condition::evaluate(tree, &resolver)
            };
            match verdict {
                Ok(true) => {}
                Ok(false) => {
                    self.skip_node(id, effects);
                    return;
                }
                Err(err) => {
                    self.fail_node(id, err.to_string(), effects);
                    return;
                }
            }
        }

        if let Some(parallel) = &step.parallel_execution {
            self.fan_out(step, parallel, &target, effects);
            return;
        }

        match self.prepare_arguments(step, &target, None) {
            Ok(arguments) => {
                let invocation = self.invocation(id, id.to_string(), &target, arguments.clone());
                if let Some(node) = self.nodes.get_mut(id) {
                    node.status = NodeStatus::Dispatched;
                    node.process_id = Some(invocation.process_id);
                    node.arguments = Some(arguments);
                }
                effects.push(dispatch_effect(invocation));
            }
            Err(err) => self.fail_node(id, err.to_string(), effects),
        }
    }

    fn fan_out(
        &mut self,
        step: &StepDocument,
        parallel: &ParallelExecution,
        target: &Target,
        effects: &mut Vec<Effect>,
    ) {
        let id = step.execution_id.as_str();
        let resolved = {
            let files = self.file_access();
            let resolver = Resolver::new(&self.arguments, self, &files).absent_outputs_as_null();
            resolver.resolve_value(&parallel.iterate_over)
        };
        let items = match resolved {
            Ok(Value::List(items)) => items,
            Ok(other) => {
                let reason = format!("iterate_over must be a list, got {}", other.kind());
                self.fail_node(id, reason, effects);
                return;
            }
            Err(err) => {
                self.fail_node(id, EngineError::from(err).to_string(), effects);
                return;
            }
        };

        if items.len() > self.config.max_parallel_children {
            let reason = format!(
                "fan-out of {} children exceeds the limit of {}",
                items.len(),
                self.config.max_parallel_children
            );
            self.fail_node(id, reason, effects);
            return;
        }

        if items.is_empty() {
            let output = target
                .definition
                .responses
                .iter()
                .map(|r| (r.name.clone(), Value::List(Vec::new())))
                .collect();
            if let Some(node) = self.nodes.get_mut(id) {
                node.result = Some(Value::List(Vec::new()));
            }
            self.complete_node(id, output, effects);
            return;
        }

        tracing::debug!(
            instance_id = %self.instance_id,
            execution_id = %id,
            children = items.len(),
            "fanning out"
        );
        if let Some(node) = self.nodes.get_mut(id) {
            node.status = NodeStatus::Dispatched;
            node.children = (0..items.len()).map(|i| ChildNode::new(id, i)).collect();
        }

        for (i, item) in items.into_iter().enumerate() {
            let prepared =
                self.prepare_arguments(step, target, Some((parallel.child_argument_name.as_str(), item)));
            match prepared {
                Ok(arguments) => {
                    let target_id = self.nodes[id].children[i].target_id.clone();
                    let invocation = self.invocation(id, target_id, target, arguments);
                    if let Some(child) = self.nodes.get_mut(id).and_then(|n| n.children.get_mut(i)) {
                        child.status = NodeStatus::Dispatched;
                        child.process_id = Some(invocation.process_id);
                    }
                    effects.push(dispatch_effect(invocation));
                }
                Err(err) => self.finish_child(id, i, Err(err), effects),
            }
        }
        self.settle_fan_out(id, effects);
    }

    /// Resolve, transform, and validate a step's arguments.
    fn prepare_arguments(
        &self,
        step: &StepDocument,
        target: &Target,
        binding: Option<(&str, Value)>,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        let files = self.file_access();
        let resolver = Resolver::new(&self.arguments, self, &files).absent_outputs_as_null();
        let mut resolved = resolver.resolve_map(&step.arguments)?;
        if let Some((name, value)) = binding {
            resolved.insert(name.to_string(), value);
        }

        let Some(block) = &step.transform_arguments else {
            return Ok(schema::validate(&target.definition.arguments, resolved)?);
        };
        let transformed = {
            let resolver = Resolver::new(&self.arguments, self, &files)
                .with_payload(&resolved)
                .absent_outputs_as_null();
            transform::apply_block(block, &resolved, &resolver, &self.registry, self.limits())?
        };
        schema::validate(&target.definition.arguments, transformed).map_err(|source| {
            EngineError::TransformValidation {
                phase: TransformPhase::Arguments,
                source,
            }
        })
    }

    /// Turn a completion into a validated response map.
    fn finalize_output(
        &self,
        execution_id: &str,
        event: &CompletionEvent,
    ) -> Result<BTreeMap<String, Value>, EngineError> {
        if event.status == CompletionStatus::Failed {
            return Err(EngineError::ChildExecutionFailure {
                execution_id: event.target_id.clone(),
                reason: event
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "no reason given".to_string()),
            });
        }
        let payload = match &event.result {
            None | Some(Value::Null) => BTreeMap::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(EngineError::ChildExecutionFailure {
                    execution_id: event.target_id.clone(),
                    reason: format!("result must be an object, got {}", other.kind()),
                });
            }
        };

        let definition = Arc::clone(&self.definition);
        let step = &definition.steps()[self.step_index[execution_id]];
        let responses = self
            .targets
            .get(execution_id)
            .map(|t| t.definition.responses.clone())
            .unwrap_or_default();

        let Some(block) = &step.transform_responses else {
            return Ok(schema::validate(&responses, payload)?);
        };
        let files = self.file_access();
        let transformed = {
            let resolver = Resolver::new(&self.arguments, self, &files)
                .with_payload(&payload)
                .absent_outputs_as_null();
            transform::apply_block(block, &payload, &resolver, &self.registry, self.limits())?
        };
        schema::validate(&responses, transformed).map_err(|source| EngineError::TransformValidation {
            phase: TransformPhase::Responses,
            source,
        })
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    fn set_status(&mut self, id: &str, status: NodeStatus) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.status = status;
        }
    }

    fn complete_node(&mut self, id: &str, output: BTreeMap<String, Value>, effects: &mut Vec<Effect>) {
        let label = self.target_label(id);
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.status = NodeStatus::Completed;
        if !node.is_parallel() {
            node.process_id.get_or_insert_with(Uuid::now_v7);
            node.result = node.result.take().or_else(|| Some(Value::Object(output.clone())));
        }
        node.output = Some(output.clone());
        let finished = NodeFinished {
            target_id: id.to_string(),
            process_id: node.process_id,
            label,
            status: NodeStatus::Completed,
            response: Some(Value::Object(output)),
            reason: None,
        };
        effects.push(Effect::NodeFinished(finished));
    }

    fn fail_node(&mut self, id: &str, reason: String, effects: &mut Vec<Effect>) {
        self.end_node(id, NodeStatus::Failed, Some(reason), effects);
    }

    fn skip_node(&mut self, id: &str, effects: &mut Vec<Effect>) {
        tracing::debug!(instance_id = %self.instance_id, execution_id = %id, "conditions not met");
        self.end_node(id, NodeStatus::Skipped, None, effects);
        effects.push(Effect::Skipped {
            execution_id: id.to_string(),
        });
    }

    /// Move a node to FAILED, SKIPPED, or TERMINATED.
    fn end_node(&mut self, id: &str, status: NodeStatus, reason: Option<String>, effects: &mut Vec<Effect>) {
        let label = self.target_label(id);
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.status = status;
        node.error = reason.clone();
        if !node.is_parallel() {
            node.process_id.get_or_insert_with(Uuid::now_v7);
        }
        if status.is_unsuccessful() {
            if let Some(reason) = &reason {
                tracing::warn!(instance_id = %self.instance_id, execution_id = %id, status = %status, reason = %reason, "node did not complete");
            }
            self.failures.push(id.to_string());
        }
        effects.push(Effect::NodeFinished(NodeFinished {
            target_id: id.to_string(),
            process_id: node.process_id,
            label,
            status,
            response: None,
            reason,
        }));
    }

    fn finish_child(
        &mut self,
        id: &str,
        index: usize,
        result: Result<BTreeMap<String, Value>, EngineError>,
        effects: &mut Vec<Effect>,
    ) {
        let label = self.target_label(id);
        let Some(child) = self.nodes.get_mut(id).and_then(|n| n.children.get_mut(index)) else {
            return;
        };
        let process_id = *child.process_id.get_or_insert_with(Uuid::now_v7);
        let finished = match result {
            Ok(output) => {
                child.status = NodeStatus::Completed;
                child.output = Some(output.clone());
                NodeFinished {
                    target_id: child.target_id.clone(),
                    process_id: Some(process_id),
                    label,
                    status: NodeStatus::Completed,
                    response: Some(Value::Object(output)),
                    reason: None,
                }
            }
            Err(err) => {
                child.status = NodeStatus::Failed;
                child.error = Some(err.to_string());
                NodeFinished {
                    target_id: child.target_id.clone(),
                    process_id: Some(process_id),
                    label,
                    status: NodeStatus::Failed,
                    response: None,
                    reason: child.error.clone(),
                }
            }
        };
        effects.push(Effect::NodeFinished(finished));
    }

    /// Close a fan-out parent once every child is terminal.
    fn settle_fan_out(&mut self, id: &str, effects: &mut Vec<Effect>) {
        let node = &self.nodes[id];
        if node.status.is_terminal() || !node.children.iter().all(|c| c.status.is_terminal()) {
            return;
        }

        if let Some(child) = node.children.iter().find(|c| c.status.is_unsuccessful()) {
            let reason = format!(
                "child '{}' {}: {}",
                child.target_id,
                child.status,
                child.error.as_deref().unwrap_or("no reason given")
            );
            self.fail_node(id, reason, effects);
            return;
        }

        let declared: Vec<String> = self
            .targets
            .get(id)
            .map(|t| t.definition.responses.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default();
        let keys: BTreeSet<String> = if declared.is_empty() {
            node.children
                .iter()
                .flat_map(|c| c.output.iter().flat_map(|o| o.keys().cloned()))
                .collect()
        } else {
            declared.into_iter().collect()
        };

        let outputs: Vec<BTreeMap<String, Value>> = node
            .children
            .iter()
            .map(|c| c.output.clone().unwrap_or_default())
            .collect();
        let merged = keys
            .into_iter()
            .map(|key| {
                let column = outputs
                    .iter()
                    .map(|o| o.get(&key).cloned().unwrap_or_default())
                    .collect();
                (key, Value::List(column))
            })
            .collect();
        let result = Value::List(outputs.into_iter().map(Value::Object).collect());

        if let Some(node) = self.nodes.get_mut(id) {
            node.result = Some(result);
        }
        self.complete_node(id, merged, effects);
    }

    fn terminate_one(&mut self, id: &str, effects: &mut Vec<Effect>) {
        let label = self.target_label(id);
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if node.status.is_terminal() {
            return;
        }
        if node.status == NodeStatus::Dispatched {
            match node.process_id {
                Some(process_id) if !node.is_parallel() => effects.push(Effect::Cancel {
                    target_id: id.to_string(),
                    process_id,
                }),
                _ => {}
            }
            for child in node.children.iter_mut().filter(|c| !c.status.is_terminal()) {
                child.status = NodeStatus::Terminated;
                child.error = Some("terminated".to_string());
                if let Some(process_id) = child.process_id {
                    effects.push(Effect::Cancel {
                        target_id: child.target_id.clone(),
                        process_id,
                    });
                }
                effects.push(Effect::NodeFinished(NodeFinished {
                    target_id: child.target_id.clone(),
                    process_id: child.process_id,
                    label: label.clone(),
                    status: NodeStatus::Terminated,
                    response: None,
                    reason: child.error.clone(),
                }));
            }
        }
        self.end_node(id, NodeStatus::Terminated, Some("terminated".to_string()), effects);
    }

    // -----------------------------------------------------------------------
    // Fixed point
    // -----------------------------------------------------------------------

    fn check_fixed_point(&mut self, effects: &mut Vec<Effect>) {
        if self.outcome.is_some() || !self.nodes.values().all(|n| n.status.is_terminal()) {
            return;
        }

        let unhandled = self
            .failures
            .iter()
            .find(|id| !self.nodes[id.as_str()].failure_handled)
            .cloned();
        if let Some(id) = unhandled {
            let node = &self.nodes[&id];
            let reason = format!(
                "step '{id}' {}: {}",
                node.status,
                node.error.as_deref().unwrap_or("no reason given")
            );
            self.finish(ProcessStatus::Failed, None, Some(reason), effects);
            return;
        }

        match self.resolve_response() {
            Ok(response) => self.finish(ProcessStatus::Completed, Some(response), None, effects),
            Err(err) => self.finish(ProcessStatus::Failed, None, Some(err.to_string()), effects),
        }
    }

    /// Resolve the response-reference map against terminal siblings.
    ///
    /// A reference into a sibling without output falls back to the
    /// response's default when the response is optional and has one.
    fn resolve_response(&self) -> Result<BTreeMap<String, Value>, EngineError> {
        let files = self.file_access();
        let resolver = Resolver::new(&self.arguments, self, &files);
        let mut resolved = BTreeMap::new();
        if let Some(map) = &self.definition.response_reference_map {
            for (name, expression) in map {
                let value = match resolver.resolve_value(expression) {
                    Ok(value) => value,
                    Err(err @ ReferenceError::NoOutput { .. }) => {
                        match self.definition.response(name) {
                            Some(spec) if !spec.required && spec.default_value.is_some() => {
                                tracing::debug!(response = %name, "using default for response without output");
                                Value::Null
                            }
                            _ => return Err(err.into()),
                        }
                    }
                    Err(err) => return Err(err.into()),
                };
                resolved.insert(name.clone(), value);
            }
        }
        Ok(schema::validate(&self.definition.responses, resolved)?)
    }

    fn finish(
        &mut self,
        status: ProcessStatus,
        response: Option<BTreeMap<String, Value>>,
        error: Option<String>,
        effects: &mut Vec<Effect>,
    ) {
        let nodes = self
            .graph
            .topological_order()
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(NodeReport::from)
            .collect();
        let outcome = InstanceOutcome {
            instance_id: self.instance_id,
            process_id: self.process_id,
            status,
            response,
            error,
            nodes,
        };
        tracing::info!(
            instance_id = %self.instance_id,
            status = %outcome.status,
            error = outcome.error.as_deref().unwrap_or(""),
            "instance reached fixed point"
        );
        self.outcome = Some(outcome.clone());
        effects.push(Effect::Finished(outcome));
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn file_access(&self) -> FileAccess<'_> {
        FileAccess::new(self.store.as_deref(), self.credential.as_ref())
    }

    fn limits(&self) -> TransformLimits {
        TransformLimits::from(&self.config)
    }

    fn target_label(&self, id: &str) -> String {
        self.targets
            .get(id)
            .map(|t| t.label.clone())
            .unwrap_or_default()
    }

    fn invocation(
        &self,
        execution_id: &str,
        target_id: String,
        target: &Target,
        arguments: BTreeMap<String, Value>,
    ) -> Invocation {
        Invocation {
            execution_id: execution_id.to_string(),
            target_id,
            process_id: Uuid::now_v7(),
            definition: Arc::clone(&target.definition),
            label: target.label.clone(),
            arguments,
        }
    }
}

fn dispatch_effect(invocation: Invocation) -> Effect {
    if invocation.definition.is_composite() {
        Effect::Spawn(invocation)
    } else {
        Effect::Dispatch(invocation)
    }
}

impl SiblingView for Instance {
    fn sibling(&self, execution_id: &str) -> SiblingState<'_> {
        let Some(node) = self.nodes.get(execution_id) else {
            return SiblingState::Unknown;
        };
        match node.status {
            NodeStatus::Completed => match &node.output {
                Some(output) => SiblingState::Output(output),
                None => SiblingState::NoOutput(ProcessStatus::Completed),
            },
            NodeStatus::Failed | NodeStatus::Skipped | NodeStatus::Terminated => {
                SiblingState::NoOutput(node.status.process_status())
            }
            NodeStatus::Pending | NodeStatus::Ready | NodeStatus::Dispatched => SiblingState::Pending,
        }
    }

    fn sibling_status(&self, execution_id: &str) -> Option<&'static str> {
        self.nodes.get(execution_id).map(|n| n.status.as_str())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::reference::testing::object;

    fn echo() -> Arc<Definition> {
        Arc::new(serde_json::from_value(json!({"system_event_endpoint": "echo"})).unwrap())
    }

    fn typed() -> Arc<Definition> {
        Arc::new(
            serde_json::from_value(json!({
                "system_event_endpoint": "count",
                "arguments": [{"name": "count", "type_name": "integer"}],
                "responses": [{"name": "total", "type_name": "integer"}]
            }))
            .unwrap(),
        )
    }

    fn build(definition: serde_json::Value, arguments: serde_json::Value) -> Result<Instance, EngineError> {
        let definition: Arc<Definition> = Arc::new(serde_json::from_value(definition).unwrap());
        let targets = definition
            .steps()
            .iter()
            .map(|step| {
                let target = match (&step.inline_definition, step.definition_path.as_deref()) {
                    (Some(inline), _) => Target::new(Arc::new((**inline).clone()), "<inline>"),
                    (None, Some("/tools/typed.json")) => Target::new(typed(), "/tools/typed.json"),
                    (None, path) => Target::new(echo(), path.unwrap_or_default()),
                };
                (step.execution_id.clone(), target)
            })
            .collect();
        Instance::new(InstanceSpec {
            instance_id: Uuid::now_v7(),
            process_id: Uuid::now_v7(),
            definition,
            label: "/agents/test.json".to_string(),
            arguments: object(arguments),
            targets,
            credential: None,
            store: None,
            registry: Arc::new(Registry::with_builtins().unwrap()),
            config: EngineConfig::default(),
        })
    }

    fn dispatched(effects: &[Effect]) -> Vec<&Invocation> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Dispatch(inv) | Effect::Spawn(inv) => Some(inv),
                _ => None,
            })
            .collect()
    }

    fn outcome(effects: &[Effect]) -> Option<&InstanceOutcome> {
        effects.iter().find_map(|e| match e {
            Effect::Finished(outcome) => Some(outcome),
            _ => None,
        })
    }

    fn done(target_id: &str, result: serde_json::Value) -> CompletionEvent {
        CompletionEvent {
            target_id: target_id.to_string(),
            status: CompletionStatus::Completed,
            result: Some(Value::from(result)),
            failure_reason: None,
        }
    }

    fn failed(target_id: &str, reason: &str) -> CompletionEvent {
        CompletionEvent {
            target_id: target_id.to_string(),
            status: CompletionStatus::Failed,
            result: None,
            failure_reason: Some(reason.to_string()),
        }
    }

    #[test]
    fn chain_dispatches_in_dependency_order() {
        let mut instance = build(
            json!({
                "arguments": [{"name": "url", "type_name": "string"}],
                "responses": [{"name": "report", "type_name": "string"}],
                "instructions": [
                    {"execution_id": "fetch", "definition_path": "/tools/fetch.json",
                     "arguments": {"url": "REF:arguments.url"}},
                    {"execution_id": "transform", "definition_path": "/tools/transform.json",
                     "arguments": {"raw": "REF:fetch.data"},
                     "transform_responses": {
                         "transforms": {"names": "join(map(people, 'item.name'), ', ')"}
                     }},
                    {"execution_id": "report", "definition_path": "/tools/report.json",
                     "arguments": {"names": "REF:transform.names"}}
                ],
                "response_reference_map": {"report": "REF:report.text"}
            }),
            json!({"url": "https://example.test"}),
        )
        .unwrap();

        let effects = instance.start();
        let first = dispatched(&effects);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].target_id, "fetch");
        assert_eq!(first[0].arguments["url"], Value::from("https://example.test"));

        let effects = instance.handle_completion(done("fetch", json!({"data": "payload"})));
        let second = dispatched(&effects);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].target_id, "transform");
        assert_eq!(second[0].arguments["raw"], Value::from("payload"));

        let effects = instance.handle_completion(done(
            "transform",
            json!({"people": [{"name": "Alice"}, {"name": "Bob"}]}),
        ));
        let third = dispatched(&effects);
        assert_eq!(third[0].target_id, "report");
        assert_eq!(third[0].arguments["names"], Value::from("Alice, Bob"));

        let effects = instance.handle_completion(done("report", json!({"text": "Alice, Bob ok"})));
        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.status, ProcessStatus::Completed);
        assert_eq!(outcome.response.as_ref().unwrap()["report"], Value::from("Alice, Bob ok"));
        assert_eq!(
            outcome.nodes.iter().map(|n| n.execution_id.as_str()).collect::<Vec<_>>(),
            vec!["fetch", "transform", "report"]
        );
    }

    #[test]
    fn duplicate_and_unknown_completions_are_ignored() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "a", "definition_path": "/a.json"},
                {"execution_id": "b", "definition_path": "/b.json", "arguments": {"x": "REF:a.x"}}
            ]}),
            json!({}),
        )
        .unwrap();
        instance.start();

        let effects = instance.handle_completion(done("a", json!({"x": 1})));
        assert_eq!(dispatched(&effects).len(), 1);
        assert!(instance.handle_completion(done("a", json!({"x": 2}))).is_empty());
        assert!(instance.handle_completion(done("ghost", json!({}))).is_empty());
        // `b` is dispatched, `a` keeps its first output.
        assert_eq!(instance.node("a").unwrap().output.as_ref().unwrap()["x"], Value::from(1_i64));
        assert_eq!(instance.node("b").unwrap().status, NodeStatus::Dispatched);

        let effects = instance.handle_completion(done("b", json!({})));
        assert!(instance.is_finished());
        assert_eq!(outcome(&effects).unwrap().status, ProcessStatus::Completed);
        assert!(instance.handle_completion(done("b", json!({}))).is_empty());
    }

    #[test]
    fn independent_steps_fan_out_together() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "a", "definition_path": "/a.json"},
                {"execution_id": "b", "definition_path": "/b.json"},
                {"execution_id": "c", "definition_path": "/c.json", "dependencies": ["a", "b"]}
            ]}),
            json!({}),
        )
        .unwrap();
        let effects = instance.start();
        assert_eq!(dispatched(&effects).len(), 2);
        // Out of order.
        assert!(dispatched(&instance.handle_completion(done("b", json!({})))).is_empty());
        let effects = instance.handle_completion(done("a", json!({})));
        assert_eq!(dispatched(&effects)[0].target_id, "c");
    }

    #[test]
    fn skipped_dependency_resolves_null_and_proceeds() {
        let mut instance = build(
            json!({
                "arguments": [{"name": "mode", "type_name": "string"}],
                "responses": [{"name": "extra", "required": false, "default_value": "none"}],
                "instructions": [
                    {"execution_id": "optional", "definition_path": "/o.json",
                     "conditions": [{"param": "REF:arguments.mode", "operator": "equals", "value": "full"}]},
                    {"execution_id": "after", "definition_path": "/a.json",
                     "arguments": {"value": "REF:optional.value"}}
                ],
                "response_reference_map": {"extra": "REF:optional.value"}
            }),
            json!({"mode": "quick"}),
        )
        .unwrap();

        let effects = instance.start();
        assert!(effects.iter().any(|e| matches!(e, Effect::Skipped { execution_id } if execution_id == "optional")));
        let after = dispatched(&effects);
        assert_eq!(after[0].target_id, "after");
        assert_eq!(after[0].arguments["value"], Value::Null);

        let effects = instance.handle_completion(done("after", json!({})));
        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.status, ProcessStatus::Completed);
        assert_eq!(outcome.response.as_ref().unwrap()["extra"], Value::from("none"));
    }

    #[test]
    fn response_without_output_and_default_fails_instance() {
        let mut instance = build(
            json!({
                "responses": [{"name": "value"}],
                "instructions": [
                    {"execution_id": "never", "definition_path": "/n.json",
                     "conditions": [{"param": 1, "operator": "equals", "value": 2}]}
                ],
                "response_reference_map": {"value": "REF:never.value"}
            }),
            json!({}),
        )
        .unwrap();
        let effects = instance.start();
        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.status, ProcessStatus::Failed);
        assert!(outcome.error.as_ref().unwrap().contains("never"));
    }

    #[test]
    fn failure_propagates_to_dependents() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "fetch", "definition_path": "/f.json"},
                {"execution_id": "use", "definition_path": "/u.json", "arguments": {"x": "REF:fetch.x"}},
                {"execution_id": "other", "definition_path": "/o.json"}
            ]}),
            json!({}),
        )
        .unwrap();
        instance.start();
        let effects = instance.handle_completion(failed("fetch", "timeout"));
        assert!(dispatched(&effects).is_empty());
        assert_eq!(instance.node("use").unwrap().status, NodeStatus::Failed);
        assert!(!instance.is_finished());

        let effects = instance.handle_completion(done("other", json!({"ok": true})));
        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.status, ProcessStatus::Failed);
        assert!(outcome.error.as_ref().unwrap().contains("fetch"));
        assert!(outcome.error.as_ref().unwrap().contains("timeout"));
        // Partial results stay inspectable.
        let other = outcome.nodes.iter().find(|n| n.execution_id == "other").unwrap();
        assert_eq!(other.status, NodeStatus::Completed);
    }

    #[test]
    fn status_branch_isolates_failure() {
        let mut instance = build(
            json!({
                "responses": [{"name": "note"}],
                "instructions": [
                    {"execution_id": "risky", "definition_path": "/r.json"},
                    {"execution_id": "fallback", "definition_path": "/f.json",
                     "conditions": [{"param": "REF:execution.risky.status", "operator": "equals", "value": "failed"}]}
                ],
                "response_reference_map": {"note": "REF:fallback.note"}
            }),
            json!({}),
        )
        .unwrap();
        instance.start();
        let effects = instance.handle_completion(failed("risky", "boom"));
        assert_eq!(dispatched(&effects)[0].target_id, "fallback");
        assert!(instance.node("risky").unwrap().failure_handled);

        let effects = instance.handle_completion(done("fallback", json!({"note": "recovered"})));
        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.status, ProcessStatus::Completed);
        assert_eq!(outcome.response.as_ref().unwrap()["note"], Value::from("recovered"));
    }

    #[test]
    fn parallel_children_collect_in_iteration_order() {
        let mut instance = build(
            json!({
                "arguments": [{"name": "counts", "type_name": "list"}],
                "responses": [{"name": "totals", "type_name": "list"}],
                "instructions": [
                    {"execution_id": "each", "definition_path": "/tools/typed.json",
                     "parallel_execution": {"iterate_over": "REF:arguments.counts", "child_argument_name": "count"}}
                ],
                "response_reference_map": {"totals": "REF:each.total"}
            }),
            json!({"counts": [1, 2, 3]}),
        )
        .unwrap();

        let effects = instance.start();
        let children = dispatched(&effects);
        assert_eq!(
            children.iter().map(|c| c.target_id.as_str()).collect::<Vec<_>>(),
            vec!["each[0]", "each[1]", "each[2]"]
        );
        assert_eq!(children[1].arguments["count"], Value::from(2_i64));

        instance.handle_completion(done("each[2]", json!({"total": 30})));
        instance.handle_completion(done("each[0]", json!({"total": 10})));
        assert!(instance.handle_completion(done("each[0]", json!({"total": 99}))).is_empty());
        for spelling in ["each[01]", "each[+1]"] {
            assert!(instance.handle_completion(done(spelling, json!({"total": 99}))).is_empty());
        }
        assert_eq!(instance.node("each").unwrap().children[1].status, NodeStatus::Dispatched);
        let effects = instance.handle_completion(done("each[1]", json!({"total": 20})));

        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.status, ProcessStatus::Completed);
        assert_eq!(
            outcome.response.as_ref().unwrap()["totals"],
            Value::from(json!([10, 20, 30]))
        );
        assert_eq!(
            instance.node("each").unwrap().result,
            Some(Value::from(json!([{"total": 10}, {"total": 20}, {"total": 30}])))
        );
    }

    #[test]
    fn parallel_child_failure_fails_parent_after_all_children() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "each", "definition_path": "/e.json",
                 "parallel_execution": {"iterate_over": ["a", "b"], "child_argument_name": "item"}}
            ]}),
            json!({}),
        )
        .unwrap();
        instance.start();
        instance.handle_completion(failed("each[0]", "bad item"));
        assert_eq!(instance.node("each").unwrap().status, NodeStatus::Dispatched);
        let effects = instance.handle_completion(done("each[1]", json!({})));
        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.status, ProcessStatus::Failed);
        assert!(outcome.error.as_ref().unwrap().contains("each[0]"));
    }

    #[test]
    fn empty_fan_out_completes_immediately() {
        let mut instance = build(
            json!({
                "responses": [{"name": "totals"}],
                "instructions": [
                    {"execution_id": "each", "definition_path": "/tools/typed.json",
                     "parallel_execution": {"iterate_over": [], "child_argument_name": "count"}}
                ],
                "response_reference_map": {"totals": "REF:each.total"}
            }),
            json!({}),
        )
        .unwrap();
        let effects = instance.start();
        assert!(dispatched(&effects).is_empty());
        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.response.as_ref().unwrap()["totals"], Value::List(vec![]));
    }

    #[test]
    fn non_list_iterate_over_fails_step() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "each", "definition_path": "/e.json",
                 "parallel_execution": {"iterate_over": "REF:arguments.x", "child_argument_name": "item"}}
            ]}),
            json!({"x": "not a list"}),
        )
        .unwrap();
        let effects = instance.start();
        assert_eq!(outcome(&effects).unwrap().status, ProcessStatus::Failed);
    }

    #[test]
    fn argument_schema_failure_fails_only_the_node() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "bad", "definition_path": "/tools/typed.json", "arguments": {"count": "three"}},
                {"execution_id": "good", "definition_path": "/tools/typed.json", "arguments": {"count": 3}}
            ]}),
            json!({}),
        )
        .unwrap();
        let effects = instance.start();
        assert_eq!(dispatched(&effects).len(), 1);
        let bad = instance.node("bad").unwrap();
        assert_eq!(bad.status, NodeStatus::Failed);
        assert!(bad.error.as_ref().unwrap().contains("schema validation"));
    }

    #[test]
    fn transformed_arguments_are_validated() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "t", "definition_path": "/tools/typed.json",
                 "arguments": {"raw": "3"},
                 "transform_arguments": {"transforms": {"count": "raw"}}}
            ]}),
            json!({}),
        )
        .unwrap();
        instance.start();
        let node = instance.node("t").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);
        assert!(node.error.as_ref().unwrap().contains("transformed arguments"));
    }

    #[test]
    fn response_schema_violation_fails_node() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "t", "definition_path": "/tools/typed.json", "arguments": {"count": 1}}
            ]}),
            json!({}),
        )
        .unwrap();
        instance.start();
        let effects = instance.handle_completion(done("t", json!({"total": "many"})));
        assert_eq!(instance.node("t").unwrap().status, NodeStatus::Failed);
        assert_eq!(outcome(&effects).unwrap().status, ProcessStatus::Failed);
    }

    #[test]
    fn terminate_cancels_dispatched_work() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "a", "definition_path": "/a.json"},
                {"execution_id": "b", "definition_path": "/b.json", "dependencies": ["a"]}
            ]}),
            json!({}),
        )
        .unwrap();
        instance.start();
        let effects = instance.terminate("user requested");
        assert!(effects.iter().any(|e| matches!(e, Effect::Cancel { target_id, .. } if target_id == "a")));
        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.status, ProcessStatus::Terminated);
        assert_eq!(instance.node("b").unwrap().status, NodeStatus::Terminated);
        assert!(instance.handle_completion(done("a", json!({}))).is_empty());
    }

    #[test]
    fn terminate_node_fails_dependents() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "a", "definition_path": "/a.json"},
                {"execution_id": "b", "definition_path": "/b.json", "dependencies": ["a"]}
            ]}),
            json!({}),
        )
        .unwrap();
        instance.start();
        let effects = instance.terminate_node("a").unwrap();
        assert_eq!(instance.node("a").unwrap().status, NodeStatus::Terminated);
        assert_eq!(instance.node("b").unwrap().status, NodeStatus::Failed);
        assert_eq!(outcome(&effects).unwrap().status, ProcessStatus::Failed);
        assert!(instance.terminate_node("zzz").is_err());
    }

    #[test]
    fn configuration_errors_abort_before_dispatch() {
        let cycle = build(
            json!({"instructions": [
                {"execution_id": "a", "definition_path": "/a.json", "arguments": {"x": "REF:b.x"}},
                {"execution_id": "b", "definition_path": "/b.json", "arguments": {"x": "REF:a.x"}}
            ]}),
            json!({}),
        );
        assert!(matches!(cycle, Err(EngineError::CycleDetected { .. })));

        let operator = build(
            json!({"instructions": [
                {"execution_id": "a", "definition_path": "/a.json",
                 "conditions": {"param": 1, "operator": "approximately", "value": 1}}
            ]}),
            json!({}),
        );
        assert!(matches!(operator, Err(EngineError::UnknownOperator(_))));

        let arguments = build(
            json!({"arguments": [{"name": "url", "type_name": "string"}], "instructions": []}),
            json!({}),
        );
        assert!(matches!(arguments, Err(EngineError::SchemaValidation(_))));
    }

    #[test]
    fn empty_composite_finishes_on_start() {
        let mut instance = build(
            json!({"instructions": [], "response_reference_map": {"greeting": "hello"}}),
            json!({}),
        )
        .unwrap();
        let effects = instance.start();
        let outcome = outcome(&effects).unwrap();
        assert_eq!(outcome.status, ProcessStatus::Completed);
        assert_eq!(outcome.response.as_ref().unwrap()["greeting"], Value::from("hello"));
    }

    #[test]
    fn composite_targets_spawn() {
        let mut instance = build(
            json!({"instructions": [
                {"execution_id": "nested", "inline_definition": {"instructions": []}}
            ]}),
            json!({}),
        )
        .unwrap();
        let effects = instance.start();
        assert!(matches!(&effects[0], Effect::Spawn(inv) if inv.target_id == "nested"));
    }
}
