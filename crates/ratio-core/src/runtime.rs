//! Async runtime: one task per composite instance.
//!
//! Each instance is an actor. Its task owns the [`Instance`] state machine
//! and an unbounded mailbox; executors, nested instances, and the public API
//! talk to it only through that mailbox, so node state is never shared. The
//! task applies every [`Effect`] the state machine returns: it opens and
//! closes process records, publishes [`EngineEvent`]s, hands primitive work
//! to the [`Executor`], and launches nested composites as child actors.
//!
//! # Lifecycle
//!
//! 1. [`Runtime::start`] validates the definition, opens a root process, and
//!    launches the top-level instance.
//! 2. The instance task loads every step's target through the
//!    [`DefinitionLoader`] and builds the state machine. Configuration errors
//!    end the instance here, before anything is dispatched.
//! 3. Completions arrive in any order; the task feeds them to the state
//!    machine until it reaches its fixed point.
//! 4. The outcome goes to the caller's [`RunHandle`], or, for a nested
//!    instance, back to its parent as an ordinary completion.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use dashmap::DashMap;
use ratio_types::config::EngineConfig;
use ratio_types::definition::{Definition, StepDocument};
use ratio_types::event::EngineEvent;
use ratio_types::process::{ParentProcess, Process, ProcessStatus};
use ratio_types::storage::AccessToken;
use ratio_types::value::Value;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::definition::{self, DefinitionLoader};
use crate::engine::{Effect, Instance, InstanceOutcome, InstanceSpec, NodeStatus, Target};
use crate::error::EngineError;
use crate::event::EventBus;
use crate::executor::{CompletionEvent, CompletionSender, CompletionStatus, DispatchRequest, Executor};
use crate::process::ProcessTable;
use crate::storage::FileStore;
use crate::transform::Registry;

/// Execution id of the step that wraps a top-level primitive.
pub const PRIMITIVE_STEP_ID: &str = "main";

/// Mailbox message for an instance task.
#[derive(Debug)]
pub(crate) enum InstanceMessage {
    Completion(CompletionEvent),
    Terminate(String),
    TerminateNode {
        execution_id: String,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
}

/// A running top-level invocation.
#[derive(Debug)]
pub struct RunHandle {
    pub instance_id: Uuid,
    pub process_id: Uuid,
    outcome: oneshot::Receiver<InstanceOutcome>,
}

impl RunHandle {
    /// Wait for the instance to reach its fixed point.
    pub async fn wait(self) -> Result<InstanceOutcome, EngineError> {
        self.outcome
            .await
            .map_err(|_| EngineError::Terminated("instance task ended without an outcome".to_string()))
    }
}

/// The execution runtime.
///
/// Generic over the primitive [`Executor`] and the [`DefinitionLoader`].
/// Cloning is cheap; clones share instances, processes, and the event bus.
pub struct Runtime<E: Executor, L: DefinitionLoader> {
    inner: Arc<RuntimeInner<E, L>>,
}

impl<E: Executor, L: DefinitionLoader> Clone for Runtime<E, L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct RuntimeInner<E, L> {
    executor: E,
    loader: L,
    store: Option<Arc<dyn FileStore>>,
    registry: Arc<Registry>,
    config: EngineConfig,
    processes: ProcessTable,
    events: EventBus,
    /// Live instance actors.
    instances: DashMap<Uuid, InstanceHandle>,
    /// Parent node process id -> nested instance id.
    nested: DashMap<Uuid, Uuid>,
}

struct InstanceHandle {
    tx: mpsc::UnboundedSender<InstanceMessage>,
}

/// Where an instance reports its outcome.
enum Reply {
    Caller(oneshot::Sender<InstanceOutcome>),
    Parent {
        target_id: String,
        sender: CompletionSender,
    },
}

struct Launch {
    instance_id: Uuid,
    process_id: Uuid,
    definition: Arc<Definition>,
    label: String,
    arguments: BTreeMap<String, Value>,
    credential: Option<AccessToken>,
    depth: u32,
    parent_instance_id: Option<Uuid>,
    reply: Reply,
}

/// Per-task state the effect loop needs besides the state machine.
struct Driver {
    instance_id: Uuid,
    process_id: Uuid,
    depth: u32,
    credential: Option<AccessToken>,
    sender: CompletionSender,
    reply: Option<Reply>,
}

impl<E: Executor, L: DefinitionLoader> Runtime<E, L> {
    /// Runtime with the builtin transform catalog and no file store.
    pub fn new(executor: E, loader: L, config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_store(executor, loader, config, None)
    }

    pub fn with_store(
        executor: E,
        loader: L,
        config: EngineConfig,
        store: Option<Arc<dyn FileStore>>,
    ) -> Result<Self, EngineError> {
        let registry = Registry::with_builtins()?;
        Ok(Self::with_registry(executor, loader, config, store, registry))
    }

    /// Runtime with a caller-assembled transform registry.
    pub fn with_registry(
        executor: E,
        loader: L,
        config: EngineConfig,
        store: Option<Arc<dyn FileStore>>,
        registry: Registry,
    ) -> Self {
        let events = EventBus::new(config.event_bus_capacity);
        Self {
            inner: Arc::new(RuntimeInner {
                executor,
                loader,
                store,
                registry: Arc::new(registry),
                config,
                processes: ProcessTable::new(),
                events,
                instances: DashMap::new(),
                nested: DashMap::new(),
            }),
        }
    }

    /// Start a top-level invocation under the root process.
    ///
    /// A primitive definition is wrapped in a one-step composite so every
    /// invocation runs through the same scheduler. Must be called from within
    /// a tokio runtime.
    pub fn start(
        &self,
        definition: Arc<Definition>,
        label: impl Into<String>,
        arguments: BTreeMap<String, Value>,
        credential: Option<AccessToken>,
    ) -> Result<RunHandle, EngineError> {
        definition::validate(&definition)?;
        let label = label.into();
        let definition = if definition.is_composite() {
            definition
        } else {
            Arc::new(wrap_primitive(&definition, &arguments))
        };

        let instance_id = Uuid::now_v7();
        let process_id = Uuid::now_v7();
        self.inner
            .processes
            .open(Process::running(process_id, ParentProcess::Root, None, label.clone()));

        let (tx, rx) = oneshot::channel();
        tracing::info!(%instance_id, %process_id, definition = %label, "starting invocation");
        self.inner.launch(Launch {
            instance_id,
            process_id,
            definition,
            label,
            arguments,
            credential,
            depth: 0,
            parent_instance_id: None,
            reply: Reply::Caller(tx),
        });

        Ok(RunHandle {
            instance_id,
            process_id,
            outcome: rx,
        })
    }

    /// Start an invocation and wait for its outcome.
    pub async fn run(
        &self,
        definition: Arc<Definition>,
        label: impl Into<String>,
        arguments: BTreeMap<String, Value>,
        credential: Option<AccessToken>,
    ) -> Result<InstanceOutcome, EngineError> {
        self.start(definition, label, arguments, credential)?.wait().await
    }

    /// Load a definition through the loader and run it.
    pub async fn run_path(
        &self,
        path: &str,
        arguments: BTreeMap<String, Value>,
        credential: Option<AccessToken>,
    ) -> Result<InstanceOutcome, EngineError> {
        let definition = self.inner.loader.load(path).await?;
        self.run(definition, path, arguments, credential).await
    }

    /// Route a completion to a live instance.
    pub fn deliver(&self, instance_id: Uuid, completion: CompletionEvent) -> Result<(), EngineError> {
        self.inner
            .send(instance_id, InstanceMessage::Completion(completion))
    }

    /// Terminate a live instance and everything it dispatched.
    pub fn terminate(&self, instance_id: Uuid, reason: impl Into<String>) -> Result<(), EngineError> {
        self.inner
            .send(instance_id, InstanceMessage::Terminate(reason.into()))
    }

    /// Terminate one node of a live instance.
    pub async fn terminate_node(&self, instance_id: Uuid, execution_id: &str) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.inner.send(
            instance_id,
            InstanceMessage::TerminateNode {
                execution_id: execution_id.to_string(),
                reply,
            },
        )?;
        rx.await.map_err(|_| EngineError::InstanceNotFound(instance_id))?
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.inner.processes
    }

    pub fn process(&self, process_id: Uuid) -> Option<Process> {
        self.inner.processes.get(process_id)
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Ids of instances whose tasks are still running.
    pub fn active_instances(&self) -> Vec<Uuid> {
        self.inner.instances.iter().map(|h| *h.key()).collect()
    }
}

impl<E: Executor, L: DefinitionLoader> RuntimeInner<E, L> {
    fn send(&self, instance_id: Uuid, message: InstanceMessage) -> Result<(), EngineError> {
        let handle = self
            .instances
            .get(&instance_id)
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        handle
            .tx
            .send(message)
            .map_err(|_| EngineError::InstanceNotFound(instance_id))
    }

    /// Register the instance and spawn its task.
    fn launch(self: &Arc<Self>, launch: Launch) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.instances.insert(launch.instance_id, InstanceHandle { tx: tx.clone() });
        if launch.parent_instance_id.is_some() {
            self.nested.insert(launch.process_id, launch.instance_id);
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.drive(launch, tx, rx).await;
        });
    }

    async fn drive(
        self: Arc<Self>,
        launch: Launch,
        tx: mpsc::UnboundedSender<InstanceMessage>,
        mut rx: mpsc::UnboundedReceiver<InstanceMessage>,
    ) {
        let instance_id = launch.instance_id;
        let mut driver = Driver {
            instance_id,
            process_id: launch.process_id,
            depth: launch.depth,
            credential: launch.credential.clone(),
            sender: CompletionSender::new(instance_id, tx),
            reply: Some(launch.reply),
        };

        let built = match self.load_targets(&launch.definition).await {
            Ok(targets) => Instance::new(InstanceSpec {
                instance_id,
                process_id: launch.process_id,
                definition: Arc::clone(&launch.definition),
                label: launch.label.clone(),
                arguments: launch.arguments,
                targets,
                credential: launch.credential,
                store: self.store.clone(),
                registry: Arc::clone(&self.registry),
                config: self.config.clone(),
            }),
            Err(err) => Err(err),
        };

        let mut instance = match built {
            Ok(instance) => instance,
            Err(err) => {
                tracing::warn!(%instance_id, definition = %launch.label, error = %err, "instance rejected before dispatch");
                let outcome = InstanceOutcome {
                    instance_id,
                    process_id: launch.process_id,
                    status: ProcessStatus::Failed,
                    response: None,
                    error: Some(err.to_string()),
                    nodes: Vec::new(),
                };
                self.apply(&mut driver, vec![Effect::Finished(outcome)]).await;
                return;
            }
        };

        self.events.publish(EngineEvent::InstanceStarted {
            instance_id,
            process_id: launch.process_id,
            definition: launch.label.clone(),
            parent_instance_id: launch.parent_instance_id,
        });
        let effects = instance.start();
        self.apply(&mut driver, effects).await;

        while !instance.is_finished() {
            let Some(message) = rx.recv().await else {
                break;
            };
            let effects = match message {
                InstanceMessage::Completion(event) => instance.handle_completion(event),
                InstanceMessage::Terminate(reason) => instance.terminate(&reason),
                InstanceMessage::TerminateNode { execution_id, reply } => {
                    match instance.terminate_node(&execution_id) {
                        Ok(effects) => {
                            let _ = reply.send(Ok(()));
                            effects
                        }
                        Err(err) => {
                            let _ = reply.send(Err(err));
                            Vec::new()
                        }
                    }
                }
            };
            self.apply(&mut driver, effects).await;
        }

        tracing::debug!(%instance_id, "instance task exiting");
    }

    /// Load every step's target. Inline definitions are used as-is.
    async fn load_targets(&self, definition: &Definition) -> Result<HashMap<String, Target>, EngineError> {
        let mut targets = HashMap::new();
        for step in definition.steps() {
            let target = match (&step.inline_definition, &step.definition_path) {
                (Some(inline), _) => Target::new(Arc::new((**inline).clone()), step.target_label()),
                (None, Some(path)) => Target::new(self.loader.load(path).await?, path.clone()),
                (None, None) => {
                    return Err(EngineError::InvalidDefinition(format!(
                        "step '{}' has no target definition",
                        step.execution_id
                    )));
                }
            };
            targets.insert(step.execution_id.clone(), target);
        }
        Ok(targets)
    }

    async fn apply(self: &Arc<Self>, driver: &mut Driver, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Dispatch(invocation) => {
                    self.open_node_process(driver, &invocation.target_id, invocation.process_id, &invocation.label);
                    let request = DispatchRequest {
                        target_id: invocation.target_id.clone(),
                        process_id: invocation.process_id,
                        parent_process_id: ParentProcess::Process(driver.process_id),
                        endpoint: invocation
                            .definition
                            .system_event_endpoint
                            .clone()
                            .unwrap_or_default(),
                        resolved_arguments: invocation.arguments,
                        argument_schema: invocation.definition.arguments.clone(),
                        response_schema: invocation.definition.responses.clone(),
                        credential: driver.credential.clone(),
                        callback_target: driver.sender.clone(),
                    };
                    tracing::info!(
                        instance_id = %driver.instance_id,
                        target_id = %request.target_id,
                        endpoint = %request.endpoint,
                        "dispatching"
                    );
                    if let Err(err) = self.executor.dispatch(request).await {
                        tracing::warn!(instance_id = %driver.instance_id, target_id = %invocation.target_id, error = %err, "dispatch rejected");
                        driver.sender.send(CompletionEvent {
                            target_id: invocation.target_id,
                            status: CompletionStatus::Failed,
                            result: None,
                            failure_reason: Some(err.to_string()),
                        });
                    }
                }
                Effect::Spawn(invocation) => {
                    self.open_node_process(driver, &invocation.target_id, invocation.process_id, &invocation.label);
                    let depth = driver.depth + 1;
                    if depth > self.config.max_nesting_depth {
                        let err = EngineError::NestingDepthExceeded {
                            depth,
                            max: self.config.max_nesting_depth,
                        };
                        tracing::warn!(instance_id = %driver.instance_id, target_id = %invocation.target_id, error = %err, "nested composite refused");
                        driver.sender.send(CompletionEvent {
                            target_id: invocation.target_id,
                            status: CompletionStatus::Failed,
                            result: None,
                            failure_reason: Some(err.to_string()),
                        });
                        continue;
                    }
                    tracing::info!(
                        instance_id = %driver.instance_id,
                        target_id = %invocation.target_id,
                        definition = %invocation.label,
                        depth,
                        "spawning nested composite"
                    );
                    self.launch(Launch {
                        instance_id: Uuid::now_v7(),
                        process_id: invocation.process_id,
                        definition: invocation.definition,
                        label: invocation.label,
                        arguments: invocation.arguments,
                        credential: driver.credential.clone(),
                        depth,
                        parent_instance_id: Some(driver.instance_id),
                        reply: Reply::Parent {
                            target_id: invocation.target_id,
                            sender: driver.sender.clone(),
                        },
                    });
                }
                Effect::Cancel { target_id, process_id } => {
                    let nested = self
                        .nested
                        .get(&process_id)
                        .and_then(|entry| self.instances.get(entry.value()).map(|h| h.tx.clone()));
                    match nested {
                        Some(tx) => {
                            let _ = tx.send(InstanceMessage::Terminate(format!("parent node '{target_id}' terminated")));
                        }
                        None => self.executor.cancel(process_id).await,
                    }
                }
                Effect::NodeFinished(finished) => {
                    if let Some(process_id) = finished.process_id {
                        if !self.processes.contains(process_id) {
                            self.open_node_process(driver, &finished.target_id, process_id, &finished.label);
                        }
                        self.processes.close(
                            process_id,
                            finished.status.process_status(),
                            finished.reason.clone(),
                            finished.response.clone(),
                        );
                    }
                    let instance_id = driver.instance_id;
                    let execution_id = finished.target_id;
                    match finished.status {
                        NodeStatus::Completed => self.events.publish(EngineEvent::NodeCompleted {
                            instance_id,
                            execution_id,
                        }),
                        NodeStatus::Failed => self.events.publish(EngineEvent::NodeFailed {
                            instance_id,
                            execution_id,
                            error: finished.reason.unwrap_or_default(),
                        }),
                        NodeStatus::Terminated => self.events.publish(EngineEvent::NodeTerminated {
                            instance_id,
                            execution_id,
                        }),
                        _ => {}
                    }
                }
                Effect::Skipped { execution_id } => self.events.publish(EngineEvent::NodeSkipped {
                    instance_id: driver.instance_id,
                    execution_id,
                }),
                Effect::Finished(outcome) => self.finish(driver, outcome),
            }
        }
    }

    fn open_node_process(&self, driver: &Driver, target_id: &str, process_id: Uuid, label: &str) {
        self.processes.open(Process::running(
            process_id,
            ParentProcess::Process(driver.process_id),
            Some(target_id.to_string()),
            label,
        ));
        self.events.publish(EngineEvent::NodeDispatched {
            instance_id: driver.instance_id,
            execution_id: target_id.to_string(),
            process_id,
        });
    }

    /// Close out an instance.
    ///
    /// A nested instance shares its process record with the parent's node,
    /// so that record is left for the parent's `NodeFinished` to close with
    /// the node's validated output.
    fn finish(&self, driver: &mut Driver, outcome: InstanceOutcome) {
        self.instances.remove(&driver.instance_id);
        let nested = matches!(driver.reply, Some(Reply::Parent { .. }));
        if nested {
            self.nested.remove_if(&outcome.process_id, |_, id| *id == driver.instance_id);
        } else {
            self.processes.close(
                outcome.process_id,
                outcome.status,
                outcome.error.clone(),
                outcome.response.clone().map(Value::Object),
            );
        }
        self.events.publish(EngineEvent::InstanceFinished {
            instance_id: outcome.instance_id,
            process_id: outcome.process_id,
            status: outcome.status,
            error: outcome.error.clone(),
        });

        match driver.reply.take() {
            Some(Reply::Caller(tx)) => {
                let _ = tx.send(outcome);
            }
            Some(Reply::Parent { target_id, sender }) => {
                let event = match outcome.status {
                    ProcessStatus::Completed => CompletionEvent {
                        target_id,
                        status: CompletionStatus::Completed,
                        result: Some(Value::Object(outcome.response.unwrap_or_default())),
                        failure_reason: None,
                    },
                    status => CompletionEvent {
                        target_id,
                        status: CompletionStatus::Failed,
                        result: None,
                        failure_reason: Some(
                            outcome.error.unwrap_or_else(|| format!("nested composite {status}")),
                        ),
                    },
                };
                sender.send(event);
            }
            None => {}
        }
    }
}

/// Wrap a primitive in a one-step composite with the same schemas.
///
/// Declared arguments are forwarded by reference; a primitive without
/// declared arguments receives every argument the caller supplied.
fn wrap_primitive(primitive: &Definition, arguments: &BTreeMap<String, Value>) -> Definition {
    let names: Vec<String> = if primitive.arguments.is_empty() {
        arguments.keys().cloned().collect()
    } else {
        primitive.arguments.iter().map(|a| a.name.clone()).collect()
    };

    let mut step = StepDocument::new(PRIMITIVE_STEP_ID);
    step.inline_definition = Some(Box::new(primitive.clone()));
    step.arguments = names
        .into_iter()
        .map(|name| {
            let reference = Value::String(format!("REF:arguments.{name}"));
            (name, reference)
        })
        .collect();

    let response_map = primitive
        .responses
        .iter()
        .map(|r| {
            let reference = Value::String(format!("REF:{PRIMITIVE_STEP_ID}.{}", r.name));
            (r.name.clone(), reference)
        })
        .collect();

    Definition {
        description: primitive.description.clone(),
        arguments: primitive.arguments.clone(),
        responses: primitive.responses.clone(),
        instructions: Some(vec![step]),
        system_event_endpoint: None,
        response_reference_map: Some(response_map),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::reference::testing::object;

    fn def(value: serde_json::Value) -> Arc<Definition> {
        Arc::new(serde_json::from_value(value).unwrap())
    }

    /// Completes every dispatch immediately.
    ///
    /// `echo` returns its arguments, `fail` fails, `broken` rejects the
    /// dispatch itself.
    struct Immediate;

    impl Executor for Immediate {
        async fn dispatch(&self, request: DispatchRequest) -> Result<(), EngineError> {
            match request.endpoint.as_str() {
                "echo" => {
                    let event = request.completed(request.resolved_arguments.clone());
                    request.callback_target.send(event);
                }
                "fail" => request.callback_target.send(request.failed("asked to fail")),
                "broken" => return Err(EngineError::Dispatch("endpoint offline".to_string())),
                other => request.callback_target.send(request.failed(format!("no endpoint {other}"))),
            }
            Ok(())
        }

        async fn cancel(&self, _process_id: Uuid) {}
    }

    /// Hands every dispatch to the test.
    struct Scripted {
        requests: mpsc::UnboundedSender<DispatchRequest>,
        cancelled: Arc<Mutex<Vec<Uuid>>>,
    }

    impl Executor for Scripted {
        async fn dispatch(&self, request: DispatchRequest) -> Result<(), EngineError> {
            self.requests
                .send(request)
                .map_err(|e| EngineError::Dispatch(e.to_string()))
        }

        async fn cancel(&self, process_id: Uuid) {
            self.cancelled.lock().unwrap().push(process_id);
        }
    }

    #[derive(Default)]
    struct MapLoader {
        definitions: HashMap<String, Arc<Definition>>,
    }

    impl MapLoader {
        fn with(mut self, path: &str, definition: serde_json::Value) -> Self {
            self.definitions.insert(path.to_string(), def(definition));
            self
        }
    }

    impl DefinitionLoader for MapLoader {
        async fn load(&self, path: &str) -> Result<Arc<Definition>, EngineError> {
            self.definitions
                .get(path)
                .cloned()
                .ok_or_else(|| EngineError::InvalidDefinition(format!("definition not found: {path}")))
        }
    }

    fn tools() -> MapLoader {
        MapLoader::default()
            .with("/tools/echo.json", json!({"system_event_endpoint": "echo"}))
            .with("/tools/fail.json", json!({"system_event_endpoint": "fail"}))
            .with("/tools/broken.json", json!({"system_event_endpoint": "broken"}))
    }

    fn immediate(loader: MapLoader) -> Runtime<Immediate, MapLoader> {
        Runtime::new(Immediate, loader, EngineConfig::default()).unwrap()
    }

    fn scripted() -> (
        Runtime<Scripted, MapLoader>,
        mpsc::UnboundedReceiver<DispatchRequest>,
        Arc<Mutex<Vec<Uuid>>>,
    ) {
        scripted_with(tools())
    }

    fn scripted_with(
        loader: MapLoader,
    ) -> (
        Runtime<Scripted, MapLoader>,
        mpsc::UnboundedReceiver<DispatchRequest>,
        Arc<Mutex<Vec<Uuid>>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancelled = Arc::new(Mutex::new(Vec::new()));
        let executor = Scripted {
            requests: tx,
            cancelled: Arc::clone(&cancelled),
        };
        (
            Runtime::new(executor, loader, EngineConfig::default()).unwrap(),
            rx,
            cancelled,
        )
    }

    async fn next_request(rx: &mut mpsc::UnboundedReceiver<DispatchRequest>) -> DispatchRequest {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("dispatch within timeout")
            .expect("executor channel open")
    }

    #[tokio::test]
    async fn top_level_primitive_runs_under_root() {
        let runtime = immediate(tools());
        let primitive = def(json!({
            "system_event_endpoint": "echo",
            "arguments": [{"name": "text", "type_name": "string"}],
            "responses": [{"name": "text", "type_name": "string"}]
        }));

        let outcome = runtime
            .run(primitive, "/tools/shout.json", object(json!({"text": "hi"})), None)
            .await
            .unwrap();

        assert_eq!(outcome.status, ProcessStatus::Completed);
        assert_eq!(outcome.response.unwrap()["text"], Value::from("hi"));

        let root = runtime.process(outcome.process_id).unwrap();
        assert_eq!(root.parent_process_id, ParentProcess::Root);
        assert_eq!(root.status, ProcessStatus::Completed);
        let children = runtime.processes().children(ParentProcess::Process(outcome.process_id));
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].execution_id.as_deref(), Some(PRIMITIVE_STEP_ID));
    }

    #[tokio::test]
    async fn composite_with_fan_out_and_skip() {
        let runtime = immediate(tools());
        let composite = def(json!({
            "arguments": [{"name": "cities", "type_name": "list"}],
            "responses": [
                {"name": "cities", "type_name": "list"},
                {"name": "note", "required": false, "default_value": "none"}
            ],
            "instructions": [
                {"execution_id": "each", "definition_path": "/tools/echo.json",
                 "parallel_execution": {"iterate_over": "REF:arguments.cities", "child_argument_name": "city"}},
                {"execution_id": "never", "definition_path": "/tools/echo.json",
                 "conditions": {"param": "REF:arguments.cities", "operator": "not_exists"}},
                {"execution_id": "after", "definition_path": "/tools/echo.json",
                 "arguments": {"from_never": "REF:never.note", "all": "REF:each.city"}}
            ],
            "response_reference_map": {"cities": "REF:after.all", "note": "REF:never.note"}
        }));

        let outcome = runtime
            .run(composite, "/agents/weather.json", object(json!({"cities": ["Oslo", "Lima"]})), None)
            .await
            .unwrap();

        assert_eq!(outcome.status, ProcessStatus::Completed, "{:?}", outcome.error);
        let response = outcome.response.unwrap();
        assert_eq!(response["cities"], Value::from(json!(["Oslo", "Lima"])));
        assert_eq!(response["note"], Value::from("none"));

        // Two fan-out children, one skipped record, one dependent.
        let children = runtime.processes().children(ParentProcess::Process(outcome.process_id));
        assert_eq!(children.len(), 4);
        assert!(children.iter().any(|p| p.status == ProcessStatus::Skipped));
    }

    #[tokio::test]
    async fn out_of_order_and_duplicate_completions() {
        let (runtime, mut requests, _) = scripted();
        let composite = def(json!({
            "responses": [{"name": "pair"}],
            "instructions": [
                {"execution_id": "left", "definition_path": "/tools/echo.json"},
                {"execution_id": "right", "definition_path": "/tools/echo.json"},
                {"execution_id": "join", "definition_path": "/tools/echo.json",
                 "arguments": {"l": "REF:left.v", "r": "REF:right.v"}}
            ],
            "response_reference_map": {"pair": ["REF:join.l", "REF:join.r"]}
        }));
        let handle = runtime.start(composite, "/agents/pair.json", BTreeMap::new(), None).unwrap();

        let first = next_request(&mut requests).await;
        let second = next_request(&mut requests).await;
        let (left, right) = if first.target_id == "left" { (first, second) } else { (second, first) };

        right.callback_target.send(right.completed(object(json!({"v": "R"}))));
        right.callback_target.send(right.completed(object(json!({"v": "late duplicate"}))));
        left.callback_target.send(left.completed(object(json!({"v": "L"}))));
        left.callback_target.send(left.failed("duplicate failure after success"));

        let join = next_request(&mut requests).await;
        assert_eq!(join.target_id, "join");
        assert_eq!(join.resolved_arguments["l"], Value::from("L"));
        assert_eq!(join.resolved_arguments["r"], Value::from("R"));
        join.callback_target.send(join.completed(join.resolved_arguments.clone()));

        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, ProcessStatus::Completed);
        assert_eq!(outcome.response.unwrap()["pair"], Value::from(json!(["L", "R"])));
        assert_eq!(runtime.process(left.process_id).unwrap().status, ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn nested_composites_chain_processes() {
        let loader = tools().with(
            "/agents/inner.json",
            json!({
                "arguments": [{"name": "word", "type_name": "string"}],
                "responses": [{"name": "word", "type_name": "string"}],
                "instructions": [
                    {"execution_id": "say", "definition_path": "/tools/echo.json",
                     "arguments": {"word": "REF:arguments.word"}}
                ],
                "response_reference_map": {"word": "REF:say.word"}
            }),
        );
        let runtime = immediate(loader);
        let outer = def(json!({
            "responses": [{"name": "result"}],
            "instructions": [
                {"execution_id": "delegate", "definition_path": "/agents/inner.json",
                 "arguments": {"word": "hello"}}
            ],
            "response_reference_map": {"result": "REF:delegate.word"}
        }));

        let outcome = runtime.run(outer, "/agents/outer.json", BTreeMap::new(), None).await.unwrap();
        assert_eq!(outcome.status, ProcessStatus::Completed, "{:?}", outcome.error);
        assert_eq!(outcome.response.unwrap()["result"], Value::from("hello"));

        let outer_children = runtime.processes().children(ParentProcess::Process(outcome.process_id));
        let delegate = &outer_children[0];
        assert_eq!(delegate.definition, "/agents/inner.json");
        assert_eq!(delegate.status, ProcessStatus::Completed);
        let inner_children = runtime.processes().children(ParentProcess::Process(delegate.process_id));
        assert_eq!(inner_children[0].execution_id.as_deref(), Some("say"));
        assert!(runtime.active_instances().is_empty());
    }

    /// Wait until every instance task, nested ones included, has exited.
    async fn settled<E: Executor, L: DefinitionLoader>(runtime: &Runtime<E, L>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !runtime.active_instances().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("instances settle within timeout");
    }

    #[tokio::test]
    async fn nested_record_follows_the_parent_node() {
        let runtime = immediate(tools());
        let outer = def(json!({
            "instructions": [
                {"execution_id": "inner",
                 "inline_definition": {
                     "responses": [{"name": "n", "type_name": "string"}],
                     "instructions": [
                         {"execution_id": "say", "definition_path": "/tools/echo.json",
                          "arguments": {"n": "text"}}
                     ],
                     "response_reference_map": {"n": "REF:say.n"}
                 },
                 "transform_responses": {"transforms": {"n": "json_parse(json_string='[1]')"}}}
            ]
        }));

        let outcome = runtime.run(outer, "/agents/outer.json", BTreeMap::new(), None).await.unwrap();
        settled(&runtime).await;

        assert_eq!(outcome.status, ProcessStatus::Failed);
        let node = outcome.nodes.iter().find(|n| n.execution_id == "inner").unwrap();
        assert_eq!(node.status, NodeStatus::Failed);

        let children = runtime.processes().children(ParentProcess::Process(outcome.process_id));
        assert_eq!(children.len(), 1);
        let record = &children[0];
        assert_eq!(record.execution_id.as_deref(), Some("inner"));
        assert_eq!(record.status, ProcessStatus::Failed);
        assert!(record.status_message.is_some());
        assert_eq!(record.response, None);

        // The nested instance's own step still closed normally.
        let say = runtime.processes().children(ParentProcess::Process(record.process_id));
        assert_eq!(say[0].status, ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn terminate_reaches_nested_work() {
        let loader = tools().with(
            "/agents/deep.json",
            json!({"instructions": [{"execution_id": "work", "definition_path": "/tools/echo.json"}]}),
        );
        let (runtime, mut requests, cancelled) = scripted_with(loader);
        let outer = def(json!({"instructions": [
            {"execution_id": "delegate", "definition_path": "/agents/deep.json"}
        ]}));
        let handle = runtime.start(outer, "/agents/outer.json", BTreeMap::new(), None).unwrap();
        let work = next_request(&mut requests).await;
        assert_eq!(work.target_id, "work");

        runtime.terminate(handle.instance_id, "operator stop").unwrap();
        let outcome = handle.wait().await.unwrap();
        settled(&runtime).await;

        assert_eq!(outcome.status, ProcessStatus::Terminated);
        assert_eq!(cancelled.lock().unwrap().as_slice(), &[work.process_id]);
        assert_eq!(runtime.process(work.process_id).unwrap().status, ProcessStatus::Terminated);
        let delegate = runtime.processes().children(ParentProcess::Process(outcome.process_id));
        assert_eq!(delegate[0].status, ProcessStatus::Terminated);
        assert!(runtime.inner.nested.is_empty());
    }

    #[tokio::test]
    async fn recursion_stops_at_nesting_limit() {
        let loader = tools().with(
            "/agents/loop.json",
            json!({"instructions": [{"execution_id": "again", "definition_path": "/agents/loop.json"}]}),
        );
        let config = EngineConfig {
            max_nesting_depth: 3,
            ..EngineConfig::default()
        };
        let runtime = Runtime::new(Immediate, loader, config).unwrap();

        let outcome = runtime.run_path("/agents/loop.json", BTreeMap::new(), None).await.unwrap();
        assert_eq!(outcome.status, ProcessStatus::Failed);
        assert!(outcome.error.unwrap().contains("nesting depth 4 exceeds maximum 3"));
    }

    #[tokio::test]
    async fn failures_and_rejected_dispatches() {
        let runtime = immediate(tools());
        let composite = def(json!({"instructions": [
            {"execution_id": "bad", "definition_path": "/tools/broken.json"},
            {"execution_id": "ok", "definition_path": "/tools/echo.json"}
        ]}));
        let outcome = runtime.run(composite, "/agents/x.json", BTreeMap::new(), None).await.unwrap();
        assert_eq!(outcome.status, ProcessStatus::Failed);
        assert!(outcome.error.as_ref().unwrap().contains("endpoint offline"));
        let ok = outcome.nodes.iter().find(|n| n.execution_id == "ok").unwrap();
        assert_eq!(ok.status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn missing_target_fails_before_dispatch() {
        let runtime = immediate(tools());
        let composite = def(json!({"instructions": [
            {"execution_id": "a", "definition_path": "/tools/echo.json"},
            {"execution_id": "b", "definition_path": "/tools/nowhere.json"}
        ]}));
        let outcome = runtime.run(composite, "/agents/x.json", BTreeMap::new(), None).await.unwrap();
        assert_eq!(outcome.status, ProcessStatus::Failed);
        assert!(outcome.error.unwrap().contains("/tools/nowhere.json"));
        assert!(runtime.processes().children(ParentProcess::Process(outcome.process_id)).is_empty());
    }

    #[tokio::test]
    async fn invalid_definition_is_rejected_at_start() {
        let runtime = immediate(tools());
        let cyclic = def(json!({"instructions": [
            {"execution_id": "a", "definition_path": "/tools/echo.json", "arguments": {"x": "REF:b.x"}},
            {"execution_id": "b", "definition_path": "/tools/echo.json", "arguments": {"x": "REF:a.x"}}
        ]}));
        let result = runtime.start(cyclic, "/agents/cycle.json", BTreeMap::new(), None);
        assert!(matches!(result, Err(EngineError::CycleDetected { .. })));
        assert!(runtime.processes().list().is_empty());
    }

    #[tokio::test]
    async fn terminate_cancels_outstanding_work() {
        let (runtime, mut requests, cancelled) = scripted();
        let composite = def(json!({"instructions": [
            {"execution_id": "slow", "definition_path": "/tools/echo.json"},
            {"execution_id": "next", "definition_path": "/tools/echo.json", "dependencies": ["slow"]}
        ]}));
        let handle = runtime.start(composite, "/agents/slow.json", BTreeMap::new(), None).unwrap();
        let slow = next_request(&mut requests).await;

        runtime.terminate(handle.instance_id, "operator stop").unwrap();
        let instance_id = handle.instance_id;
        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome.status, ProcessStatus::Terminated);
        assert_eq!(cancelled.lock().unwrap().as_slice(), &[slow.process_id]);
        assert_eq!(runtime.process(slow.process_id).unwrap().status, ProcessStatus::Terminated);
        assert_eq!(runtime.process(outcome.process_id).unwrap().status, ProcessStatus::Terminated);

        // Late completions for a finished instance are dropped.
        slow.callback_target.send(slow.completed(BTreeMap::new()));
        assert!(matches!(
            runtime.deliver(instance_id, slow.completed(BTreeMap::new())),
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn terminate_node_fails_dependents() {
        let (runtime, mut requests, _) = scripted();
        let composite = def(json!({"instructions": [
            {"execution_id": "slow", "definition_path": "/tools/echo.json"},
            {"execution_id": "next", "definition_path": "/tools/echo.json", "dependencies": ["slow"]}
        ]}));
        let handle = runtime.start(composite, "/agents/slow.json", BTreeMap::new(), None).unwrap();
        next_request(&mut requests).await;

        assert!(runtime.terminate_node(handle.instance_id, "ghost").await.is_err());
        runtime.terminate_node(handle.instance_id, "slow").await.unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.status, ProcessStatus::Failed);
        let next = outcome.nodes.iter().find(|n| n.execution_id == "next").unwrap();
        assert_eq!(next.status, NodeStatus::Failed);
    }

    #[tokio::test]
    async fn events_follow_the_lifecycle() {
        let runtime = immediate(tools());
        let mut events = runtime.events().subscribe();
        let composite = def(json!({"instructions": [
            {"execution_id": "go", "definition_path": "/tools/echo.json"},
            {"execution_id": "stay", "definition_path": "/tools/echo.json",
             "conditions": {"param": false, "operator": "equals", "value": true}}
        ]}));
        runtime.run(composite, "/agents/e.json", BTreeMap::new(), None).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(EngineEvent::InstanceStarted { .. })));
        assert!(matches!(seen.last(), Some(EngineEvent::InstanceFinished { status: ProcessStatus::Completed, .. })));
        assert!(seen.iter().any(|e| matches!(e, EngineEvent::NodeSkipped { execution_id, .. } if execution_id == "stay")));
        assert!(seen.iter().any(|e| matches!(e, EngineEvent::NodeCompleted { execution_id, .. } if execution_id == "go")));
    }

    #[tokio::test]
    async fn deliver_to_unknown_instance() {
        let runtime = immediate(tools());
        let event = CompletionEvent {
            target_id: "a".to_string(),
            status: CompletionStatus::Completed,
            result: None,
            failure_reason: None,
        };
        assert!(matches!(
            runtime.deliver(Uuid::now_v7(), event),
            Err(EngineError::InstanceNotFound(_))
        ));
    }
}
