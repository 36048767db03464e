//! Runtime façade.
//!
//! `ProcessRuntime` owns the registries (definitions, handlers, instances,
//! work item index) and hands out the `WorkItemManager` and `SignalRouter`.
//! Each process instance sits behind its own async mutex; registries are
//! plain `RwLock`s that are never held across an await.

use crate::config::EngineConfig;
use crate::definition::ProcessDefinition;
use crate::egress::{MessageEgress, NoopEgress};
use crate::error::{EngineError, Result};
use crate::events::{ChannelEventListener, EventListener, EventListenerBus, ProcessEvent};
use crate::execution::{Effect, Execution};
use crate::handler::{HumanTaskWorkItemHandler, SendTaskWorkItemHandler, SharedHandler};
use crate::manager::{self, WorkItemManager};
use crate::process_instance::{
    InstanceOptions, ProcessInstance, ProcessInstanceSnapshot, ProcessInstanceState,
};
use crate::signal::{self, SignalContext, SignalReceipt, SignalRouter, SignalScope};
use crate::types::{require_non_blank, Variables};
use crate::work_item::WorkItem;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, Mutex};

type InstanceHandle = Arc<Mutex<ProcessInstance>>;

/// Who holds a live work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WorkItemOwner {
    Instance(String),
    Detached,
}

// ─── Shared state ─────────────────────────────────────────────

pub(crate) struct RuntimeShared {
    pub(crate) config: EngineConfig,
    definitions: RwLock<HashMap<String, Arc<ProcessDefinition>>>,
    handlers: RwLock<HashMap<String, SharedHandler>>,
    /// Keyed by time-ordered id, so iteration follows creation order.
    instances: RwLock<BTreeMap<String, InstanceHandle>>,
    work_items: RwLock<HashMap<String, WorkItemOwner>>,
    /// Work items that belong to no node instance.
    pub(crate) detached: Mutex<BTreeMap<String, WorkItem>>,
    listeners: EventListenerBus,
    egress: Arc<dyn MessageEgress>,
}

impl RuntimeShared {
    // ── Definitions ──

    pub(crate) fn definition(&self, process_id: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(process_id)
            .cloned()
    }

    fn register_definition(&self, definition: ProcessDefinition) {
        tracing::debug!(process_id = %definition.id, version = %definition.version, "Process definition registered");
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.id.clone(), Arc::new(definition));
    }

    /// Definitions started by a default-scope signal of `event_type`.
    pub(crate) fn signal_start_definitions(&self, event_type: &str) -> Vec<Arc<ProcessDefinition>> {
        let mut found: Vec<_> = self
            .definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|d| d.signal_start.as_deref() == Some(event_type))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    // ── Handlers ──

    pub(crate) fn handler(&self, name: &str) -> Option<SharedHandler> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Bind `handler` to work items named `name`, replacing any previous one.
    pub(crate) fn register_handler(&self, name: &str, handler: SharedHandler) -> Result<()> {
        require_non_blank(name, "handler name")?;
        let kind = self.config.runtime_kind;
        if !handler.supports(kind) {
            return Err(EngineError::UnsupportedRuntime {
                component: handler.name().to_string(),
                kind,
            });
        }
        let replaced = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), handler)
            .is_some();
        tracing::debug!(name, replaced, "Work item handler registered");
        Ok(())
    }

    // ── Instances ──

    pub(crate) fn instance(&self, id: &str) -> Result<InstanceHandle> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))
    }

    pub(crate) fn instance_ids(&self) -> Vec<String> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub(crate) fn insert_instance(&self, instance: ProcessInstance) {
        let id = instance.id.clone();
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(Mutex::new(instance)));
    }

    /// Called with the instance lock still held after every execution.
    /// Terminal instances leave the registry unless configured to stay.
    pub(crate) fn settled(&self, instance: &ProcessInstance) {
        if instance.state.is_terminal() && !self.config.retain_terminal_instances {
            self.instances
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&instance.id);
            tracing::debug!(process_instance_id = %instance.id, "Terminal instance dropped");
        }
    }

    // ── Work item index ──

    pub(crate) fn index_work_item(&self, work_item_id: &str, owner: WorkItemOwner) {
        self.work_items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(work_item_id.to_string(), owner);
    }

    pub(crate) fn unindex_work_item(&self, work_item_id: &str) {
        self.work_items
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(work_item_id);
    }

    pub(crate) fn work_item_owner(&self, work_item_id: &str) -> Option<WorkItemOwner> {
        self.work_items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(work_item_id)
            .cloned()
    }

    // ── Events & effects ──

    pub(crate) fn fire(&self, event: ProcessEvent) {
        self.listeners.fire(&event);
    }

    /// Run queued effects until none are left. Effects raised while
    /// dispatching join the back of the queue. Failures are logged; they
    /// belong to the receiving instance, not to the caller.
    pub(crate) async fn dispatch(self: &Arc<Self>, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            let mut follow_up = Vec::new();
            match effect {
                Effect::Signal {
                    scope,
                    event_type,
                    payload,
                    context,
                } => {
                    if let Err(e) = signal::route_signal(
                        self,
                        scope,
                        &event_type,
                        payload,
                        &context,
                        &mut follow_up,
                    )
                    .await
                    {
                        tracing::warn!(scope = %scope, event_type = %event_type, error = %e, "Queued signal failed");
                    }
                }
                Effect::StartChild {
                    child_id,
                    parent_id,
                    process_id,
                } => match start_instance(self, &child_id, &mut follow_up).await {
                    Ok(()) => {
                        tracing::info!(process_instance_id = %child_id, parent = %parent_id, process_id = %process_id, "Sub-process started");
                    }
                    // Aborted with its parent before it got to run.
                    Err(EngineError::InvalidState { .. }) | Err(EngineError::UnknownInstance(_)) => {
                        tracing::debug!(process_instance_id = %child_id, parent = %parent_id, "Sub-process start skipped");
                    }
                    Err(e) => {
                        tracing::warn!(process_instance_id = %child_id, error = %e, "Sub-process failed to start");
                    }
                },
                Effect::AbortInstance(id) => match abort_instance(self, &id, &mut follow_up).await {
                    Ok(()) | Err(EngineError::UnknownInstance(_)) => {}
                    Err(EngineError::InvalidState { .. }) => {
                        tracing::debug!(process_instance_id = %id, "Instance already settled");
                    }
                    Err(e) => {
                        tracing::warn!(process_instance_id = %id, error = %e, "Abort failed");
                    }
                },
                Effect::ExecuteWorkItem(item) => {
                    let name = item.name.clone();
                    if let Err(e) = manager::execute_detached(self, item).await {
                        tracing::warn!(name = %name, error = %e, "Work item execution failed");
                    }
                }
                Effect::Produce {
                    process_instance_id,
                    payload,
                } => {
                    let egress = self.egress.clone();
                    tokio::spawn(async move {
                        if let Err(e) = egress.produce(process_instance_id.as_deref(), payload).await {
                            tracing::warn!(egress = egress.name(), error = %e, "Egress failed");
                        }
                    });
                }
            }
            queue.extend(follow_up);
        }
    }
}

// ─── Instance operations ──────────────────────────────────────

/// Register a PENDING instance of `process_id`.
pub(crate) fn create_instance(
    shared: &Arc<RuntimeShared>,
    process_id: &str,
    variables: Variables,
    options: InstanceOptions,
) -> Result<String> {
    require_non_blank(process_id, "process id")?;
    let definition = shared
        .definition(process_id)
        .ok_or_else(|| EngineError::UnknownProcess(process_id.to_string()))?;
    let instance = ProcessInstance::new(definition, variables, options);
    let id = instance.id.clone();
    shared.insert_instance(instance);
    tracing::debug!(process_instance_id = %id, process_id, "Process instance created");
    Ok(id)
}

pub(crate) async fn start_instance(
    shared: &Arc<RuntimeShared>,
    process_instance_id: &str,
    effects: &mut Vec<Effect>,
) -> Result<()> {
    let handle = shared.instance(process_instance_id)?;
    let mut guard = handle.lock().await;
    let mut exec = Execution::new(shared, &mut guard);
    let result = exec.start().await;
    effects.extend(exec.into_effects());
    shared.settled(&guard);
    result
}

async fn abort_instance(
    shared: &Arc<RuntimeShared>,
    process_instance_id: &str,
    effects: &mut Vec<Effect>,
) -> Result<()> {
    let handle = shared.instance(process_instance_id)?;
    let mut guard = handle.lock().await;
    let mut exec = Execution::new(shared, &mut guard);
    let result = exec.abort().await;
    effects.extend(exec.into_effects());
    shared.settled(&guard);
    result
}

/// Body of a timer task. Boxed so the spawned future does not have to name
/// the execution future it drives.
pub(crate) fn fire_timer(
    shared: Arc<RuntimeShared>,
    process_instance_id: String,
    timer_id: String,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let Ok(handle) = shared.instance(&process_instance_id) else {
            return;
        };
        let mut effects = Vec::new();
        {
            let mut guard = handle.lock().await;
            let mut exec = Execution::new(&shared, &mut guard);
            if let Err(e) = exec.fire_timer(&timer_id).await {
                tracing::warn!(process_instance_id = %process_instance_id, timer_id = %timer_id, error = %e, "Timer step failed");
            }
            effects.extend(exec.into_effects());
            shared.settled(&guard);
        }
        shared.dispatch(effects).await;
    })
}

// ─── ProcessRuntime ───────────────────────────────────────────

/// Entry point for hosts: start and steer process instances, and reach the
/// work item manager and signal router bound to the same registries.
#[derive(Clone)]
pub struct ProcessRuntime {
    shared: Arc<RuntimeShared>,
}

impl ProcessRuntime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Add or replace a definition. Running instances keep the version they
    /// were created from.
    pub fn register_definition(&self, definition: ProcessDefinition) {
        self.shared.register_definition(definition);
    }

    pub fn create_process_instance(
        &self,
        process_id: &str,
        variables: Variables,
        options: InstanceOptions,
    ) -> Result<String> {
        create_instance(&self.shared, process_id, variables, options)
    }

    /// PENDING → ACTIVE and run to the first wait state.
    pub async fn start_process_instance(&self, process_instance_id: &str) -> Result<()> {
        let mut effects = Vec::new();
        let result = start_instance(&self.shared, process_instance_id, &mut effects).await;
        self.shared.dispatch(effects).await;
        result
    }

    /// Create and start in one call.
    pub async fn start_process(&self, process_id: &str, variables: Variables) -> Result<String> {
        let id = self.create_process_instance(process_id, variables, InstanceOptions::default())?;
        self.start_process_instance(&id).await?;
        Ok(id)
    }

    pub async fn abort_process_instance(&self, process_instance_id: &str) -> Result<()> {
        let mut effects = Vec::new();
        let result = abort_instance(&self.shared, process_instance_id, &mut effects).await;
        self.shared.dispatch(effects).await;
        result
    }

    /// ACTIVE → SUSPENDED. Signals are not delivered. Timers that elapse and
    /// completions of awaited sub-processes are held until resume.
    pub async fn suspend_process_instance(&self, process_instance_id: &str) -> Result<()> {
        let handle = self.shared.instance(process_instance_id)?;
        let mut guard = handle.lock().await;
        if guard.state != ProcessInstanceState::Active {
            return Err(EngineError::InvalidState {
                process_instance_id: process_instance_id.to_string(),
                state: guard.state,
            });
        }
        guard.state = ProcessInstanceState::Suspended;
        tracing::info!(process_instance_id, "Process instance suspended");
        Ok(())
    }

    /// SUSPENDED → ACTIVE, replaying timers that elapsed and awaited
    /// sub-processes that finished meanwhile.
    pub async fn resume_process_instance(&self, process_instance_id: &str) -> Result<()> {
        let handle = self.shared.instance(process_instance_id)?;
        let mut effects = Vec::new();
        let result = {
            let mut guard = handle.lock().await;
            if guard.state != ProcessInstanceState::Suspended {
                return Err(EngineError::InvalidState {
                    process_instance_id: process_instance_id.to_string(),
                    state: guard.state,
                });
            }
            guard.state = ProcessInstanceState::Active;
            tracing::info!(process_instance_id, "Process instance resumed");
            let mut exec = Execution::new(&self.shared, &mut guard);
            let result = exec.replay_pending().await;
            effects.extend(exec.into_effects());
            self.shared.settled(&guard);
            result
        };
        self.shared.dispatch(effects).await;
        result
    }

    /// Signal one instance; shorthand for a process-instance scoped route.
    pub async fn signal_event(
        &self,
        process_instance_id: &str,
        event_type: &str,
        payload: Value,
    ) -> Result<SignalReceipt> {
        self.signal_router()
            .signal(
                SignalScope::ProcessInstance,
                event_type,
                payload,
                SignalContext::for_instance(process_instance_id),
            )
            .await
    }

    pub async fn process_instance(&self, process_instance_id: &str) -> Result<ProcessInstanceSnapshot> {
        let handle = self.shared.instance(process_instance_id)?;
        let guard = handle.lock().await;
        Ok(guard.snapshot())
    }

    /// Registered instances, oldest first.
    pub fn process_instance_ids(&self) -> Vec<String> {
        self.shared.instance_ids()
    }

    pub fn work_item_manager(&self) -> WorkItemManager {
        WorkItemManager::new(self.shared.clone())
    }

    pub fn signal_router(&self) -> SignalRouter {
        SignalRouter::new(self.shared.clone())
    }
}

// ─── Builder ──────────────────────────────────────────────────

#[derive(Default)]
pub struct RuntimeBuilder {
    config: EngineConfig,
    definitions: Vec<ProcessDefinition>,
    handlers: Vec<(Option<String>, SharedHandler)>,
    listeners: EventListenerBus,
    egress: Option<Arc<dyn MessageEgress>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn definition(mut self, definition: ProcessDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Register under the handler's own name.
    pub fn handler(mut self, handler: SharedHandler) -> Self {
        self.handlers.push((None, handler));
        self
    }

    pub fn handler_named(mut self, name: impl Into<String>, handler: SharedHandler) -> Self {
        self.handlers.push((Some(name.into()), handler));
        self
    }

    /// Listeners are notified in the order they are added.
    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.subscribe(listener);
        self
    }

    /// Subscribe a channel listener sized by `event_channel_capacity`.
    /// Add it after `config` for the capacity to apply.
    pub fn event_channel(mut self) -> (Self, mpsc::Receiver<ProcessEvent>) {
        let (listener, receiver) = ChannelEventListener::new(self.config.event_channel_capacity);
        self.listeners.subscribe(Arc::new(listener));
        (self, receiver)
    }

    pub fn egress(mut self, egress: Arc<dyn MessageEgress>) -> Self {
        self.egress = Some(egress);
        self
    }

    /// Fails if the egress or any explicitly added handler does not support
    /// the configured runtime kind.
    pub fn build(self) -> Result<ProcessRuntime> {
        let kind = self.config.runtime_kind;
        let egress = self.egress.unwrap_or_else(|| Arc::new(NoopEgress));
        if !egress.supports(kind) {
            return Err(EngineError::UnsupportedRuntime {
                component: egress.name().to_string(),
                kind,
            });
        }

        let shared = Arc::new(RuntimeShared {
            definitions: RwLock::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
            instances: RwLock::new(BTreeMap::new()),
            work_items: RwLock::new(HashMap::new()),
            detached: Mutex::new(BTreeMap::new()),
            listeners: self.listeners,
            egress: egress.clone(),
            config: self.config,
        });

        let human_task: SharedHandler =
            Arc::new(HumanTaskWorkItemHandler::new(shared.config.human_task_name.clone()));
        if human_task.supports(kind) {
            shared.register_handler(&shared.config.human_task_name, human_task)?;
        }
        for name in [
            shared.config.send_task_name.clone(),
            shared.config.external_send_task_name.clone(),
        ] {
            let send: SharedHandler =
                Arc::new(SendTaskWorkItemHandler::new(name.clone(), egress.clone()));
            shared.register_handler(&name, send)?;
        }

        for (name, handler) in self.handlers {
            let name = name.unwrap_or_else(|| handler.name().to_string());
            shared.register_handler(&name, handler)?;
        }
        for definition in self.definitions {
            shared.register_definition(definition);
        }

        tracing::info!(kind = ?kind, "Process runtime ready");
        Ok(ProcessRuntime { shared })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeKind;
    use crate::definition::NodeDef;
    use crate::handler::FnWorkItemHandler;
    use serde_json::json;

    fn waiting() -> ProcessDefinition {
        ProcessDefinition::builder("waiting")
            .node(NodeDef::start("start").to("wait"))
            .node(NodeDef::event_wait("wait", ["go"]).to("end"))
            .node(NodeDef::end("end"))
            .build()
            .unwrap()
    }

    fn runtime() -> ProcessRuntime {
        ProcessRuntime::builder().definition(waiting()).build().unwrap()
    }

    /// The parent is aborted before its outbox runs; the child it spawned
    /// is already registered and goes down with it instead of starting.
    #[tokio::test]
    async fn test_child_aborted_before_its_start_is_dispatched() {
        let runtime = ProcessRuntime::builder()
            .definition(waiting())
            .definition(
                ProcessDefinition::builder("parent")
                    .node(NodeDef::start("start").to("call"))
                    .node(NodeDef::sub_process("call", "waiting").to("end"))
                    .node(NodeDef::end("end"))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let shared = &runtime.shared;
        let pid = runtime
            .create_process_instance("parent", Variables::new(), InstanceOptions::default())
            .unwrap();

        let mut start_effects = Vec::new();
        start_instance(shared, &pid, &mut start_effects).await.unwrap();
        let child_id = runtime
            .process_instance_ids()
            .into_iter()
            .find(|id| id != &pid)
            .unwrap();
        assert_eq!(
            runtime.process_instance(&child_id).await.unwrap().state,
            ProcessInstanceState::Pending
        );

        let mut abort_effects = Vec::new();
        abort_instance(shared, &pid, &mut abort_effects).await.unwrap();
        shared.dispatch(abort_effects).await;
        shared.dispatch(start_effects).await;

        let child = runtime.process_instance(&child_id).await.unwrap();
        assert_eq!(child.state, ProcessInstanceState::Aborted);
        assert!(child.node_instances.is_empty());
    }

    #[tokio::test]
    async fn test_create_is_pending_until_started() {
        let runtime = runtime();
        let id = runtime
            .create_process_instance(
                "waiting",
                Variables::new(),
                InstanceOptions {
                    business_key: Some("order-7".into()),
                    reference_id: None,
                },
            )
            .unwrap();
        let snapshot = runtime.process_instance(&id).await.unwrap();
        assert_eq!(snapshot.state, ProcessInstanceState::Pending);
        assert_eq!(snapshot.business_key.as_deref(), Some("order-7"));

        runtime.start_process_instance(&id).await.unwrap();
        let snapshot = runtime.process_instance(&id).await.unwrap();
        assert_eq!(snapshot.state, ProcessInstanceState::Active);
        assert_eq!(snapshot.active_node_ids(), vec!["wait"]);

        assert!(matches!(
            runtime.start_process_instance(&id).await,
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_blank_process_ids() {
        let runtime = runtime();
        assert!(matches!(
            runtime.start_process("nope", Variables::new()).await,
            Err(EngineError::UnknownProcess(_))
        ));
        assert!(matches!(
            runtime.start_process("  ", Variables::new()).await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            runtime.process_instance("nope").await,
            Err(EngineError::UnknownInstance(_))
        ));
    }

    #[tokio::test]
    async fn test_suspend_blocks_signals_until_resume() {
        let runtime = runtime();
        let id = runtime.start_process("waiting", Variables::new()).await.unwrap();

        runtime.suspend_process_instance(&id).await.unwrap();
        assert!(matches!(
            runtime.suspend_process_instance(&id).await,
            Err(EngineError::InvalidState { .. })
        ));
        let receipt = runtime.signal_event(&id, "go", json!(null)).await.unwrap();
        assert!(receipt.is_empty());

        runtime.resume_process_instance(&id).await.unwrap();
        runtime.signal_event(&id, "go", json!(null)).await.unwrap();
        assert_eq!(
            runtime.process_instance(&id).await.unwrap().state,
            ProcessInstanceState::Completed
        );
    }

    #[tokio::test]
    async fn test_abort_is_terminal() {
        let runtime = runtime();
        let id = runtime.start_process("waiting", Variables::new()).await.unwrap();
        runtime.abort_process_instance(&id).await.unwrap();

        let snapshot = runtime.process_instance(&id).await.unwrap();
        assert_eq!(snapshot.state, ProcessInstanceState::Aborted);
        assert!(snapshot.node_instances.is_empty());
        assert!(matches!(
            runtime.abort_process_instance(&id).await,
            Err(EngineError::InvalidState { .. })
        ));
        assert!(matches!(
            runtime.resume_process_instance(&id).await,
            Err(EngineError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_terminal_instances_dropped_when_not_retained() {
        let runtime = ProcessRuntime::builder()
            .config(EngineConfig {
                retain_terminal_instances: false,
                ..EngineConfig::default()
            })
            .definition(waiting())
            .build()
            .unwrap();
        let id = runtime.start_process("waiting", Variables::new()).await.unwrap();
        assert_eq!(runtime.process_instance_ids(), vec![id.clone()]);

        runtime.signal_event(&id, "go", json!(null)).await.unwrap();
        assert!(runtime.process_instance_ids().is_empty());
    }

    #[test]
    fn test_builtin_handlers_follow_runtime_kind() {
        let runtime = ProcessRuntime::builder().build().unwrap();
        let shared = &runtime.shared;
        assert!(shared.handler("Human Task").is_some());
        assert!(shared.handler("Send Task").is_some());
        assert!(shared.handler("External Send Task").is_some());

        let serverless = ProcessRuntime::builder()
            .config(EngineConfig {
                runtime_kind: RuntimeKind::ServerlessWorkflow,
                ..EngineConfig::default()
            })
            .build()
            .unwrap();
        assert!(serverless.shared.handler("Human Task").is_none());
        assert!(serverless.shared.handler("Send Task").is_some());
    }

    #[test]
    fn test_unsupported_handler_fails_build() {
        let err = ProcessRuntime::builder()
            .config(EngineConfig {
                runtime_kind: RuntimeKind::ServerlessWorkflow,
                ..EngineConfig::default()
            })
            .handler(Arc::new(
                FnWorkItemHandler::accepting("Approve").only_for(vec![RuntimeKind::Process]),
            ))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnsupportedRuntime { .. }));
    }

    #[tokio::test]
    async fn test_event_channel_receives_lifecycle() {
        let (builder, mut rx) = ProcessRuntime::builder().definition(waiting()).event_channel();
        let runtime = builder.build().unwrap();
        runtime.start_process("waiting", Variables::new()).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ProcessEvent::BeforeProcessStarted { .. }));
    }
}
