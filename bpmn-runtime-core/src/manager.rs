//! Work item operations for callers outside the engine.
//!
//! Every mutating call resolves the item, locks the process instance that
//! owns it and delegates to the item's lifecycle. Calls against the same
//! instance therefore serialize, and a second completion of the same item
//! finds it gone.

use crate::error::{EngineError, Result};
use crate::events::ProcessEvent;
use crate::execution::{Effect, Execution};
use crate::handler::{SharedHandler, WorkItemHandler};
use crate::policy::SharedPolicy;
use crate::process_instance::ProcessInstanceState;
use crate::runtime::{RuntimeShared, WorkItemOwner};
use crate::types::{require_non_blank, Variables};
use crate::work_item::{TransitionOutcome, WorkItem, WorkItemTransition};
use std::collections::BTreeSet;
use std::sync::Arc;

#[derive(Clone)]
pub struct WorkItemManager {
    shared: Arc<RuntimeShared>,
}

impl WorkItemManager {
    pub(crate) fn new(shared: Arc<RuntimeShared>) -> Self {
        Self { shared }
    }

    pub async fn complete_work_item(
        &self,
        work_item_id: &str,
        results: Variables,
        policies: Vec<SharedPolicy>,
    ) -> Result<TransitionOutcome> {
        self.transition_with(work_item_id, move |handler, item| {
            handler.complete_transition(item.phase_status.as_deref(), results, policies)
        })
        .await
    }

    pub async fn abort_work_item(
        &self,
        work_item_id: &str,
        policies: Vec<SharedPolicy>,
    ) -> Result<TransitionOutcome> {
        self.transition_with(work_item_id, move |handler, item| {
            handler.abort_transition(item.phase_status.as_deref(), policies)
        })
        .await
    }

    /// Apply a caller-built transition, e.g. a claim or a skip.
    pub async fn transition_work_item(
        &self,
        work_item_id: &str,
        transition: WorkItemTransition,
    ) -> Result<TransitionOutcome> {
        self.transition_with(work_item_id, move |_, _| transition).await
    }

    /// Read-modify-write under the same exclusion as completion. Policies
    /// are checked first. Identity, phase and back-references cannot be
    /// changed this way; parameters, results and owner can.
    pub async fn update_work_item<R, F>(
        &self,
        work_item_id: &str,
        updater: F,
        policies: Vec<SharedPolicy>,
    ) -> Result<R>
    where
        F: FnOnce(&mut WorkItem) -> R + Send,
    {
        match self.owner(work_item_id)? {
            WorkItemOwner::Instance(pid) => {
                let handle = self.instance_of(work_item_id, &pid)?;
                let mut guard = handle.lock().await;
                let item = guard
                    .work_items
                    .get_mut(work_item_id)
                    .ok_or_else(|| EngineError::UnknownWorkItem(work_item_id.to_string()))?;
                enforce(&policies, item)?;
                Ok(apply_update(item, updater))
            }
            WorkItemOwner::Detached => {
                let mut table = self.shared.detached.lock().await;
                let item = table
                    .get_mut(work_item_id)
                    .ok_or_else(|| EngineError::UnknownWorkItem(work_item_id.to_string()))?;
                enforce(&policies, item)?;
                Ok(apply_update(item, updater))
            }
        }
    }

    pub fn register_work_item_handler(&self, name: &str, handler: SharedHandler) -> Result<()> {
        self.shared.register_handler(name, handler)
    }

    pub async fn get_work_item(&self, work_item_id: &str, policies: &[SharedPolicy]) -> Result<WorkItem> {
        let item = self.lookup(work_item_id).await?;
        enforce(policies, &item)?;
        Ok(item)
    }

    /// Phase ids reachable from the item's current status.
    pub async fn allowed_transitions(&self, work_item_id: &str) -> Result<BTreeSet<String>> {
        let item = self.lookup(work_item_id).await?;
        let handler = self.handler_for(&item)?;
        Ok(handler.allowed_transitions(item.phase_status.as_deref()))
    }

    /// In-flight work items owned by one process instance.
    pub async fn work_items(&self, process_instance_id: &str) -> Result<Vec<WorkItem>> {
        let handle = self.shared.instance(process_instance_id)?;
        let guard = handle.lock().await;
        Ok(guard.work_items.values().cloned().collect())
    }

    /// Start a work item that belongs to no node, e.g. an outbound message.
    pub async fn internal_execute_work_item(&self, work_item: WorkItem) -> Result<String> {
        execute_detached(&self.shared, work_item).await
    }

    // ─── Internals ────────────────────────────────────────────

    async fn transition_with<F>(&self, work_item_id: &str, build: F) -> Result<TransitionOutcome>
    where
        F: FnOnce(&dyn WorkItemHandler, &WorkItem) -> WorkItemTransition + Send,
    {
        let mut effects = Vec::new();
        let result = self.transition_inner(work_item_id, build, &mut effects).await;
        self.shared.dispatch(effects).await;
        result
    }

    async fn transition_inner<F>(
        &self,
        work_item_id: &str,
        build: F,
        effects: &mut Vec<Effect>,
    ) -> Result<TransitionOutcome>
    where
        F: FnOnce(&dyn WorkItemHandler, &WorkItem) -> WorkItemTransition + Send,
    {
        match self.owner(work_item_id)? {
            WorkItemOwner::Instance(pid) => {
                let handle = self.instance_of(work_item_id, &pid)?;
                let mut guard = handle.lock().await;
                let item = guard
                    .work_items
                    .get(work_item_id)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownWorkItem(work_item_id.to_string()))?;
                if guard.state != ProcessInstanceState::Active {
                    return Err(EngineError::InvalidState {
                        process_instance_id: pid,
                        state: guard.state,
                    });
                }
                let handler = self.handler_for(&item)?;
                let transition = build(handler.as_ref(), &item);

                let mut exec = Execution::new(&self.shared, &mut guard);
                let result = exec
                    .transition_work_item(work_item_id, handler.as_ref(), transition)
                    .await;
                effects.extend(exec.into_effects());
                self.shared.settled(&guard);
                result
            }
            WorkItemOwner::Detached => {
                let mut table = self.shared.detached.lock().await;
                let mut item = table
                    .get(work_item_id)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownWorkItem(work_item_id.to_string()))?;
                let handler = self.handler_for(&item)?;
                let transition = build(handler.as_ref(), &item);
                let outcome =
                    transition_detached(&self.shared, self, handler.as_ref(), &mut item, transition)
                        .await?;
                if item.is_terminal() {
                    table.remove(work_item_id);
                    self.shared.unindex_work_item(work_item_id);
                } else {
                    table.insert(work_item_id.to_string(), item);
                }
                Ok(outcome)
            }
        }
    }

    async fn lookup(&self, work_item_id: &str) -> Result<WorkItem> {
        let found = match self.owner(work_item_id)? {
            WorkItemOwner::Instance(pid) => {
                let handle = self.instance_of(work_item_id, &pid)?;
                let guard = handle.lock().await;
                guard.work_items.get(work_item_id).cloned()
            }
            WorkItemOwner::Detached => self.shared.detached.lock().await.get(work_item_id).cloned(),
        };
        found.ok_or_else(|| EngineError::UnknownWorkItem(work_item_id.to_string()))
    }

    fn owner(&self, work_item_id: &str) -> Result<WorkItemOwner> {
        self.shared
            .work_item_owner(work_item_id)
            .ok_or_else(|| EngineError::UnknownWorkItem(work_item_id.to_string()))
    }

    /// The owning instance; an item whose instance was dropped is unknown.
    fn instance_of(
        &self,
        work_item_id: &str,
        process_instance_id: &str,
    ) -> Result<Arc<tokio::sync::Mutex<crate::process_instance::ProcessInstance>>> {
        self.shared
            .instance(process_instance_id)
            .map_err(|_| EngineError::UnknownWorkItem(work_item_id.to_string()))
    }

    fn handler_for(&self, item: &WorkItem) -> Result<SharedHandler> {
        self.shared
            .handler(&item.name)
            .ok_or_else(|| EngineError::UnknownHandler(item.name.clone()))
    }
}

/// Start a detached work item and keep it until it terminates.
pub(crate) async fn execute_detached(shared: &Arc<RuntimeShared>, mut item: WorkItem) -> Result<String> {
    require_non_blank(&item.id, "work item id")?;
    require_non_blank(&item.name, "work item name")?;
    let handler = shared
        .handler(&item.name)
        .ok_or_else(|| EngineError::UnknownHandler(item.name.clone()))?;
    let manager = WorkItemManager::new(shared.clone());
    let id = item.id.clone();
    item.node_instance_id = None;
    item.node_id = None;

    let mut table = shared.detached.lock().await;
    if table.contains_key(&id) || shared.work_item_owner(&id).is_some() {
        return Err(EngineError::InvalidArgument(format!(
            "work item {id} already exists"
        )));
    }
    shared.index_work_item(&id, WorkItemOwner::Detached);

    let transition = handler.starting_transition(Variables::new(), Vec::new());
    match transition_detached(shared, &manager, handler.as_ref(), &mut item, transition).await {
        Ok(TransitionOutcome::Rejected(reason)) => {
            shared.unindex_work_item(&id);
            Err(EngineError::Handler {
                work_item_id: id,
                message: format!("rejected: {reason}"),
            })
        }
        Ok(_) => {
            tracing::debug!(work_item_id = %id, name = %item.name, status = ?item.phase_status, "Detached work item started");
            if item.is_terminal() {
                shared.unindex_work_item(&id);
            } else {
                table.insert(id.clone(), item);
            }
            Ok(id)
        }
        Err(e) => {
            shared.unindex_work_item(&id);
            Err(e)
        }
    }
}

async fn transition_detached(
    shared: &Arc<RuntimeShared>,
    manager: &WorkItemManager,
    handler: &dyn WorkItemHandler,
    item: &mut WorkItem,
    transition: WorkItemTransition,
) -> Result<TransitionOutcome> {
    let before = item.clone();
    let requested = transition.id.clone();
    shared.fire(ProcessEvent::BeforeWorkItemTransition {
        process_instance_id: item.process_instance_id.clone(),
        work_item_id: item.id.clone(),
        transition: requested.clone(),
        from_status: item.phase_status.clone(),
    });

    let outcome = handler
        .lifecycle()
        .transition_to(
            manager,
            handler,
            item,
            transition,
            shared.config.max_transition_hops,
        )
        .await
        .map_err(|e| match e {
            EngineError::Internal(e) => EngineError::Handler {
                work_item_id: before.id.clone(),
                message: e.to_string(),
            },
            other => other,
        })?;

    if *item != before {
        shared.fire(ProcessEvent::AfterWorkItemTransition {
            process_instance_id: item.process_instance_id.clone(),
            work_item_id: item.id.clone(),
            transition: item.phase_id.clone().unwrap_or(requested),
            to_status: item.phase_status.clone(),
        });
    }
    Ok(outcome)
}

fn enforce(policies: &[SharedPolicy], item: &WorkItem) -> Result<()> {
    for policy in policies {
        policy
            .enforce(item)
            .map_err(|reason| EngineError::PolicyViolation {
                work_item_id: item.id.clone(),
                policy: policy.name().to_string(),
                reason,
            })?;
    }
    Ok(())
}

fn apply_update<R>(item: &mut WorkItem, updater: impl FnOnce(&mut WorkItem) -> R) -> R {
    let pinned = item.clone();
    let result = updater(item);
    item.id = pinned.id;
    item.name = pinned.name;
    item.phase_id = pinned.phase_id;
    item.phase_status = pinned.phase_status;
    item.termination = pinned.termination;
    item.start_date = pinned.start_date;
    item.complete_date = pinned.complete_date;
    item.node_instance_id = pinned.node_instance_id;
    item.process_instance_id = pinned.process_instance_id;
    item.node_id = pinned.node_id;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{NodeDef, ProcessDefinition};
    use crate::handler::FnWorkItemHandler;
    use crate::lifecycle::{ACTIVE, COMPLETE};
    use crate::policy::{FnPolicy, Identity, SecurityPolicy};
    use crate::runtime::ProcessRuntime;
    use serde_json::json;

    fn runtime() -> ProcessRuntime {
        ProcessRuntime::builder()
            .definition(
                ProcessDefinition::builder("review")
                    .node(NodeDef::start("start").to("task"))
                    .node(
                        NodeDef::work_item("task", "Review")
                            .parameter("ActorId", json!("alice"))
                            .input("document", "Document")
                            .output("verdict", "verdict")
                            .to("end"),
                    )
                    .node(NodeDef::end("end"))
                    .build()
                    .unwrap(),
            )
            .handler(Arc::new(FnWorkItemHandler::accepting("Review")))
            .build()
            .unwrap()
    }

    async fn started(runtime: &ProcessRuntime) -> (String, WorkItem) {
        let mut vars = Variables::new();
        vars.insert("document".into(), json!("contract.pdf"));
        let pid = runtime.start_process("review", vars).await.unwrap();
        let item = runtime
            .work_item_manager()
            .work_items(&pid)
            .await
            .unwrap()
            .pop()
            .unwrap();
        (pid, item)
    }

    #[tokio::test]
    async fn test_complete_maps_results_and_resumes_node() {
        let runtime = runtime();
        let (pid, item) = started(&runtime).await;
        assert_eq!(item.phase_status.as_deref(), Some(ACTIVE));
        assert_eq!(item.parameter("Document"), Some(&json!("contract.pdf")));

        let mut results = Variables::new();
        results.insert("verdict".into(), json!("approved"));
        let outcome = runtime
            .work_item_manager()
            .complete_work_item(&item.id, results, Vec::new())
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let snapshot = runtime.process_instance(&pid).await.unwrap();
        assert_eq!(snapshot.state, ProcessInstanceState::Completed);
        assert_eq!(snapshot.variable("verdict"), Some(&json!("approved")));
        assert!(snapshot.node_instances.is_empty());
    }

    #[tokio::test]
    async fn test_second_completion_is_unknown() {
        let runtime = runtime();
        let (_, item) = started(&runtime).await;
        let manager = runtime.work_item_manager();
        manager
            .complete_work_item(&item.id, Variables::new(), Vec::new())
            .await
            .unwrap();
        let err = manager
            .complete_work_item(&item.id, Variables::new(), Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownWorkItem(_)));
    }

    #[tokio::test]
    async fn test_abort_leaves_without_mapping() {
        let runtime = runtime();
        let (pid, item) = started(&runtime).await;
        runtime
            .work_item_manager()
            .abort_work_item(&item.id, Vec::new())
            .await
            .unwrap();
        let snapshot = runtime.process_instance(&pid).await.unwrap();
        assert_eq!(snapshot.state, ProcessInstanceState::Completed);
        assert_eq!(snapshot.variable("verdict"), None);
    }

    #[tokio::test]
    async fn test_policy_violation_leaves_item_unchanged() {
        let runtime = runtime();
        let (pid, item) = started(&runtime).await;
        let manager = runtime.work_item_manager();

        let err = manager
            .complete_work_item(
                &item.id,
                Variables::new(),
                vec![SecurityPolicy::shared(Identity::new("mallory"))],
            )
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        let unchanged = manager.get_work_item(&item.id, &[]).await.unwrap();
        assert_eq!(unchanged, item);
        assert_eq!(
            runtime.process_instance(&pid).await.unwrap().state,
            ProcessInstanceState::Active
        );

        manager
            .complete_work_item(
                &item.id,
                Variables::new(),
                vec![SecurityPolicy::shared(Identity::new("alice"))],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_transition_is_reported() {
        let runtime = runtime();
        let (_, item) = started(&runtime).await;
        let err = runtime
            .work_item_manager()
            .transition_work_item(&item.id, WorkItemTransition::new("claim"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_update_cannot_touch_identity() {
        let runtime = runtime();
        let (_, item) = started(&runtime).await;
        let manager = runtime.work_item_manager();

        let previous = manager
            .update_work_item(
                &item.id,
                |w| {
                    w.id = "hijacked".into();
                    w.phase_status = Some("Completed".into());
                    w.parameters.insert("Priority".into(), json!(1));
                    w.parameters.len()
                },
                Vec::new(),
            )
            .await
            .unwrap();
        assert_eq!(previous, 3);

        let updated = manager.get_work_item(&item.id, &[]).await.unwrap();
        assert_eq!(updated.id, item.id);
        assert_eq!(updated.phase_status.as_deref(), Some(ACTIVE));
        assert_eq!(updated.parameter("Priority"), Some(&json!(1)));

        let veto: SharedPolicy = Arc::new(FnPolicy::new("frozen", |_| Err("frozen".to_string())));
        let err = manager
            .update_work_item(&item.id, |w| w.parameters.clear(), vec![veto])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PolicyViolation { .. }));
    }

    #[tokio::test]
    async fn test_allowed_transitions_follow_status() {
        let runtime = runtime();
        let (_, item) = started(&runtime).await;
        let allowed = runtime
            .work_item_manager()
            .allowed_transitions(&item.id)
            .await
            .unwrap();
        assert!(allowed.contains(COMPLETE));
        assert!(!allowed.contains("activate"));
    }

    #[tokio::test]
    async fn test_detached_work_item_lifecycle() {
        let runtime = runtime();
        let manager = runtime.work_item_manager();
        let id = manager
            .internal_execute_work_item(WorkItem::new("Review"))
            .await
            .unwrap();
        assert_eq!(
            manager.get_work_item(&id, &[]).await.unwrap().phase_status.as_deref(),
            Some(ACTIVE)
        );
        manager
            .complete_work_item(&id, Variables::new(), Vec::new())
            .await
            .unwrap();
        assert!(matches!(
            manager.get_work_item(&id, &[]).await,
            Err(EngineError::UnknownWorkItem(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_handler_and_blank_name() {
        let runtime = runtime();
        let manager = runtime.work_item_manager();
        assert!(matches!(
            manager.internal_execute_work_item(WorkItem::new("Nobody")).await,
            Err(EngineError::UnknownHandler(_))
        ));
        assert!(matches!(
            manager.internal_execute_work_item(WorkItem::new(" ")).await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.get_work_item("missing", &[]).await,
            Err(EngineError::UnknownWorkItem(_))
        ));
    }

    #[tokio::test]
    async fn test_detached_blank_id_is_rejected() {
        let runtime = runtime();
        let manager = runtime.work_item_manager();
        let mut item = WorkItem::new("Review");
        item.id = "  ".into();
        assert!(matches!(
            manager.internal_execute_work_item(item).await,
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            manager.get_work_item("  ", &[]).await,
            Err(EngineError::UnknownWorkItem(_)) | Err(EngineError::InvalidArgument(_))
        ));
    }
}
