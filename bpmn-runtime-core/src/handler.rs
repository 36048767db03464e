//! Work item handlers.
//!
//! A handler is the external system behind a work item name. The engine
//! never decides on its own whether work is done: every transition is
//! offered to the handler, which applies, defers or rejects it.

use crate::config::RuntimeKind;
use crate::egress::MessageEgress;
use crate::lifecycle::{WorkItemLifeCycle, ABORT, ACTIVATE, ACTIVE, CLAIM, COMPLETE, RELEASE};
use crate::manager::WorkItemManager;
use crate::policy::SharedPolicy;
use crate::types::Variables;
use crate::work_item::{TransitionOutcome, WorkItem, WorkItemTransition};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

#[async_trait]
pub trait WorkItemHandler: Send + Sync {
    /// Used in logs and construction errors.
    fn name(&self) -> &str;

    fn lifecycle(&self) -> &WorkItemLifeCycle;

    /// Decide what happens with `transition`. `work_item` is a staged copy
    /// that is committed only when the outcome is `Applied`.
    ///
    /// Called while the owning process instance is locked: handlers must not
    /// call back into the manager for the same instance. To finish work
    /// immediately, return `Applied` with the follow-up transition.
    async fn transition_to_phase(
        &self,
        manager: &WorkItemManager,
        work_item: &mut WorkItem,
        transition: &WorkItemTransition,
    ) -> anyhow::Result<TransitionOutcome>;

    fn allowed_transitions(&self, phase_status: Option<&str>) -> BTreeSet<String> {
        self.lifecycle()
            .phases_by_status(phase_status)
            .map(|p| p.id.clone())
            .collect()
    }

    fn new_transition(
        &self,
        phase_id: &str,
        phase_status: Option<&str>,
        data: Variables,
        policies: Vec<SharedPolicy>,
    ) -> WorkItemTransition {
        let mut transition = WorkItemTransition::new(phase_id)
            .with_data(data)
            .with_policies(policies);
        transition.termination = self
            .lifecycle()
            .phase_by_id(phase_id, phase_status)
            .and_then(|p| p.target.termination);
        transition
    }

    fn starting_transition(&self, data: Variables, policies: Vec<SharedPolicy>) -> WorkItemTransition {
        let phase_id = self
            .lifecycle()
            .starting_phase()
            .map(|p| p.id.clone())
            .unwrap_or_else(|| ACTIVATE.to_string());
        self.new_transition(&phase_id, None, data, policies)
    }

    fn complete_transition(
        &self,
        phase_status: Option<&str>,
        data: Variables,
        policies: Vec<SharedPolicy>,
    ) -> WorkItemTransition {
        self.new_transition(COMPLETE, phase_status, data, policies)
    }

    fn abort_transition(
        &self,
        phase_status: Option<&str>,
        policies: Vec<SharedPolicy>,
    ) -> WorkItemTransition {
        self.new_transition(ABORT, phase_status, Variables::new(), policies)
    }

    fn supports(&self, _kind: RuntimeKind) -> bool {
        true
    }
}

pub type SharedHandler = Arc<dyn WorkItemHandler>;

// ─── Human tasks ──────────────────────────────────────────────

/// Human task handler: tasks wait in Ready until claimed, completed, skipped
/// or aborted by a user. Claim takes the owner from the acting identity.
pub struct HumanTaskWorkItemHandler {
    name: String,
    lifecycle: WorkItemLifeCycle,
}

impl HumanTaskWorkItemHandler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lifecycle: WorkItemLifeCycle::human_task(),
        }
    }
}

#[async_trait]
impl WorkItemHandler for HumanTaskWorkItemHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> &WorkItemLifeCycle {
        &self.lifecycle
    }

    async fn transition_to_phase(
        &self,
        _manager: &WorkItemManager,
        work_item: &mut WorkItem,
        transition: &WorkItemTransition,
    ) -> anyhow::Result<TransitionOutcome> {
        let identity = transition.policies.iter().find_map(|p| p.identity());
        match transition.id.as_str() {
            CLAIM => match identity {
                Some(identity) => work_item.set_actual_owner(&identity.user)?,
                None => {
                    return Ok(TransitionOutcome::Rejected(
                        "claim requires an acting identity".to_string(),
                    ))
                }
            },
            RELEASE => work_item.clear_actual_owner(),
            COMPLETE if work_item.actual_owner.is_none() => {
                if let Some(identity) = identity {
                    work_item.set_actual_owner(&identity.user)?;
                }
            }
            _ => {}
        }
        Ok(TransitionOutcome::Applied(transition.clone()))
    }

    fn supports(&self, kind: RuntimeKind) -> bool {
        kind == RuntimeKind::Process
    }
}

// ─── Send tasks ───────────────────────────────────────────────

/// Publishes the work item parameters through the egress and completes at
/// once. Delivery runs on a spawned task; failures are logged.
pub struct SendTaskWorkItemHandler {
    name: String,
    lifecycle: WorkItemLifeCycle,
    egress: Arc<dyn MessageEgress>,
}

impl SendTaskWorkItemHandler {
    pub fn new(name: impl Into<String>, egress: Arc<dyn MessageEgress>) -> Self {
        Self {
            name: name.into(),
            lifecycle: WorkItemLifeCycle::default_lifecycle(),
            egress,
        }
    }
}

#[async_trait]
impl WorkItemHandler for SendTaskWorkItemHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> &WorkItemLifeCycle {
        &self.lifecycle
    }

    async fn transition_to_phase(
        &self,
        _manager: &WorkItemManager,
        work_item: &mut WorkItem,
        transition: &WorkItemTransition,
    ) -> anyhow::Result<TransitionOutcome> {
        if transition.id != ACTIVATE {
            return Ok(TransitionOutcome::Applied(transition.clone()));
        }

        let payload = Value::Object(
            work_item
                .parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let egress = self.egress.clone();
        let process_instance_id = work_item.process_instance_id.clone();
        let work_item_id = work_item.id.clone();
        tokio::spawn(async move {
            if let Err(e) = egress.produce(process_instance_id.as_deref(), payload).await {
                tracing::warn!(work_item_id = %work_item_id, error = %e, "Message egress failed");
            }
        });

        Ok(TransitionOutcome::Applied(self.complete_transition(
            Some(ACTIVE),
            Variables::new(),
            Vec::new(),
        )))
    }

    fn supports(&self, kind: RuntimeKind) -> bool {
        self.egress.supports(kind)
    }
}

// ─── Closure handler ──────────────────────────────────────────

type TransitionFn =
    dyn Fn(&mut WorkItem, &WorkItemTransition) -> anyhow::Result<TransitionOutcome> + Send + Sync;

/// Synchronous handler backed by a closure.
pub struct FnWorkItemHandler {
    name: String,
    lifecycle: WorkItemLifeCycle,
    runtimes: Option<Vec<RuntimeKind>>,
    f: Box<TransitionFn>,
}

impl FnWorkItemHandler {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut WorkItem, &WorkItemTransition) -> anyhow::Result<TransitionOutcome>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            lifecycle: WorkItemLifeCycle::default_lifecycle(),
            runtimes: None,
            f: Box::new(f),
        }
    }

    /// Handler that applies every transition as requested.
    pub fn accepting(name: impl Into<String>) -> Self {
        Self::new(name, |_, transition| {
            Ok(TransitionOutcome::Applied(transition.clone()))
        })
    }

    pub fn with_lifecycle(mut self, lifecycle: WorkItemLifeCycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Restrict the runtime kinds this handler may be bound to.
    pub fn only_for(mut self, kinds: Vec<RuntimeKind>) -> Self {
        self.runtimes = Some(kinds);
        self
    }
}

#[async_trait]
impl WorkItemHandler for FnWorkItemHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> &WorkItemLifeCycle {
        &self.lifecycle
    }

    async fn transition_to_phase(
        &self,
        _manager: &WorkItemManager,
        work_item: &mut WorkItem,
        transition: &WorkItemTransition,
    ) -> anyhow::Result<TransitionOutcome> {
        (self.f)(work_item, transition)
    }

    fn supports(&self, kind: RuntimeKind) -> bool {
        self.runtimes
            .as_ref()
            .map_or(true, |kinds| kinds.contains(&kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::ChannelEgress;
    use crate::lifecycle::{READY, RESERVED};
    use crate::policy::{Identity, SecurityPolicy};
    use crate::runtime::ProcessRuntime;
    use crate::work_item::Termination;
    use serde_json::json;

    fn manager() -> WorkItemManager {
        ProcessRuntime::builder().build().unwrap().work_item_manager()
    }

    #[test]
    fn test_transition_factories() {
        let handler = HumanTaskWorkItemHandler::new("Human Task");
        let start = handler.starting_transition(Variables::new(), Vec::new());
        assert_eq!(start.id, ACTIVATE);
        assert_eq!(start.termination, None);

        let complete = handler.complete_transition(Some(RESERVED), Variables::new(), Vec::new());
        assert_eq!(complete.termination, Some(Termination::Complete));

        let allowed = handler.allowed_transitions(Some(READY));
        assert!(allowed.contains(CLAIM));
        assert!(!allowed.contains(RELEASE));
    }

    #[tokio::test]
    async fn test_claim_sets_owner_from_identity() {
        let manager = manager();
        let handler = HumanTaskWorkItemHandler::new("Human Task");
        let mut item = WorkItem::new("Human Task");
        item.phase_status = Some(READY.into());

        let claim = handler.new_transition(
            CLAIM,
            Some(READY),
            Variables::new(),
            vec![SecurityPolicy::shared(Identity::new("alice"))],
        );
        handler
            .lifecycle()
            .transition_to(&manager, &handler, &mut item, claim, 8)
            .await
            .unwrap();
        assert_eq!(item.actual_owner.as_deref(), Some("alice"));
        assert_eq!(item.phase_status.as_deref(), Some(RESERVED));

        let release = handler.new_transition(RELEASE, Some(RESERVED), Variables::new(), Vec::new());
        handler
            .lifecycle()
            .transition_to(&manager, &handler, &mut item, release, 8)
            .await
            .unwrap();
        assert!(item.actual_owner.is_none());
    }

    #[tokio::test]
    async fn test_claim_without_identity_is_rejected() {
        let manager = manager();
        let handler = HumanTaskWorkItemHandler::new("Human Task");
        let mut item = WorkItem::new("Human Task");
        item.phase_status = Some(READY.into());
        let outcome = handler
            .lifecycle()
            .transition_to(&manager, &handler, &mut item, WorkItemTransition::new(CLAIM), 8)
            .await
            .unwrap();
        assert!(matches!(outcome, TransitionOutcome::Rejected(_)));
        assert_eq!(item.phase_status.as_deref(), Some(READY));
    }

    #[tokio::test]
    async fn test_send_task_produces_and_completes() {
        let manager = manager();
        let (egress, mut rx) = ChannelEgress::new(4);
        let handler = SendTaskWorkItemHandler::new("Send Task", Arc::new(egress));
        let mut item = WorkItem::new("Send Task").with_parameter("Message", json!("hello"));

        let start = handler.starting_transition(Variables::new(), Vec::new());
        handler
            .lifecycle()
            .transition_to(&manager, &handler, &mut item, start, 8)
            .await
            .unwrap();
        assert!(item.is_terminal());

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.payload["Message"], "hello");
    }

    #[test]
    fn test_runtime_support() {
        let human = HumanTaskWorkItemHandler::new("Human Task");
        assert!(human.supports(RuntimeKind::Process));
        assert!(!human.supports(RuntimeKind::ServerlessWorkflow));

        let only = FnWorkItemHandler::accepting("Rest").only_for(vec![RuntimeKind::ServerlessWorkflow]);
        assert!(!only.supports(RuntimeKind::Process));
    }
}
