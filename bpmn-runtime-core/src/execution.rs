//! Step execution.
//!
//! An `Execution` borrows one locked process instance and runs an agenda of
//! steps (trigger, leave, completion check) to quiescence. Nothing here
//! touches another instance: signals, child starts, child aborts and egress
//! are queued as effects and dispatched by the runtime once the instance
//! lock has been released.

use crate::context::NodeContext;
use crate::definition::{ActionOutcome, ContainerDef, NodeDef, NodeKind};
use crate::error::{EngineError, Fault, Result};
use crate::events::{NodeEventInfo, ProcessEvent, VariableChange};
use crate::handler::WorkItemHandler;
use crate::manager::WorkItemManager;
use crate::node_instance::{
    Cancellable, ContainerKind, NodeBody, NodeInstance, NodeInstanceContainer, Released,
};
use crate::process_instance::{
    CompletedActivity, InstanceError, InstanceOptions, ProcessInstance, ProcessInstanceState,
};
use crate::runtime::{RuntimeShared, WorkItemOwner};
use crate::signal::{SignalContext, SignalScope};
use crate::types::{
    new_id, now, process_completed_signal, NodeId, Variables, PROCESS_COMPLETED_SIGNAL_PREFIX,
    SUB_PROCESS_ABORTED_FAULT, WORK_ITEM_REJECTED_FAULT,
};
use crate::work_item::{Termination, TransitionOutcome, WorkItem, WorkItemTransition};
use serde_json::{json, Value};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// One unit of agenda work.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Trigger {
        container_id: String,
        node_id: NodeId,
    },
    Leave {
        node_instance_id: String,
        /// Overrides the node's outgoing connections.
        route: Option<Vec<NodeId>>,
    },
    CheckCompletion {
        container_id: String,
    },
}

impl Step {
    fn touches(&self, ids: &HashSet<String>) -> bool {
        match self {
            Step::Trigger { container_id, .. } | Step::CheckCompletion { container_id } => {
                ids.contains(container_id)
            }
            Step::Leave {
                node_instance_id, ..
            } => ids.contains(node_instance_id),
        }
    }
}

/// Work queued for after the instance lock is released.
#[derive(Debug)]
pub(crate) enum Effect {
    Signal {
        scope: SignalScope,
        event_type: String,
        payload: Value,
        context: SignalContext,
    },
    /// Start a child already registered as PENDING.
    StartChild {
        child_id: String,
        parent_id: String,
        process_id: String,
    },
    AbortInstance(String),
    ExecuteWorkItem(WorkItem),
    Produce {
        process_instance_id: Option<String>,
        payload: Value,
    },
}

pub(crate) struct Execution<'a> {
    shared: &'a Arc<RuntimeShared>,
    instance: &'a mut ProcessInstance,
    agenda: VecDeque<Step>,
    effects: Vec<Effect>,
    steps: usize,
}

impl<'a> Execution<'a> {
    pub(crate) fn new(shared: &'a Arc<RuntimeShared>, instance: &'a mut ProcessInstance) -> Self {
        Self {
            shared,
            instance,
            agenda: VecDeque::new(),
            effects: Vec::new(),
            steps: 0,
        }
    }

    pub(crate) fn into_effects(self) -> Vec<Effect> {
        self.effects
    }

    // ─── Entry points ─────────────────────────────────────────

    /// PENDING → ACTIVE, then trigger the root start node.
    pub(crate) async fn start(&mut self) -> Result<()> {
        if self.instance.state != ProcessInstanceState::Pending {
            return Err(self.invalid_state());
        }
        let pid = self.instance.id.clone();
        let process_id = self.instance.process_id.clone();

        self.fire(ProcessEvent::BeforeProcessStarted {
            process_instance_id: pid.clone(),
            process_id: process_id.clone(),
        });
        self.instance.state = ProcessInstanceState::Active;
        self.instance.start_date = Some(now());
        tracing::info!(process_instance_id = %pid, process_id = %process_id, "Process instance started");
        self.fire(ProcessEvent::AfterProcessStarted {
            process_instance_id: pid.clone(),
            process_id,
        });

        let start = self
            .instance
            .definition
            .container
            .start_node()
            .map(|n| n.id.clone())
            .ok_or_else(|| anyhow::anyhow!("definition has no start node"))?;
        self.agenda.push_back(Step::Trigger {
            container_id: pid,
            node_id: start,
        });
        self.run().await
    }

    /// Cancel every active node instance, then settle as ABORTED.
    pub(crate) async fn abort(&mut self) -> Result<()> {
        match self.instance.state {
            ProcessInstanceState::Pending
            | ProcessInstanceState::Active
            | ProcessInstanceState::Suspended => {
                self.abort_instance().await;
                Ok(())
            }
            _ => Err(self.invalid_state()),
        }
    }

    /// Resume every node waiting for `event_type`. Returns whether anything
    /// was waiting.
    pub(crate) async fn deliver_signal(&mut self, event_type: &str, payload: Value) -> Result<bool> {
        if self.instance.state != ProcessInstanceState::Active {
            return Ok(false);
        }
        if let Some(child_id) = event_type.strip_prefix(PROCESS_COMPLETED_SIGNAL_PREFIX) {
            return self.child_finished(child_id, payload).await;
        }

        let mut waiting = Vec::new();
        self.instance.root.visit(&mut |container, ni| {
            if ni.is_awaiting(event_type) {
                waiting.push((container.id.clone(), ni.id.clone(), ni.node_id.clone()));
            }
        });
        if waiting.is_empty() {
            return Ok(false);
        }

        for (container_id, ni_id, node_id) in waiting {
            tracing::debug!(
                process_instance_id = %self.instance.id,
                node_id = %node_id,
                event_type,
                "Signal resumes node"
            );
            if let Some(ni) = self.instance.root.find_node_instance_mut(&ni_id) {
                ni.body = NodeBody::Plain;
            }
            if let Some(NodeKind::EventWait {
                variable: Some(variable),
                ..
            }) = self.node_def(&container_id, &node_id).map(|n| n.kind)
            {
                self.set_variable(&container_id, &variable, payload.clone());
            }
            self.agenda.push_back(Step::Leave {
                node_instance_id: ni_id,
                route: None,
            });
        }
        self.run().await?;
        Ok(true)
    }

    /// A timer owned by this instance elapsed.
    pub(crate) async fn fire_timer(&mut self, timer_id: &str) -> Result<()> {
        match self.instance.state {
            ProcessInstanceState::Active => {}
            ProcessInstanceState::Suspended => {
                self.instance.timers.remove(timer_id);
                self.instance.pending_timers.push(timer_id.to_string());
                return Ok(());
            }
            _ => return Ok(()),
        }
        self.instance.timers.remove(timer_id);

        let mut fired = None;
        self.instance.root.visit(&mut |_, ni| {
            if matches!(&ni.body, NodeBody::Timer { timer_id: t } if t == timer_id) {
                fired = Some(ni.id.clone());
            }
        });
        let Some(ni_id) = fired else {
            tracing::debug!(timer_id, "Timer owner already gone");
            return Ok(());
        };
        if let Some(ni) = self.instance.root.find_node_instance_mut(&ni_id) {
            ni.body = NodeBody::Plain;
        }
        self.agenda.push_back(Step::Leave {
            node_instance_id: ni_id,
            route: None,
        });
        self.run().await
    }

    /// Replay timers and child completions held while SUSPENDED.
    pub(crate) async fn replay_pending(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.instance.pending_timers);
        for timer_id in pending {
            self.fire_timer(&timer_id).await?;
        }
        let completions = std::mem::take(&mut self.instance.pending_completions);
        for (event_type, payload) in completions {
            self.deliver_signal(&event_type, payload).await?;
        }
        Ok(())
    }

    /// Apply an externally requested transition to a work item owned by
    /// this instance.
    pub(crate) async fn transition_work_item(
        &mut self,
        work_item_id: &str,
        handler: &dyn WorkItemHandler,
        transition: WorkItemTransition,
    ) -> Result<TransitionOutcome> {
        if self.instance.state != ProcessInstanceState::Active {
            return Err(self.invalid_state());
        }

        let outcome = match self.apply_transition(work_item_id, handler, transition).await {
            Ok(outcome) => outcome,
            Err(EngineError::Internal(e)) => match e.downcast::<Fault>() {
                Ok(fault) => {
                    let reason = fault.to_string();
                    self.fault_work_item(work_item_id, fault).await?;
                    self.run().await?;
                    return Ok(TransitionOutcome::Rejected(reason));
                }
                Err(e) => {
                    return Err(EngineError::Handler {
                        work_item_id: work_item_id.to_string(),
                        message: e.to_string(),
                    })
                }
            },
            Err(e) => return Err(e),
        };
        self.run().await?;
        Ok(outcome)
    }

    /// Run the compensation handlers of completed activities. A reference
    /// equal to the process id compensates everything, newest first.
    pub(crate) async fn compensate(&mut self, activity_ref: &str) -> Result<bool> {
        let all = activity_ref == self.instance.process_id;
        let mut selected = Vec::new();
        let mut index = self.instance.completed_activities.len();
        while index > 0 {
            index -= 1;
            if all || self.instance.completed_activities[index].node_id == activity_ref {
                selected.push(self.instance.completed_activities.remove(index));
                if !all {
                    break;
                }
            }
        }

        let mut triggered = false;
        for activity in selected {
            if self.instance.root.find_container(&activity.container_id).is_none() {
                tracing::debug!(node_id = %activity.node_id, "Compensation scope already gone");
                continue;
            }
            tracing::info!(
                process_instance_id = %self.instance.id,
                node_id = %activity.node_id,
                handler = %activity.handler_node,
                "Compensating activity"
            );
            self.agenda.push_back(Step::Trigger {
                container_id: activity.container_id,
                node_id: activity.handler_node,
            });
            triggered = true;
        }
        self.run().await?;
        Ok(triggered)
    }

    // ─── Agenda ───────────────────────────────────────────────

    async fn run(&mut self) -> Result<()> {
        while let Some(step) = self.agenda.pop_front() {
            if self.instance.state != ProcessInstanceState::Active {
                self.agenda.clear();
                break;
            }
            self.steps += 1;
            if self.steps > self.shared.config.max_steps {
                let node_id = match &step {
                    Step::Trigger { node_id, .. } => node_id.clone(),
                    _ => String::new(),
                };
                let limit = self.shared.config.max_steps;
                return Err(self.fail(&node_id, format!("step limit of {limit} exceeded")));
            }
            match step {
                Step::Trigger {
                    container_id,
                    node_id,
                } => self.trigger(&container_id, &node_id).await?,
                Step::Leave {
                    node_instance_id,
                    route,
                } => self.leave(&node_instance_id, route).await?,
                Step::CheckCompletion { container_id } => self.check_completion(&container_id),
            }
        }
        Ok(())
    }

    async fn trigger(&mut self, container_id: &str, node_id: &str) -> Result<()> {
        let pid = self.instance.id.clone();
        let Some(container) = self.instance.root.find_container_mut(container_id) else {
            tracing::debug!(container_id, node_id, "Container gone, trigger dropped");
            return Ok(());
        };
        let Some(node) = container
            .definition
            .as_ref()
            .and_then(|def| def.node(node_id).cloned())
        else {
            return Err(self.fail(node_id, format!("unknown node '{node_id}'")));
        };

        if matches!(node.kind, NodeKind::Join) {
            return self.arrive_at_join(container_id, &node);
        }

        let ni = NodeInstance::new(container, node_id, &node.name);
        let info = node_info(&pid, &ni);
        let ni_id = ni.id.clone();
        container.node_instances.push(ni);

        self.fire(ProcessEvent::BeforeNodeTriggered(info.clone()));
        self.execute_node(container_id, &ni_id, &node).await?;
        if self.instance.state == ProcessInstanceState::Active
            && self.instance.root.find_node_instance(&ni_id).is_some()
        {
            self.fire(ProcessEvent::AfterNodeTriggered(info));
        }
        Ok(())
    }

    fn arrive_at_join(&mut self, container_id: &str, node: &NodeDef) -> Result<()> {
        let pid = self.instance.id.clone();
        let Some(container) = self.instance.root.find_container_mut(container_id) else {
            return Ok(());
        };
        let expected = container
            .definition
            .as_ref()
            .map_or(1, |def| def.incoming_count(&node.id))
            .max(1);

        if let Some(ni) = container.node_instance_by_node(&node.id) {
            if let NodeBody::Join { arrived } = &mut ni.body {
                *arrived += 1;
                if *arrived >= expected {
                    let ni_id = ni.id.clone();
                    self.agenda.push_back(Step::Leave {
                        node_instance_id: ni_id,
                        route: None,
                    });
                }
                return Ok(());
            }
        }

        let mut ni = NodeInstance::new(container, &node.id, &node.name);
        ni.body = NodeBody::Join { arrived: 1 };
        let info = node_info(&pid, &ni);
        let ni_id = ni.id.clone();
        container.node_instances.push(ni);

        self.fire(ProcessEvent::BeforeNodeTriggered(info.clone()));
        self.fire(ProcessEvent::AfterNodeTriggered(info));
        if expected <= 1 {
            self.agenda.push_back(Step::Leave {
                node_instance_id: ni_id,
                route: None,
            });
        }
        Ok(())
    }

    async fn execute_node(&mut self, container_id: &str, ni_id: &str, node: &NodeDef) -> Result<()> {
        match &node.kind {
            NodeKind::Start | NodeKind::End { .. } => self.continue_with(ni_id, None),

            NodeKind::Action(action) => {
                let Some(ni) = self.instance.root.find_node_instance(ni_id) else {
                    return Ok(());
                };
                let mut ctx = NodeContext::new(self.instance, container_id, ni);
                match action.execute(&mut ctx) {
                    Ok(outcome) => {
                        let (writes, effects) = ctx.into_parts();
                        for (name, value) in writes {
                            self.set_variable(container_id, &name, value);
                        }
                        self.effects.extend(effects);
                        let route = match outcome {
                            ActionOutcome::Complete => None,
                            ActionOutcome::Route(targets) => Some(targets),
                        };
                        self.continue_with(ni_id, route);
                    }
                    Err(fault) => self.escalate(container_id, ni_id, fault).await?,
                }
            }

            NodeKind::WorkItem { name, parameters } => {
                self.activate_work_item(container_id, ni_id, node, name, parameters)
                    .await?
            }

            NodeKind::EventWait { event_types, .. } => {
                self.set_body(
                    ni_id,
                    NodeBody::EventWait {
                        event_types: event_types.clone(),
                    },
                );
            }

            NodeKind::Timer { delay_ms } => self.schedule_timer(ni_id, *delay_ms),

            NodeKind::Join => self.continue_with(ni_id, None),

            NodeKind::Throw {
                fault,
                payload_variable,
            } => {
                let payload = payload_variable
                    .as_deref()
                    .and_then(|v| self.instance.variable(container_id, v))
                    .unwrap_or(Value::Null);
                let fault = Fault::new(fault.clone()).with_payload(payload);
                self.escalate(container_id, ni_id, fault).await?;
            }

            NodeKind::Composite { container } => {
                let start = container.start_node().map(|n| n.id.clone());
                let locals = container.local_variables().clone();
                self.nest(container_id, ni_id, ContainerKind::Composite, Some(container.clone()), locals);
                if let Some(start) = start {
                    self.agenda.push_back(Step::Trigger {
                        container_id: ni_id.to_string(),
                        node_id: start,
                    });
                }
            }

            NodeKind::ForEach {
                collection,
                item,
                body,
            } => {
                let elements = match self.instance.variable(container_id, collection) {
                    None | Some(Value::Null) => Vec::new(),
                    Some(Value::Array(elements)) => elements,
                    Some(other) => {
                        return Err(self.fail(
                            &node.id,
                            format!("for-each collection '{collection}' is not an array: {other}"),
                        ))
                    }
                };
                self.nest(container_id, ni_id, ContainerKind::ForEach, None, Variables::new());
                if elements.is_empty() {
                    self.agenda.push_back(Step::CheckCompletion {
                        container_id: ni_id.to_string(),
                    });
                    return Ok(());
                }

                let start = body.start_node().map(|n| n.id.clone());
                for element in elements {
                    let Some(each) = self.instance.root.find_container_mut(ni_id) else {
                        break;
                    };
                    let mut iteration = NodeInstance::new(each, &node.id, &node.name);
                    let mut scope = body.local_variables().clone();
                    scope.insert(item.clone(), element);
                    let nested = NodeInstanceContainer::nested(
                        each,
                        &iteration,
                        ContainerKind::ForEachIteration,
                        Some(body.clone()),
                        scope,
                    );
                    iteration.body = NodeBody::Container(nested);
                    let iteration_id = iteration.id.clone();
                    each.node_instances.push(iteration);
                    if let Some(start) = &start {
                        self.agenda.push_back(Step::Trigger {
                            container_id: iteration_id,
                            node_id: start.clone(),
                        });
                    }
                }
            }

            NodeKind::SubProcess {
                process_id,
                wait_for_completion,
                independent,
                ..
            } => {
                let Some(child_definition) = self.shared.definition(process_id) else {
                    return Err(self.fail(
                        &node.id,
                        format!("unknown process definition '{process_id}'"),
                    ));
                };
                let visible = self.instance.visible_variables(container_id);
                let variables: Variables = node
                    .inputs
                    .iter()
                    .filter_map(|m| visible.get(&m.source).map(|v| (m.target.clone(), v.clone())))
                    .collect();
                let child_id = new_id();
                tracing::info!(
                    process_instance_id = %self.instance.id,
                    child_id = %child_id,
                    process_id = %process_id,
                    "Starting sub-process"
                );
                // Registered PENDING under the parent lock so a racing abort
                // of the parent always finds the child.
                let child = ProcessInstance::with_id(
                    child_id.clone(),
                    child_definition,
                    variables,
                    InstanceOptions::default(),
                )
                .with_parent(self.instance.id.clone(), self.instance.root_id().to_string());
                self.shared.insert_instance(child);
                self.effects.push(Effect::StartChild {
                    child_id: child_id.clone(),
                    parent_id: self.instance.id.clone(),
                    process_id: process_id.clone(),
                });
                if *wait_for_completion {
                    self.set_body(
                        ni_id,
                        NodeBody::SubProcess {
                            child_id,
                            independent: *independent,
                        },
                    );
                } else {
                    self.continue_with(ni_id, None);
                }
            }
        }
        Ok(())
    }

    async fn leave(&mut self, ni_id: &str, route: Option<Vec<NodeId>>) -> Result<()> {
        let pid = self.instance.id.clone();
        let Some(container) = self.instance.root.parent_of(ni_id) else {
            tracing::debug!(node_instance_id = ni_id, "Node instance gone, leave dropped");
            return Ok(());
        };
        let container_id = container.id.clone();
        let definition = container.definition.clone();
        let Some(ni) = container.node_instance(ni_id) else {
            return Ok(());
        };
        let node_id = ni.node_id.clone();
        let info = node_info(&pid, ni);
        if let Some(ni) = self.instance.root.find_node_instance_mut(ni_id) {
            ni.exited_at = Some(now());
        }

        self.fire(ProcessEvent::BeforeNodeLeft(info.clone()));
        if let Some(handler) = definition
            .as_ref()
            .and_then(|def| def.compensation_handler(&node_id))
        {
            self.instance
                .completed_activities
                .push(CompletedActivity {
                    container_id: container_id.clone(),
                    node_id: node_id.clone(),
                    handler_node: handler.clone(),
                });
        }
        if let Some(container) = self.instance.root.find_container_mut(&container_id) {
            container.remove(ni_id);
        }
        self.fire(ProcessEvent::AfterNodeLeft(info));

        // Nothing to route to without a definition node.
        let Some(node) = definition.as_ref().and_then(|def| def.node(&node_id).cloned()) else {
            self.agenda.push_back(Step::CheckCompletion { container_id });
            return Ok(());
        };

        if matches!(node.kind, NodeKind::End { terminate: true }) {
            tracing::info!(container_id = %container_id, node_id = %node_id, "Terminate end reached");
            self.cancel_container(&container_id).await;
            self.agenda.push_back(Step::CheckCompletion { container_id });
            return Ok(());
        }

        let targets = route.unwrap_or_else(|| node.outgoing.clone());
        if let Some(unknown) = targets
            .iter()
            .find(|t| definition.as_ref().map_or(true, |def| def.node(t).is_none()))
        {
            let message = format!("route target '{unknown}' does not exist");
            return Err(self.fail(&node_id, message));
        }
        if targets.is_empty() {
            self.agenda.push_back(Step::CheckCompletion { container_id });
        } else {
            for target in targets {
                self.agenda.push_back(Step::Trigger {
                    container_id: container_id.clone(),
                    node_id: target,
                });
            }
        }
        Ok(())
    }

    fn check_completion(&mut self, container_id: &str) {
        let Some(container) = self.instance.root.find_container(container_id) else {
            return;
        };
        let pending = self.agenda.iter().any(|s| {
            matches!(s, Step::Trigger { container_id: c, .. } if c == container_id)
        });
        if !container.is_empty() || pending {
            return;
        }

        match container.kind {
            ContainerKind::Process => self.settle(ProcessInstanceState::Completed),
            ContainerKind::Composite | ContainerKind::ForEach => {
                self.agenda.push_back(Step::Leave {
                    node_instance_id: container_id.to_string(),
                    route: None,
                });
            }
            ContainerKind::ForEachIteration => {
                let Some(each_id) = self.instance.root.parent_of(container_id).map(|c| c.id.clone())
                else {
                    return;
                };
                if let Some(each) = self.instance.root.find_container_mut(&each_id) {
                    if let Some(mut iteration) = each.remove(container_id) {
                        iteration.exited_at = Some(now());
                    }
                    if each.is_empty() {
                        self.agenda.push_back(Step::Leave {
                            node_instance_id: each_id,
                            route: None,
                        });
                    }
                }
            }
        }
    }

    // ─── Work items ───────────────────────────────────────────

    async fn activate_work_item(
        &mut self,
        container_id: &str,
        ni_id: &str,
        node: &NodeDef,
        name: &str,
        parameters: &Variables,
    ) -> Result<()> {
        let Some(handler) = self.shared.handler(name) else {
            return Err(self.fail(&node.id, format!("no work item handler registered for '{name}'")));
        };

        let mut item = WorkItem::new(name);
        item.parameters = parameters.clone();
        let visible = self.instance.visible_variables(container_id);
        for mapping in &node.inputs {
            if let Some(value) = visible.get(&mapping.source) {
                item.parameters.insert(mapping.target.clone(), value.clone());
            }
        }
        item.node_instance_id = Some(ni_id.to_string());
        item.process_instance_id = Some(self.instance.id.clone());
        item.node_id = Some(node.id.clone());

        let work_item_id = item.id.clone();
        self.set_body(
            ni_id,
            NodeBody::WorkItem {
                work_item_id: work_item_id.clone(),
            },
        );
        self.instance.work_items.insert(work_item_id.clone(), item);
        self.shared.index_work_item(
            &work_item_id,
            WorkItemOwner::Instance(self.instance.id.clone()),
        );

        let transition = handler.starting_transition(Variables::new(), Vec::new());
        match self
            .apply_transition(&work_item_id, handler.as_ref(), transition)
            .await
        {
            Ok(TransitionOutcome::Rejected(reason)) => {
                let fault = Fault::new(WORK_ITEM_REJECTED_FAULT)
                    .with_payload(json!({ "workItemId": work_item_id, "reason": reason }));
                self.fault_work_item(&work_item_id, fault).await
            }
            Ok(_) => Ok(()),
            Err(EngineError::Internal(e)) => match e.downcast::<Fault>() {
                Ok(fault) => self.fault_work_item(&work_item_id, fault).await,
                Err(e) => Err(self.fail(&node.id, format!("work item activation failed: {e}"))),
            },
            Err(e) => Err(self.fail(&node.id, e.to_string())),
        }
    }

    /// Move one owned work item along its lifecycle and resume its node when
    /// it terminates.
    async fn apply_transition(
        &mut self,
        work_item_id: &str,
        handler: &dyn WorkItemHandler,
        transition: WorkItemTransition,
    ) -> Result<TransitionOutcome> {
        let mut item = self
            .instance
            .work_items
            .get(work_item_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownWorkItem(work_item_id.to_string()))?;
        let before = item.clone();
        let requested = transition.id.clone();

        self.fire(ProcessEvent::BeforeWorkItemTransition {
            process_instance_id: Some(self.instance.id.clone()),
            work_item_id: work_item_id.to_string(),
            transition: requested.clone(),
            from_status: item.phase_status.clone(),
        });

        let manager = WorkItemManager::new(self.shared.clone());
        let outcome = handler
            .lifecycle()
            .transition_to(
                &manager,
                handler,
                &mut item,
                transition,
                self.shared.config.max_transition_hops,
            )
            .await?;

        if item != before {
            self.fire(ProcessEvent::AfterWorkItemTransition {
                process_instance_id: Some(self.instance.id.clone()),
                work_item_id: work_item_id.to_string(),
                transition: item.phase_id.clone().unwrap_or(requested),
                to_status: item.phase_status.clone(),
            });
        }

        if item.is_terminal() {
            self.instance.work_items.remove(work_item_id);
            self.shared.unindex_work_item(work_item_id);
            self.resume_after_work_item(&item);
        } else {
            self.instance.work_items.insert(work_item_id.to_string(), item);
        }
        Ok(outcome)
    }

    /// Complete maps results to variables before leaving; abort just leaves.
    fn resume_after_work_item(&mut self, item: &WorkItem) {
        let Some(ni_id) = item.node_instance_id.as_deref() else {
            return;
        };
        let Some((container_id, node_id)) = self.locate(ni_id) else {
            return;
        };
        self.set_body(ni_id, NodeBody::Plain);

        if item.termination == Some(Termination::Complete) {
            let outputs = self
                .node_def(&container_id, &node_id)
                .map(|n| n.outputs)
                .unwrap_or_default();
            for mapping in outputs {
                if let Some(value) = item.results.get(&mapping.source) {
                    self.set_variable(&container_id, &mapping.target, value.clone());
                }
            }
        }
        self.continue_with(ni_id, None);
    }

    /// Drop the work item and escalate `fault` from its node.
    async fn fault_work_item(&mut self, work_item_id: &str, fault: Fault) -> Result<()> {
        let item = self.instance.work_items.remove(work_item_id);
        self.shared.unindex_work_item(work_item_id);
        let Some(ni_id) = item.and_then(|i| i.node_instance_id) else {
            return Ok(());
        };
        let Some((container_id, _)) = self.locate(&ni_id) else {
            return Ok(());
        };
        self.set_body(&ni_id, NodeBody::Plain);
        self.escalate(&container_id, &ni_id, fault).await
    }

    // ─── Sub-processes ────────────────────────────────────────

    async fn child_finished(&mut self, child_id: &str, payload: Value) -> Result<bool> {
        let mut owner = None;
        self.instance.root.visit(&mut |container, ni| {
            if matches!(&ni.body, NodeBody::SubProcess { child_id: c, .. } if c == child_id) {
                owner = Some((container.id.clone(), ni.id.clone(), ni.node_id.clone()));
            }
        });
        let Some((container_id, ni_id, node_id)) = owner else {
            return Ok(false);
        };
        self.set_body(&ni_id, NodeBody::Plain);

        let state: Option<ProcessInstanceState> =
            serde_json::from_value(payload["state"].clone()).ok();
        let node = self.node_def(&container_id, &node_id);

        if state == Some(ProcessInstanceState::Completed) {
            let outputs = node.map(|n| n.outputs).unwrap_or_default();
            for mapping in outputs {
                if let Some(value) = payload["variables"].get(&mapping.source) {
                    self.set_variable(&container_id, &mapping.target, value.clone());
                }
            }
            self.continue_with(&ni_id, None);
        } else {
            let abort_parent = matches!(
                node.map(|n| n.kind),
                Some(NodeKind::SubProcess {
                    abort_parent: true,
                    ..
                })
            );
            tracing::info!(
                process_instance_id = %self.instance.id,
                child_id,
                state = ?state,
                abort_parent,
                "Sub-process did not complete"
            );
            if abort_parent {
                let fault = Fault::new(SUB_PROCESS_ABORTED_FAULT)
                    .with_payload(json!({ "processInstanceId": child_id, "state": state }));
                self.escalate(&container_id, &ni_id, fault).await?;
            } else {
                self.continue_with(&ni_id, None);
            }
        }
        self.run().await?;
        Ok(true)
    }

    // ─── Faults, cancellation, settlement ─────────────────────

    /// Offer `fault` to the exception handlers of `container_id` and then
    /// its ancestors. The first match cancels the faulting branch inside its
    /// container and triggers the handler node; no match aborts the instance.
    async fn escalate(&mut self, container_id: &str, ni_id: &str, fault: Fault) -> Result<()> {
        let chain = self.instance.scope_chain(container_id);
        for (depth, scope_id) in chain.iter().enumerate() {
            let Some(handler) = self
                .instance
                .root
                .find_container(scope_id)
                .and_then(|c| c.definition.as_ref())
                .and_then(|def| def.exception_handler_for(&fault.name).cloned())
            else {
                continue;
            };

            tracing::info!(
                process_instance_id = %self.instance.id,
                fault = %fault.name,
                handler = %handler.handler_node,
                "Fault caught"
            );
            let branch = if depth == 0 {
                ni_id.to_string()
            } else {
                chain[depth - 1].clone()
            };
            let removed = self
                .instance
                .root
                .find_container_mut(scope_id)
                .and_then(|c| c.remove(&branch));
            if let Some(mut removed) = removed {
                self.purge_agenda(&subtree_ids(&removed));
                let released = removed.cancel();
                self.release(released).await;
            }
            if let Some(variable) = &handler.fault_variable {
                self.set_variable(scope_id, variable, fault.payload.clone());
            }
            self.agenda.push_back(Step::Trigger {
                container_id: scope_id.clone(),
                node_id: handler.handler_node,
            });
            return Ok(());
        }

        tracing::warn!(
            process_instance_id = %self.instance.id,
            fault = %fault.name,
            "Unhandled fault, aborting process instance"
        );
        self.abort_instance().await;
        Err(EngineError::UnhandledFault {
            process_instance_id: self.instance.id.clone(),
            fault: fault.name,
        })
    }

    async fn cancel_container(&mut self, container_id: &str) {
        let Some(container) = self.instance.root.find_container_mut(container_id) else {
            return;
        };
        let mut ids = HashSet::new();
        for ni in &container.node_instances {
            ids.extend(subtree_ids(ni));
        }
        let released = container.cancel();
        self.agenda.retain(|s| {
            !s.touches(&ids)
                && !matches!(s, Step::Trigger { container_id: c, .. } if c == container_id)
        });
        self.release(released).await;
    }

    async fn abort_instance(&mut self) {
        self.agenda.clear();
        let released = self.instance.root.cancel();
        self.release(released).await;
        self.settle(ProcessInstanceState::Aborted);
    }

    /// Give back what cancelled node instances were holding.
    async fn release(&mut self, released: Vec<Released>) {
        for resource in released {
            match resource {
                Released::WorkItem(id) => {
                    let Some(item) = self.instance.work_items.remove(&id) else {
                        continue;
                    };
                    self.shared.unindex_work_item(&id);
                    // Activation was deferred: the handler never took the item on.
                    if item.phase_status.is_none() {
                        tracing::debug!(work_item_id = %id, "Unactivated work item released");
                        continue;
                    }
                    let Some(handler) = self.shared.handler(&item.name) else {
                        continue;
                    };
                    let manager = WorkItemManager::new(self.shared.clone());
                    let mut staged = item.clone();
                    let transition =
                        handler.abort_transition(item.phase_status.as_deref(), Vec::new());
                    match handler
                        .lifecycle()
                        .transition_to(
                            &manager,
                            handler.as_ref(),
                            &mut staged,
                            transition,
                            self.shared.config.max_transition_hops,
                        )
                        .await
                    {
                        Ok(_) => tracing::debug!(work_item_id = %id, "Work item aborted"),
                        Err(e) => {
                            tracing::warn!(work_item_id = %id, error = %e, "Handler abort failed")
                        }
                    }
                }
                Released::Timer(id) => {
                    if let Some(handle) = self.instance.timers.remove(&id) {
                        handle.abort();
                    }
                    self.instance.pending_timers.retain(|t| t != &id);
                }
                Released::ChildInstance(id) => self.effects.push(Effect::AbortInstance(id)),
            }
        }
    }

    /// Drive the instance to ERROR, keeping its tree for inspection.
    fn fail(&mut self, node_id: &str, message: String) -> EngineError {
        tracing::error!(
            process_instance_id = %self.instance.id,
            node_id,
            message = %message,
            "Process instance failed"
        );
        self.agenda.clear();
        self.instance.error = Some(InstanceError {
            node_id: node_id.to_string(),
            message: message.clone(),
        });
        self.settle(ProcessInstanceState::Error);
        EngineError::ProcessInstanceInError {
            process_instance_id: self.instance.id.clone(),
            node_id: node_id.to_string(),
            message,
        }
    }

    fn settle(&mut self, state: ProcessInstanceState) {
        let pid = self.instance.id.clone();
        let process_id = self.instance.process_id.clone();
        self.fire(ProcessEvent::BeforeProcessCompleted {
            process_instance_id: pid.clone(),
            process_id: process_id.clone(),
            state,
        });
        self.instance.state = state;
        self.instance.end_date = Some(now());
        for (_, handle) in self.instance.timers.drain() {
            handle.abort();
        }
        self.instance.pending_timers.clear();
        self.instance.pending_completions.clear();
        tracing::info!(process_instance_id = %pid, state = ?state, "Process instance settled");
        self.fire(ProcessEvent::AfterProcessCompleted {
            process_instance_id: pid.clone(),
            process_id,
            state,
        });

        if let Some(parent) = self.instance.parent_process_instance_id.clone() {
            self.effects.push(Effect::Signal {
                scope: SignalScope::ProcessInstance,
                event_type: process_completed_signal(&pid),
                payload: json!({ "state": state, "variables": self.instance.variables }),
                context: SignalContext::for_instance(parent),
            });
        }
    }

    // ─── Helpers ──────────────────────────────────────────────

    fn schedule_timer(&mut self, ni_id: &str, delay_ms: u64) {
        let timer_id = new_id();
        let shared = Arc::downgrade(self.shared);
        let pid = self.instance.id.clone();
        let tid = timer_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(shared) = shared.upgrade() {
                crate::runtime::fire_timer(shared, pid, tid).await;
            }
        })
        .abort_handle();
        self.instance.timers.insert(timer_id.clone(), handle);
        self.set_body(ni_id, NodeBody::Timer { timer_id });
    }

    /// Create the container owned by node instance `ni_id`.
    fn nest(
        &mut self,
        container_id: &str,
        ni_id: &str,
        kind: ContainerKind,
        definition: Option<Arc<ContainerDef>>,
        variables: Variables,
    ) {
        let Some(parent) = self.instance.root.find_container_mut(container_id) else {
            return;
        };
        let Some(owner) = parent.node_instance(ni_id) else {
            return;
        };
        let nested = NodeInstanceContainer::nested(parent, owner, kind, definition, variables);
        if let Some(owner) = parent.node_instance_mut(ni_id) {
            owner.body = NodeBody::Container(nested);
        }
    }

    /// Write to the innermost scope declaring `name`, else process scope.
    /// Unchanged values fire no events.
    fn set_variable(&mut self, container_id: &str, name: &str, value: Value) {
        let holder = self.instance.scope_holder(container_id, name);
        let old = match &holder {
            Some(id) => self
                .instance
                .root
                .find_container(id)
                .and_then(|c| c.variables.get(name).cloned()),
            None => self.instance.variables.get(name).cloned(),
        };
        if old.as_ref() == Some(&value) {
            return;
        }

        let change = VariableChange {
            process_instance_id: self.instance.id.clone(),
            variable: name.to_string(),
            old_value: old,
            new_value: value.clone(),
        };
        self.fire(ProcessEvent::BeforeVariableChanged(change.clone()));
        match holder.and_then(|id| self.instance.root.find_container_mut(&id)) {
            Some(container) => {
                container.variables.insert(name.to_string(), value);
            }
            None => {
                self.instance.variables.insert(name.to_string(), value);
            }
        }
        self.fire(ProcessEvent::AfterVariableChanged(change));
    }

    fn continue_with(&mut self, ni_id: &str, route: Option<Vec<NodeId>>) {
        self.agenda.push_back(Step::Leave {
            node_instance_id: ni_id.to_string(),
            route,
        });
    }

    fn set_body(&mut self, ni_id: &str, body: NodeBody) {
        if let Some(ni) = self.instance.root.find_node_instance_mut(ni_id) {
            ni.body = body;
        }
    }

    /// Container id and definition node id of a node instance.
    fn locate(&self, ni_id: &str) -> Option<(String, NodeId)> {
        let container = self.instance.root.parent_of(ni_id)?;
        let ni = container.node_instance(ni_id)?;
        Some((container.id.clone(), ni.node_id.clone()))
    }

    fn node_def(&self, container_id: &str, node_id: &str) -> Option<NodeDef> {
        self.instance
            .root
            .find_container(container_id)?
            .definition
            .as_ref()?
            .node(node_id)
            .cloned()
    }

    fn purge_agenda(&mut self, ids: &HashSet<String>) {
        self.agenda.retain(|s| !s.touches(ids));
    }

    fn fire(&self, event: ProcessEvent) {
        self.shared.fire(event);
    }

    fn invalid_state(&self) -> EngineError {
        EngineError::InvalidState {
            process_instance_id: self.instance.id.clone(),
            state: self.instance.state,
        }
    }
}

fn node_info(process_instance_id: &str, ni: &NodeInstance) -> NodeEventInfo {
    NodeEventInfo {
        process_instance_id: process_instance_id.to_string(),
        node_id: ni.node_id.clone(),
        node_name: ni.node_name.clone(),
        node_instance_id: ni.id.clone(),
        qualified_node_id: ni.qualified_node_id.clone(),
        qualified_node_instance_id: ni.qualified_id.clone(),
    }
}

/// Ids of `ni`, every node instance below it and every container below it.
fn subtree_ids(ni: &NodeInstance) -> HashSet<String> {
    let mut ids = HashSet::from([ni.id.clone()]);
    if let Some(container) = ni.container() {
        ids.extend(container.container_ids());
        container.visit(&mut |_, nested| {
            ids.insert(nested.id.clone());
        });
    }
    ids
}
