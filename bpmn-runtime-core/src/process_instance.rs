use crate::definition::ProcessDefinition;
use crate::node_instance::{NodeBody, NodeInstanceContainer};
use crate::types::{new_id, process_completed_signal, NodeId, Timestamp, Variables};
use crate::work_item::WorkItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::task::AbortHandle;

// ─── State ────────────────────────────────────────────────────

/// PENDING → ACTIVE → {COMPLETED, ABORTED, ERROR}; ACTIVE ⇄ SUSPENDED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessInstanceState {
    Pending,
    Active,
    Completed,
    Aborted,
    Suspended,
    Error,
}

impl ProcessInstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessInstanceState::Completed
                | ProcessInstanceState::Aborted
                | ProcessInstanceState::Error
        )
    }
}

/// Why an instance is in ERROR.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstanceError {
    pub node_id: String,
    pub message: String,
}

/// Caller-supplied correlation data for a new instance.
#[derive(Clone, Debug, Default)]
pub struct InstanceOptions {
    pub business_key: Option<String>,
    pub reference_id: Option<String>,
}

/// A completed activity that registered a compensation handler.
#[derive(Clone, Debug)]
pub(crate) struct CompletedActivity {
    pub container_id: String,
    pub node_id: NodeId,
    pub handler_node: NodeId,
}

// ─── ProcessInstance ──────────────────────────────────────────

/// One running execution of a process definition.
///
/// Process variables live in `variables`; composite and iteration scopes
/// live on their containers. COMPLETED implies an empty root container.
#[derive(Debug)]
pub struct ProcessInstance {
    pub id: String,
    pub process_id: String,
    pub process_version: String,
    pub state: ProcessInstanceState,
    pub variables: Variables,
    pub root: NodeInstanceContainer,
    pub parent_process_instance_id: Option<String>,
    pub root_process_instance_id: Option<String>,
    pub reference_id: Option<String>,
    pub business_key: Option<String>,
    pub start_date: Option<Timestamp>,
    pub end_date: Option<Timestamp>,
    pub error: Option<InstanceError>,
    pub(crate) definition: Arc<ProcessDefinition>,
    pub(crate) work_items: BTreeMap<String, WorkItem>,
    pub(crate) timers: HashMap<String, AbortHandle>,
    /// Timers that fired while SUSPENDED, replayed on resume.
    pub(crate) pending_timers: Vec<String>,
    /// Awaited child completions that arrived while SUSPENDED.
    pub(crate) pending_completions: Vec<(String, Value)>,
    pub(crate) completed_activities: Vec<CompletedActivity>,
}

impl ProcessInstance {
    pub(crate) fn new(
        definition: Arc<ProcessDefinition>,
        variables: Variables,
        options: InstanceOptions,
    ) -> Self {
        Self::with_id(new_id(), definition, variables, options)
    }

    pub(crate) fn with_id(
        id: String,
        definition: Arc<ProcessDefinition>,
        variables: Variables,
        options: InstanceOptions,
    ) -> Self {
        let mut initial = definition.container.local_variables().clone();
        initial.extend(variables);
        Self {
            root: NodeInstanceContainer::root(&id, definition.container.clone()),
            process_id: definition.id.clone(),
            process_version: definition.version.clone(),
            state: ProcessInstanceState::Pending,
            variables: initial,
            parent_process_instance_id: None,
            root_process_instance_id: None,
            reference_id: options.reference_id,
            business_key: options.business_key,
            start_date: None,
            end_date: None,
            error: None,
            definition,
            work_items: BTreeMap::new(),
            timers: HashMap::new(),
            pending_timers: Vec::new(),
            pending_completions: Vec::new(),
            completed_activities: Vec::new(),
            id,
        }
    }

    pub(crate) fn with_parent(mut self, parent_id: String, root_id: String) -> Self {
        self.parent_process_instance_id = Some(parent_id);
        self.root_process_instance_id = Some(root_id);
        self
    }

    /// Root of the call hierarchy this instance belongs to.
    pub fn root_id(&self) -> &str {
        self.root_process_instance_id.as_deref().unwrap_or(&self.id)
    }

    pub fn definition(&self) -> &ProcessDefinition {
        &self.definition
    }

    pub fn node_instance_count(&self) -> usize {
        self.root.count_node_instances()
    }

    /// Whether delivering `event_type` would resume anything.
    pub fn is_awaiting(&self, event_type: &str) -> bool {
        let mut awaiting = false;
        self.root.visit(&mut |_, ni| {
            awaiting |= ni.is_awaiting(event_type)
                || matches!(&ni.body, NodeBody::SubProcess { child_id, .. }
                    if process_completed_signal(child_id) == event_type);
        });
        awaiting
    }

    // ── Variable scopes ──

    /// Container ids from `container_id` outwards to the root.
    pub(crate) fn scope_chain(&self, container_id: &str) -> Vec<String> {
        self.root
            .path_to(container_id)
            .map(|path| path.iter().rev().map(|c| c.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Variables visible from `container_id`; inner scopes shadow outer ones.
    pub(crate) fn visible_variables(&self, container_id: &str) -> Variables {
        let mut merged = self.variables.clone();
        if let Some(path) = self.root.path_to(container_id) {
            for container in path {
                merged.extend(
                    container
                        .variables
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone())),
                );
            }
        }
        merged
    }

    pub(crate) fn variable(&self, container_id: &str, name: &str) -> Option<Value> {
        self.visible_variables(container_id).remove(name)
    }

    /// The innermost container declaring `name`, `None` for process scope.
    pub(crate) fn scope_holder(&self, container_id: &str, name: &str) -> Option<String> {
        self.scope_chain(container_id).into_iter().find(|id| {
            self.root
                .find_container(id)
                .is_some_and(|c| c.variables.contains_key(name))
        })
    }

    // ── Snapshots ──

    pub fn snapshot(&self) -> ProcessInstanceSnapshot {
        let mut node_instances = Vec::new();
        self.root.visit(&mut |container, ni| {
            node_instances.push(NodeInstanceSnapshot {
                id: ni.id.clone(),
                node_id: ni.node_id.clone(),
                node_name: ni.node_name.clone(),
                qualified_node_id: ni.qualified_node_id.clone(),
                qualified_id: ni.qualified_id.clone(),
                container_id: container.id.clone(),
                entered_at: ni.entered_at,
            });
        });
        ProcessInstanceSnapshot {
            id: self.id.clone(),
            process_id: self.process_id.clone(),
            process_version: self.process_version.clone(),
            state: self.state,
            variables: self.variables.clone(),
            parent_process_instance_id: self.parent_process_instance_id.clone(),
            root_process_instance_id: self.root_process_instance_id.clone(),
            reference_id: self.reference_id.clone(),
            business_key: self.business_key.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            error: self.error.clone(),
            node_instances,
            work_items: self.work_items.values().cloned().collect(),
        }
    }
}

impl Drop for ProcessInstance {
    fn drop(&mut self) {
        for handle in self.timers.values() {
            handle.abort();
        }
    }
}

/// Read-only view handed to callers.
#[derive(Clone, Debug, Serialize)]
pub struct ProcessInstanceSnapshot {
    pub id: String,
    pub process_id: String,
    pub process_version: String,
    pub state: ProcessInstanceState,
    pub variables: Variables,
    pub parent_process_instance_id: Option<String>,
    pub root_process_instance_id: Option<String>,
    pub reference_id: Option<String>,
    pub business_key: Option<String>,
    pub start_date: Option<Timestamp>,
    pub end_date: Option<Timestamp>,
    pub error: Option<InstanceError>,
    pub node_instances: Vec<NodeInstanceSnapshot>,
    pub work_items: Vec<WorkItem>,
}

impl ProcessInstanceSnapshot {
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn active_node_ids(&self) -> Vec<&str> {
        self.node_instances
            .iter()
            .map(|ni| ni.node_id.as_str())
            .collect()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeInstanceSnapshot {
    pub id: String,
    pub node_id: NodeId,
    pub node_name: String,
    pub qualified_node_id: String,
    pub qualified_id: String,
    pub container_id: String,
    pub entered_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{ContainerDef, NodeDef};
    use crate::node_instance::{ContainerKind, NodeInstance};
    use serde_json::json;

    fn definition() -> Arc<ProcessDefinition> {
        Arc::new(
            ProcessDefinition::builder("orders")
                .variable("total", json!(0))
                .node(NodeDef::start("start").to("end"))
                .node(NodeDef::end("end"))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_state_terminality() {
        assert!(!ProcessInstanceState::Pending.is_terminal());
        assert!(!ProcessInstanceState::Suspended.is_terminal());
        assert!(ProcessInstanceState::Error.is_terminal());
        assert_eq!(
            serde_json::to_value(ProcessInstanceState::Active).unwrap(),
            json!("ACTIVE")
        );
    }

    #[test]
    fn test_new_instance_defaults() {
        let mut vars = Variables::new();
        vars.insert("customer".into(), json!("acme"));
        let pi = ProcessInstance::new(
            definition(),
            vars,
            InstanceOptions {
                business_key: Some("order-7".into()),
                reference_id: None,
            },
        );
        assert_eq!(pi.state, ProcessInstanceState::Pending);
        assert_eq!(pi.variables["total"], 0);
        assert_eq!(pi.variables["customer"], "acme");
        assert_eq!(pi.root.id, pi.id);
        assert_eq!(pi.snapshot().business_key.as_deref(), Some("order-7"));
    }

    #[test]
    fn test_child_inherits_root_id() {
        let parent = ProcessInstance::new(definition(), Variables::new(), InstanceOptions::default());
        let child = ProcessInstance::new(definition(), Variables::new(), InstanceOptions::default())
            .with_parent(parent.id.clone(), parent.root_id().to_string());
        let grandchild =
            ProcessInstance::new(definition(), Variables::new(), InstanceOptions::default())
                .with_parent(child.id.clone(), child.root_id().to_string());
        assert_eq!(child.root_process_instance_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(grandchild.root_process_instance_id.as_deref(), Some(parent.id.as_str()));
        assert_eq!(grandchild.parent_process_instance_id.as_deref(), Some(child.id.as_str()));
    }

    /// Inner scopes shadow the process scope; writes find the declaring scope.
    #[test]
    fn test_variable_scoping() {
        let mut pi = ProcessInstance::new(definition(), Variables::new(), InstanceOptions::default());
        let body = ContainerDef::builder()
            .node(NodeDef::start("s").to("e"))
            .node(NodeDef::end("e"))
            .build()
            .unwrap();

        let mut owner = NodeInstance::new(&pi.root, "sub", "sub");
        let mut locals = Variables::new();
        locals.insert("total".into(), json!(99));
        owner.body = NodeBody::Container(NodeInstanceContainer::nested(
            &pi.root,
            &owner,
            ContainerKind::Composite,
            Some(body),
            locals,
        ));
        let sub = owner.id.clone();
        pi.root.node_instances.push(owner);

        assert_eq!(pi.variable(&sub, "total"), Some(json!(99)));
        assert_eq!(pi.variable(&pi.id.clone(), "total"), Some(json!(0)));
        assert_eq!(pi.scope_holder(&sub, "total"), Some(sub.clone()));
        assert_eq!(pi.scope_holder(&sub, "missing"), None);
        assert_eq!(pi.scope_chain(&sub), vec![sub.clone(), pi.id.clone()]);
    }

    #[test]
    fn test_is_awaiting() {
        let mut pi = ProcessInstance::new(definition(), Variables::new(), InstanceOptions::default());
        let mut wait = NodeInstance::new(&pi.root, "wait", "wait");
        wait.body = NodeBody::EventWait {
            event_types: vec!["approved".into(), "rejected".into()],
        };
        pi.root.node_instances.push(wait);
        let mut call = NodeInstance::new(&pi.root, "call", "call");
        call.body = NodeBody::SubProcess {
            child_id: "c1".into(),
            independent: false,
        };
        pi.root.node_instances.push(call);

        assert!(pi.is_awaiting("rejected"));
        assert!(pi.is_awaiting(&process_completed_signal("c1")));
        assert!(!pi.is_awaiting("shipped"));
        assert_eq!(pi.snapshot().active_node_ids(), vec!["wait", "call"]);
    }
}
