//! Executable node graphs.
//!
//! Definitions are built in code and validated once at build time; the
//! engine never mutates them. Containers nest: composite and for-each nodes
//! carry their own `ContainerDef`.

use crate::context::NodeContext;
use crate::error::{EngineError, Fault, Result};
use crate::types::{require_non_blank, NodeId, Variables};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

// ─── Node actions ─────────────────────────────────────────────

/// What an action wants the engine to do once it returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// Leave through every outgoing connection.
    Complete,
    /// Leave through the listed connections only (exclusive/inclusive split).
    Route(Vec<NodeId>),
}

/// Business logic plugged into an action node.
///
/// Returning a `Fault` discards the action's variable writes and queued
/// signals, and escalates the fault through the enclosing exception scopes.
pub trait NodeAction: Send + Sync {
    fn execute(&self, ctx: &mut NodeContext) -> std::result::Result<ActionOutcome, Fault>;
}

/// Closure-backed action.
pub struct FnAction<F>(pub F);

impl<F> NodeAction for FnAction<F>
where
    F: Fn(&mut NodeContext) -> std::result::Result<ActionOutcome, Fault> + Send + Sync,
{
    fn execute(&self, ctx: &mut NodeContext) -> std::result::Result<ActionOutcome, Fault> {
        (self.0)(ctx)
    }
}

// ─── Nodes ────────────────────────────────────────────────────

/// Copy `source` to `target`. The direction depends on where it is used:
/// node inputs read variables into parameters, node outputs write results
/// back into variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMapping {
    pub source: String,
    pub target: String,
}

#[derive(Clone)]
pub enum NodeKind {
    Start,
    End {
        terminate: bool,
    },
    Action(Arc<dyn NodeAction>),
    /// Dispatch to the handler registered under `name`.
    WorkItem {
        name: String,
        parameters: Variables,
    },
    /// Wait until any of `event_types` is signalled. The payload is stored
    /// in `variable` when set.
    EventWait {
        event_types: Vec<String>,
        variable: Option<String>,
    },
    Timer {
        delay_ms: u64,
    },
    /// AND-join over every incoming connection.
    Join,
    Throw {
        fault: String,
        payload_variable: Option<String>,
    },
    Composite {
        container: Arc<ContainerDef>,
    },
    /// Run `body` once per element of the `collection` variable, with the
    /// element bound to `item` in the iteration scope.
    ForEach {
        collection: String,
        item: String,
        body: Arc<ContainerDef>,
    },
    SubProcess {
        process_id: String,
        wait_for_completion: bool,
        independent: bool,
        abort_parent: bool,
    },
}

impl NodeKind {
    fn label(&self) -> &'static str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End { .. } => "end",
            NodeKind::Action(_) => "action",
            NodeKind::WorkItem { .. } => "work item",
            NodeKind::EventWait { .. } => "event wait",
            NodeKind::Timer { .. } => "timer",
            NodeKind::Join => "join",
            NodeKind::Throw { .. } => "throw",
            NodeKind::Composite { .. } => "composite",
            NodeKind::ForEach { .. } => "for-each",
            NodeKind::SubProcess { .. } => "sub-process",
        }
    }
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::WorkItem { name, .. } => write!(f, "WorkItem({name})"),
            NodeKind::EventWait { event_types, .. } => write!(f, "EventWait({event_types:?})"),
            NodeKind::Timer { delay_ms } => write!(f, "Timer({delay_ms}ms)"),
            NodeKind::Throw { fault, .. } => write!(f, "Throw({fault})"),
            NodeKind::SubProcess { process_id, .. } => write!(f, "SubProcess({process_id})"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeDef {
    pub id: NodeId,
    pub name: String,
    pub kind: NodeKind,
    pub outgoing: Vec<NodeId>,
    pub inputs: Vec<DataMapping>,
    pub outputs: Vec<DataMapping>,
    misuse: Vec<String>,
}

impl NodeDef {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            outgoing: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            misuse: Vec::new(),
        }
    }

    pub fn start(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::End { terminate: false })
    }

    pub fn terminate_end(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::End { terminate: true })
    }

    pub fn action(id: impl Into<NodeId>, action: impl NodeAction + 'static) -> Self {
        Self::new(id, NodeKind::Action(Arc::new(action)))
    }

    pub fn script<F>(id: impl Into<NodeId>, f: F) -> Self
    where
        F: Fn(&mut NodeContext) -> std::result::Result<ActionOutcome, Fault>
            + Send
            + Sync
            + 'static,
    {
        Self::action(id, FnAction(f))
    }

    pub fn work_item(id: impl Into<NodeId>, name: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::WorkItem {
                name: name.into(),
                parameters: Variables::new(),
            },
        )
    }

    pub fn event_wait<I, S>(id: impl Into<NodeId>, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            id,
            NodeKind::EventWait {
                event_types: event_types.into_iter().map(Into::into).collect(),
                variable: None,
            },
        )
    }

    pub fn timer(id: impl Into<NodeId>, delay_ms: u64) -> Self {
        Self::new(id, NodeKind::Timer { delay_ms })
    }

    pub fn join(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Join)
    }

    pub fn throw(id: impl Into<NodeId>, fault: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::Throw {
                fault: fault.into(),
                payload_variable: None,
            },
        )
    }

    pub fn composite(id: impl Into<NodeId>, container: Arc<ContainerDef>) -> Self {
        Self::new(id, NodeKind::Composite { container })
    }

    pub fn for_each(
        id: impl Into<NodeId>,
        collection: impl Into<String>,
        item: impl Into<String>,
        body: Arc<ContainerDef>,
    ) -> Self {
        Self::new(
            id,
            NodeKind::ForEach {
                collection: collection.into(),
                item: item.into(),
                body,
            },
        )
    }

    /// Calls `process_id`, waiting for it to finish by default.
    pub fn sub_process(id: impl Into<NodeId>, process_id: impl Into<String>) -> Self {
        Self::new(
            id,
            NodeKind::SubProcess {
                process_id: process_id.into(),
                wait_for_completion: true,
                independent: false,
                abort_parent: true,
            },
        )
    }

    // ── Chained configuration ──

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn to(mut self, target: impl Into<NodeId>) -> Self {
        self.outgoing.push(target.into());
        self
    }

    /// Variable (or parent variable) `source` → parameter (or child variable) `target`.
    pub fn input(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.inputs.push(DataMapping {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Result (or child variable) `source` → variable `target`.
    pub fn output(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.outputs.push(DataMapping {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    pub fn parameter(self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        self.configure("parameter", |kind| match kind {
            NodeKind::WorkItem { parameters, .. } => {
                parameters.insert(key, value);
                true
            }
            _ => false,
        })
    }

    pub fn variable(self, variable: impl Into<String>) -> Self {
        let variable = variable.into();
        self.configure("variable", |kind| match kind {
            NodeKind::EventWait { variable: v, .. } => {
                *v = Some(variable);
                true
            }
            _ => false,
        })
    }

    pub fn payload_variable(self, variable: impl Into<String>) -> Self {
        let variable = variable.into();
        self.configure("payload_variable", |kind| match kind {
            NodeKind::Throw {
                payload_variable, ..
            } => {
                *payload_variable = Some(variable);
                true
            }
            _ => false,
        })
    }

    pub fn wait_for_completion(self, wait: bool) -> Self {
        self.configure("wait_for_completion", |kind| match kind {
            NodeKind::SubProcess {
                wait_for_completion,
                ..
            } => {
                *wait_for_completion = wait;
                true
            }
            _ => false,
        })
    }

    pub fn independent(self, value: bool) -> Self {
        self.configure("independent", |kind| match kind {
            NodeKind::SubProcess { independent, .. } => {
                *independent = value;
                true
            }
            _ => false,
        })
    }

    pub fn abort_parent(self, value: bool) -> Self {
        self.configure("abort_parent", |kind| match kind {
            NodeKind::SubProcess { abort_parent, .. } => {
                *abort_parent = value;
                true
            }
            _ => false,
        })
    }

    /// Kind-specific setters on the wrong kind are reported at build time.
    fn configure(mut self, setting: &str, apply: impl FnOnce(&mut NodeKind) -> bool) -> Self {
        if !apply(&mut self.kind) {
            self.misuse.push(format!(
                "'{setting}' does not apply to {} node '{}'",
                self.kind.label(),
                self.id
            ));
        }
        self
    }
}

// ─── Exception scopes ─────────────────────────────────────────

/// Routes a fault raised inside the container to `handler_node`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandlerDef {
    /// `None` catches every fault.
    pub fault_name: Option<String>,
    /// Receives the fault payload before the handler node runs.
    pub fault_variable: Option<String>,
    pub handler_node: NodeId,
}

impl ExceptionHandlerDef {
    pub fn catching(fault_name: impl Into<String>, handler_node: impl Into<NodeId>) -> Self {
        Self {
            fault_name: Some(fault_name.into()),
            fault_variable: None,
            handler_node: handler_node.into(),
        }
    }

    pub fn catch_all(handler_node: impl Into<NodeId>) -> Self {
        Self {
            fault_name: None,
            fault_variable: None,
            handler_node: handler_node.into(),
        }
    }

    pub fn variable(mut self, variable: impl Into<String>) -> Self {
        self.fault_variable = Some(variable.into());
        self
    }

    fn matches(&self, fault: &str) -> bool {
        self.fault_name.as_deref().map_or(true, |name| name == fault)
    }
}

// ─── Containers ───────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct ContainerDef {
    nodes: Vec<NodeDef>,
    local_variables: Variables,
    exception_handlers: Vec<ExceptionHandlerDef>,
    compensation_handlers: BTreeMap<NodeId, NodeId>,
}

impl ContainerDef {
    pub fn builder() -> ContainerDefBuilder {
        ContainerDefBuilder::default()
    }

    pub fn nodes(&self) -> &[NodeDef] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&NodeDef> {
        self.nodes.iter().find(|n| matches!(n.kind, NodeKind::Start))
    }

    pub fn incoming_count(&self, id: &str) -> usize {
        self.nodes
            .iter()
            .map(|n| n.outgoing.iter().filter(|t| t.as_str() == id).count())
            .sum()
    }

    pub fn local_variables(&self) -> &Variables {
        &self.local_variables
    }

    /// Exact name match wins over a catch-all in the same container.
    pub fn exception_handler_for(&self, fault: &str) -> Option<&ExceptionHandlerDef> {
        self.exception_handlers
            .iter()
            .find(|h| h.fault_name.as_deref() == Some(fault))
            .or_else(|| self.exception_handlers.iter().find(|h| h.matches(fault)))
    }

    pub fn compensation_handler(&self, activity: &str) -> Option<&NodeId> {
        self.compensation_handlers.get(activity)
    }
}

#[derive(Default)]
pub struct ContainerDefBuilder {
    nodes: Vec<NodeDef>,
    local_variables: Variables,
    exception_handlers: Vec<ExceptionHandlerDef>,
    compensation_handlers: BTreeMap<NodeId, NodeId>,
}

impl ContainerDefBuilder {
    pub fn node(mut self, node: NodeDef) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn variable(mut self, name: impl Into<String>, initial: Value) -> Self {
        self.local_variables.insert(name.into(), initial);
        self
    }

    pub fn exception_handler(mut self, handler: ExceptionHandlerDef) -> Self {
        self.exception_handlers.push(handler);
        self
    }

    /// Run `handler_node` when `activity` is compensated after completing.
    pub fn compensation_handler(
        mut self,
        activity: impl Into<NodeId>,
        handler_node: impl Into<NodeId>,
    ) -> Self {
        self.compensation_handlers
            .insert(activity.into(), handler_node.into());
        self
    }

    pub fn build(self) -> Result<Arc<ContainerDef>> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            require_non_blank(&node.id, "node id")?;
            if !ids.insert(node.id.as_str()) {
                return Err(invalid(format!("duplicate node id '{}'", node.id)));
            }
            if let Some(misuse) = node.misuse.first() {
                return Err(invalid(misuse.clone()));
            }
        }

        let starts = self
            .nodes
            .iter()
            .filter(|n| matches!(n.kind, NodeKind::Start))
            .count();
        if starts != 1 {
            return Err(invalid(format!(
                "container must have exactly one start node, found {starts}"
            )));
        }

        for node in &self.nodes {
            for target in &node.outgoing {
                if !ids.contains(target.as_str()) {
                    return Err(invalid(format!(
                        "node '{}' connects to unknown node '{target}'",
                        node.id
                    )));
                }
            }
            match &node.kind {
                NodeKind::WorkItem { name, .. } => require_non_blank(name, "work item name")?,
                NodeKind::EventWait { event_types, .. } => {
                    if event_types.is_empty() {
                        return Err(invalid(format!(
                            "event wait '{}' has no event types",
                            node.id
                        )));
                    }
                    for event_type in event_types {
                        require_non_blank(event_type, "event type")?;
                    }
                }
                NodeKind::Throw { fault, .. } => require_non_blank(fault, "fault name")?,
                NodeKind::SubProcess { process_id, .. } => {
                    require_non_blank(process_id, "sub-process id")?
                }
                _ => {}
            }
        }

        for handler in &self.exception_handlers {
            if !ids.contains(handler.handler_node.as_str()) {
                return Err(invalid(format!(
                    "exception handler targets unknown node '{}'",
                    handler.handler_node
                )));
            }
        }
        for (activity, handler) in &self.compensation_handlers {
            for id in [activity, handler] {
                if !ids.contains(id.as_str()) {
                    return Err(invalid(format!(
                        "compensation refers to unknown node '{id}'"
                    )));
                }
            }
        }

        Ok(Arc::new(ContainerDef {
            nodes: self.nodes,
            local_variables: self.local_variables,
            exception_handlers: self.exception_handlers,
            compensation_handlers: self.compensation_handlers,
        }))
    }
}

fn invalid(message: String) -> EngineError {
    EngineError::InvalidArgument(message)
}

// ─── Process definitions ──────────────────────────────────────

#[derive(Debug)]
pub struct ProcessDefinition {
    pub id: String,
    pub name: String,
    pub version: String,
    pub container: Arc<ContainerDef>,
    /// A default-scope signal with this event type starts a new instance.
    pub signal_start: Option<String>,
}

impl ProcessDefinition {
    pub fn builder(id: impl Into<String>) -> ProcessDefinitionBuilder {
        let id = id.into();
        ProcessDefinitionBuilder {
            name: id.clone(),
            id,
            version: "1.0".to_string(),
            container: ContainerDef::builder(),
            signal_start: None,
        }
    }
}

pub struct ProcessDefinitionBuilder {
    id: String,
    name: String,
    version: String,
    container: ContainerDefBuilder,
    signal_start: Option<String>,
}

impl ProcessDefinitionBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn node(mut self, node: NodeDef) -> Self {
        self.container = self.container.node(node);
        self
    }

    /// Process variable with its initial value.
    pub fn variable(mut self, name: impl Into<String>, initial: Value) -> Self {
        self.container = self.container.variable(name, initial);
        self
    }

    pub fn exception_handler(mut self, handler: ExceptionHandlerDef) -> Self {
        self.container = self.container.exception_handler(handler);
        self
    }

    pub fn compensation_handler(
        mut self,
        activity: impl Into<NodeId>,
        handler_node: impl Into<NodeId>,
    ) -> Self {
        self.container = self.container.compensation_handler(activity, handler_node);
        self
    }

    pub fn signal_start(mut self, event_type: impl Into<String>) -> Self {
        self.signal_start = Some(event_type.into());
        self
    }

    pub fn build(self) -> Result<ProcessDefinition> {
        require_non_blank(&self.id, "process id")?;
        if let Some(event_type) = &self.signal_start {
            require_non_blank(event_type, "start signal")?;
        }
        Ok(ProcessDefinition {
            id: self.id,
            name: self.name,
            version: self.version,
            container: self.container.build()?,
            signal_start: self.signal_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> ProcessDefinitionBuilder {
        ProcessDefinition::builder("linear")
            .node(NodeDef::start("start").to("end"))
            .node(NodeDef::end("end"))
    }

    #[test]
    fn test_build_valid_definition() {
        let def = linear().version("2").build().unwrap();
        assert_eq!(def.version, "2");
        assert_eq!(def.container.start_node().unwrap().id, "start");
        assert_eq!(def.container.incoming_count("end"), 1);
    }

    #[test]
    fn test_rejects_duplicate_ids_and_dangling_connections() {
        let dup = linear().node(NodeDef::end("end")).build().unwrap_err();
        assert!(dup.to_string().contains("duplicate"));

        let dangling = ProcessDefinition::builder("p")
            .node(NodeDef::start("start").to("missing"))
            .build()
            .unwrap_err();
        assert!(dangling.to_string().contains("missing"));
    }

    #[test]
    fn test_requires_exactly_one_start() {
        let err = ProcessDefinition::builder("p")
            .node(NodeDef::end("end"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_kind_specific_setter_on_wrong_kind() {
        let err = ProcessDefinition::builder("p")
            .node(NodeDef::start("start").to("end"))
            .node(NodeDef::end("end").variable("x"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("does not apply"));
    }

    #[test]
    fn test_exception_handler_lookup_prefers_exact_match() {
        let container = ContainerDef::builder()
            .node(NodeDef::start("start").to("end"))
            .node(NodeDef::end("end"))
            .node(NodeDef::end("on_any"))
            .node(NodeDef::end("on_timeout"))
            .exception_handler(ExceptionHandlerDef::catch_all("on_any"))
            .exception_handler(ExceptionHandlerDef::catching("Timeout", "on_timeout"))
            .build()
            .unwrap();

        assert_eq!(
            container.exception_handler_for("Timeout").unwrap().handler_node,
            "on_timeout"
        );
        assert_eq!(
            container.exception_handler_for("Other").unwrap().handler_node,
            "on_any"
        );
    }

    #[test]
    fn test_rejects_unknown_handler_nodes() {
        let err = linear()
            .exception_handler(ExceptionHandlerDef::catch_all("nowhere"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("nowhere"));

        let err = linear()
            .compensation_handler("end", "undo")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("undo"));
    }
}
