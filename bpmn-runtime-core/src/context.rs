//! What a node action sees while it runs.
//!
//! The context holds a snapshot of the visible variables. Writes and queued
//! side effects are applied by the engine only after the action returns
//! successfully; a fault discards them.

use crate::error::Result;
use crate::execution::Effect;
use crate::node_instance::NodeInstance;
use crate::process_instance::ProcessInstance;
use crate::signal::{SignalContext, SignalScope};
use crate::types::{require_non_blank, Variables};
use crate::work_item::WorkItem;
use serde_json::Value;

pub struct NodeContext {
    process_instance_id: String,
    process_id: String,
    business_key: Option<String>,
    node_id: String,
    node_name: String,
    node_instance_id: String,
    variables: Variables,
    writes: Vec<(String, Value)>,
    effects: Vec<Effect>,
}

impl NodeContext {
    pub(crate) fn new(instance: &ProcessInstance, container_id: &str, node: &NodeInstance) -> Self {
        Self {
            process_instance_id: instance.id.clone(),
            process_id: instance.process_id.clone(),
            business_key: instance.business_key.clone(),
            node_id: node.node_id.clone(),
            node_name: node.node_name.clone(),
            node_instance_id: node.id.clone(),
            variables: instance.visible_variables(container_id),
            writes: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn process_instance_id(&self) -> &str {
        &self.process_instance_id
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn business_key(&self) -> Option<&str> {
        self.business_key.as_deref()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn node_instance_id(&self) -> &str {
        &self.node_instance_id
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Written to the innermost scope declaring `name`, else process scope.
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.variables.insert(name.clone(), value.clone());
        self.writes.push((name, value));
    }

    /// Queue a signal, routed once the current step has released the
    /// instance.
    pub fn signal(&mut self, scope: SignalScope, event_type: impl Into<String>, payload: Value) {
        let context = SignalContext {
            process_instance_id: Some(self.process_instance_id.clone()),
            node_instance_id: Some(self.node_instance_id.clone()),
            ..SignalContext::default()
        };
        self.effects.push(Effect::Signal {
            scope,
            event_type: event_type.into(),
            payload,
            context,
        });
    }

    /// Queue a detached work item for `name`'s handler. Returns its id.
    pub fn execute_work_item(&mut self, name: &str, parameters: Variables) -> Result<String> {
        require_non_blank(name, "work item name")?;
        let mut item = WorkItem::new(name);
        item.parameters = parameters;
        item.process_instance_id = Some(self.process_instance_id.clone());
        let id = item.id.clone();
        self.effects.push(Effect::ExecuteWorkItem(item));
        Ok(id)
    }

    /// Queue a one-way message through the configured egress.
    pub fn produce(&mut self, payload: Value) {
        self.effects.push(Effect::Produce {
            process_instance_id: Some(self.process_instance_id.clone()),
            payload,
        });
    }

    pub(crate) fn into_parts(self) -> (Vec<(String, Value)>, Vec<Effect>) {
        (self.writes, self.effects)
    }
}
