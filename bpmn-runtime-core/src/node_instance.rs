//! Runtime node-instance tree.
//!
//! Every container except the root is owned by a node instance and shares
//! its id, so a container id doubles as the id of the node instance that
//! owns it. Node instances never hold references to their container; the
//! engine addresses containers by id.

use crate::definition::ContainerDef;
use crate::types::{new_id, now, NodeId, Timestamp, Variables};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerKind {
    Process,
    Composite,
    /// Holds one iteration node instance per collection element.
    ForEach,
    ForEachIteration,
}

/// Resources a cancelled node instance was holding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    WorkItem(String),
    Timer(String),
    /// A waited-on child instance that must be aborted with its parent.
    ChildInstance(String),
}

// ─── Capabilities ─────────────────────────────────────────────

/// Something that owns a variable scope.
pub trait VariableScopeHolder {
    fn variable_scope(&self) -> &Variables;
    fn variable_scope_mut(&mut self) -> &mut Variables;
}

/// Something that can be torn down without leaving.
pub trait Cancellable {
    /// Cancel this element and everything below it, returning what the
    /// engine still has to release.
    fn cancel(&mut self) -> Vec<Released>;
}

// ─── Node instance ────────────────────────────────────────────

#[derive(Debug)]
pub enum NodeBody {
    Plain,
    WorkItem { work_item_id: String },
    EventWait { event_types: Vec<String> },
    Timer { timer_id: String },
    Join { arrived: usize },
    SubProcess { child_id: String, independent: bool },
    Container(NodeInstanceContainer),
}

#[derive(Debug)]
pub struct NodeInstance {
    pub id: String,
    pub node_id: NodeId,
    pub node_name: String,
    pub qualified_node_id: String,
    pub qualified_id: String,
    pub entered_at: Timestamp,
    pub exited_at: Option<Timestamp>,
    pub body: NodeBody,
}

impl NodeInstance {
    pub(crate) fn new(container: &NodeInstanceContainer, node_id: &str, node_name: &str) -> Self {
        let id = new_id();
        Self {
            qualified_node_id: format!("{}{node_id}", container.node_prefix),
            qualified_id: format!("{}{id}", container.instance_prefix),
            id,
            node_id: node_id.to_string(),
            node_name: node_name.to_string(),
            entered_at: now(),
            exited_at: None,
            body: NodeBody::Plain,
        }
    }

    pub fn container(&self) -> Option<&NodeInstanceContainer> {
        match &self.body {
            NodeBody::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn container_mut(&mut self) -> Option<&mut NodeInstanceContainer> {
        match &mut self.body {
            NodeBody::Container(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_awaiting(&self, event_type: &str) -> bool {
        matches!(&self.body, NodeBody::EventWait { event_types } if event_types.iter().any(|e| e == event_type))
    }
}

impl Cancellable for NodeInstance {
    fn cancel(&mut self) -> Vec<Released> {
        self.exited_at = Some(now());
        match &mut self.body {
            NodeBody::WorkItem { work_item_id } => vec![Released::WorkItem(work_item_id.clone())],
            NodeBody::Timer { timer_id } => vec![Released::Timer(timer_id.clone())],
            NodeBody::SubProcess {
                child_id,
                independent: false,
            } => vec![Released::ChildInstance(child_id.clone())],
            NodeBody::Container(container) => container.cancel(),
            _ => Vec::new(),
        }
    }
}

// ─── Container ────────────────────────────────────────────────

#[derive(Debug)]
pub struct NodeInstanceContainer {
    pub id: String,
    pub kind: ContainerKind,
    pub node_instances: Vec<NodeInstance>,
    pub variables: Variables,
    pub(crate) definition: Option<Arc<ContainerDef>>,
    /// Prepended to definition ids of nodes created here.
    node_prefix: String,
    /// Prepended to instance ids of nodes created here.
    instance_prefix: String,
}

impl NodeInstanceContainer {
    pub(crate) fn root(process_instance_id: &str, definition: Arc<ContainerDef>) -> Self {
        Self {
            id: process_instance_id.to_string(),
            kind: ContainerKind::Process,
            node_instances: Vec::new(),
            variables: Variables::new(),
            definition: Some(definition),
            node_prefix: String::new(),
            instance_prefix: String::new(),
        }
    }

    /// Container owned by `owner`, which lives in `parent`.
    ///
    /// Qualified ids gain `owner:` unless the owner is a for-each iteration,
    /// which is skipped and inherits the prefixes of the for-each container.
    pub(crate) fn nested(
        parent: &NodeInstanceContainer,
        owner: &NodeInstance,
        kind: ContainerKind,
        definition: Option<Arc<ContainerDef>>,
        variables: Variables,
    ) -> Self {
        let (node_prefix, instance_prefix) = if parent.kind == ContainerKind::ForEach {
            (parent.node_prefix.clone(), parent.instance_prefix.clone())
        } else {
            (
                format!("{}:", owner.qualified_node_id),
                format!("{}:", owner.qualified_id),
            )
        };
        Self {
            id: owner.id.clone(),
            kind,
            node_instances: Vec::new(),
            variables,
            definition,
            node_prefix,
            instance_prefix,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.node_instances.is_empty()
    }

    /// Active node instances in this container and every nested one.
    pub fn count_node_instances(&self) -> usize {
        self.node_instances
            .iter()
            .map(|ni| 1 + ni.container().map_or(0, |c| c.count_node_instances()))
            .sum()
    }

    pub fn node_instance(&self, id: &str) -> Option<&NodeInstance> {
        self.node_instances.iter().find(|ni| ni.id == id)
    }

    pub fn node_instance_mut(&mut self, id: &str) -> Option<&mut NodeInstance> {
        self.node_instances.iter_mut().find(|ni| ni.id == id)
    }

    pub fn node_instance_by_node(&mut self, node_id: &str) -> Option<&mut NodeInstance> {
        self.node_instances.iter_mut().find(|ni| ni.node_id == node_id)
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<NodeInstance> {
        let index = self.node_instances.iter().position(|ni| ni.id == id)?;
        Some(self.node_instances.remove(index))
    }

    pub fn find_container(&self, id: &str) -> Option<&NodeInstanceContainer> {
        if self.id == id {
            return Some(self);
        }
        self.node_instances
            .iter()
            .filter_map(NodeInstance::container)
            .find_map(|c| c.find_container(id))
    }

    pub fn find_container_mut(&mut self, id: &str) -> Option<&mut NodeInstanceContainer> {
        if self.id == id {
            return Some(self);
        }
        for ni in self.node_instances.iter_mut() {
            if let Some(found) = ni.container_mut().and_then(|c| c.find_container_mut(id)) {
                return Some(found);
            }
        }
        None
    }

    pub fn find_node_instance_mut(&mut self, id: &str) -> Option<&mut NodeInstance> {
        if let Some(index) = self.node_instances.iter().position(|ni| ni.id == id) {
            return self.node_instances.get_mut(index);
        }
        for ni in self.node_instances.iter_mut() {
            if let Some(found) = ni.container_mut().and_then(|c| c.find_node_instance_mut(id)) {
                return Some(found);
            }
        }
        None
    }

    pub fn find_node_instance(&self, id: &str) -> Option<&NodeInstance> {
        self.parent_of(id).and_then(|c| c.node_instance(id))
    }

    /// The container directly holding node instance `id`.
    pub fn parent_of(&self, id: &str) -> Option<&NodeInstanceContainer> {
        if self.node_instances.iter().any(|ni| ni.id == id) {
            return Some(self);
        }
        self.node_instances
            .iter()
            .filter_map(NodeInstance::container)
            .find_map(|c| c.parent_of(id))
    }

    /// Containers from this one down to `id`, outermost first.
    pub fn path_to(&self, id: &str) -> Option<Vec<&NodeInstanceContainer>> {
        if self.id == id {
            return Some(vec![self]);
        }
        self.node_instances
            .iter()
            .filter_map(NodeInstance::container)
            .find_map(|c| c.path_to(id))
            .map(|mut path| {
                path.insert(0, self);
                path
            })
    }

    /// Depth-first visit of every node instance.
    pub fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a NodeInstanceContainer, &'a NodeInstance)) {
        for ni in &self.node_instances {
            f(self, ni);
            if let Some(c) = ni.container() {
                c.visit(f);
            }
        }
    }

    /// Ids of this container and every container nested below it.
    pub fn container_ids(&self) -> Vec<String> {
        let mut ids = vec![self.id.clone()];
        for c in self.node_instances.iter().filter_map(NodeInstance::container) {
            ids.extend(c.container_ids());
        }
        ids
    }
}

impl VariableScopeHolder for NodeInstanceContainer {
    fn variable_scope(&self) -> &Variables {
        &self.variables
    }

    fn variable_scope_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }
}

impl Cancellable for NodeInstanceContainer {
    fn cancel(&mut self) -> Vec<Released> {
        self.node_instances
            .drain(..)
            .flat_map(|mut ni| ni.cancel())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeDef;
    use serde_json::json;

    fn body() -> Arc<ContainerDef> {
        ContainerDef::builder()
            .node(NodeDef::start("s").to("e"))
            .node(NodeDef::end("e"))
            .build()
            .unwrap()
    }

    /// Nest `kind` under a fresh node instance in `parent` and return both ids.
    fn nest(
        parent: &mut NodeInstanceContainer,
        node_id: &str,
        kind: ContainerKind,
    ) -> String {
        let mut owner = NodeInstance::new(parent, node_id, node_id);
        let container = NodeInstanceContainer::nested(parent, &owner, kind, Some(body()), Variables::new());
        owner.body = NodeBody::Container(container);
        let id = owner.id.clone();
        parent.node_instances.push(owner);
        id
    }

    #[test]
    fn test_qualified_ids_prepend_composite_ancestors() {
        let mut root = NodeInstanceContainer::root("p1", body());
        let sub = nest(&mut root, "sub", ContainerKind::Composite);
        let inner = root.find_container_mut(&sub).unwrap();
        let leaf = NodeInstance::new(inner, "task", "task");

        assert_eq!(leaf.qualified_node_id, "sub:task");
        assert_eq!(leaf.qualified_id, format!("{sub}:{}", leaf.id));
    }

    /// Iteration node instances are skipped; the for-each node is not.
    #[test]
    fn test_qualified_ids_skip_for_each_iterations() {
        let mut root = NodeInstanceContainer::root("p1", body());
        let each = nest(&mut root, "each", ContainerKind::ForEach);
        let iteration = {
            let fe = root.find_container_mut(&each).unwrap();
            nest(fe, "each", ContainerKind::ForEachIteration)
        };
        let inner = root.find_container_mut(&iteration).unwrap();
        let leaf = NodeInstance::new(inner, "task", "task");

        assert_eq!(leaf.qualified_node_id, "each:task");
        assert_eq!(leaf.qualified_id, format!("{each}:{}", leaf.id));
    }

    #[test]
    fn test_lookup_and_path() {
        let mut root = NodeInstanceContainer::root("p1", body());
        let sub = nest(&mut root, "sub", ContainerKind::Composite);
        let leaf_id = {
            let inner = root.find_container_mut(&sub).unwrap();
            let leaf = NodeInstance::new(inner, "task", "task");
            let id = leaf.id.clone();
            inner.node_instances.push(leaf);
            id
        };

        assert_eq!(root.count_node_instances(), 2);
        assert_eq!(root.parent_of(&leaf_id).unwrap().id, sub);
        assert_eq!(root.find_node_instance(&leaf_id).unwrap().node_id, "task");
        let path: Vec<_> = root.path_to(&sub).unwrap().iter().map(|c| c.id.clone()).collect();
        assert_eq!(path, vec!["p1".to_string(), sub.clone()]);
        assert_eq!(root.container_ids(), vec!["p1".to_string(), sub]);
    }

    #[test]
    fn test_cancel_reports_resources() {
        let mut root = NodeInstanceContainer::root("p1", body());
        let sub = nest(&mut root, "sub", ContainerKind::Composite);
        {
            let inner = root.find_container_mut(&sub).unwrap();
            let mut task = NodeInstance::new(inner, "task", "task");
            task.body = NodeBody::WorkItem {
                work_item_id: "w1".into(),
            };
            let mut timer = NodeInstance::new(inner, "timer", "timer");
            timer.body = NodeBody::Timer {
                timer_id: "t1".into(),
            };
            inner.node_instances.push(task);
            inner.node_instances.push(timer);
            inner.variables.insert("x".into(), json!(1));
        }
        let mut call = NodeInstance::new(&root, "call", "call");
        call.body = NodeBody::SubProcess {
            child_id: "c1".into(),
            independent: false,
        };
        root.node_instances.push(call);
        let mut detached = NodeInstance::new(&root, "call2", "call2");
        detached.body = NodeBody::SubProcess {
            child_id: "c2".into(),
            independent: true,
        };
        root.node_instances.push(detached);

        let released = root.cancel();
        assert_eq!(
            released,
            vec![
                Released::WorkItem("w1".into()),
                Released::Timer("t1".into()),
                Released::ChildInstance("c1".into()),
            ]
        );
        assert!(root.is_empty());
    }
}
