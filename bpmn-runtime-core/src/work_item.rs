use crate::error::Result;
use crate::policy::SharedPolicy;
use crate::types::{new_id, require_non_blank, Timestamp, Variables};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Phase state ──────────────────────────────────────────────

/// How a terminal phase ends the work item. Drives what the owning node
/// does on resume: `Complete` maps results to variables, `Abort` does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    Complete,
    Abort,
}

/// A named state of the phase graph. Terminal when it carries a termination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItemPhaseState {
    pub name: String,
    pub termination: Option<Termination>,
}

impl WorkItemPhaseState {
    pub fn of(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            termination: None,
        }
    }

    pub fn terminating(name: impl Into<String>, termination: Termination) -> Self {
        Self {
            name: name.into(),
            termination: Some(termination),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.termination.is_some()
    }
}

// ─── WorkItem ─────────────────────────────────────────────────

/// A unit of work delegated to an external handler.
///
/// `phase_status` is `None` until the starting transition has been applied.
/// Back-references are `None` for detached items (external signals, items
/// raised from node actions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub name: String,
    pub parameters: Variables,
    pub results: Variables,
    pub phase_id: Option<String>,
    pub phase_status: Option<String>,
    pub termination: Option<Termination>,
    pub actual_owner: Option<String>,
    pub start_date: Option<Timestamp>,
    pub complete_date: Option<Timestamp>,
    pub node_instance_id: Option<String>,
    pub process_instance_id: Option<String>,
    pub node_id: Option<String>,
}

impl WorkItem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            parameters: Variables::new(),
            results: Variables::new(),
            phase_id: None,
            phase_status: None,
            termination: None,
            actual_owner: None,
            start_date: None,
            complete_date: None,
            node_instance_id: None,
            process_instance_id: None,
            node_id: None,
        }
    }

    /// Work item with a caller-supplied id.
    pub fn with_id(id: impl Into<String>, name: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let name = name.into();
        require_non_blank(&id, "work item id")?;
        require_non_blank(&name, "work item name")?;
        Ok(Self {
            id,
            ..Self::new(name)
        })
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn result(&self, key: &str) -> Option<&Value> {
        self.results.get(key)
    }

    pub fn is_terminal(&self) -> bool {
        self.termination.is_some()
    }

    /// Blank owners are rejected rather than ignored.
    pub fn set_actual_owner(&mut self, owner: &str) -> Result<()> {
        require_non_blank(owner, "actual owner")?;
        self.actual_owner = Some(owner.to_string());
        Ok(())
    }

    pub fn clear_actual_owner(&mut self) {
        self.actual_owner = None;
    }
}

// ─── Transition ───────────────────────────────────────────────

/// A requested move along one edge of the phase graph.
#[derive(Debug, Clone)]
pub struct WorkItemTransition {
    /// Target phase id.
    pub id: String,
    pub data: Variables,
    pub policies: Vec<SharedPolicy>,
    pub termination: Option<Termination>,
}

impl WorkItemTransition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: Variables::new(),
            policies: Vec::new(),
            termination: None,
        }
    }

    pub fn with_data(mut self, data: Variables) -> Self {
        self.data = data;
        self
    }

    pub fn with_policies(mut self, policies: Vec<SharedPolicy>) -> Self {
        self.policies = policies;
        self
    }
}

/// What a handler did with a requested transition.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// Apply the phase's target status. A transition naming a different
    /// phase id is chained as a follow-up.
    Applied(WorkItemTransition),
    /// The external system is still processing; nothing changes yet.
    Deferred,
    /// The handler refused; nothing changes.
    Rejected(String),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_owner_rejected() {
        let mut item = WorkItem::new("Human Task");
        assert!(item.set_actual_owner("  ").is_err());
        assert!(item.actual_owner.is_none());
        item.set_actual_owner("alice").unwrap();
        assert_eq!(item.actual_owner.as_deref(), Some("alice"));
    }

    #[test]
    fn test_caller_supplied_id() {
        let item = WorkItem::with_id("wi-1", "Send Task").unwrap();
        assert_eq!(item.id, "wi-1");
        assert!(WorkItem::with_id("", "Send Task").is_err());
    }

    #[test]
    fn test_phase_state_terminal() {
        assert!(!WorkItemPhaseState::of("Active").is_terminal());
        assert!(WorkItemPhaseState::terminating("Completed", Termination::Complete).is_terminal());
    }
}
