use crate::config::RuntimeKind;
use crate::process_instance::ProcessInstanceState;
use serde_json::Value;
use thiserror::Error;

/// Typed engine error. Every failing operation reports one of these so the
/// caller can tell "retry with different input" apart from "this process
/// instance is now dead".
#[derive(Debug, Error)]
pub enum EngineError {
    /// No phase edge leaves the work item's current status under the
    /// requested transition id. Programming/configuration error, do not retry.
    #[error("invalid transition '{transition}' for work item {work_item_id} in status {status}")]
    InvalidTransition {
        work_item_id: String,
        transition: String,
        status: String,
    },

    /// A policy vetoed the transition. The work item is unchanged and the
    /// caller may retry with different credentials.
    #[error("policy '{policy}' rejected work item {work_item_id}: {reason}")]
    PolicyViolation {
        work_item_id: String,
        policy: String,
        reason: String,
    },

    #[error("unknown work item {0}")]
    UnknownWorkItem(String),

    #[error("unknown process instance {0}")]
    UnknownInstance(String),

    #[error("unknown process definition {0}")]
    UnknownProcess(String),

    #[error("no work item handler registered for '{0}'")]
    UnknownHandler(String),

    /// Escalation found no exception scope for the fault; the owning process
    /// instance has been aborted.
    #[error("unhandled fault '{fault}' aborted process instance {process_instance_id}")]
    UnhandledFault {
        process_instance_id: String,
        fault: String,
    },

    #[error("{component} does not support runtime kind {kind:?}")]
    UnsupportedRuntime { component: String, kind: RuntimeKind },

    #[error("process instance {process_instance_id} is {state:?}")]
    InvalidState {
        process_instance_id: String,
        state: ProcessInstanceState,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("handler failed for work item {work_item_id}: {message}")]
    Handler {
        work_item_id: String,
        message: String,
    },

    #[error("process instance {process_instance_id} entered ERROR at node {node_id}: {message}")]
    ProcessInstanceInError {
        process_instance_id: String,
        node_id: String,
        message: String,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the caller may retry the same operation with different input.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::PolicyViolation { .. })
    }

    /// Whether the error means the owning process instance can make no
    /// further progress.
    pub fn is_instance_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::UnhandledFault { .. } | EngineError::ProcessInstanceInError { .. }
        )
    }
}

/// A named business fault raised by a node action, a throw node or a work
/// item handler. Resolved against exception scopes before it can abort the
/// owning process instance.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("fault '{name}'")]
pub struct Fault {
    pub name: String,
    pub payload: Value,
}

impl Fault {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload: Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let veto = EngineError::PolicyViolation {
            work_item_id: "w1".into(),
            policy: "security".into(),
            reason: "not owner".into(),
        };
        assert!(veto.is_recoverable());
        assert!(!veto.is_instance_fatal());

        let fault = EngineError::UnhandledFault {
            process_instance_id: "p1".into(),
            fault: "PaymentDeclined".into(),
        };
        assert!(fault.is_instance_fatal());
        assert!(!fault.is_recoverable());

        let invalid = EngineError::InvalidTransition {
            work_item_id: "w1".into(),
            transition: "complete".into(),
            status: "Completed".into(),
        };
        assert!(!invalid.is_recoverable());
    }

    #[test]
    fn test_fault_downcast_through_anyhow() {
        let err: anyhow::Error = Fault::new("Timeout")
            .with_payload(serde_json::json!({"after_ms": 30}))
            .into();
        let fault = err.downcast_ref::<Fault>().unwrap();
        assert_eq!(fault.name, "Timeout");
        assert_eq!(fault.payload["after_ms"], 30);
    }
}
