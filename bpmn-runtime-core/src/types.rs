use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Definition-level node identifier (unique within its container).
pub type NodeId = String;

/// Process variables, work item parameters and results.
pub type Variables = BTreeMap<String, Value>;

pub type Timestamp = DateTime<Utc>;

/// Generate a new time-ordered identifier.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

pub fn now() -> Timestamp {
    Utc::now()
}

/// Reject blank identifiers and names instead of silently ignoring them.
pub(crate) fn require_non_blank(value: &str, what: &str) -> crate::error::Result<()> {
    if value.trim().is_empty() {
        return Err(crate::error::EngineError::InvalidArgument(format!(
            "{what} must not be blank"
        )));
    }
    Ok(())
}

// ─── Reserved names ───────────────────────────────────────────

/// Signal reserved for invoking compensation handlers.
pub const COMPENSATION_SIGNAL: &str = "Compensation";

/// Prefix of the signal a parent receives when a child instance finishes.
pub const PROCESS_COMPLETED_SIGNAL_PREFIX: &str = "processInstanceCompleted:";

/// Fault raised when a handler rejects the starting transition.
pub const WORK_ITEM_REJECTED_FAULT: &str = "WorkItemRejected";

/// Fault raised in the parent when a waited-on child instance aborts.
pub const SUB_PROCESS_ABORTED_FAULT: &str = "SubProcessAborted";

pub fn process_completed_signal(child_id: &str) -> String {
    format!("{PROCESS_COMPLETED_SIGNAL_PREFIX}{child_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn test_require_non_blank() {
        assert!(require_non_blank("alice", "owner").is_ok());
        assert!(require_non_blank("  ", "owner").is_err());
        assert!(require_non_blank("", "owner").is_err());
    }
}
