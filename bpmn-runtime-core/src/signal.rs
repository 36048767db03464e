//! Signal routing.
//!
//! The caller picks the scope; it is never inferred from the event type.
//! `OnSignal` (or `OnMessage` for the external scope) is fired before any
//! delivery is attempted, so auditors see the intent even when delivery
//! fails.

use crate::error::{EngineError, Result};
use crate::events::ProcessEvent;
use crate::execution::{Effect, Execution};
use crate::manager;
use crate::process_instance::{InstanceOptions, ProcessInstanceState};
use crate::runtime::{self, RuntimeShared};
use crate::types::{
    require_non_blank, Variables, COMPENSATION_SIGNAL, PROCESS_COMPLETED_SIGNAL_PREFIX,
};
use crate::work_item::WorkItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

// ─── Scope ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalScope {
    /// Broadcast to every instance waiting for the event.
    #[default]
    Default,
    /// Only the instance named in the context; a no-op if it is not waiting.
    ProcessInstance,
    /// Out of process, through a detached work item. Fire and forget.
    External,
}

impl FromStr for SignalScope {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(SignalScope::Default),
            "processInstance" => Ok(SignalScope::ProcessInstance),
            "external" => Ok(SignalScope::External),
            other => Err(EngineError::InvalidArgument(format!(
                "unknown signal scope '{other}'"
            ))),
        }
    }
}

impl fmt::Display for SignalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SignalScope::Default => "default",
            SignalScope::ProcessInstance => "processInstance",
            SignalScope::External => "external",
        })
    }
}

// ─── Context & receipt ────────────────────────────────────────

/// Where a signal comes from, and what it correlates with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalContext {
    pub process_instance_id: Option<String>,
    pub node_instance_id: Option<String>,
    pub work_item_id: Option<String>,
    /// Copied into the parameters of external-scope work items.
    pub correlation: Variables,
}

impl SignalContext {
    pub fn for_instance(process_instance_id: impl Into<String>) -> Self {
        Self {
            process_instance_id: Some(process_instance_id.into()),
            ..Self::default()
        }
    }

    pub fn with_correlation(mut self, key: impl Into<String>, value: Value) -> Self {
        self.correlation.insert(key.into(), value);
        self
    }
}

/// What a signal reached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SignalReceipt {
    /// Instances that had at least one node resumed.
    pub delivered_to: Vec<String>,
    /// Instances started by the signal.
    pub started: Vec<String>,
    /// The detached work item created for an external signal.
    pub work_item_id: Option<String>,
}

impl SignalReceipt {
    pub fn is_empty(&self) -> bool {
        self.delivered_to.is_empty() && self.started.is_empty() && self.work_item_id.is_none()
    }
}

// ─── Router ───────────────────────────────────────────────────

pub const SIGNAL_PARAM: &str = "Signal";
pub const SIGNAL_PROCESS_INSTANCE_ID_PARAM: &str = "SignalProcessInstanceId";
pub const SIGNAL_WORK_ITEM_ID_PARAM: &str = "SignalWorkItemId";
pub const DATA_PARAM: &str = "Data";

#[derive(Clone)]
pub struct SignalRouter {
    shared: Arc<RuntimeShared>,
}

impl SignalRouter {
    pub(crate) fn new(shared: Arc<RuntimeShared>) -> Self {
        Self { shared }
    }

    /// Route `event_type` to `scope`. Default and process-instance scopes
    /// run the receiving instances to quiescence before returning.
    ///
    /// Must not be called from a handler while the handler's own instance
    /// is mid-step; node actions signal through their context instead.
    pub async fn signal(
        &self,
        scope: SignalScope,
        event_type: &str,
        payload: Value,
        context: SignalContext,
    ) -> Result<SignalReceipt> {
        let mut effects = Vec::new();
        let result = route_signal(&self.shared, scope, event_type, payload, &context, &mut effects).await;
        self.shared.dispatch(effects).await;
        result
    }
}

pub(crate) async fn route_signal(
    shared: &Arc<RuntimeShared>,
    scope: SignalScope,
    event_type: &str,
    payload: Value,
    context: &SignalContext,
    effects: &mut Vec<Effect>,
) -> Result<SignalReceipt> {
    require_non_blank(event_type, "event type")?;
    let process_instance_id = context.process_instance_id.clone();

    shared.fire(match scope {
        SignalScope::External => ProcessEvent::OnMessage {
            process_instance_id: process_instance_id.clone(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
        },
        _ => ProcessEvent::OnSignal {
            process_instance_id: process_instance_id.clone(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
        },
    });
    tracing::debug!(scope = %scope, event_type, process_instance_id = ?process_instance_id, "Routing signal");

    let mut receipt = SignalReceipt::default();

    if event_type == COMPENSATION_SIGNAL && scope != SignalScope::External {
        let pid = process_instance_id.ok_or_else(|| {
            EngineError::InvalidArgument("compensation requires a process instance".to_string())
        })?;
        let activity = payload.as_str().ok_or_else(|| {
            EngineError::InvalidArgument(
                "compensation payload must be an activity reference".to_string(),
            )
        })?;
        require_non_blank(activity, "activity reference")?;
        if compensate(shared, &pid, activity, effects).await? {
            receipt.delivered_to.push(pid);
        }
        return Ok(receipt);
    }

    match scope {
        SignalScope::Default => {
            for id in shared.instance_ids() {
                match deliver(shared, &id, event_type, &payload, effects).await {
                    Ok(true) => receipt.delivered_to.push(id),
                    Ok(false) | Err(EngineError::UnknownInstance(_)) => {}
                    Err(e) => {
                        tracing::warn!(process_instance_id = %id, event_type, error = %e, "Signal delivery failed");
                    }
                }
            }

            for definition in shared.signal_start_definitions(event_type) {
                let variables: Variables = match &payload {
                    Value::Object(map) => map.clone().into_iter().collect(),
                    _ => Variables::new(),
                };
                let id = runtime::create_instance(
                    shared,
                    &definition.id,
                    variables,
                    InstanceOptions::default(),
                )?;
                if let Err(e) = runtime::start_instance(shared, &id, effects).await {
                    tracing::warn!(process_instance_id = %id, event_type, error = %e, "Signal-started instance failed");
                }
                receipt.started.push(id);
            }
        }

        SignalScope::ProcessInstance => {
            let pid = process_instance_id.ok_or_else(|| {
                EngineError::InvalidArgument(
                    "processInstance scope requires a process instance id".to_string(),
                )
            })?;
            if deliver(shared, &pid, event_type, &payload, effects).await? {
                receipt.delivered_to.push(pid);
            } else {
                tracing::debug!(process_instance_id = %pid, event_type, "Instance not awaiting signal, ignored");
            }
        }

        SignalScope::External => {
            let mut item = WorkItem::new(shared.config.external_send_task_name.clone());
            item.parameters
                .insert(SIGNAL_PARAM.to_string(), Value::String(event_type.to_string()));
            item.parameters.insert(
                SIGNAL_PROCESS_INSTANCE_ID_PARAM.to_string(),
                process_instance_id.clone().map_or(Value::Null, Value::String),
            );
            item.parameters.insert(
                SIGNAL_WORK_ITEM_ID_PARAM.to_string(),
                context.work_item_id.clone().map_or(Value::Null, Value::String),
            );
            item.parameters.insert(DATA_PARAM.to_string(), payload);
            item.parameters.extend(
                context
                    .correlation
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
            item.process_instance_id = process_instance_id;
            receipt.work_item_id = Some(manager::execute_detached(shared, item).await?);
        }
    }

    Ok(receipt)
}

/// Deliver to one instance if it is active and waiting for `event_type`.
async fn deliver(
    shared: &Arc<RuntimeShared>,
    process_instance_id: &str,
    event_type: &str,
    payload: &Value,
    effects: &mut Vec<Effect>,
) -> Result<bool> {
    let handle = shared.instance(process_instance_id)?;
    let mut guard = handle.lock().await;
    if !guard.is_awaiting(event_type) {
        return Ok(false);
    }
    match guard.state {
        ProcessInstanceState::Active => {}
        ProcessInstanceState::Suspended
            if event_type.starts_with(PROCESS_COMPLETED_SIGNAL_PREFIX) =>
        {
            tracing::debug!(process_instance_id, event_type, "Child completion held until resume");
            guard
                .pending_completions
                .push((event_type.to_string(), payload.clone()));
            return Ok(false);
        }
        _ => return Ok(false),
    }
    let mut exec = Execution::new(shared, &mut guard);
    let result = exec.deliver_signal(event_type, payload.clone()).await;
    effects.extend(exec.into_effects());
    shared.settled(&guard);
    result
}

async fn compensate(
    shared: &Arc<RuntimeShared>,
    process_instance_id: &str,
    activity: &str,
    effects: &mut Vec<Effect>,
) -> Result<bool> {
    let handle = shared.instance(process_instance_id)?;
    let mut guard = handle.lock().await;
    if guard.state != ProcessInstanceState::Active {
        return Err(EngineError::InvalidState {
            process_instance_id: process_instance_id.to_string(),
            state: guard.state,
        });
    }
    let mut exec = Execution::new(shared, &mut guard);
    let result = exec.compensate(activity).await;
    effects.extend(exec.into_effects());
    shared.settled(&guard);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_parsing() {
        assert_eq!("default".parse::<SignalScope>().unwrap(), SignalScope::Default);
        assert_eq!(
            "processInstance".parse::<SignalScope>().unwrap(),
            SignalScope::ProcessInstance
        );
        assert_eq!("external".parse::<SignalScope>().unwrap(), SignalScope::External);
        assert!(matches!(
            "broadcast".parse::<SignalScope>(),
            Err(EngineError::InvalidArgument(_))
        ));
        assert_eq!(SignalScope::ProcessInstance.to_string(), "processInstance");
    }

    #[test]
    fn test_scope_serde_matches_display() {
        for scope in [SignalScope::Default, SignalScope::ProcessInstance, SignalScope::External] {
            let json = serde_json::to_value(scope).unwrap();
            assert_eq!(json, Value::String(scope.to_string()));
        }
    }

    #[test]
    fn test_context_builder() {
        let ctx = SignalContext::for_instance("p1").with_correlation("orderId", serde_json::json!(7));
        assert_eq!(ctx.process_instance_id.as_deref(), Some("p1"));
        assert_eq!(ctx.correlation["orderId"], 7);
        assert!(SignalReceipt::default().is_empty());
    }
}
