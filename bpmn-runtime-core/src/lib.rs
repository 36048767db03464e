//! Process execution engine core.
//!
//! - `ProcessRuntime` - registries, instance lifecycle and the entry point for hosts
//! - `WorkItemManager` - completes, aborts and transitions work items under policies
//! - `SignalRouter` - routes events by scope to waiting instances or out of process
//! - `EventListenerBus` - ordered lifecycle notifications for audit and monitoring
//!
//! Instances execute node-instance trees built from `ProcessDefinition`s.
//! Work items move through a `WorkItemLifeCycle` owned by their handler.

pub mod config;
pub mod context;
pub mod definition;
pub mod egress;
pub mod error;
pub mod events;
mod execution;
pub mod handler;
pub mod lifecycle;
pub mod manager;
pub mod node_instance;
pub mod policy;
pub mod process_instance;
pub mod runtime;
pub mod signal;
pub mod types;
pub mod work_item;

pub use config::{EngineConfig, RuntimeKind};
pub use context::NodeContext;
pub use definition::{
    ActionOutcome, ContainerDef, ExceptionHandlerDef, FnAction, NodeAction, NodeDef, NodeKind,
    ProcessDefinition,
};
pub use egress::{ChannelEgress, EgressMessage, MessageEgress, NoopEgress};
pub use error::{EngineError, Fault, Result};
pub use events::{
    ChannelEventListener, EventListener, EventListenerBus, NodeEventInfo, ProcessEvent,
    ProcessEventKind, RecordingListener, VariableChange,
};
pub use handler::{
    FnWorkItemHandler, HumanTaskWorkItemHandler, SendTaskWorkItemHandler, SharedHandler,
    WorkItemHandler,
};
pub use lifecycle::{LifeCyclePhase, WorkItemLifeCycle};
pub use manager::WorkItemManager;
pub use node_instance::{NodeInstance, NodeInstanceContainer};
pub use policy::{FnPolicy, Identity, Policy, SecurityPolicy, SharedPolicy};
pub use process_instance::{
    InstanceOptions, ProcessInstance, ProcessInstanceSnapshot, ProcessInstanceState,
};
pub use runtime::{ProcessRuntime, RuntimeBuilder};
pub use signal::{SignalContext, SignalReceipt, SignalRouter, SignalScope};
pub use types::{Variables, COMPENSATION_SIGNAL};
pub use work_item::{Termination, TransitionOutcome, WorkItem, WorkItemTransition};
