//! Lifecycle notifications.
//!
//! Events are delivered synchronously, in subscription order, to every
//! listener on the bus. A listener that errors or panics is logged and
//! skipped; the remaining listeners are still notified.

use crate::process_instance::ProcessInstanceState;
use serde::Serialize;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Node identity carried by node-level events.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeEventInfo {
    pub process_instance_id: String,
    pub node_id: String,
    pub node_name: String,
    pub node_instance_id: String,
    pub qualified_node_id: String,
    pub qualified_node_instance_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VariableChange {
    pub process_instance_id: String,
    pub variable: String,
    pub old_value: Option<Value>,
    pub new_value: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum ProcessEvent {
    BeforeProcessStarted {
        process_instance_id: String,
        process_id: String,
    },
    AfterProcessStarted {
        process_instance_id: String,
        process_id: String,
    },
    /// Fired for every terminal state, not only COMPLETED.
    BeforeProcessCompleted {
        process_instance_id: String,
        process_id: String,
        state: ProcessInstanceState,
    },
    AfterProcessCompleted {
        process_instance_id: String,
        process_id: String,
        state: ProcessInstanceState,
    },
    BeforeNodeTriggered(NodeEventInfo),
    AfterNodeTriggered(NodeEventInfo),
    BeforeNodeLeft(NodeEventInfo),
    AfterNodeLeft(NodeEventInfo),
    BeforeVariableChanged(VariableChange),
    AfterVariableChanged(VariableChange),
    OnSignal {
        process_instance_id: Option<String>,
        event_type: String,
        payload: Value,
    },
    OnMessage {
        process_instance_id: Option<String>,
        event_type: String,
        payload: Value,
    },
    BeforeWorkItemTransition {
        process_instance_id: Option<String>,
        work_item_id: String,
        transition: String,
        from_status: Option<String>,
    },
    AfterWorkItemTransition {
        process_instance_id: Option<String>,
        work_item_id: String,
        transition: String,
        to_status: Option<String>,
    },
}

/// Closed set of event tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ProcessEventKind {
    BeforeProcessStarted,
    AfterProcessStarted,
    BeforeProcessCompleted,
    AfterProcessCompleted,
    BeforeNodeTriggered,
    AfterNodeTriggered,
    BeforeNodeLeft,
    AfterNodeLeft,
    BeforeVariableChanged,
    AfterVariableChanged,
    OnSignal,
    OnMessage,
    BeforeWorkItemTransition,
    AfterWorkItemTransition,
}

impl ProcessEvent {
    pub fn kind(&self) -> ProcessEventKind {
        match self {
            ProcessEvent::BeforeProcessStarted { .. } => ProcessEventKind::BeforeProcessStarted,
            ProcessEvent::AfterProcessStarted { .. } => ProcessEventKind::AfterProcessStarted,
            ProcessEvent::BeforeProcessCompleted { .. } => ProcessEventKind::BeforeProcessCompleted,
            ProcessEvent::AfterProcessCompleted { .. } => ProcessEventKind::AfterProcessCompleted,
            ProcessEvent::BeforeNodeTriggered(_) => ProcessEventKind::BeforeNodeTriggered,
            ProcessEvent::AfterNodeTriggered(_) => ProcessEventKind::AfterNodeTriggered,
            ProcessEvent::BeforeNodeLeft(_) => ProcessEventKind::BeforeNodeLeft,
            ProcessEvent::AfterNodeLeft(_) => ProcessEventKind::AfterNodeLeft,
            ProcessEvent::BeforeVariableChanged(_) => ProcessEventKind::BeforeVariableChanged,
            ProcessEvent::AfterVariableChanged(_) => ProcessEventKind::AfterVariableChanged,
            ProcessEvent::OnSignal { .. } => ProcessEventKind::OnSignal,
            ProcessEvent::OnMessage { .. } => ProcessEventKind::OnMessage,
            ProcessEvent::BeforeWorkItemTransition { .. } => {
                ProcessEventKind::BeforeWorkItemTransition
            }
            ProcessEvent::AfterWorkItemTransition { .. } => {
                ProcessEventKind::AfterWorkItemTransition
            }
        }
    }

    /// The node id for node-level events.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ProcessEvent::BeforeNodeTriggered(info)
            | ProcessEvent::AfterNodeTriggered(info)
            | ProcessEvent::BeforeNodeLeft(info)
            | ProcessEvent::AfterNodeLeft(info) => Some(&info.node_id),
            _ => None,
        }
    }

    pub fn process_instance_id(&self) -> Option<&str> {
        match self {
            ProcessEvent::BeforeProcessStarted {
                process_instance_id,
                ..
            }
            | ProcessEvent::AfterProcessStarted {
                process_instance_id,
                ..
            }
            | ProcessEvent::BeforeProcessCompleted {
                process_instance_id,
                ..
            }
            | ProcessEvent::AfterProcessCompleted {
                process_instance_id,
                ..
            } => Some(process_instance_id),
            ProcessEvent::BeforeNodeTriggered(info)
            | ProcessEvent::AfterNodeTriggered(info)
            | ProcessEvent::BeforeNodeLeft(info)
            | ProcessEvent::AfterNodeLeft(info) => Some(&info.process_instance_id),
            ProcessEvent::BeforeVariableChanged(change)
            | ProcessEvent::AfterVariableChanged(change) => Some(&change.process_instance_id),
            ProcessEvent::OnSignal {
                process_instance_id,
                ..
            }
            | ProcessEvent::OnMessage {
                process_instance_id,
                ..
            }
            | ProcessEvent::BeforeWorkItemTransition {
                process_instance_id,
                ..
            }
            | ProcessEvent::AfterWorkItemTransition {
                process_instance_id,
                ..
            } => process_instance_id.as_deref(),
        }
    }
}

// ─── Listener ─────────────────────────────────────────────────

/// Audit / monitoring subscriber.
///
/// `on_event` runs synchronously on the firing task while the instance lock
/// is held. It must never block: a slow listener stalls every operation on
/// that instance. Anything that does I/O belongs behind a
/// [`ChannelEventListener`], which hands events off with `try_send`.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ProcessEvent) -> anyhow::Result<()>;

    /// Kinds this listener wants. Defaults to all.
    fn accepts(&self, _kind: ProcessEventKind) -> bool {
        true
    }
}

/// Ordered, continue-on-error fan-out.
#[derive(Clone, Default)]
pub struct EventListenerBus {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventListenerBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn fire(&self, event: &ProcessEvent) {
        let kind = event.kind();
        for (index, listener) in self.listeners.iter().enumerate() {
            if !listener.accepts(kind) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(listener = index, event = ?kind, error = %e, "Event listener failed");
                }
                Err(_) => {
                    tracing::warn!(listener = index, event = ?kind, "Event listener panicked");
                }
            }
        }
    }
}

// ─── Channel listener ─────────────────────────────────────────

/// Forwards events into a bounded channel without ever blocking the firing
/// task. When the buffer is full the event is dropped and counted.
pub struct ChannelEventListener {
    sender: mpsc::Sender<ProcessEvent>,
    events_emitted: AtomicU64,
    events_dropped: AtomicU64,
}

/// Listener statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub emitted: u64,
    pub dropped: u64,
}

impl ChannelEventListener {
    pub fn new(buffer_size: usize) -> (Self, mpsc::Receiver<ProcessEvent>) {
        let (sender, receiver) = mpsc::channel(buffer_size);
        let listener = Self {
            sender,
            events_emitted: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
        };
        (listener, receiver)
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            emitted: self.events_emitted.load(Ordering::Relaxed),
            dropped: self.events_dropped.load(Ordering::Relaxed),
        }
    }
}

impl EventListener for ChannelEventListener {
    fn on_event(&self, event: &ProcessEvent) -> anyhow::Result<()> {
        match self.sender.try_send(event.clone()) {
            Ok(()) => {
                self.events_emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                // Full or receiver gone
                self.events_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

// ─── Recording listener ───────────────────────────────────────

/// Keeps every event in memory. Intended for tests and debugging.
#[derive(Default)]
pub struct RecordingListener {
    events: std::sync::Mutex<Vec<ProcessEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProcessEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn kinds(&self) -> Vec<ProcessEventKind> {
        self.events().iter().map(ProcessEvent::kind).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &ProcessEvent) -> anyhow::Result<()> {
        self.events
            .lock()
            .map_err(|e| anyhow::anyhow!("Lock: {}", e))?
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(event_type: &str) -> ProcessEvent {
        ProcessEvent::OnSignal {
            process_instance_id: Some("p1".into()),
            event_type: event_type.into(),
            payload: Value::Null,
        }
    }

    struct Failing;
    impl EventListener for Failing {
        fn on_event(&self, _event: &ProcessEvent) -> anyhow::Result<()> {
            anyhow::bail!("audit store down")
        }
    }

    struct Panicking;
    impl EventListener for Panicking {
        fn on_event(&self, _event: &ProcessEvent) -> anyhow::Result<()> {
            panic!("listener bug")
        }
    }

    /// A failing or panicking subscriber does not stop later subscribers.
    #[test]
    fn test_continue_on_error_fan_out() {
        let recorder = Arc::new(RecordingListener::new());
        let mut bus = EventListenerBus::new();
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(Arc::new(Panicking));
        bus.subscribe(recorder.clone());

        bus.fire(&signal("a"));
        bus.fire(&signal("b"));

        assert_eq!(bus.len(), 3);
        assert_eq!(recorder.events(), vec![signal("a"), signal("b")]);
    }

    #[test]
    fn test_kind_filter() {
        struct OnlyMessages(RecordingListener);
        impl EventListener for OnlyMessages {
            fn on_event(&self, event: &ProcessEvent) -> anyhow::Result<()> {
                self.0.on_event(event)
            }
            fn accepts(&self, kind: ProcessEventKind) -> bool {
                kind == ProcessEventKind::OnMessage
            }
        }

        let listener = Arc::new(OnlyMessages(RecordingListener::new()));
        let mut bus = EventListenerBus::new();
        bus.subscribe(listener.clone());
        bus.fire(&signal("a"));
        assert!(listener.0.events().is_empty());
    }

    #[tokio::test]
    async fn test_channel_listener_drops_when_full() {
        let (listener, mut rx) = ChannelEventListener::new(2);
        for i in 0..5 {
            listener.on_event(&signal(&format!("s{i}"))).unwrap();
        }
        assert_eq!(listener.stats(), ListenerStats { emitted: 2, dropped: 3 });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind(), ProcessEventKind::OnSignal);
        assert_eq!(first.process_instance_id(), Some("p1"));
    }
}
