//! Outbound messages.
//!
//! Egress is one-way: the engine hands a payload over and never waits for a
//! reply. Replies come back in as signals.

use crate::config::RuntimeKind;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

#[async_trait]
pub trait MessageEgress: Send + Sync {
    fn name(&self) -> &str {
        "egress"
    }

    async fn produce(&self, process_instance_id: Option<&str>, payload: Value) -> anyhow::Result<()>;

    fn supports(&self, _kind: RuntimeKind) -> bool {
        true
    }
}

/// Discards every message. Used when no egress is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEgress;

#[async_trait]
impl MessageEgress for NoopEgress {
    fn name(&self) -> &str {
        "noop"
    }

    async fn produce(&self, process_instance_id: Option<&str>, _payload: Value) -> anyhow::Result<()> {
        tracing::debug!(process_instance_id = ?process_instance_id, "No egress configured, message dropped");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EgressMessage {
    pub process_instance_id: Option<String>,
    pub payload: Value,
}

/// Forwards messages into a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelEgress {
    sender: mpsc::Sender<EgressMessage>,
}

impl ChannelEgress {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<EgressMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl MessageEgress for ChannelEgress {
    fn name(&self) -> &str {
        "channel"
    }

    async fn produce(&self, process_instance_id: Option<&str>, payload: Value) -> anyhow::Result<()> {
        self.sender
            .send(EgressMessage {
                process_instance_id: process_instance_id.map(String::from),
                payload,
            })
            .await
            .map_err(|_| anyhow::anyhow!("egress channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_egress_forwards() {
        let (egress, mut rx) = ChannelEgress::new(2);
        egress.produce(Some("p1"), json!({"a": 1})).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.process_instance_id.as_deref(), Some("p1"));
        assert_eq!(msg.payload["a"], 1);
    }

    #[tokio::test]
    async fn test_closed_channel_errors() {
        let (egress, rx) = ChannelEgress::new(1);
        drop(rx);
        assert!(egress.produce(None, json!(null)).await.is_err());
    }
}
