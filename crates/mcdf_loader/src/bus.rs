//! In-process message bus.
//!
//! Messages form a closed enum broadcast to every live [`Subscription`]. A
//! subscription filters on [`MessageKind`] and unsubscribes when dropped.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::orchestrator::ApplyPhase;
use crate::target::TargetRef;

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    Notification {
        title: String,
        message: String,
        severity: Severity,
    },
    RedrawStarted {
        target: TargetRef,
    },
    RedrawFinished {
        target: TargetRef,
    },
    PhaseChanged {
        target: TargetRef,
        phase: ApplyPhase,
    },
    CacheRescanned {
        added: usize,
        removed: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Notification,
    Redraw,
    PhaseChanged,
    CacheRescanned,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Notification { .. } => MessageKind::Notification,
            Message::RedrawStarted { .. } | Message::RedrawFinished { .. } => MessageKind::Redraw,
            Message::PhaseChanged { .. } => MessageKind::PhaseChanged,
            Message::CacheRescanned { .. } => MessageKind::CacheRescanned,
        }
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Message::Notification {
            title: title.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Message::Notification {
            title: title.into(),
            message: message.into(),
            severity: Severity::Info,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Message>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers. Without subscribers the message is dropped.
    pub fn publish(&self, message: Message) {
        tracing::trace!(?message, "publish");
        let _ = self.tx.send(message);
    }

    /// Subscribe to the given kinds. An empty slice subscribes to everything.
    pub fn subscribe(&self, kinds: &[MessageKind]) -> Subscription {
        Subscription {
            rx: self.tx.subscribe(),
            kinds: kinds.to_vec(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: broadcast::Receiver<Message>,
    kinds: Vec<MessageKind>,
}

impl Subscription {
    fn wants(&self, message: &Message) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&message.kind())
    }

    /// Next matching message, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) if self.wants(&message) => return Some(message),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Subscriber lagged behind the message bus");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching message that is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.try_recv() {
                Ok(message) if self.wants(&message) => return Some(message),
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => return None,
            }
        }
    }

    /// Drain every matching message that is already queued.
    pub fn drain(&mut self) -> Vec<Message> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filtered_subscription() {
        let bus = MessageBus::new();
        let mut notifications = bus.subscribe(&[MessageKind::Notification]);
        let mut everything = bus.subscribe(&[]);

        bus.publish(Message::CacheRescanned {
            added: 1,
            removed: 0,
        });
        bus.publish(Message::error("Apply failed", "boom"));

        assert_eq!(notifications.drain(), vec![Message::error("Apply failed", "boom")]);
        assert_eq!(everything.drain().len(), 2);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = MessageBus::new();
        let subscription = bus.subscribe(&[]);
        assert_eq!(bus.subscriber_count(), 1);
        drop(subscription);
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(Message::info("nobody", "listening"));
    }

    #[tokio::test]
    async fn test_recv_waits_for_match() {
        let bus = MessageBus::new();
        let mut sub = bus.subscribe(&[MessageKind::CacheRescanned]);
        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(Message::info("skip", "me"));
            publisher.publish(Message::CacheRescanned {
                added: 0,
                removed: 3,
            });
        });
        assert_eq!(
            sub.recv().await,
            Some(Message::CacheRescanned {
                added: 0,
                removed: 3
            })
        );
    }
}
