//! Message Bus (C3).
//!
//! An in-process, single-producer-per-agent ordered log scoped to one
//! session. Writers (agents) append; the engine and agents read in
//! insertion order when assembling context for the next turn.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Classification of a published message, used for filtering and for
/// deciding what survives history-cap eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Broadcast,
    Reply,
    Proposal,
    Agreement,
    Objection,
    Question,
    Information,
    Summary,
}

/// A single entry on the bus.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub id: u64,
    pub sender: String,
    /// `None` means broadcast to all participants.
    pub recipient: Option<String>,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Filter applied to [`MessageBus::history`].
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub sender: Option<String>,
    pub recipient: Option<String>,
    pub kind: Option<MessageKind>,
    pub from_id: Option<u64>,
    pub to_id: Option<u64>,
}

impl HistoryFilter {
    fn matches(&self, message: &BusMessage) -> bool {
        if let Some(sender) = &self.sender {
            if &message.sender != sender {
                return false;
            }
        }
        if let Some(recipient) = &self.recipient {
            match &message.recipient {
                Some(actual) if actual == recipient => {}
                None => {} // broadcasts pass any recipient filter
                _ => return false,
            }
        }
        if let Some(kind) = self.kind {
            if message.kind != kind {
                return false;
            }
        }
        if let Some(from_id) = self.from_id {
            if message.id < from_id {
                return false;
            }
        }
        if let Some(to_id) = self.to_id {
            if message.id > to_id {
                return false;
            }
        }
        true
    }
}

/// Receives a copy of every message after it is durably appended to the bus.
/// Mirrors the event-handler default-no-op-on-failure posture elsewhere in
/// this crate: a subscriber error never fails the publish.
#[async_trait::async_trait]
pub trait BusSubscriber: Send + Sync {
    async fn on_message(&self, message: &BusMessage);
}

struct BusState {
    messages: Vec<BusMessage>,
    next_id: AtomicU64,
}

/// Ordered, in-memory message log for one session.
pub struct MessageBus {
    state: RwLock<BusState>,
    subscribers: RwLock<Vec<Arc<dyn BusSubscriber>>>,
    max_history: usize,
}

impl MessageBus {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: RwLock::new(BusState {
                messages: Vec::new(),
                next_id: AtomicU64::new(1),
            }),
            subscribers: RwLock::new(Vec::new()),
            max_history,
        }
    }

    pub async fn subscribe(&self, subscriber: Arc<dyn BusSubscriber>) {
        self.subscribers.write().await.push(subscriber);
    }

    /// Append a message, assign it the next id, and fan out to subscribers.
    pub async fn publish(
        &self,
        sender: impl Into<String>,
        recipient: Option<String>,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> BusMessage {
        let message = {
            let mut state = self.state.write().await;
            let id = state.next_id.fetch_add(1, Ordering::SeqCst);
            let message = BusMessage {
                id,
                sender: sender.into(),
                recipient,
                kind,
                content: content.into(),
                timestamp: chrono::Utc::now(),
            };
            state.messages.push(message.clone());
            self.evict_if_needed(&mut state.messages);
            message
        };

        for subscriber in self.subscribers.read().await.iter() {
            subscriber.on_message(&message).await;
        }

        message
    }

    fn evict_if_needed(&self, messages: &mut Vec<BusMessage>) {
        if messages.len() <= self.max_history {
            return;
        }
        let overflow = messages.len() - self.max_history;
        let mut evicted = 0;
        let mut i = 0;
        while i < messages.len() && evicted < overflow {
            if messages[i].kind != MessageKind::Summary {
                messages.remove(i);
                evicted += 1;
            } else {
                i += 1;
            }
        }
        if evicted < overflow {
            log::warn!(
                "message_bus: history cap exceeded by {} messages that could not be elided (all summaries)",
                overflow - evicted
            );
        }
    }

    /// Messages matching `filter`, in insertion order.
    pub async fn history(&self, filter: &HistoryFilter) -> Vec<BusMessage> {
        self.state
            .read()
            .await
            .messages
            .iter()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect()
    }

    /// All messages with id >= `from_id`, used when an agent rebuilds its
    /// prompt context after a gap.
    pub async fn replay(&self, from_id: u64) -> Vec<BusMessage> {
        self.history(&HistoryFilter {
            from_id: Some(from_id),
            ..Default::default()
        })
        .await
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Latest `n` messages visible to `recipient` (its own targeted messages
    /// plus all broadcasts), in insertion order — the default context
    /// extraction window an agent turn uses (§4.4).
    pub async fn recent_for(&self, recipient: &str, n: usize) -> Vec<BusMessage> {
        let state = self.state.read().await;
        let visible: Vec<BusMessage> = state
            .messages
            .iter()
            .filter(|m| match &m.recipient {
                None => true,
                Some(r) => r == recipient,
            })
            .cloned()
            .collect();
        let skip = visible.len().saturating_sub(n);
        visible[skip..].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_assigns_sequential_ids() {
        let bus = MessageBus::new(1000);
        let m1 = bus.publish("agent-a", None, MessageKind::Broadcast, "hi").await;
        let m2 = bus.publish("agent-b", None, MessageKind::Reply, "yo").await;
        assert_eq!(m1.id, 1);
        assert_eq!(m2.id, 2);
    }

    #[tokio::test]
    async fn history_filters_by_sender() {
        let bus = MessageBus::new(1000);
        bus.publish("agent-a", None, MessageKind::Broadcast, "hi").await;
        bus.publish("agent-b", None, MessageKind::Broadcast, "yo").await;
        let filtered = bus
            .history(&HistoryFilter {
                sender: Some("agent-a".to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].sender, "agent-a");
    }

    #[tokio::test]
    async fn recipient_filter_still_includes_broadcasts() {
        let bus = MessageBus::new(1000);
        bus.publish("agent-a", None, MessageKind::Broadcast, "all").await;
        bus.publish(
            "agent-a",
            Some("agent-b".to_string()),
            MessageKind::Reply,
            "direct",
        )
        .await;
        bus.publish(
            "agent-a",
            Some("agent-c".to_string()),
            MessageKind::Reply,
            "not for b",
        )
        .await;
        let visible = bus.recent_for("agent-b", 10).await;
        assert_eq!(visible.len(), 2);
    }

    #[tokio::test]
    async fn replay_returns_messages_from_id_onward() {
        let bus = MessageBus::new(1000);
        bus.publish("a", None, MessageKind::Broadcast, "1").await;
        bus.publish("a", None, MessageKind::Broadcast, "2").await;
        let m3 = bus.publish("a", None, MessageKind::Broadcast, "3").await;
        let replayed = bus.replay(m3.id).await;
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].content, "3");
    }

    #[tokio::test]
    async fn history_cap_evicts_oldest_non_summary_first() {
        let bus = MessageBus::new(3);
        bus.publish("a", None, MessageKind::Summary, "keep-me").await;
        bus.publish("a", None, MessageKind::Broadcast, "old-1").await;
        bus.publish("a", None, MessageKind::Broadcast, "old-2").await;
        bus.publish("a", None, MessageKind::Broadcast, "new").await;
        let all = bus.history(&HistoryFilter::default()).await;
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|m| m.content == "keep-me"));
        assert!(!all.iter().any(|m| m.content == "old-1"));
    }

    struct CountingSubscriber(std::sync::atomic::AtomicUsize);

    #[async_trait::async_trait]
    impl BusSubscriber for CountingSubscriber {
        async fn on_message(&self, _message: &BusMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn subscribers_are_notified_on_publish() {
        let bus = MessageBus::new(1000);
        let subscriber = Arc::new(CountingSubscriber(std::sync::atomic::AtomicUsize::new(0)));
        bus.subscribe(subscriber.clone()).await;
        bus.publish("a", None, MessageKind::Broadcast, "hi").await;
        bus.publish("a", None, MessageKind::Broadcast, "again").await;
        assert_eq!(subscriber.0.load(Ordering::SeqCst), 2);
    }
}
