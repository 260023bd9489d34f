use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::slotmap::EndpointId;
use crate::types::Reply;

/// How a channel name is matched by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscriptionKind {
    Exact,
    Pattern,
    Sharded,
}

impl SubscriptionKind {
    pub(crate) fn subscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Exact => "SUBSCRIBE",
            SubscriptionKind::Pattern => "PSUBSCRIBE",
            SubscriptionKind::Sharded => "SSUBSCRIBE",
        }
    }

    pub(crate) fn unsubscribe_command(self) -> &'static str {
        match self {
            SubscriptionKind::Exact => "UNSUBSCRIBE",
            SubscriptionKind::Pattern => "PUNSUBSCRIBE",
            SubscriptionKind::Sharded => "SUNSUBSCRIBE",
        }
    }
}

/// A delivered pub/sub message. `pattern` is set only for pattern
/// subscriptions, carrying the pattern that matched.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    pub channel: Vec<u8>,
    pub pattern: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

/// Synchronous callback run on the read-loop task of the owning bridge.
/// Handlers must not block; blocking work belongs behind a queue.
pub type MessageHandler = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;

/// Identifies a registered handler so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerToken(u64);

struct QueueInner {
    buf: Mutex<VecDeque<PubSubMessage>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// Bounded FIFO the caller drains at its own pace. Overflow drops the oldest
/// message and counts the loss; delivery never blocks the read loop.
#[derive(Clone)]
pub struct SubscriptionQueue {
    inner: Arc<QueueInner>,
}

impl SubscriptionQueue {
    pub fn bounded(capacity: usize) -> SubscriptionQueue {
        SubscriptionQueue {
            inner: Arc::new(QueueInner {
                buf: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn push(&self, message: PubSubMessage) {
        {
            let mut buf = self.inner.buf.lock().unwrap();
            if buf.len() == self.inner.capacity {
                buf.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            }
            buf.push_back(message);
        }
        self.inner.notify.notify_one();
    }

    pub fn try_recv(&self) -> Option<PubSubMessage> {
        self.inner.buf.lock().unwrap().pop_front()
    }

    pub async fn recv(&self) -> PubSubMessage {
        loop {
            let notified = self.inner.notify.notified();
            if let Some(message) = self.try_recv() {
                return message;
            }
            notified.await;
        }
    }

    /// Messages lost to overflow since the queue was created.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn same_queue(&self, other: &SubscriptionQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

struct SubscriptionEntry {
    handlers: Vec<(HandlerToken, MessageHandler)>,
    queues: Vec<SubscriptionQueue>,
    current_server: Option<EndpointId>,
}

impl SubscriptionEntry {
    fn is_empty(&self) -> bool {
        self.handlers.is_empty() && self.queues.is_empty()
    }
}

/// A push frame classified into a deliverable message.
#[derive(Debug, PartialEq)]
pub(crate) struct InboundMessage {
    pub(crate) kind: SubscriptionKind,
    /// Registry key: the channel for exact/sharded, the pattern for pattern
    /// subscriptions.
    pub(crate) key: Vec<u8>,
    pub(crate) channel: Vec<u8>,
    pub(crate) payload: Vec<u8>,
}

/// Classifies a push-shaped frame (`RESP3 Push` or a RESP2 subscription
/// array). Subscribe/unsubscribe confirmations are not messages; they match
/// the command that caused them and are left to in-flight matching.
pub(crate) fn classify_message(items: &[Reply]) -> Option<InboundMessage> {
    let word = items.first()?.as_bytes()?;
    if word == b"message" {
        let channel = items.get(1)?.as_bytes()?.to_vec();
        Some(InboundMessage {
            kind: SubscriptionKind::Exact,
            key: channel.clone(),
            channel,
            payload: items.get(2)?.as_bytes()?.to_vec(),
        })
    } else if word == b"pmessage" {
        Some(InboundMessage {
            kind: SubscriptionKind::Pattern,
            key: items.get(1)?.as_bytes()?.to_vec(),
            channel: items.get(2)?.as_bytes()?.to_vec(),
            payload: items.get(3)?.as_bytes()?.to_vec(),
        })
    } else if word == b"smessage" {
        let channel = items.get(1)?.as_bytes()?.to_vec();
        Some(InboundMessage {
            kind: SubscriptionKind::Sharded,
            key: channel.clone(),
            channel,
            payload: items.get(2)?.as_bytes()?.to_vec(),
        })
    } else {
        None
    }
}

/// Registry of live subscriptions, keyed by `(channel-or-pattern, kind)`.
/// Entries survive reconnects; the bridge asks for its entries after each
/// handshake and re-issues the subscribe commands before admitting user
/// work.
pub(crate) struct SubscriptionRegistry {
    entries: DashMap<(Vec<u8>, SubscriptionKind), SubscriptionEntry>,
    channel_prefix: Option<Vec<u8>>,
    next_token: AtomicU64,
}

/// What the caller must do on the wire after a local registry mutation.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum WireAction {
    None,
    Subscribe,
    Unsubscribe,
}

impl SubscriptionRegistry {
    pub(crate) fn new(channel_prefix: Option<Vec<u8>>) -> SubscriptionRegistry {
        SubscriptionRegistry {
            entries: DashMap::new(),
            channel_prefix,
            next_token: AtomicU64::new(1),
        }
    }

    /// The channel name as it appears on the wire.
    pub(crate) fn wire_channel(&self, channel: &[u8]) -> Vec<u8> {
        match &self.channel_prefix {
            Some(prefix) => {
                let mut out = Vec::with_capacity(prefix.len() + channel.len());
                out.extend_from_slice(prefix);
                out.extend_from_slice(channel);
                out
            }
            None => channel.to_vec(),
        }
    }

    fn strip_prefix<'a>(&self, wire: &'a [u8]) -> &'a [u8] {
        match &self.channel_prefix {
            Some(prefix) if wire.starts_with(prefix) => &wire[prefix.len()..],
            _ => wire,
        }
    }

    pub(crate) fn add_handler(
        &self,
        channel: &[u8],
        kind: SubscriptionKind,
        handler: MessageHandler,
    ) -> (HandlerToken, WireAction) {
        let token = HandlerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let mut entry = self
            .entries
            .entry((channel.to_vec(), kind))
            .or_insert_with(|| SubscriptionEntry {
                handlers: Vec::new(),
                queues: Vec::new(),
                current_server: None,
            });
        let action = if entry.current_server.is_none() {
            WireAction::Subscribe
        } else {
            WireAction::None
        };
        entry.handlers.push((token, handler));
        (token, action)
    }

    pub(crate) fn add_queue(
        &self,
        channel: &[u8],
        kind: SubscriptionKind,
        queue: &SubscriptionQueue,
    ) -> WireAction {
        let mut entry = self
            .entries
            .entry((channel.to_vec(), kind))
            .or_insert_with(|| SubscriptionEntry {
                handlers: Vec::new(),
                queues: Vec::new(),
                current_server: None,
            });
        let action = if entry.current_server.is_none() {
            WireAction::Subscribe
        } else {
            WireAction::None
        };
        entry.queues.push(queue.clone());
        action
    }

    pub(crate) fn remove_handler(
        &self,
        channel: &[u8],
        kind: SubscriptionKind,
        token: HandlerToken,
    ) -> WireAction {
        let Some(mut entry) = self.entries.get_mut(&(channel.to_vec(), kind)) else {
            return WireAction::None;
        };
        entry.handlers.retain(|(t, _)| *t != token);
        if entry.is_empty() {
            WireAction::Unsubscribe
        } else {
            WireAction::None
        }
    }

    pub(crate) fn remove_queue(
        &self,
        channel: &[u8],
        kind: SubscriptionKind,
        queue: &SubscriptionQueue,
    ) -> WireAction {
        let Some(mut entry) = self.entries.get_mut(&(channel.to_vec(), kind)) else {
            return WireAction::None;
        };
        entry.queues.retain(|q| !q.same_queue(queue));
        if entry.is_empty() {
            WireAction::Unsubscribe
        } else {
            WireAction::None
        }
    }

    /// Binds the subscription to the server the subscribe command was
    /// acknowledged by.
    pub(crate) fn attach_server(&self, channel: &[u8], kind: SubscriptionKind, id: EndpointId) {
        if let Some(mut entry) = self.entries.get_mut(&(channel.to_vec(), kind)) {
            entry.current_server = Some(id);
        }
    }

    pub(crate) fn server_of(&self, channel: &[u8], kind: SubscriptionKind) -> Option<EndpointId> {
        self.entries
            .get(&(channel.to_vec(), kind))
            .and_then(|entry| entry.current_server)
    }

    /// Drops an entry once its UNSUBSCRIBE has been acknowledged, unless a
    /// new consumer re-registered in the meantime.
    pub(crate) fn drop_if_empty(&self, channel: &[u8], kind: SubscriptionKind) {
        self.entries
            .remove_if(&(channel.to_vec(), kind), |_, entry| entry.is_empty());
    }

    /// Subscriptions bound to `id`, re-issued by the bridge after each
    /// reconnect handshake.
    pub(crate) fn entries_for_server(&self, id: EndpointId) -> Vec<(Vec<u8>, SubscriptionKind)> {
        self.entries
            .iter()
            .filter(|item| item.value().current_server == Some(id))
            .map(|item| item.key().clone())
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Delivers a classified message to every queue and handler, FIFO per
    /// channel because each read loop is serial. The entry lists are
    /// snapshotted first so a handler that mutates the registry cannot
    /// deadlock against the map shard it is being delivered from.
    pub(crate) fn deliver(&self, message: InboundMessage) {
        let key = (self.strip_prefix(&message.key).to_vec(), message.kind);
        let (queues, handlers) = {
            let Some(entry) = self.entries.get(&key) else {
                debug!(
                    channel = %String::from_utf8_lossy(&message.key),
                    "push message for an unknown subscription",
                );
                return;
            };
            (entry.queues.clone(), entry.handlers.clone())
        };
        let channel = self.strip_prefix(&message.channel).to_vec();
        let pattern = match message.kind {
            SubscriptionKind::Pattern => Some(key.0.clone()),
            _ => None,
        };
        for queue in &queues {
            queue.push(PubSubMessage {
                channel: channel.clone(),
                pattern: pattern.clone(),
                payload: message.payload.clone(),
            });
        }
        for (_, handler) in &handlers {
            handler(&channel, &message.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn message_frame(channel: &[u8], payload: &[u8]) -> Vec<Reply> {
        vec![
            Reply::Bulk(Some(b"message".to_vec())),
            Reply::Bulk(Some(channel.to_vec())),
            Reply::Bulk(Some(payload.to_vec())),
        ]
    }

    #[test]
    fn classify_message_shapes() {
        let message = classify_message(&message_frame(b"news", b"hello")).unwrap();
        assert_eq!(message.kind, SubscriptionKind::Exact);
        assert_eq!(message.channel, b"news");
        assert_eq!(message.payload, b"hello");

        let pmessage = classify_message(&[
            Reply::Bulk(Some(b"pmessage".to_vec())),
            Reply::Bulk(Some(b"news.*".to_vec())),
            Reply::Bulk(Some(b"news.uk".to_vec())),
            Reply::Bulk(Some(b"hi".to_vec())),
        ])
        .unwrap();
        assert_eq!(pmessage.kind, SubscriptionKind::Pattern);
        assert_eq!(pmessage.key, b"news.*");
        assert_eq!(pmessage.channel, b"news.uk");

        // Subscription confirmations match their command instead.
        assert_eq!(
            classify_message(&[
                Reply::Bulk(Some(b"subscribe".to_vec())),
                Reply::Bulk(Some(b"news".to_vec())),
                Reply::Int(1),
            ]),
            None
        );
    }

    #[test]
    fn handler_lifecycle_drives_wire_actions() {
        let registry = SubscriptionRegistry::new(None);
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let handler: MessageHandler = Arc::new(move |_, _| {
            count2.fetch_add(1, Ordering::Relaxed);
        });

        let (token, action) = registry.add_handler(b"news", SubscriptionKind::Exact, handler.clone());
        assert_eq!(action, WireAction::Subscribe);
        registry.attach_server(b"news", SubscriptionKind::Exact, EndpointId(0));

        // Second consumer: purely local.
        let (token2, action) = registry.add_handler(b"news", SubscriptionKind::Exact, handler);
        assert_eq!(action, WireAction::None);

        registry.deliver(classify_message(&message_frame(b"news", b"hello")).unwrap());
        assert_eq!(count.load(Ordering::Relaxed), 2);

        assert_eq!(
            registry.remove_handler(b"news", SubscriptionKind::Exact, token),
            WireAction::None
        );
        assert_eq!(
            registry.remove_handler(b"news", SubscriptionKind::Exact, token2),
            WireAction::Unsubscribe
        );
        registry.drop_if_empty(b"news", SubscriptionKind::Exact);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn queue_overflow_drops_oldest() {
        let queue = SubscriptionQueue::bounded(2);
        for i in 0..3u8 {
            queue.push(PubSubMessage {
                channel: b"c".to_vec(),
                pattern: None,
                payload: vec![i],
            });
        }
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_recv().unwrap().payload, vec![1]);
        assert_eq!(queue.try_recv().unwrap().payload, vec![2]);
        assert_eq!(queue.try_recv(), None);
    }

    #[tokio::test]
    async fn queue_recv_wakes_on_push() {
        let queue = SubscriptionQueue::bounded(8);
        let waiter = queue.clone();
        let task = tokio::spawn(async move { waiter.recv().await });
        tokio::task::yield_now().await;
        queue.push(PubSubMessage {
            channel: b"c".to_vec(),
            pattern: None,
            payload: b"p".to_vec(),
        });
        let message = task.await.unwrap();
        assert_eq!(message.payload, b"p");
    }

    #[test]
    fn prefix_is_applied_and_stripped() {
        let registry = SubscriptionRegistry::new(Some(b"app:".to_vec()));
        assert_eq!(registry.wire_channel(b"news"), b"app:news".to_vec());

        let queue = SubscriptionQueue::bounded(4);
        registry.add_queue(b"news", SubscriptionKind::Exact, &queue);
        registry.attach_server(b"news", SubscriptionKind::Exact, EndpointId(0));
        registry.deliver(classify_message(&message_frame(b"app:news", b"x")).unwrap());
        let message = queue.try_recv().unwrap();
        assert_eq!(message.channel, b"news");
    }

    #[test]
    fn restore_enumerates_bound_entries() {
        let registry = SubscriptionRegistry::new(None);
        let queue = SubscriptionQueue::bounded(4);
        registry.add_queue(b"a", SubscriptionKind::Exact, &queue);
        registry.add_queue(b"b", SubscriptionKind::Pattern, &queue);
        registry.attach_server(b"a", SubscriptionKind::Exact, EndpointId(3));
        registry.attach_server(b"b", SubscriptionKind::Pattern, EndpointId(3));
        let mut entries = registry.entries_for_server(EndpointId(3));
        entries.sort();
        assert_eq!(
            entries,
            vec![
                (b"a".to_vec(), SubscriptionKind::Exact),
                (b"b".to_vec(), SubscriptionKind::Pattern),
            ]
        );
        assert!(registry.entries_for_server(EndpointId(9)).is_empty());
    }
}
