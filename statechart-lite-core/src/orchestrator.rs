//! Orchestrator — routes events between instance mailboxes and fans
//! notifications out to subscribers.
//!
//! Routing preserves per sender→receiver ordering (each mailbox channel is
//! FIFO); no cross-sender order is promised. Windowed batching is a
//! separate combinator over the notification stream, never coupled to the
//! step engine.

use crate::error::EngineError;
use crate::events::Notification;
use crate::mailbox::MailboxHandle;
use crate::types::EventObject;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

struct Inner {
    routes: HashMap<String, MailboxHandle>,
    subscriptions: Vec<Subscription>,
}

struct Subscription {
    pattern: String,
    sink: mpsc::UnboundedSender<Notification>,
}

/// Shared routing table + subscription registry.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<RwLock<Inner>>,
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl Orchestrator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                routes: HashMap::new(),
                subscriptions: Vec::new(),
            })),
        }
    }

    pub async fn register(&self, handle: MailboxHandle) {
        let mut w = self.inner.write().await;
        w.routes.insert(handle.id().to_string(), handle);
    }

    pub async fn unregister(&self, id: &str) {
        let mut w = self.inner.write().await;
        w.routes.remove(id);
    }

    pub async fn lookup(&self, id: &str) -> Option<MailboxHandle> {
        let r = self.inner.read().await;
        r.routes.get(id).cloned()
    }

    /// Route an event to a registered instance.
    pub async fn send_event(
        &self,
        from: &str,
        to: &str,
        name: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let handle = self
            .lookup(to)
            .await
            .ok_or_else(|| EngineError::UnknownPeer(to.to_string()))?;
        tracing::debug!(%from, %to, event = %name, "routing event");
        handle.send(EventObject::new(name, payload))
    }

    /// Subscribe to notifications by instance id or wildcard pattern
    /// (`foo.*` matches `foo.bar`; `*` matches everything).
    pub async fn subscribe(&self, pattern: impl Into<String>, sink: mpsc::UnboundedSender<Notification>) {
        let mut w = self.inner.write().await;
        w.subscriptions.push(Subscription {
            pattern: pattern.into(),
            sink,
        });
    }

    /// Fan a notification out to every matching live subscriber.
    pub async fn publish(&self, notification: &Notification) {
        let instance = notification.instance();
        let mut w = self.inner.write().await;
        w.subscriptions.retain(|sub| {
            if !pattern_matches(&sub.pattern, instance) {
                return true;
            }
            sub.sink.send(notification.clone()).is_ok()
        });
    }
}

fn pattern_matches(pattern: &str, id: &str) -> bool {
    if pattern == "*" || pattern == id {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => id
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

// ─── Wire form ────────────────────────────────────────────────

/// Line-delimited wire shape for carrying orchestrator traffic over an
/// external transport. The engine mandates no transport; this is the
/// framing a host can pipe over whatever it has.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct WireMessage {
    /// Small integer tag; see the `KIND_*` constants.
    pub kind: u8,
    pub payload: Value,
}

impl WireMessage {
    pub const KIND_REGISTER: u8 = 0;
    pub const KIND_EVENT: u8 = 1;
    pub const KIND_SUBSCRIBE: u8 = 2;
    pub const KIND_NOTIFICATION: u8 = 3;

    pub fn event(from: &str, to: &str, name: &str, payload: Value) -> Self {
        Self {
            kind: Self::KIND_EVENT,
            payload: serde_json::json!({
                "from": from, "to": to, "name": name, "payload": payload
            }),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

impl Orchestrator {
    /// Apply one decoded wire message. Only event frames carry enough to
    /// act on from the outside; registration and subscription frames need
    /// live handles and channels, so they are dropped with a warning.
    pub async fn deliver(&self, msg: &WireMessage) -> Result<(), EngineError> {
        if msg.kind != WireMessage::KIND_EVENT {
            tracing::warn!(kind = msg.kind, "undeliverable wire frame dropped");
            return Ok(());
        }
        let from = msg.payload["from"].as_str().unwrap_or("");
        let to = msg.payload["to"].as_str().unwrap_or("");
        let name = msg.payload["name"].as_str().unwrap_or("");
        self.send_event(from, to, name, msg.payload["payload"].clone())
            .await
    }
}

// ─── Windowed batching ────────────────────────────────────────

/// Aggregates a notification stream into groups bounded by `max_delay`
/// and `max_batch_size`.
pub struct NotificationBatcher {
    pub max_delay: Duration,
    pub max_batch_size: usize,
}

impl NotificationBatcher {
    /// Consume `rx` until it closes, delivering grouped notifications.
    /// The window opens at the first item of each batch.
    pub fn spawn(
        self,
        mut rx: mpsc::UnboundedReceiver<Notification>,
        out: mpsc::UnboundedSender<Vec<Notification>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(first) = rx.recv().await else {
                    return;
                };
                let mut batch = vec![first];
                let window = tokio::time::sleep(self.max_delay);
                tokio::pin!(window);
                let mut closed = false;
                while batch.len() < self.max_batch_size {
                    tokio::select! {
                        _ = &mut window => break,
                        item = rx.recv() => match item {
                            Some(n) => batch.push(n),
                            None => {
                                closed = true;
                                break;
                            }
                        },
                    }
                }
                let _ = out.send(batch);
                if closed {
                    return;
                }
            }
        })
    }
}
