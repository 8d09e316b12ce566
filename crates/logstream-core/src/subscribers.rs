//! Viewer fan-out.
//!
//! Each viewer owns a [`Subscription`], the receiving half of an unbounded
//! ordered channel. The per-stream [`SubscriberSet`] keeps the sending
//! halves; it is only ever touched under its stream's slot lock, so every
//! viewer sees chunks in the order they were broadcast.
//!
//! A viewer is attached for at most its lifetime. Past that it is dropped
//! at the stream's next liveness check, which closes its channel; a viewer
//! that stopped reading can therefore neither keep the poll loop alive nor
//! grow its queue forever.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

use crate::obs;
use crate::session::StreamKey;

/// Event delivered to a viewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Acknowledgement, sent once per subscription
    Connected,
    /// Sanitized log text
    Log(String),
    /// Terminal event carrying an opaque result tag; nothing follows it
    Complete(String),
}

impl StreamEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Connected => "connected",
            StreamEvent::Log(_) => "log",
            StreamEvent::Complete(_) => "complete",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete(_))
    }
}

/// Identity of one attached viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        SubscriberId(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiving half handed to a viewer.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    stream_key: StreamKey,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn stream_key(&self) -> &StreamKey {
        &self.stream_key
    }

    /// Next event, or `None` once the sender side has been dropped.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }

    /// Hand over the raw receiver, e.g. to wrap it in a response stream.
    pub fn into_receiver(self) -> mpsc::UnboundedReceiver<StreamEvent> {
        self.rx
    }
}

/// Sending half kept by the registry.
#[derive(Debug)]
pub struct SubscriberSink {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<StreamEvent>,
    expires_at: Instant,
}

impl SubscriberSink {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Deliver one event. `false` means the viewer is gone.
    pub fn send(&self, event: StreamEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Create a connected sink/subscription pair for `stream_key`. The sink
/// expires `lifetime` from now.
pub fn channel(stream_key: &StreamKey, lifetime: Duration) -> (SubscriberSink, Subscription) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = SubscriberId::new();
    (
        SubscriberSink {
            id,
            tx,
            expires_at: Instant::now() + lifetime,
        },
        Subscription {
            id,
            stream_key: stream_key.clone(),
            rx,
        },
    )
}

/// Attached viewers of one stream.
#[derive(Debug, Default)]
pub struct SubscriberSet {
    sinks: Vec<SubscriberSink>,
}

impl SubscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sink: SubscriberSink) {
        self.sinks.push(sink);
    }

    /// Detach a viewer. Returns whether it was attached.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        let before = self.sinks.len();
        self.sinks.retain(|s| s.id != id);
        self.sinks.len() != before
    }

    /// Drop viewers whose receiver is gone or whose lifetime ran out, then
    /// report whether any remain.
    pub fn has_subscribers(&mut self) -> bool {
        let now = Instant::now();
        self.sinks.retain(|sink| {
            if sink.is_expired(now) {
                obs::emit_subscriber_expired(sink.id);
                return false;
            }
            !sink.is_closed()
        });
        !self.sinks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Send `text` to every viewer; failed viewers are removed and the rest
    /// still receive it. Returns the number of successful deliveries.
    pub fn broadcast(&mut self, text: &str) -> usize {
        self.sinks
            .retain(|sink| sink.send(StreamEvent::Log(text.to_string())));
        self.sinks.len()
    }

    /// Send the terminal event to every viewer, then close and forget them.
    pub fn broadcast_terminal(&mut self, tag: &str) -> usize {
        self.sinks
            .drain(..)
            .filter(|sink| sink.send(StreamEvent::Complete(tag.to_string())))
            .count()
    }
}
