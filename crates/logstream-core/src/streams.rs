//! Per-stream shared state: replay buffer plus attached viewers.
//!
//! Each [`StreamKey`] owns one slot behind its own mutex, held in a sharded
//! map. All mutation of a key's buffer and viewer set happens under that
//! one lock, which is what makes "snapshot, replay, then register" atomic
//! with respect to live broadcasts. Distinct keys only share a map shard for
//! the instant it takes to clone the slot handle.

use crate::cache::{LogBuffer, LogSnapshot};
use crate::config::StreamConfig;
use crate::error::StreamError;
use crate::session::StreamKey;
use crate::subscribers::{self, StreamEvent, SubscriberId, SubscriberSet, Subscription};
use dashmap::DashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Outcome of attaching a viewer to a stream.
#[derive(Debug)]
pub struct Attached {
    pub subscription: Subscription,
    /// Bytes replayed to the new viewer before any live chunk
    pub replay_bytes: usize,
    /// The stream had already finished; the viewer got `complete` and is
    /// not registered for live chunks
    pub completed: bool,
}

/// State of one stream. Only reachable through [`StreamRegistry::with_slot`].
#[derive(Debug, Default)]
pub struct StreamSlot {
    buffer: LogBuffer,
    subscribers: SubscriberSet,
    evicted: bool,
}

impl StreamSlot {
    /// Create a viewer, replay the buffered text to it, then register it
    /// for live chunks. A finished stream instead delivers `complete`
    /// straight after the replay.
    pub fn attach(&mut self, key: &StreamKey, config: &StreamConfig) -> Attached {
        let (sink, subscription) = subscribers::channel(key, config.subscriber_timeout);
        let text = self.buffer.text();
        let replay_bytes = text.len();
        let completed = self.buffer.is_completed();

        sink.send(StreamEvent::Connected);
        if !text.is_empty() {
            sink.send(StreamEvent::Log(text.to_string()));
        }
        if completed {
            sink.send(StreamEvent::Complete(config.complete_tag.clone()));
        } else {
            self.subscribers.add(sink);
        }

        Attached {
            subscription,
            replay_bytes,
            completed,
        }
    }

    /// Append a sanitized chunk and fan it out. Empty chunks only move the
    /// cursor. Returns the number of viewers that received the chunk.
    pub fn append(
        &mut self,
        key: &StreamKey,
        chunk: &str,
        new_offset: u64,
    ) -> Result<usize, StreamError> {
        self.buffer.append(key.as_str(), chunk, new_offset)?;
        if chunk.is_empty() {
            return Ok(0);
        }
        Ok(self.subscribers.broadcast(chunk))
    }

    pub fn snapshot(&self) -> LogSnapshot {
        self.buffer.snapshot()
    }

    pub fn offset(&self) -> u64 {
        self.buffer.offset()
    }

    pub fn mark_completed(&mut self) {
        self.buffer.mark_completed();
    }

    pub fn remove_subscriber(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(id)
    }

    pub fn has_subscribers(&mut self) -> bool {
        self.subscribers.has_subscribers()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn broadcast(&mut self, chunk: &str) -> usize {
        self.subscribers.broadcast(chunk)
    }

    pub fn broadcast_terminal(&mut self, tag: &str) -> usize {
        self.subscribers.broadcast_terminal(tag)
    }
}

/// Sharded map of stream slots.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    slots: DashMap<StreamKey, Arc<Mutex<StreamSlot>>>,
}

fn lock(slot: &Mutex<StreamSlot>) -> MutexGuard<'_, StreamSlot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the key's slot, creating it if
    /// needed. `f` must not block or await.
    pub fn with_slot<R>(&self, key: &StreamKey, f: impl FnOnce(&mut StreamSlot) -> R) -> R {
        loop {
            let slot = Arc::clone(&self.slots.entry(key.clone()).or_default());
            let mut guard = lock(&slot);
            if guard.evicted {
                // Lost a race with eviction; the map now holds a fresh slot.
                continue;
            }
            return f(&mut guard);
        }
    }

    /// Read-only access that does not create missing slots.
    fn peek<R>(&self, key: &StreamKey, f: impl FnOnce(&StreamSlot) -> R) -> Option<R> {
        let slot = self.slots.get(key).map(|s| Arc::clone(&s))?;
        let guard = lock(&slot);
        Some(f(&guard))
    }

    pub fn attach(&self, key: &StreamKey, config: &StreamConfig) -> Attached {
        self.with_slot(key, |slot| slot.attach(key, config))
    }

    pub fn append(
        &self,
        key: &StreamKey,
        chunk: &str,
        new_offset: u64,
    ) -> Result<usize, StreamError> {
        self.with_slot(key, |slot| slot.append(key, chunk, new_offset))
    }

    /// Snapshot of the key's buffer; empty if the key is unknown.
    pub fn snapshot(&self, key: &StreamKey) -> LogSnapshot {
        self.peek(key, |slot| slot.snapshot()).unwrap_or_default()
    }

    pub fn mark_completed(&self, key: &StreamKey) {
        self.with_slot(key, |slot| slot.mark_completed());
    }

    pub fn remove_subscriber(&self, key: &StreamKey, id: SubscriberId) -> bool {
        self.slots
            .get(key)
            .map(|s| Arc::clone(&s))
            .map(|slot| lock(&slot).remove_subscriber(id))
            .unwrap_or(false)
    }

    pub fn has_subscribers(&self, key: &StreamKey) -> bool {
        self.slots
            .get(key)
            .map(|s| Arc::clone(&s))
            .map(|slot| lock(&slot).has_subscribers())
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.peek(key, |slot| slot.subscriber_count()).unwrap_or(0)
    }

    pub fn broadcast(&self, key: &StreamKey, chunk: &str) -> usize {
        self.with_slot(key, |slot| slot.broadcast(chunk))
    }

    pub fn broadcast_terminal(&self, key: &StreamKey, tag: &str) -> usize {
        self.with_slot(key, |slot| slot.broadcast_terminal(tag))
    }

    /// Drop a stream's slot if nobody is watching it and `busy` reports no
    /// background work on it. `busy` runs under the slot lock.
    pub fn evict_if_idle(&self, key: &StreamKey, busy: impl Fn() -> bool) -> bool {
        self.slots
            .remove_if(key, |_, slot| {
                let mut guard = lock(slot);
                if guard.has_subscribers() || busy() {
                    return false;
                }
                guard.evicted = true;
                true
            })
            .is_some()
    }

    /// Keys of every live slot.
    pub fn keys(&self) -> Vec<StreamKey> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
