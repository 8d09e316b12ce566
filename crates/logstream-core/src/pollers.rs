//! Supervised poll-loop handles.
//!
//! The registry is the in-progress set: a stream key is present exactly
//! while one poll loop owns it. Claiming is an atomic insert-if-absent on
//! the sharded map, so concurrent subscribers can race freely and at most
//! one of them starts a loop.
//!
//! Each entry carries the loop's cancellation token and, once spawned, its
//! join handle. Entries are tagged with a generation so a finishing loop
//! can never release a marker that a newer loop has claimed.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::StreamKey;

/// Why a poll loop stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PollOutcome {
    /// Upstream reported the end of the log
    Completed { final_offset: u64 },
    /// No viewer left; the build may still be running
    Idle { offset: u64 },
    /// Cancelled through the registry or coordinator shutdown
    Cancelled { offset: u64 },
    /// Fetch or cache failure; viewers were not notified
    Failed { offset: u64, error: String },
}

/// Proof of ownership of a key's in-progress marker.
#[derive(Debug, Clone)]
pub struct PollerClaim {
    pub generation: u64,
    pub token: CancellationToken,
}

/// Inspection view of a running poll loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollerInfo {
    pub stream_key: StreamKey,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

struct PollerSlot {
    generation: u64,
    started_at: DateTime<Utc>,
    token: CancellationToken,
    join: Mutex<Option<JoinHandle<PollOutcome>>>,
}

/// In-progress set plus supervision handles.
#[derive(Default)]
pub struct PollerRegistry {
    slots: DashMap<StreamKey, PollerSlot>,
    outcomes: DashMap<StreamKey, PollOutcome>,
    next_generation: AtomicU64,
}

impl PollerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `key` if no loop owns it. The loop's token is a child of
    /// `parent`, so cancelling `parent` stops every loop.
    pub fn try_claim(&self, key: &StreamKey, parent: &CancellationToken) -> Option<PollerClaim> {
        if parent.is_cancelled() {
            return None;
        }
        match self.slots.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
                let token = parent.child_token();
                vacant.insert(PollerSlot {
                    generation,
                    started_at: Utc::now(),
                    token: token.clone(),
                    join: Mutex::new(None),
                });
                Some(PollerClaim { generation, token })
            }
        }
    }

    /// Store the spawned task's handle. If the loop already released its
    /// claim the handle is simply dropped; the task is finished anyway.
    pub fn attach_handle(&self, key: &StreamKey, generation: u64, handle: JoinHandle<PollOutcome>) {
        if let Some(slot) = self.slots.get(key) {
            if slot.generation == generation {
                if let Ok(mut join) = slot.join.lock() {
                    *join = Some(handle);
                }
            }
        }
    }

    /// Give up the marker and record why. No-op for a stale generation.
    pub fn release(&self, key: &StreamKey, generation: u64, outcome: PollOutcome) -> bool {
        let released = self
            .slots
            .remove_if(key, |_, slot| slot.generation == generation)
            .is_some();
        if released {
            self.outcomes.insert(key.clone(), outcome);
        }
        released
    }

    pub fn is_running(&self, key: &StreamKey) -> bool {
        self.slots.contains_key(key)
    }

    /// Ask the key's loop to stop. Returns whether a loop was running.
    pub fn cancel(&self, key: &StreamKey) -> bool {
        match self.slots.get(key) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the recorded outcome of a stream that no longer exists. Refused
    /// while a loop owns the key.
    pub fn forget(&self, key: &StreamKey) -> bool {
        if self.slots.contains_key(key) {
            return false;
        }
        self.outcomes.remove(key).is_some()
    }

    /// Outcome of the most recent loop on `key` that has stopped.
    pub fn last_outcome(&self, key: &StreamKey) -> Option<PollOutcome> {
        self.outcomes.get(key).map(|o| o.value().clone())
    }

    /// Running loops, sorted by stream key.
    pub fn active(&self) -> Vec<PollerInfo> {
        let mut infos: Vec<PollerInfo> = self
            .slots
            .iter()
            .map(|entry| PollerInfo {
                stream_key: entry.key().clone(),
                generation: entry.generation,
                started_at: entry.started_at,
            })
            .collect();
        infos.sort_by(|a, b| a.stream_key.cmp(&b.stream_key));
        infos
    }

    /// Detach every stored join handle, for shutdown.
    pub fn take_handles(&self) -> Vec<JoinHandle<PollOutcome>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.join.lock().ok().and_then(|mut join| join.take()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
