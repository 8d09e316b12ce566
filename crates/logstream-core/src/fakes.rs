//! In-memory implementations of the fetcher and store seams
//!
//! `ScriptedFetcher` answers progressive fetches from a script keyed by
//! offset; `FlakyBuildStore` wraps [`MemoryBuildStore`] and can be told to
//! fail specific writes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{FetchError, FetchResult, StoreError};
use crate::fetcher::{ChunkFetcher, LogChunk};
use crate::store::{BuildResultRecord, BuildStore, MemoryBuildStore, StageRecord, StoreResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ScriptedFetcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Step {
    Chunk(LogChunk),
    Fail(String),
}

/// Fetcher that replays scripted responses.
///
/// An offset with no scripted response yields an empty chunk that keeps the
/// build running at the same offset, like an idle upstream build.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    steps: Mutex<HashMap<u64, Step>>,
    full_logs: Mutex<HashMap<(String, u64), String>>,
    calls: Mutex<Vec<(String, u64, u64)>>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every fetch, to widen race windows in concurrency tests.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_chunk(self, offset: u64, text: &str, next_offset: u64, has_more: bool) -> Self {
        self.push_chunk(offset, text, next_offset, has_more);
        self
    }

    pub fn with_failure(self, offset: u64, message: &str) -> Self {
        self.push_failure(offset, message);
        self
    }

    pub fn with_full_log(self, job_name: &str, build_number: u64, text: &str) -> Self {
        lock(&self.full_logs).insert((job_name.to_string(), build_number), text.to_string());
        self
    }

    /// Script (or replace) the response for `offset`.
    pub fn push_chunk(&self, offset: u64, text: &str, next_offset: u64, has_more: bool) {
        let chunk = LogChunk {
            text: text.to_string(),
            next_offset,
            has_more,
            byte_offset: offset + text.len() as u64,
        };
        lock(&self.steps).insert(offset, Step::Chunk(chunk));
    }

    pub fn push_failure(&self, offset: u64, message: &str) {
        lock(&self.steps).insert(offset, Step::Fail(message.to_string()));
    }

    /// Every `(job, build, offset)` fetched so far, in order.
    pub fn calls(&self) -> Vec<(String, u64, u64)> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Highest number of fetches that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkFetcher for ScriptedFetcher {
    async fn fetch(&self, job_name: &str, build_number: u64, offset: u64) -> FetchResult<LogChunk> {
        lock(&self.calls).push((job_name.to_string(), build_number, offset));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let step = lock(&self.steps).get(&offset).cloned();
        match step {
            Some(Step::Chunk(chunk)) => Ok(chunk),
            Some(Step::Fail(message)) => Err(FetchError::Other(message)),
            None => Ok(LogChunk {
                text: String::new(),
                next_offset: offset,
                has_more: true,
                byte_offset: offset,
            }),
        }
    }

    async fn fetch_full(&self, job_name: &str, build_number: u64) -> FetchResult<String> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        lock(&self.full_logs)
            .get(&(job_name.to_string(), build_number))
            .cloned()
            .ok_or_else(|| FetchError::Status {
                status: 404,
                url: format!("{}/{}/consoleText", job_name, build_number),
            })
    }
}

// ---------------------------------------------------------------------------
// FlakyBuildStore
// ---------------------------------------------------------------------------

/// [`MemoryBuildStore`] with injectable write failures.
#[derive(Debug, Default)]
pub struct FlakyBuildStore {
    inner: MemoryBuildStore,
    failing_stages: Mutex<HashSet<usize>>,
    fail_results: AtomicBool,
}

impl FlakyBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `save_stage` fail for the stage at `order_index`.
    pub fn fail_stage(&self, order_index: usize) {
        lock(&self.failing_stages).insert(order_index);
    }

    /// Make `save_build_result` fail.
    pub fn fail_results(&self) {
        self.fail_results.store(true, Ordering::SeqCst);
    }

    pub fn results(&self) -> Vec<BuildResultRecord> {
        self.inner.results()
    }

    pub fn stages(&self) -> Vec<StageRecord> {
        self.inner.stages()
    }
}

#[async_trait]
impl BuildStore for FlakyBuildStore {
    async fn save_build_result(&self, record: &BuildResultRecord) -> StoreResult<()> {
        if self.fail_results.load(Ordering::SeqCst) {
            return Err(StoreError::BuildResult {
                deployment_id: record.deployment_id.clone(),
                reason: "injected failure".to_string(),
            });
        }
        self.inner.save_build_result(record).await
    }

    async fn save_stage(&self, record: &StageRecord) -> StoreResult<()> {
        if lock(&self.failing_stages).contains(&record.order_index) {
            return Err(StoreError::Stage {
                order_index: record.order_index,
                name: record.name.clone(),
                reason: "injected failure".to_string(),
            });
        }
        self.inner.save_stage(record).await
    }
}
