//! Persistence seam for finished builds.
//!
//! The schema behind it belongs to the surrounding application; this crate
//! only needs to hand over a build's result flag and its parsed stages.
//! [`MemoryBuildStore`] keeps records for the life of the process only.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::stage_parser::StageBlock;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result string the CI server reports for a green build.
pub const SUCCESS_RESULT: &str = "SUCCESS";

/// Outcome of a finished build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResultRecord {
    pub deployment_id: String,
    pub job_name: String,
    pub build_number: u64,
    /// Raw result string (`SUCCESS`, `FAILURE`, `ABORTED`, ...)
    pub result: String,
    pub success: bool,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One parsed stage, ready to persist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub deployment_id: String,
    pub build_number: u64,
    pub order_index: usize,
    pub name: String,
    pub log: String,
    pub success: bool,
}

impl StageRecord {
    pub fn from_block(deployment_id: &str, build_number: u64, block: StageBlock) -> Self {
        StageRecord {
            deployment_id: deployment_id.to_string(),
            build_number,
            order_index: block.order_index,
            name: block.name,
            log: block.log,
            success: block.success,
        }
    }
}

/// Backend-agnostic sink for build outcomes.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Persist the build's success flag and timing.
    async fn save_build_result(&self, record: &BuildResultRecord) -> StoreResult<()>;

    /// Persist a single stage. Callers continue with the next stage when
    /// this fails.
    async fn save_stage(&self, record: &StageRecord) -> StoreResult<()>;
}

/// Non-durable store: records live in memory until the process exits.
#[derive(Debug, Default)]
pub struct MemoryBuildStore {
    results: Mutex<Vec<BuildResultRecord>>,
    stages: Mutex<Vec<StageRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryBuildStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<BuildResultRecord> {
        lock(&self.results).clone()
    }

    pub fn stages(&self) -> Vec<StageRecord> {
        lock(&self.stages).clone()
    }

    /// Stages recorded for one build, in stage order.
    pub fn stages_for(&self, deployment_id: &str, build_number: u64) -> Vec<StageRecord> {
        let mut stages: Vec<StageRecord> = lock(&self.stages)
            .iter()
            .filter(|s| s.deployment_id == deployment_id && s.build_number == build_number)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.order_index);
        stages
    }
}

#[async_trait]
impl BuildStore for MemoryBuildStore {
    async fn save_build_result(&self, record: &BuildResultRecord) -> StoreResult<()> {
        lock(&self.results).push(record.clone());
        Ok(())
    }

    async fn save_stage(&self, record: &StageRecord) -> StoreResult<()> {
        lock(&self.stages).push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(build_number: u64, order_index: usize) -> StageRecord {
        StageRecord {
            deployment_id: "dep".to_string(),
            build_number,
            order_index,
            name: format!("stage-{}", order_index),
            log: String::new(),
            success: true,
        }
    }

    #[test]
    fn stage_record_from_block() {
        let block = StageBlock {
            order_index: 2,
            name: "test".to_string(),
            log: "error: boom\n".to_string(),
            success: false,
        };
        let record = StageRecord::from_block("dep", 9, block);
        assert_eq!(record.deployment_id, "dep");
        assert_eq!(record.build_number, 9);
        assert_eq!(record.order_index, 2);
        assert!(!record.success);
    }

    #[tokio::test]
    async fn memory_store_filters_stages_by_build() {
        let store = MemoryBuildStore::new();
        store.save_stage(&stage(1, 1)).await.unwrap();
        store.save_stage(&stage(2, 0)).await.unwrap();
        store.save_stage(&stage(1, 0)).await.unwrap();

        let build_one: Vec<usize> = store
            .stages_for("dep", 1)
            .into_iter()
            .map(|s| s.order_index)
            .collect();
        assert_eq!(build_one, vec![0, 1]);
        assert_eq!(store.stages().len(), 3);
        assert!(store.stages_for("other", 1).is_empty());
    }
}
