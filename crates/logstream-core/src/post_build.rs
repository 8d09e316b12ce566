//! Post-build analysis pool.
//!
//! A finished build first gets its result flag persisted, then a job is
//! queued that fetches the full console log, splits it into stages and
//! persists each stage. The queue is bounded and drained by a fixed number
//! of workers; submissions beyond the bound are rejected, not buffered.
//!
//! ```text
//!   build_finished ──► save_build_result
//!         │
//!         └──► [bounded queue] ──► worker 1..N ──► fetch_full ─► clean ─► parse
//!                                        │                                  │
//!                                        │                         save_stage (each)
//!                                        └──► ticket (outcome) / dead letters (failures)
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::PostBuildConfig;
use crate::error::{PoolError, PostBuildError};
use crate::fetcher::ChunkFetcher;
use crate::obs;
use crate::sanitize;
use crate::stage_parser;
use crate::store::{BuildResultRecord, BuildStore, StageRecord, SUCCESS_RESULT};

/// Inbound "build finished" notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFinished {
    pub deployment_id: String,
    pub job_name: String,
    pub build_number: u64,
    pub result: String,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BuildFinished {
    pub fn result_record(&self) -> BuildResultRecord {
        BuildResultRecord {
            deployment_id: self.deployment_id.clone(),
            job_name: self.job_name.clone(),
            build_number: self.build_number,
            result: self.result.clone(),
            success: self.result == SUCCESS_RESULT,
            duration_ms: self.duration_ms,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// What a completed post-build job did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostBuildOutcome {
    pub deployment_id: String,
    pub build_number: u64,
    /// Stages found in the full log
    pub stages: usize,
    /// Stages the store accepted
    pub persisted: usize,
    /// Order indexes of stages the store rejected
    pub failed_stages: Vec<usize>,
}

/// Which step of a post-build job failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterKind {
    BuildResult,
    FullLog,
}

/// A failed post-build step, kept for inspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub deployment_id: String,
    pub job_name: String,
    pub build_number: u64,
    pub kind: DeadLetterKind,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Handle to a queued job.
#[derive(Debug)]
pub struct PostBuildTicket {
    rx: oneshot::Receiver<Result<PostBuildOutcome, PostBuildError>>,
}

impl PostBuildTicket {
    /// Wait for the job to finish.
    pub async fn wait(self) -> Result<PostBuildOutcome, PostBuildError> {
        self.rx.await.unwrap_or(Err(PostBuildError::Abandoned))
    }
}

struct Job {
    finished: BuildFinished,
    reply: oneshot::Sender<Result<PostBuildOutcome, PostBuildError>>,
}

#[derive(Clone)]
struct Worker {
    fetcher: Arc<dyn ChunkFetcher>,
    store: Arc<dyn BuildStore>,
    dead_letters: Arc<Mutex<Vec<DeadLetter>>>,
}

/// Bounded worker pool for post-build stage analysis.
pub struct PostBuildPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker: Worker,
    capacity: usize,
}

impl PostBuildPool {
    /// Spawn the workers. Must be called from within a Tokio runtime.
    pub fn new(
        fetcher: Arc<dyn ChunkFetcher>,
        store: Arc<dyn BuildStore>,
        config: PostBuildConfig,
    ) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let worker = Worker {
            fetcher,
            store,
            dead_letters: Arc::new(Mutex::new(Vec::new())),
        };

        let workers = (0..config.workers.max(1))
            .map(|_| {
                let worker = worker.clone();
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        let Some(job) = job else { break };
                        let result = worker.run(&job.finished).await;
                        let _ = job.reply.send(result);
                    }
                })
            })
            .collect();

        PostBuildPool {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            worker,
            capacity,
        }
    }

    /// Handle an inbound "build finished": persist the result flag, then
    /// queue stage analysis. A failed result write is dead-lettered and does
    /// not stop the analysis.
    pub async fn build_finished(
        &self,
        finished: BuildFinished,
    ) -> Result<PostBuildTicket, PoolError> {
        let record = finished.result_record();
        if let Err(err) = self.worker.store.save_build_result(&record).await {
            obs::emit_post_build_failed(&finished.deployment_id, &err);
            self.worker
                .dead_letter(&finished, DeadLetterKind::BuildResult, &err);
        }
        self.submit(finished)
    }

    /// Queue stage analysis only. Fails fast when the queue is full.
    pub fn submit(&self, finished: BuildFinished) -> Result<PostBuildTicket, PoolError> {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(PoolError::ShutDown)?;

        let (reply, rx) = oneshot::channel();
        match sender.try_send(Job { finished, reply }) {
            Ok(()) => Ok(PostBuildTicket { rx }),
            Err(mpsc::error::TrySendError::Full(_)) => Err(PoolError::QueueFull {
                capacity: self.capacity,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(PoolError::ShutDown),
        }
    }

    /// Failed steps so far, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.worker
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop accepting jobs, let the workers drain the queue, and wait for
    /// them.
    pub async fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let workers: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in workers {
            let _ = handle.await;
        }
    }
}

impl Worker {
    async fn run(&self, finished: &BuildFinished) -> Result<PostBuildOutcome, PostBuildError> {
        let raw = match self
            .fetcher
            .fetch_full(&finished.job_name, finished.build_number)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                obs::emit_post_build_failed(&finished.deployment_id, &err);
                self.dead_letter(finished, DeadLetterKind::FullLog, &err);
                return Err(err.into());
            }
        };

        let blocks = stage_parser::parse(&sanitize::clean(&raw));
        let mut outcome = PostBuildOutcome {
            deployment_id: finished.deployment_id.clone(),
            build_number: finished.build_number,
            stages: blocks.len(),
            persisted: 0,
            failed_stages: Vec::new(),
        };

        for block in blocks {
            let record =
                StageRecord::from_block(&finished.deployment_id, finished.build_number, block);
            match self.store.save_stage(&record).await {
                Ok(()) => outcome.persisted += 1,
                Err(err) => {
                    obs::emit_stage_persist_failed(
                        &finished.deployment_id,
                        record.order_index,
                        &err,
                    );
                    outcome.failed_stages.push(record.order_index);
                }
            }
        }

        obs::emit_post_build_done(&finished.deployment_id, outcome.stages, outcome.persisted);
        Ok(outcome)
    }

    fn dead_letter(
        &self,
        finished: &BuildFinished,
        kind: DeadLetterKind,
        error: &dyn std::fmt::Display,
    ) {
        self.dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeadLetter {
                deployment_id: finished.deployment_id.clone(),
                job_name: finished.job_name.clone(),
                build_number: finished.build_number,
                kind,
                error: error.to_string(),
                failed_at: Utc::now(),
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FlakyBuildStore, ScriptedFetcher};
    use std::time::Duration;

    const LOG: &str = "\
[Pipeline] { (build)
compiling
[Pipeline] // stage
[Pipeline] { (test)
error: boom
[Pipeline] // stage
Finished: FAILURE
";

    fn finished(result: &str) -> BuildFinished {
        let now = Utc::now();
        BuildFinished {
            deployment_id: "dep".to_string(),
            job_name: "app".to_string(),
            build_number: 7,
            result: result.to_string(),
            duration_ms: 1_500,
            started_at: now,
            finished_at: now,
        }
    }

    fn pool(
        fetcher: ScriptedFetcher,
        store: Arc<FlakyBuildStore>,
        config: PostBuildConfig,
    ) -> PostBuildPool {
        PostBuildPool::new(Arc::new(fetcher), store, config)
    }

    #[test]
    fn result_record_success_flag() {
        assert!(finished("SUCCESS").result_record().success);
        assert!(!finished("FAILURE").result_record().success);
        assert!(!finished("ABORTED").result_record().success);
    }

    #[tokio::test]
    async fn persists_result_then_every_stage() {
        let store = Arc::new(FlakyBuildStore::new());
        let pool = pool(
            ScriptedFetcher::new().with_full_log("app", 7, LOG),
            store.clone(),
            PostBuildConfig::default(),
        );

        let outcome = pool
            .build_finished(finished("FAILURE"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(outcome.stages, 2);
        assert_eq!(outcome.persisted, 2);
        assert!(outcome.failed_stages.is_empty());

        let results = store.results();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);

        let stages = store.stages();
        assert_eq!(stages[0].name, "build");
        assert!(stages[0].success);
        assert_eq!(stages[1].name, "test");
        assert!(!stages[1].success);
    }

    #[tokio::test]
    async fn full_log_is_sanitized_before_parsing() {
        let store = Arc::new(FlakyBuildStore::new());
        let log = concat!(
            "\x1b[8mha:hidden\x1b[0m[Pipeline] { (lint)\r\n",
            "\x1b[32mclean\x1b[0m\r\n",
            "[Pipeline] // stage\r\n",
        );
        let pool = pool(
            ScriptedFetcher::new().with_full_log("app", 7, log),
            store.clone(),
            PostBuildConfig::default(),
        );

        let ticket = pool.submit(finished("SUCCESS")).unwrap();
        let outcome = ticket.wait().await.unwrap();
        assert_eq!(outcome.stages, 1);
        let stages = store.stages();
        assert_eq!(stages[0].name, "lint");
        assert_eq!(stages[0].log, "clean\n");
    }

    #[tokio::test]
    async fn one_stage_failing_to_persist_does_not_stop_the_rest() {
        let store = Arc::new(FlakyBuildStore::new());
        store.fail_stage(1);
        let pool = pool(
            ScriptedFetcher::new().with_full_log("app", 7, LOG),
            store.clone(),
            PostBuildConfig::default(),
        );

        let ticket = pool.submit(finished("FAILURE")).unwrap();
        let outcome = ticket.wait().await.unwrap();
        assert_eq!(outcome.persisted, 1);
        assert_eq!(outcome.failed_stages, vec![1]);
        assert_eq!(store.stages().len(), 1);
        assert_eq!(store.stages()[0].order_index, 2);
    }

    #[tokio::test]
    async fn fetch_failure_is_dead_lettered() {
        let store = Arc::new(FlakyBuildStore::new());
        let pool = pool(ScriptedFetcher::new(), store.clone(), PostBuildConfig::default());

        let ticket = pool.submit(finished("SUCCESS")).unwrap();
        let err = ticket.wait().await.unwrap_err();
        assert!(matches!(err, PostBuildError::Fetch(_)));

        let letters = pool.dead_letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, DeadLetterKind::FullLog);
        assert_eq!(letters[0].build_number, 7);
        assert!(store.stages().is_empty());
    }

    #[tokio::test]
    async fn result_write_failure_still_runs_analysis() {
        let store = Arc::new(FlakyBuildStore::new());
        store.fail_results();
        let pool = pool(
            ScriptedFetcher::new().with_full_log("app", 7, LOG),
            store.clone(),
            PostBuildConfig::default(),
        );

        let outcome = pool
            .build_finished(finished("SUCCESS"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(outcome.persisted, 2);
        assert_eq!(pool.dead_letters()[0].kind, DeadLetterKind::BuildResult);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_submissions() {
        let store = Arc::new(FlakyBuildStore::new());
        let pool = pool(
            ScriptedFetcher::new()
                .with_latency(Duration::from_secs(1))
                .with_full_log("app", 7, LOG),
            store,
            PostBuildConfig {
                workers: 1,
                queue_capacity: 1,
            },
        );

        let first = pool.submit(finished("SUCCESS")).unwrap();
        let err = pool.submit(finished("SUCCESS")).unwrap_err();
        assert_eq!(err, PoolError::QueueFull { capacity: 1 });

        assert!(first.wait().await.is_ok());
        assert!(pool.submit(finished("SUCCESS")).is_ok());
    }

    #[tokio::test]
    async fn shutdown_drains_queue_and_refuses_new_jobs() {
        let store = Arc::new(FlakyBuildStore::new());
        let pool = pool(
            ScriptedFetcher::new().with_full_log("app", 7, LOG),
            store.clone(),
            PostBuildConfig::default(),
        );

        let ticket = pool.submit(finished("SUCCESS")).unwrap();
        pool.shutdown().await;

        assert!(ticket.wait().await.is_ok());
        assert_eq!(pool.submit(finished("SUCCESS")).unwrap_err(), PoolError::ShutDown);
    }
}
