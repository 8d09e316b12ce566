//! Stream coordinator: subscribe, poll, broadcast, terminate.
//!
//! One coordinator instance owns the session registry, the stream slots and
//! the poller registry, and is shared by cloning (it is an `Arc` inside).
//!
//! Lock order is always stream slot → poller/session maps. Two decisions
//! are made under a stream's slot lock so they cannot interleave:
//!
//! * `subscribe` attaches the viewer, replays the buffer and claims the
//!   in-progress marker in one critical section;
//! * the poll loop checks for remaining viewers and, when there are none,
//!   releases the marker in one critical section.
//!
//! A viewer joining right as the loop goes idle therefore either keeps the
//! loop alive or finds the marker free and starts a new loop; it can never
//! be left attached to a stream nobody polls. The price is at most one
//! extra fetch when the last viewer leaves just after a liveness check.
//!
//! A build replaced by a newer one keeps its stream only while something
//! still uses it. Eviction is retried whenever that changes: on the next
//! "build started", when its poll loop exits, and when a viewer detaches.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::cache::LogSnapshot;
use crate::config::StreamConfig;
use crate::error::{Result, StreamError};
use crate::fetcher::ChunkFetcher;
use crate::obs;
use crate::pollers::{PollOutcome, PollerClaim, PollerInfo, PollerRegistry};
use crate::sanitize;
use crate::session::{BuildSession, SessionRegistry, StreamKey};
use crate::streams::StreamRegistry;
use crate::subscribers::{SubscriberId, Subscription};

struct Inner {
    sessions: SessionRegistry,
    streams: StreamRegistry,
    pollers: PollerRegistry,
    fetcher: Arc<dyn ChunkFetcher>,
    config: StreamConfig,
    shutdown: CancellationToken,
}

impl Inner {
    /// Drop the stream of a build that is no longer its deployment's
    /// active one, unless a viewer or a poll loop still uses it. Must not
    /// be called under a slot lock.
    fn evict_if_superseded(&self, key: &StreamKey) -> bool {
        let active = self
            .sessions
            .get_by_deployment_id(key.deployment_id())
            .map(|session| session.stream_key());
        if active.as_ref() == Some(key) {
            return false;
        }
        let evicted = self
            .streams
            .evict_if_idle(key, || self.pollers.is_running(key));
        if evicted {
            self.pollers.forget(key);
            obs::emit_stream_evicted(key.as_str());
        }
        evicted
    }
}

/// Shared entry point for viewers and build-lifecycle hooks.
#[derive(Clone)]
pub struct StreamCoordinator {
    inner: Arc<Inner>,
}

impl StreamCoordinator {
    pub fn new(fetcher: Arc<dyn ChunkFetcher>, config: StreamConfig) -> Self {
        StreamCoordinator {
            inner: Arc::new(Inner {
                sessions: SessionRegistry::new(),
                streams: StreamRegistry::new(),
                pollers: PollerRegistry::new(),
                fetcher,
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Inbound "build started": make this build the deployment's active
    /// session. Streams of the deployment's earlier builds are dropped if
    /// nobody is watching or polling them.
    pub fn build_started(&self, deployment_id: &str, job_name: &str, build_number: u64) {
        let inner = &self.inner;
        inner
            .sessions
            .create_or_update(deployment_id, build_number, job_name);
        obs::emit_session_started(deployment_id, job_name, build_number);

        for key in inner.streams.keys() {
            if key.deployment_id() == deployment_id {
                inner.evict_if_superseded(&key);
            }
        }
    }

    /// Attach a viewer to the deployment's active build.
    ///
    /// The viewer first receives `connected`, then everything buffered so
    /// far as one `log` event, then live chunks. Must be called from within
    /// a Tokio runtime, since it may spawn the stream's poll loop.
    pub fn subscribe(&self, deployment_id: &str) -> Result<Subscription> {
        let inner = &self.inner;
        let session = inner
            .sessions
            .get_by_deployment_id(deployment_id)
            .ok_or_else(|| StreamError::NoActiveSession {
                deployment_id: deployment_id.to_string(),
            })?;
        let key = session.stream_key();

        let (attached, claim) = inner.streams.with_slot(&key, |slot| {
            let attached = slot.attach(&key, &inner.config);
            let claim = if attached.completed {
                None
            } else {
                inner.pollers.try_claim(&key, &inner.shutdown)
            };
            (attached, claim)
        });
        obs::emit_subscribed(key.as_str(), attached.replay_bytes, attached.completed);

        if let Some(claim) = claim {
            self.spawn_poller(session, key, claim);
        }
        Ok(attached.subscription)
    }

    /// Detach a viewer. The poll loop notices at its next liveness check.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.remove_subscriber(subscription.stream_key(), subscription.id())
    }

    pub fn remove_subscriber(&self, key: &StreamKey, id: SubscriberId) -> bool {
        let removed = self.inner.streams.remove_subscriber(key, id);
        if removed {
            self.inner.evict_if_superseded(key);
        }
        removed
    }

    fn spawn_poller(&self, session: BuildSession, key: StreamKey, claim: PollerClaim) {
        let inner = Arc::clone(&self.inner);
        let span = obs::stream_span(key.as_str());
        let generation = claim.generation;
        let task_key = key.clone();
        let handle: JoinHandle<PollOutcome> =
            tokio::spawn(poll_loop(inner, session, task_key, claim).instrument(span));
        self.inner.pollers.attach_handle(&key, generation, handle);
    }

    pub fn session(&self, deployment_id: &str) -> Option<BuildSession> {
        self.inner.sessions.get_by_deployment_id(deployment_id)
    }

    pub fn snapshot(&self, key: &StreamKey) -> LogSnapshot {
        self.inner.streams.snapshot(key)
    }

    pub fn subscriber_count(&self, key: &StreamKey) -> usize {
        self.inner.streams.subscriber_count(key)
    }

    pub fn is_polling(&self, key: &StreamKey) -> bool {
        self.inner.pollers.is_running(key)
    }

    pub fn active_pollers(&self) -> Vec<PollerInfo> {
        self.inner.pollers.active()
    }

    pub fn last_outcome(&self, key: &StreamKey) -> Option<PollOutcome> {
        self.inner.pollers.last_outcome(key)
    }

    /// Cancel one stream's poll loop. Viewers stay attached.
    pub fn cancel(&self, key: &StreamKey) -> bool {
        self.inner.pollers.cancel(key)
    }

    /// Cancel every poll loop, refuse new ones, and wait for the running
    /// loops to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for handle in self.inner.pollers.take_handles() {
            let _ = handle.await;
        }
    }
}

/// Body of a stream's background task. Returns why it stopped.
async fn poll_loop(
    inner: Arc<Inner>,
    session: BuildSession,
    key: StreamKey,
    claim: PollerClaim,
) -> PollOutcome {
    let PollerClaim { generation, token } = claim;
    let mut offset = inner.streams.snapshot(&key).offset;
    obs::emit_poller_started(key.as_str(), offset);

    let outcome = loop {
        let gone_idle = inner.streams.with_slot(&key, |slot| {
            if slot.has_subscribers() {
                return false;
            }
            inner
                .pollers
                .release(&key, generation, PollOutcome::Idle { offset });
            true
        });
        if gone_idle {
            obs::emit_poller_idle(key.as_str(), offset, "no subscribers");
            inner.evict_if_superseded(&key);
            return PollOutcome::Idle { offset };
        }

        let fetch = inner
            .fetcher
            .fetch(&session.job_name, session.build_number, offset);
        let fetched = tokio::select! {
            _ = token.cancelled() => break PollOutcome::Cancelled { offset },
            fetched = fetch => fetched,
        };
        let chunk = match fetched {
            Ok(chunk) => chunk,
            Err(err) => {
                obs::emit_poller_aborted(key.as_str(), offset, &err);
                break PollOutcome::Failed {
                    offset,
                    error: err.to_string(),
                };
            }
        };
        if let Some((header_offset, byte_offset)) = chunk.drift() {
            obs::emit_offset_drift(key.as_str(), header_offset, byte_offset);
        }

        let text = sanitize::clean(&chunk.text);
        if let Err(err) = inner.streams.append(&key, &text, chunk.next_offset) {
            obs::emit_poller_aborted(key.as_str(), offset, &err);
            break PollOutcome::Failed {
                offset,
                error: err.to_string(),
            };
        }
        offset = chunk.next_offset;

        if !chunk.has_more {
            let outcome = PollOutcome::Completed {
                final_offset: offset,
            };
            let delivered = inner.streams.with_slot(&key, |slot| {
                slot.mark_completed();
                inner
                    .sessions
                    .mark_build_completed(&session.deployment_id, session.build_number);
                let delivered = slot.broadcast_terminal(&inner.config.complete_tag);
                inner.pollers.release(&key, generation, outcome.clone());
                delivered
            });
            obs::emit_poller_finished(key.as_str(), offset, delivered);
            inner.evict_if_superseded(&key);
            return outcome;
        }

        tokio::select! {
            _ = token.cancelled() => break PollOutcome::Cancelled { offset },
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    };

    if let PollOutcome::Cancelled { offset } = &outcome {
        obs::emit_poller_idle(key.as_str(), *offset, "cancelled");
    }
    inner.streams.with_slot(&key, |_| {
        inner.pollers.release(&key, generation, outcome.clone());
    });
    inner.evict_if_superseded(&key);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::ScriptedFetcher;
    use crate::subscribers::StreamEvent;
    use std::time::Duration;

    fn coordinator(fetcher: ScriptedFetcher) -> (StreamCoordinator, Arc<ScriptedFetcher>) {
        let fetcher = Arc::new(fetcher);
        let config = StreamConfig::default().with_poll_interval(Duration::from_millis(100));
        (
            StreamCoordinator::new(fetcher.clone() as Arc<dyn ChunkFetcher>, config),
            fetcher,
        )
    }

    async fn wait_for_outcome(coord: &StreamCoordinator, key: &StreamKey) -> PollOutcome {
        for _ in 0..1000 {
            if let Some(outcome) = coord.last_outcome(key) {
                if !coord.is_polling(key) {
                    return outcome;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("poller for {} never stopped", key);
    }

    async fn wait_until_stopped(coord: &StreamCoordinator, key: &StreamKey) {
        for _ in 0..1000 {
            if !coord.is_polling(key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("poller for {} never stopped", key);
    }

    #[tokio::test]
    async fn subscribe_without_session_fails() {
        let (coord, _) = coordinator(ScriptedFetcher::new());
        let err = coord.subscribe("unknown").unwrap_err();
        assert_eq!(
            err,
            StreamError::NoActiveSession {
                deployment_id: "unknown".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_stream() {
        let (coord, fetcher) = coordinator(
            ScriptedFetcher::new()
                .with_chunk(0, "Hello\n", 6, true)
                .with_chunk(6, "World\n", 12, false),
        );
        coord.build_started("dep", "app", 5);
        let mut sub = coord.subscribe("dep").unwrap();

        assert_eq!(sub.recv().await, Some(StreamEvent::Connected));
        assert_eq!(sub.recv().await, Some(StreamEvent::Log("Hello\n".into())));
        assert_eq!(sub.recv().await, Some(StreamEvent::Log("World\n".into())));
        assert_eq!(sub.recv().await, Some(StreamEvent::Complete("done".into())));
        assert_eq!(sub.recv().await, None);

        let key = StreamKey::new("dep", 5);
        let snapshot = coord.snapshot(&key);
        assert_eq!(snapshot.text, "Hello\nWorld\n");
        assert_eq!(snapshot.offset, 12);
        assert!(snapshot.completed);
        assert!(coord.session("dep").unwrap().completed);
        assert_eq!(
            wait_for_outcome(&coord, &key).await,
            PollOutcome::Completed { final_offset: 12 }
        );
        assert_eq!(fetcher.calls(), vec![("app".into(), 5, 0), ("app".into(), 5, 6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_are_sanitized_before_broadcast() {
        let (coord, _) = coordinator(
            ScriptedFetcher::new().with_chunk(0, "\x1b[32mok\x1b[0m\r\n", 12, false),
        );
        coord.build_started("dep", "app", 1);
        let mut sub = coord.subscribe("dep").unwrap();

        assert_eq!(sub.recv().await, Some(StreamEvent::Connected));
        assert_eq!(sub.recv().await, Some(StreamEvent::Log("ok\n".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_stops_silently() {
        let (coord, _) = coordinator(
            ScriptedFetcher::new()
                .with_chunk(0, "partial\n", 8, true)
                .with_failure(8, "connection reset"),
        );
        coord.build_started("dep", "app", 2);
        let mut sub = coord.subscribe("dep").unwrap();
        let key = StreamKey::new("dep", 2);

        let outcome = wait_for_outcome(&coord, &key).await;
        assert!(matches!(outcome, PollOutcome::Failed { offset: 8, .. }));

        assert_eq!(sub.try_recv(), Some(StreamEvent::Connected));
        assert_eq!(sub.try_recv(), Some(StreamEvent::Log("partial\n".into())));
        assert_eq!(sub.try_recv(), None);
        assert!(!coord.snapshot(&key).completed);
        assert!(!coord.session("dep").unwrap().completed);
    }

    #[tokio::test(start_paused = true)]
    async fn last_viewer_leaving_idles_the_loop() {
        let (coord, _) = coordinator(ScriptedFetcher::new().with_chunk(0, "a\n", 2, true));
        coord.build_started("dep", "app", 3);
        let sub = coord.subscribe("dep").unwrap();
        let key = StreamKey::new("dep", 3);

        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(sub);

        assert_eq!(wait_for_outcome(&coord, &key).await, PollOutcome::Idle { offset: 2 });
        assert!(!coord.snapshot(&key).completed);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribe_resumes_from_cached_offset() {
        let (coord, fetcher) = coordinator(ScriptedFetcher::new().with_chunk(0, "a\n", 2, true));
        coord.build_started("dep", "app", 3);
        let key = StreamKey::new("dep", 3);

        let sub = coord.subscribe("dep").unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        drop(sub);
        wait_for_outcome(&coord, &key).await;

        fetcher.push_chunk(2, "b\n", 4, false);
        let mut sub = coord.subscribe("dep").unwrap();
        assert_eq!(sub.recv().await, Some(StreamEvent::Connected));
        assert_eq!(sub.recv().await, Some(StreamEvent::Log("a\n".into())));
        assert_eq!(sub.recv().await, Some(StreamEvent::Log("b\n".into())));
        assert_eq!(sub.recv().await, Some(StreamEvent::Complete("done".into())));

        let calls = fetcher.calls();
        assert!(!calls[1..].iter().any(|(_, _, offset)| *offset == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_after_completion_replays_and_completes() {
        let (coord, fetcher) = coordinator(ScriptedFetcher::new().with_chunk(0, "all\n", 4, false));
        coord.build_started("dep", "app", 4);
        let key = StreamKey::new("dep", 4);

        let _first = coord.subscribe("dep").unwrap();
        wait_for_outcome(&coord, &key).await;
        let calls = fetcher.call_count();

        let mut late = coord.subscribe("dep").unwrap();
        assert_eq!(late.try_recv(), Some(StreamEvent::Connected));
        assert_eq!(late.try_recv(), Some(StreamEvent::Log("all\n".into())));
        assert_eq!(late.try_recv(), Some(StreamEvent::Complete("done".into())));
        assert_eq!(late.try_recv(), None);
        assert!(!coord.is_polling(&key));
        assert_eq!(fetcher.call_count(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_loop_without_completing() {
        let (coord, _) = coordinator(ScriptedFetcher::new());
        coord.build_started("dep", "app", 6);
        let key = StreamKey::new("dep", 6);
        let mut sub = coord.subscribe("dep").unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(coord.cancel(&key));

        assert!(matches!(
            wait_for_outcome(&coord, &key).await,
            PollOutcome::Cancelled { .. }
        ));
        assert_eq!(sub.try_recv(), Some(StreamEvent::Connected));
        assert_eq!(sub.try_recv(), None);
        assert!(!coord.snapshot(&key).completed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_all_and_refuses_new_loops() {
        let (coord, _) = coordinator(ScriptedFetcher::new());
        coord.build_started("a", "app", 1);
        coord.build_started("b", "app", 1);
        let _a = coord.subscribe("a").unwrap();
        let _b = coord.subscribe("b").unwrap();
        assert_eq!(coord.active_pollers().len(), 2);

        coord.shutdown().await;
        assert!(coord.active_pollers().is_empty());

        coord.build_started("c", "app", 1);
        let _c = coord.subscribe("c").unwrap();
        assert!(!coord.is_polling(&StreamKey::new("c", 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn new_build_evicts_idle_previous_stream() {
        let (coord, _) = coordinator(ScriptedFetcher::new().with_chunk(0, "old\n", 4, false));
        coord.build_started("dep", "app", 1);
        let old_key = StreamKey::new("dep", 1);
        let _sub = coord.subscribe("dep").unwrap();
        wait_for_outcome(&coord, &old_key).await;
        assert_eq!(coord.snapshot(&old_key).text, "old\n");

        coord.build_started("dep", "app", 2);
        assert_eq!(coord.snapshot(&old_key), LogSnapshot::default());
        assert_eq!(coord.session("dep").unwrap().build_number, 2);
    }

    #[tokio::test]
    async fn unsubscribe_detaches_viewer() {
        let (coord, _) = coordinator(ScriptedFetcher::new());
        coord.build_started("dep", "app", 9);
        let sub = coord.subscribe("dep").unwrap();
        let key = StreamKey::new("dep", 9);

        assert_eq!(coord.subscriber_count(&key), 1);
        assert!(coord.unsubscribe(&sub));
        assert_eq!(coord.subscriber_count(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_stream_is_evicted_once_its_last_viewer_leaves() {
        let (coord, _) = coordinator(ScriptedFetcher::new().with_chunk(0, "a\n", 2, true));
        coord.build_started("dep", "app", 1);
        let old_key = StreamKey::new("dep", 1);
        let sub = coord.subscribe("dep").unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        // Still watched, so the new build must not drop it yet.
        coord.build_started("dep", "app", 2);
        assert_eq!(coord.snapshot(&old_key).text, "a\n");

        drop(sub);
        wait_until_stopped(&coord, &old_key).await;
        assert_eq!(coord.snapshot(&old_key), LogSnapshot::default());
        assert_eq!(coord.last_outcome(&old_key), None);
        assert!(!coord.inner.streams.contains(&old_key));

        for build in 3..=5 {
            coord.build_started("dep", "app", build);
        }
        assert!(coord.inner.streams.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_stream_is_evicted_when_viewer_unsubscribes() {
        let (coord, _) = coordinator(
            ScriptedFetcher::new()
                .with_chunk(0, "a\n", 2, true)
                .with_failure(2, "gone"),
        );
        coord.build_started("dep", "app", 1);
        let old_key = StreamKey::new("dep", 1);
        let sub = coord.subscribe("dep").unwrap();
        assert!(matches!(
            wait_for_outcome(&coord, &old_key).await,
            PollOutcome::Failed { offset: 2, .. }
        ));

        coord.build_started("dep", "app", 2);
        assert_eq!(coord.snapshot(&old_key).text, "a\n");

        assert!(coord.unsubscribe(&sub));
        assert_eq!(coord.snapshot(&old_key), LogSnapshot::default());
        assert_eq!(coord.last_outcome(&old_key), None);
    }

    #[tokio::test(start_paused = true)]
    async fn active_build_stream_survives_viewer_leaving() {
        let (coord, _) = coordinator(ScriptedFetcher::new().with_chunk(0, "a\n", 2, true));
        coord.build_started("dep", "app", 1);
        let key = StreamKey::new("dep", 1);
        let sub = coord.subscribe("dep").unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(coord.unsubscribe(&sub));
        assert_eq!(wait_for_outcome(&coord, &key).await, PollOutcome::Idle { offset: 2 });
        assert_eq!(coord.snapshot(&key).text, "a\n");
    }

    #[tokio::test(start_paused = true)]
    async fn viewer_joining_before_liveness_check_keeps_the_same_loop() {
        let (coord, fetcher) = coordinator(ScriptedFetcher::new().with_chunk(0, "a\n", 2, true));
        coord.build_started("dep", "app", 1);
        let key = StreamKey::new("dep", 1);
        let first = coord.subscribe("dep").unwrap();
        let generation = coord.active_pollers()[0].generation;

        // The loop fetched at t=0 and is asleep until t=100.
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(first);
        let mut second = coord.subscribe("dep").unwrap();

        let pollers = coord.active_pollers();
        assert_eq!(pollers.len(), 1);
        assert_eq!(pollers[0].generation, generation);

        fetcher.push_chunk(2, "b\n", 4, false);
        assert_eq!(second.recv().await, Some(StreamEvent::Connected));
        assert_eq!(second.recv().await, Some(StreamEvent::Log("a\n".into())));
        assert_eq!(second.recv().await, Some(StreamEvent::Log("b\n".into())));
        assert_eq!(second.recv().await, Some(StreamEvent::Complete("done".into())));

        assert_eq!(
            wait_for_outcome(&coord, &key).await,
            PollOutcome::Completed { final_offset: 4 }
        );
        assert_eq!(fetcher.calls(), vec![("app".into(), 1, 0), ("app".into(), 1, 2)]);
        assert_eq!(fetcher.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_viewer_is_detached_after_subscriber_timeout() {
        let fetcher = Arc::new(ScriptedFetcher::new().with_chunk(0, "a\n", 2, true));
        let config = StreamConfig::default()
            .with_poll_interval(Duration::from_millis(100))
            .with_subscriber_timeout(Duration::from_secs(1));
        let coord = StreamCoordinator::new(fetcher as Arc<dyn ChunkFetcher>, config);
        coord.build_started("dep", "app", 1);
        let key = StreamKey::new("dep", 1);
        let mut sub = coord.subscribe("dep").unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(coord.is_polling(&key));
        assert_eq!(coord.subscriber_count(&key), 1);

        assert_eq!(wait_for_outcome(&coord, &key).await, PollOutcome::Idle { offset: 2 });
        assert_eq!(coord.subscriber_count(&key), 0);
        assert_eq!(sub.recv().await, Some(StreamEvent::Connected));
        assert_eq!(sub.recv().await, Some(StreamEvent::Log("a\n".into())));
        assert_eq!(sub.recv().await, None);
    }
}
