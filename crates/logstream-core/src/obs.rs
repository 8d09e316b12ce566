//! Structured lifecycle events for streams, pollers and post-build jobs.
//!
//! Every emitter logs an `event = "<domain>.<verb>"` field so log pipelines
//! can filter on it without parsing messages.

use tracing::{info, warn};

use crate::subscribers::SubscriberId;

/// Span tagged with the stream key, attached to a poller's future with
/// `tracing::Instrument` so it follows the task across await points.
pub fn stream_span(stream_key: &str) -> tracing::Span {
    tracing::info_span!("logstream.stream", stream_key = %stream_key)
}

pub fn emit_session_started(deployment_id: &str, job_name: &str, build_number: u64) {
    info!(
        event = "session.started",
        deployment_id = %deployment_id,
        job_name = %job_name,
        build_number = build_number,
    );
}

pub fn emit_subscribed(stream_key: &str, replay_bytes: usize, completed: bool) {
    info!(
        event = "stream.subscribed",
        stream_key = %stream_key,
        replay_bytes = replay_bytes,
        completed = completed,
    );
}

/// Viewer outlived its maximum subscription lifetime and was detached.
pub fn emit_subscriber_expired(subscriber: SubscriberId) {
    info!(event = "stream.subscriber_expired", subscriber = %subscriber);
}

/// A replaced build's stream was dropped from memory.
pub fn emit_stream_evicted(stream_key: &str) {
    info!(event = "stream.evicted", stream_key = %stream_key);
}

pub fn emit_poller_started(stream_key: &str, offset: u64) {
    info!(event = "poller.started", stream_key = %stream_key, offset = offset);
}

/// Poller reached the end of the build log.
pub fn emit_poller_finished(stream_key: &str, final_offset: u64, subscribers: usize) {
    info!(
        event = "poller.finished",
        stream_key = %stream_key,
        final_offset = final_offset,
        subscribers = subscribers,
    );
}

/// Poller stopped before the build finished (no viewers, cancelled).
pub fn emit_poller_idle(stream_key: &str, offset: u64, reason: &str) {
    info!(
        event = "poller.stopped",
        stream_key = %stream_key,
        offset = offset,
        reason = %reason,
    );
}

pub fn emit_poller_aborted(stream_key: &str, offset: u64, error: &dyn std::fmt::Display) {
    warn!(
        event = "poller.aborted",
        stream_key = %stream_key,
        offset = offset,
        error = %error,
    );
}

pub fn emit_offset_drift(stream_key: &str, header_offset: u64, byte_offset: u64) {
    warn!(
        event = "fetch.offset_drift",
        stream_key = %stream_key,
        header_offset = header_offset,
        byte_offset = byte_offset,
    );
}

pub fn emit_post_build_done(deployment_id: &str, stages: usize, persisted: usize) {
    info!(
        event = "post_build.done",
        deployment_id = %deployment_id,
        stages = stages,
        persisted = persisted,
    );
}

pub fn emit_post_build_failed(deployment_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "post_build.failed", deployment_id = %deployment_id, error = %error);
}

pub fn emit_stage_persist_failed(
    deployment_id: &str,
    order_index: usize,
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "post_build.stage_persist_failed",
        deployment_id = %deployment_id,
        order_index = order_index,
        error = %error,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_span_can_be_entered() {
        let span = stream_span("dep-1#7");
        let _guard = span.enter();
    }
}
