//! Active build sessions.
//!
//! The registry remembers, per deployment, which CI job and build number is
//! currently running. It is the only way a viewer that knows just a
//! deployment id can address a log stream.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Identifier of one log stream: `deploymentId#buildNumber`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(deployment_id: &str, build_number: u64) -> Self {
        StreamKey(format!("{}#{}", deployment_id, build_number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Deployment part of the key.
    pub fn deployment_id(&self) -> &str {
        self.0
            .rsplit_once('#')
            .map_or(self.0.as_str(), |(deployment_id, _)| deployment_id)
    }
}

impl std::fmt::Display for StreamKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The build currently associated with a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSession {
    pub deployment_id: String,
    pub job_name: String,
    pub build_number: u64,
    pub started_at: DateTime<Utc>,
    pub completed: bool,
}

impl BuildSession {
    pub fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.deployment_id, self.build_number)
    }
}

/// Deployment id → active build. One session per deployment, no history.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, BuildSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a newly started build, replacing any earlier one for the same
    /// deployment. Returns the replaced session.
    pub fn create_or_update(
        &self,
        deployment_id: &str,
        build_number: u64,
        job_name: &str,
    ) -> Option<BuildSession> {
        let session = BuildSession {
            deployment_id: deployment_id.to_string(),
            job_name: job_name.to_string(),
            build_number,
            started_at: Utc::now(),
            completed: false,
        };
        self.sessions.insert(deployment_id.to_string(), session)
    }

    pub fn get_by_deployment_id(&self, deployment_id: &str) -> Option<BuildSession> {
        self.sessions.get(deployment_id).map(|s| s.value().clone())
    }

    /// Mark the deployment's session completed. Returns `false` when no
    /// session is known.
    pub fn mark_completed(&self, deployment_id: &str) -> bool {
        match self.sessions.get_mut(deployment_id) {
            Some(mut session) => {
                session.completed = true;
                true
            }
            None => false,
        }
    }

    /// Like [`mark_completed`](Self::mark_completed), but only if the session
    /// still refers to `build_number`. A poller finishing an old build must
    /// not complete the build that replaced it.
    pub fn mark_build_completed(&self, deployment_id: &str, build_number: u64) -> bool {
        match self.sessions.get_mut(deployment_id) {
            Some(mut session) if session.build_number == build_number => {
                session.completed = true;
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
