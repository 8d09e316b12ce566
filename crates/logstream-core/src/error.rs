//! Error types for logstream-core

use thiserror::Error;

/// Failure reaching the upstream log source.
///
/// Every variant is treated as non-retryable by the fetcher itself; the
/// poll loop logs it and stops.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Connection, DNS, TLS or timeout failure
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// Upstream rejected our credentials
    #[error("upstream rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    /// Any other non-success HTTP status
    #[error("upstream returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    /// Scripted or injected failure (fakes only)
    #[error("upstream fetch failed: {0}")]
    Other(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Transport(err.to_string())
    }
}

/// Errors surfaced by the stream coordinator and the log cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Subscribe was called for a deployment with no known build
    #[error("no active build session for deployment {deployment_id}")]
    NoActiveSession { deployment_id: String },

    /// An append tried to move the offset cursor backwards
    #[error("offset regression on {stream_key}: cursor at {current}, append at {requested}")]
    OffsetRegression {
        stream_key: String,
        current: u64,
        requested: u64,
    },
}

/// Persistence failures reported by a [`crate::store::BuildStore`].
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("failed to persist build result for {deployment_id}: {reason}")]
    BuildResult {
        deployment_id: String,
        reason: String,
    },

    #[error("failed to persist stage {order_index} ({name}): {reason}")]
    Stage {
        order_index: usize,
        name: String,
        reason: String,
    },
}

/// Submission failures of the post-build worker pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("post-build queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("post-build pool has shut down")]
    ShutDown,
}

/// Why a queued post-build job produced no stage analysis.
#[derive(Error, Debug)]
pub enum PostBuildError {
    #[error("full log fetch failed: {0}")]
    Fetch(#[from] FetchError),

    /// The pool shut down before a worker reported back
    #[error("post-build job was abandoned")]
    Abandoned,
}

/// Invalid configuration values read from the environment.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Result type for upstream fetches
pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, StreamError>;
