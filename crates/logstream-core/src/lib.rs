//! logstream core library
//!
//! Progressive CI build-log streaming: one poll loop per build fetches new
//! log bytes, sanitizes them, caches them for replay and fans them out to
//! every attached viewer. Finished builds are split into pipeline stages
//! with a pass/fail verdict each.

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fakes;
pub mod fetcher;
pub mod obs;
pub mod pollers;
pub mod post_build;
pub mod sanitize;
pub mod session;
pub mod stage_parser;
pub mod store;
pub mod streams;
pub mod subscribers;
pub mod telemetry;

pub use cache::{LogBuffer, LogSnapshot};
pub use config::{PostBuildConfig, StreamConfig, UpstreamConfig};
pub use coordinator::StreamCoordinator;
pub use error::{
    ConfigError, FetchError, FetchResult, PoolError, PostBuildError, Result, StoreError,
    StreamError,
};
pub use fetcher::{ChunkFetcher, JenkinsFetcher, LogChunk};
pub use pollers::{PollOutcome, PollerInfo};
pub use post_build::{
    BuildFinished, DeadLetter, DeadLetterKind, PostBuildOutcome, PostBuildPool, PostBuildTicket,
};
pub use sanitize::clean;
pub use session::{BuildSession, SessionRegistry, StreamKey};
pub use stage_parser::{classify, parse, StageBlock, Verdict, VerdictRule};
pub use store::{BuildResultRecord, BuildStore, MemoryBuildStore, StageRecord};
pub use subscribers::{StreamEvent, SubscriberId, Subscription};
pub use telemetry::init_tracing;

/// logstream version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
