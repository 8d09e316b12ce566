//! Progressive console-log fetcher
//!
//! Talks to the CI server's progressive text endpoint, which returns the
//! bytes appended since a given offset together with two headers:
//! `X-Text-Size` (the offset to ask for next) and `X-More-Data` (present
//! and `true` while the build is still running).

use crate::config::UpstreamConfig;
use crate::error::{FetchError, FetchResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Header carrying the authoritative next offset
pub const TEXT_SIZE_HEADER: &str = "X-Text-Size";
/// Header signalling that the build is still producing output
pub const MORE_DATA_HEADER: &str = "X-More-Data";

/// One progressive-fetch response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Raw (unsanitized) text
    pub text: String,
    /// Offset for the next fetch
    pub next_offset: u64,
    /// Build still running upstream
    pub has_more: bool,
    /// Requested offset plus the byte length of the body
    pub byte_offset: u64,
}

impl LogChunk {
    /// Build a chunk from a response.
    ///
    /// The size header is authoritative; without it the next offset is the
    /// requested offset plus the body's byte length.
    pub fn from_response(
        offset: u64,
        text: String,
        body_len: usize,
        size_header: Option<u64>,
        has_more: bool,
    ) -> Self {
        let byte_offset = offset + body_len as u64;
        LogChunk {
            text,
            next_offset: size_header.unwrap_or(byte_offset),
            has_more,
            byte_offset,
        }
    }

    /// `Some((header_offset, byte_offset))` when the two offset sources
    /// disagree.
    pub fn drift(&self) -> Option<(u64, u64)> {
        (self.next_offset != self.byte_offset).then_some((self.next_offset, self.byte_offset))
    }
}

/// Narrow contract on the upstream log source.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    /// Fetch everything appended since `offset`.
    async fn fetch(&self, job_name: &str, build_number: u64, offset: u64) -> FetchResult<LogChunk>;

    /// Fetch the whole console log of a finished build.
    async fn fetch_full(&self, job_name: &str, build_number: u64) -> FetchResult<String>;
}

/// `team/app` → `job/team/job/app`, the CI server's folder path layout.
pub fn job_path(job_name: &str) -> String {
    job_name
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("job/{}", segment))
        .collect::<Vec<_>>()
        .join("/")
}

/// HTTP client for a Jenkins-compatible CI server.
pub struct JenkinsFetcher {
    config: UpstreamConfig,
    http_client: reqwest::Client,
}

impl JenkinsFetcher {
    pub fn new(config: UpstreamConfig) -> FetchResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("logstream/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;
        Ok(JenkinsFetcher {
            config,
            http_client,
        })
    }

    fn build_url(&self, job_name: &str, build_number: u64, tail: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.config.base_url,
            job_path(job_name),
            build_number,
            tail
        )
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> FetchResult<reqwest::Response> {
        let mut request = self.http_client.get(url).query(query);
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.api_token.as_deref());
        }
        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Unauthorized {
                status: response.status().as_u16(),
            }),
            status => Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }
}

fn header_u64(response: &reqwest::Response, name: &str) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn header_flag(response: &reqwest::Response, name: &str) -> bool {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[async_trait]
impl ChunkFetcher for JenkinsFetcher {
    async fn fetch(&self, job_name: &str, build_number: u64, offset: u64) -> FetchResult<LogChunk> {
        let url = self.build_url(job_name, build_number, "logText/progressiveText");
        let response = self.get(&url, &[("start", offset.to_string())]).await?;

        let size_header = header_u64(&response, TEXT_SIZE_HEADER);
        let has_more = header_flag(&response, MORE_DATA_HEADER);
        let body = response.bytes().await?;
        let text = String::from_utf8_lossy(&body).into_owned();

        debug!(
            job_name = %job_name,
            build_number = build_number,
            offset = offset,
            bytes = body.len(),
            has_more = has_more,
            "fetched log chunk"
        );
        Ok(LogChunk::from_response(offset, text, body.len(), size_header, has_more))
    }

    async fn fetch_full(&self, job_name: &str, build_number: u64) -> FetchResult<String> {
        let url = self.build_url(job_name, build_number, "consoleText");
        let response = self.get(&url, &[]).await?;
        let body = response.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}
