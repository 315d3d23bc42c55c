//! Backend transport for the file-stream protocol.
//!
//! [`Transport`] is the seam between the uploader and the network:
//! [`HttpTransport`] talks to a real collector with `reqwest`, while
//! [`ScriptedTransport`] replays canned replies in memory for tests and
//! dry runs.
//!
//! Status handling is centralized in [`classify_response`] so both the real
//! transport and tests agree on what is retryable.

use crate::config::BackendConfig;
use crate::error::ErrorClass;
use crate::retry::Retryable;
use crate::run::RunTarget;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Lines for one stream file starting at a line offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkPayload {
    pub offset: u64,
    pub content: Vec<String>,
}

/// Body of one `file_stream` POST.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStreamRequest {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, FileChunkPayload>,
    /// Chunks given up on so far in this run.
    pub dropped: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uploaded: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preempting: Option<bool>,
}

impl FileStreamRequest {
    /// Request carrying no lines: a heartbeat.
    #[must_use]
    pub fn heartbeat(dropped: u64) -> Self {
        Self {
            dropped,
            complete: Some(false),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn line_count(&self) -> usize {
        self.files.values().map(|chunk| chunk.content.len()).sum()
    }

    /// Serialized size in bytes.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map_or(0, |body| body.len())
    }
}

/// Server-driven pacing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DynamicLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_seconds: Option<f64>,
    /// Limits this client does not interpret.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileStreamResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<DynamicLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
}

/// Line counts the backend already holds for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    #[serde(default)]
    pub history_line_count: u64,
    #[serde(default)]
    pub events_line_count: u64,
    #[serde(default)]
    pub output_line_count: u64,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("network error: {message}")]
    Network { message: String },

    #[error("request timed out")]
    Timeout,

    #[error("backend returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("rate limited by backend (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("malformed response body: {message}")]
    MalformedResponse { message: String },

    #[error("invalid transport configuration: {message}")]
    Config { message: String },
}

impl TransportError {
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Config { .. } => ErrorClass::Config,
            _ => ErrorClass::Transport,
        }
    }
}

impl Retryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout
            | Self::RateLimited { .. }
            | Self::MalformedResponse { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408,
            Self::Config { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

const MAX_ERROR_BODY: usize = 512;

/// Turn an HTTP status, `Retry-After` header and body into a result.
pub fn classify_response(
    status: u16,
    retry_after: Option<&str>,
    body: &[u8],
) -> Result<FileStreamResponse, TransportError> {
    match status {
        200..=299 => {
            if body.iter().all(u8::is_ascii_whitespace) {
                return Ok(FileStreamResponse::default());
            }
            serde_json::from_slice(body).map_err(|e| TransportError::MalformedResponse {
                message: e.to_string(),
            })
        }
        429 => Err(TransportError::RateLimited {
            retry_after: retry_after
                .and_then(|raw| raw.trim().parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64),
        }),
        _ => {
            let mut text = String::from_utf8_lossy(body).into_owned();
            if text.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !text.is_char_boundary(cut) {
                    cut -= 1;
                }
                text.truncate(cut);
            }
            Err(TransportError::Status { status, body: text })
        }
    }
}

/// Network seam used by the uploader and the replayer.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn post_file_stream(
        &self,
        target: &RunTarget,
        request: &FileStreamRequest,
    ) -> Result<FileStreamResponse, TransportError>;

    async fn resume_state(&self, target: &RunTarget) -> Result<ResumeState, TransportError>;
}

impl<T: Transport> Transport for Arc<T> {
    async fn post_file_stream(
        &self,
        target: &RunTarget,
        request: &FileStreamRequest,
    ) -> Result<FileStreamResponse, TransportError> {
        (**self).post_file_stream(target, request).await
    }

    async fn resume_state(&self, target: &RunTarget) -> Result<ResumeState, TransportError> {
        (**self).resume_state(target).await
    }
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &BackendConfig) -> Result<Self, TransportError> {
        let base_url = config
            .base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .ok_or_else(|| TransportError::Config {
                message: "backend.base_url is not set".to_string(),
            })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("runsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Config {
                message: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
        })
    }

    fn run_url(&self, target: &RunTarget, leaf: &str) -> String {
        format!(
            "{}/files/{}/{}/{}/{leaf}",
            self.base_url, target.entity, target.project, target.run_id
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.basic_auth("api", Some(key)),
            None => request,
        }
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<(u16, Option<String>, Vec<u8>), TransportError> {
        let response = self.authorize(request).send().await.map_err(map_reqwest)?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await.map_err(map_reqwest)?;
        Ok((status, retry_after, body.to_vec()))
    }
}

fn map_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network {
            message: err.to_string(),
        }
    }
}

impl Transport for HttpTransport {
    async fn post_file_stream(
        &self,
        target: &RunTarget,
        request: &FileStreamRequest,
    ) -> Result<FileStreamResponse, TransportError> {
        let url = self.run_url(target, "file_stream");
        let (status, retry_after, body) = self.execute(self.client.post(&url).json(request)).await?;
        if status == 429 {
            tracing::warn!(run_id = %target.run_id, status, retry_after = ?retry_after, "file stream rate limited");
        }
        classify_response(status, retry_after.as_deref(), &body)
    }

    async fn resume_state(&self, target: &RunTarget) -> Result<ResumeState, TransportError> {
        let url = self.run_url(target, "resume");
        let (status, retry_after, body) = self.execute(self.client.get(&url)).await?;
        if status == 404 {
            // The backend has never seen this run.
            return Ok(ResumeState::default());
        }
        classify_response(status, retry_after.as_deref(), &[])?;
        serde_json::from_slice(&body).map_err(|e| TransportError::MalformedResponse {
            message: e.to_string(),
        })
    }
}

/// One canned reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Ok(FileStreamResponse),
    Fail(TransportError),
}

/// In-memory transport that records every request.
///
/// Replies are consumed in order; once the script runs out every request
/// succeeds with an empty response.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<FileStreamRequest>>,
    resume: Mutex<ResumeState>,
    resume_queries: Mutex<u32>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_script(replies: impl IntoIterator<Item = ScriptedReply>) -> Self {
        let transport = Self::default();
        transport.script.lock().extend(replies);
        transport
    }

    /// Queue `count` failures with the given HTTP status.
    pub fn fail_with_status(&self, status: u16, count: usize) {
        let mut script = self.script.lock();
        for _ in 0..count {
            script.push_back(ScriptedReply::Fail(TransportError::Status {
                status,
                body: String::new(),
            }));
        }
    }

    pub fn push(&self, reply: ScriptedReply) {
        self.script.lock().push_back(reply);
    }

    pub fn set_resume_state(&self, state: ResumeState) {
        *self.resume.lock() = state;
    }

    /// Every request received, including failed attempts.
    #[must_use]
    pub fn requests(&self) -> Vec<FileStreamRequest> {
        self.requests.lock().clone()
    }

    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    #[must_use]
    pub fn resume_queries(&self) -> u32 {
        *self.resume_queries.lock()
    }

    /// All lines ever sent for `file`, keyed by line offset (later sends win).
    #[must_use]
    pub fn lines_for(&self, file: &str) -> BTreeMap<u64, String> {
        let mut lines = BTreeMap::new();
        for request in self.requests.lock().iter() {
            if let Some(chunk) = request.files.get(file) {
                for (i, line) in chunk.content.iter().enumerate() {
                    lines.insert(chunk.offset + i as u64, line.clone());
                }
            }
        }
        lines
    }
}

impl Transport for ScriptedTransport {
    async fn post_file_stream(
        &self,
        _target: &RunTarget,
        request: &FileStreamRequest,
    ) -> Result<FileStreamResponse, TransportError> {
        self.requests.lock().push(request.clone());
        match self.script.lock().pop_front() {
            Some(ScriptedReply::Ok(response)) => Ok(response),
            Some(ScriptedReply::Fail(err)) => Err(err),
            None => Ok(FileStreamResponse::default()),
        }
    }

    async fn resume_state(&self, _target: &RunTarget) -> Result<ResumeState, TransportError> {
        *self.resume_queries.lock() += 1;
        Ok(*self.resume.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> RunTarget {
        RunTarget::new("acme", "vision", "run-1")
    }

    #[test]
    fn request_body_matches_wire_shape() {
        let mut request = FileStreamRequest {
            dropped: 2,
            uploaded: vec!["model.pt".into()],
            complete: Some(true),
            exitcode: Some(0),
            ..FileStreamRequest::default()
        };
        request.files.insert(
            "history.jsonl".into(),
            FileChunkPayload {
                offset: 5,
                content: vec!["{\"loss\":1}".into()],
            },
        );
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["files"]["history.jsonl"]["offset"], 5);
        assert_eq!(value["dropped"], 2);
        assert_eq!(value["uploaded"][0], "model.pt");
        assert_eq!(value["complete"], true);
        assert_eq!(value["exitcode"], 0);
        assert!(value.get("preempting").is_none());
        assert_eq!(request.line_count(), 1);
    }

    #[test]
    fn heartbeat_has_no_files() {
        let value = serde_json::to_value(FileStreamRequest::heartbeat(1)).unwrap();
        assert!(value.get("files").is_none());
        assert_eq!(value["complete"], false);
        assert_eq!(value["dropped"], 1);
    }

    #[test]
    fn success_bodies_parse_limits() {
        let ok = classify_response(200, None, br#"{"limits":{"heartbeat_seconds":10,"gpu":"x"}}"#)
            .unwrap();
        let limits = ok.limits.unwrap();
        assert_eq!(limits.heartbeat_seconds, Some(10.0));
        assert_eq!(limits.other["gpu"], "x");
        assert_eq!(classify_response(204, None, b"").unwrap(), FileStreamResponse::default());
    }

    #[test]
    fn malformed_success_body_is_retryable() {
        let err = classify_response(200, None, b"<html>proxy</html>").unwrap_err();
        assert!(matches!(err, TransportError::MalformedResponse { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn status_classification() {
        for status in [500, 502, 503, 504, 408] {
            assert!(classify_response(status, None, b"").unwrap_err().is_retryable());
        }
        for status in [400, 401, 403, 404, 409] {
            let err = classify_response(status, None, b"nope").unwrap_err();
            assert!(!err.is_retryable(), "{status} must not be retried");
            assert_eq!(err.status(), Some(status));
        }
    }

    #[test]
    fn rate_limit_honours_retry_after() {
        let err = classify_response(429, Some("3"), b"").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        let err = classify_response(429, Some("soon"), b"").unwrap_err();
        assert_eq!(err.retry_after(), None);
    }

    #[test]
    fn error_bodies_are_truncated() {
        let body = "é".repeat(1_000);
        match classify_response(500, None, body.as_bytes()).unwrap_err() {
            TransportError::Status { body, .. } => assert!(body.len() <= MAX_ERROR_BODY),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn http_transport_requires_base_url() {
        let err = HttpTransport::new(&BackendConfig::default()).unwrap_err();
        assert!(matches!(err, TransportError::Config { .. }));
        assert_eq!(err.class(), ErrorClass::Config);
    }

    #[test]
    fn http_transport_builds_run_urls() {
        let config = BackendConfig {
            base_url: Some("https://collector.example/".into()),
            ..BackendConfig::default()
        };
        let transport = HttpTransport::new(&config).unwrap();
        assert_eq!(
            transport.run_url(&target(), "file_stream"),
            "https://collector.example/files/acme/vision/run-1/file_stream"
        );
    }

    #[tokio::test]
    async fn scripted_transport_replays_in_order() {
        let transport = ScriptedTransport::new();
        transport.fail_with_status(500, 1);
        let request = FileStreamRequest::heartbeat(0);
        assert!(transport.post_file_stream(&target(), &request).await.is_err());
        assert!(transport.post_file_stream(&target(), &request).await.is_ok());
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn arc_transport_delegates() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.set_resume_state(ResumeState {
            history_line_count: 4,
            ..ResumeState::default()
        });
        let shared = Arc::clone(&transport);
        let state = shared.resume_state(&target()).await.unwrap();
        assert_eq!(state.history_line_count, 4);
        assert_eq!(transport.resume_queries(), 1);
    }
}
