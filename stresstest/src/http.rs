//! A [`Backend`] that commits batches to a remote document store over HTTP.
//!
//! Each batch is sent as `POST {remote}/commit` with a body of `{"writes": [...]}`. The response
//! carries one result per write, in order: `{"results": [{"code": "OK"}, {"code": "ABORTED",
//! "message": "..."}]}`.

use std::time::Duration;

use bulkwriter_service::{
    Backend, CommitError, CommitResult, ErrorKind, OpError, OpResult, Write, WriteIntent,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// A remote document store reached over HTTP.
#[derive(Debug)]
pub struct HttpBackend {
    remote: String,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Creates a backend for the store at `remote`, e.g. `http://localhost:8888`.
    pub fn new(remote: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent("bulkwriter-stresstest")
            .timeout(timeout)
            .build()?;

        let mut remote = remote.into();
        while remote.ends_with('/') {
            remote.pop();
        }

        Ok(Self { remote, client })
    }
}

#[derive(Debug, Serialize)]
struct CommitRequest<'a> {
    writes: Vec<&'a Write>,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    results: Vec<WireResult>,
}

#[derive(Debug, Deserialize)]
struct WireResult {
    code: String,
    #[serde(default)]
    message: String,
}

impl WireResult {
    fn into_result(self) -> OpResult {
        if self.code == "OK" {
            return Ok(());
        }

        match serde_json::from_value::<ErrorKind>(serde_json::Value::String(self.code.clone())) {
            Ok(kind) => Err(OpError::new(kind, self.message)),
            Err(_) => Err(OpError::new(
                ErrorKind::InvalidArgument,
                format!("unknown result code {}: {}", self.code, self.message),
            )),
        }
    }
}

/// Maps a non-success HTTP status to the error that fails the whole batch.
///
/// A missing `/commit` endpoint means the remote is misconfigured and aborts the run.
fn status_error(status: StatusCode) -> CommitError {
    let kind = match status {
        StatusCode::NOT_FOUND => {
            return CommitError::Unreachable {
                context: "commit endpoint not found".to_owned(),
                cause: format!("remote responded with {status}").into(),
            };
        }
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::ResourceExhausted,
        StatusCode::CONFLICT => ErrorKind::Aborted,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::PermissionDenied,
        status if status.is_server_error() => ErrorKind::Unavailable,
        _ => ErrorKind::InvalidArgument,
    };
    CommitError::Rejected(OpError::new(
        kind,
        format!("commit request failed with {status}"),
    ))
}

fn unreachable(context: &str, error: reqwest::Error) -> CommitError {
    CommitError::Unreachable {
        context: context.to_owned(),
        cause: Box::new(error),
    }
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn commit(&self, intents: &[WriteIntent]) -> CommitResult {
        let request = CommitRequest {
            writes: intents.iter().map(WriteIntent::write).collect(),
        };

        let response = self
            .client
            .post(format!("{}/commit", self.remote))
            .json(&request)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(error) if error.is_timeout() => {
                return Err(CommitError::Rejected(OpError::new(
                    ErrorKind::Unavailable,
                    "commit request timed out",
                )));
            }
            Err(error) => return Err(unreachable("sending commit request", error)),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let body: CommitResponse = response.json().await.map_err(|error| {
            tracing::warn!(
                error = &error as &dyn std::error::Error,
                "failed to read commit response"
            );
            CommitError::Rejected(OpError::new(
                ErrorKind::Unavailable,
                "malformed commit response",
            ))
        })?;

        Ok(body
            .results
            .into_iter()
            .map(WireResult::into_result)
            .collect())
    }
}
