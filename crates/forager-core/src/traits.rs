use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::job::Job;

/// A single outbound fetch to perform for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    /// Per-site parameters carried by the job (cookies, query fragments,
    /// pagination cursors). Opaque to the core.
    pub payload: serde_json::Value,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Raw outcome of a fetch. The core inspects `status` (block detection)
/// and `body` (maintenance markers); it never parses structured fields.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub body: String,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Performs the actual page fetch. Injected per deployment — an HTTP
/// client, a headless browser bridge, a replay fixture. Implementations
/// return transport-level failures as [`AppError::Transient`] and hand
/// back non-success statuses in the response for the core to classify.
pub trait FetchClient: Send + Sync + Clone {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<FetchResponse, AppError>> + Send;
}

/// Receives job outcomes. The core performs no durable writes of its own
/// beyond the job queue's bookkeeping; extraction and storage live behind
/// this seam.
pub trait CompletionSink: Send + Sync + Clone {
    /// Called once per successfully fetched job, before the job is marked
    /// completed.
    fn on_success(
        &self,
        job: &Job,
        response: &FetchResponse,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Called once when a job fails terminally.
    fn on_permanent_failure(
        &self,
        job: &Job,
        error: &AppError,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// A no-op CompletionSink for use when persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullSink;

impl CompletionSink for NullSink {
    async fn on_success(&self, _job: &Job, _response: &FetchResponse) -> Result<(), AppError> {
        Ok(())
    }

    async fn on_permanent_failure(&self, _job: &Job, _error: &AppError) -> Result<(), AppError> {
        Ok(())
    }
}
