//! Collaborator contracts consumed by the workflow steps.
//!
//! The steps only ever see these traits, never a concrete client, so the
//! same state machine runs against the HTTP analysis API, the local object
//! store, or in-memory fakes.

use std::future::Future;

use docflow_shared::{DocumentRef, JobId, RequestId, Result};
use docflow_storage::ObjectStore;

/// Content type of every persisted result page.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// One answer from the analysis service.
#[derive(Debug, Clone, PartialEq)]
pub struct PollResponse {
    /// Raw job status as reported by the service.
    pub status: String,
    /// Result payload, absent while the job runs or when it produced nothing.
    pub page: Option<serde_json::Value>,
    /// Continuation token for the next page.
    pub next_cursor: Option<String>,
}

/// A blob write request.
#[derive(Debug, Clone)]
pub struct PutObject<'a> {
    pub container: &'a str,
    pub key: &'a str,
    pub bytes: Vec<u8>,
    pub content_type: &'a str,
}

/// The external analysis-job API.
pub trait JobClient: Send + Sync {
    /// Start a job for `document`.
    ///
    /// `idempotency_key` is forwarded to the service so that a retried
    /// submission resolves to the job created by the first attempt.
    fn submit(
        &self,
        document: &DocumentRef,
        idempotency_key: &RequestId,
    ) -> impl Future<Output = Result<JobId>> + Send;

    /// Fetch the job status and the result page at `cursor` (first page when `None`).
    fn poll(
        &self,
        job_id: &JobId,
        cursor: Option<&str>,
    ) -> impl Future<Output = Result<PollResponse>> + Send;
}

/// Durable blob storage for result pages.
pub trait ResultSink: Send + Sync {
    fn write(&self, object: PutObject<'_>) -> impl Future<Output = Result<()>> + Send;
}

impl ResultSink for ObjectStore {
    async fn write(&self, object: PutObject<'_>) -> Result<()> {
        self.put(
            object.container,
            object.key,
            &object.bytes,
            object.content_type,
        )
        .await
        .map(|_| ())
    }
}
