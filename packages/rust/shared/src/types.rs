//! Core domain types for docflow workflow instances.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DocflowError, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for execution identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    /// Generate a new time-sortable execution identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Opaque correlation identifier assigned once when a workflow starts.
///
/// Doubles as the idempotency key for job submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Generate a fresh request identifier.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of an external analysis job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// DocumentRef
// ---------------------------------------------------------------------------

/// Storage location of the analyzed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRef {
    /// Bucket or top-level container name.
    pub container: String,
    /// Object key within the container.
    pub key: String,
}

impl DocumentRef {
    pub fn new(container: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            key: key.into(),
        }
    }

    /// Key under which result page `n` (1-based) is stored.
    pub fn page_key(&self, n: usize) -> String {
        format!("{}_raw_{n}.json", self.key)
    }
}

impl std::fmt::Display for DocumentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.container, self.key)
    }
}

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Status of the external job as tracked by the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Unstarted,
    InProgress,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Parse a status string reported by the analysis service.
    ///
    /// Only `IN_PROGRESS`, `SUCCEEDED` and `FAILED` are accepted; a running job
    /// can never report itself as unstarted.
    pub fn from_remote(status: &str) -> Result<Self> {
        match status {
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            other => Err(DocflowError::unrecognized_status(other)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unstarted => "UNSTARTED",
            Self::InProgress => "IN_PROGRESS",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Checked forward transition.
    ///
    /// Allowed: staying put, `UNSTARTED -> IN_PROGRESS`, and
    /// `IN_PROGRESS -> SUCCEEDED | FAILED`.
    pub fn advance(self, next: JobStatus) -> Result<JobStatus> {
        use JobStatus::*;
        match (self, next) {
            (a, b) if a == b => Ok(b),
            (Unstarted, InProgress) | (InProgress, Succeeded) | (InProgress, Failed) => Ok(next),
            (from, to) => Err(DocflowError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// WorkflowState
// ---------------------------------------------------------------------------

/// States of the orchestration state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowState {
    Initialize,
    Wait,
    ProcessResults,
    Decide,
    Success,
    Failure,
}

impl WorkflowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialize => "Initialize",
            Self::Wait => "Wait",
            Self::ProcessResults => "ProcessResults",
            Self::Decide => "Decide",
            Self::Success => "Success",
            Self::Failure => "Failure",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl std::fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowState {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Initialize" => Ok(Self::Initialize),
            "Wait" => Ok(Self::Wait),
            "ProcessResults" => Ok(Self::ProcessResults),
            "Decide" => Ok(Self::Decide),
            "Success" => Ok(Self::Success),
            "Failure" => Ok(Self::Failure),
            other => Err(DocflowError::validation(format!(
                "unknown workflow state '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// StartRequest / WorkflowContext
// ---------------------------------------------------------------------------

/// Initial payload handed to the orchestrator when a workflow starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    pub request_id: RequestId,
    pub document: DocumentRef,
}

/// The record threaded through every step of a workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowContext {
    /// Correlation identifier, immutable.
    pub request_id: RequestId,
    /// Document under analysis, immutable.
    pub document: DocumentRef,
    /// External job handle, set once by Initialize.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Last known job status.
    pub job_status: JobStatus,
    /// Continuation token while draining result pages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_cursor: Option<String>,
}

impl WorkflowContext {
    /// Fresh context for a newly triggered workflow.
    pub fn new(request: StartRequest) -> Self {
        Self {
            request_id: request.request_id,
            document: request.document,
            job_id: None,
            job_status: JobStatus::Unstarted,
            result_cursor: None,
        }
    }

    /// Record a job status reported by the service, refusing regressions.
    pub fn set_status(&mut self, next: JobStatus) -> Result<()> {
        self.job_status = self.job_status.advance(next)?;
        Ok(())
    }

    /// Verify the structural invariants of the context.
    pub fn validate(&self) -> Result<()> {
        let started = self.job_status != JobStatus::Unstarted;
        if started != self.job_id.is_some() {
            return Err(DocflowError::validation(format!(
                "job id presence does not match status {}",
                self.job_status
            )));
        }
        if self.result_cursor.is_some() && self.job_status != JobStatus::Succeeded {
            return Err(DocflowError::validation(format!(
                "result cursor set while status is {}",
                self.job_status
            )));
        }
        Ok(())
    }
}
