//! The orchestration state machine.
//!
//! ```text
//! Initialize ──► Wait ──► ProcessResults ──► Decide ──► Success
//!                 ▲                            │  └────► Failure
//!                 └────────── IN_PROGRESS ─────┘
//! ```
//!
//! Steps take the context by value and hand back the updated one. The executor
//! checkpoints whatever a step returns; a step that fails leaves the previous
//! checkpoint in place, so every step must be safe to run again.

use docflow_shared::{DocflowError, JobStatus, Result, WorkflowContext, WorkflowState};
use tracing::{info, instrument};

use crate::contracts::{JobClient, ResultSink};
use crate::paginator::ResultPaginator;

/// Step implementations bound to their collaborators.
pub struct Steps<'a, J, S> {
    client: &'a J,
    sink: &'a S,
}

impl<'a, J: JobClient, S: ResultSink> Steps<'a, J, S> {
    pub fn new(client: &'a J, sink: &'a S) -> Self {
        Self { client, sink }
    }

    /// Submit the analysis job.
    ///
    /// A context that already carries a job id is returned untouched, and the
    /// request id is always sent as the idempotency key.
    #[instrument(skip_all, fields(request_id = %ctx.request_id, document = %ctx.document))]
    pub async fn initialize(&self, mut ctx: WorkflowContext) -> Result<WorkflowContext> {
        if let Some(job_id) = &ctx.job_id {
            info!(%job_id, "job already submitted, skipping");
            return Ok(ctx);
        }

        let job_id = self.client.submit(&ctx.document, &ctx.request_id).await?;
        info!(%job_id, "analysis job started");

        ctx.job_id = Some(job_id);
        ctx.set_status(JobStatus::InProgress)?;
        Ok(ctx)
    }

    /// Poll the job; once it has succeeded, drain every result page.
    #[instrument(skip_all, fields(request_id = %ctx.request_id, job_id = tracing::field::Empty))]
    pub async fn process_results(&self, mut ctx: WorkflowContext) -> Result<WorkflowContext> {
        let job_id = ctx
            .job_id
            .clone()
            .ok_or_else(|| DocflowError::validation("cannot poll before the job is submitted"))?;
        tracing::Span::current().record("job_id", tracing::field::display(&job_id));

        let first = self.client.poll(&job_id, None).await?;
        let status = JobStatus::from_remote(&first.status)?;
        ctx.set_status(status)?;

        if status != JobStatus::Succeeded {
            info!(status = %status, "job not finished");
            return Ok(ctx);
        }

        let pages = ResultPaginator::new(self.client, self.sink)
            .drain_from(&mut ctx, first)
            .await?;
        info!(pages, "all result pages saved");
        Ok(ctx)
    }
}

/// Route on the job status. Anything other than success or progress fails.
pub fn decide(ctx: &WorkflowContext) -> WorkflowState {
    match ctx.job_status {
        JobStatus::Succeeded => WorkflowState::Success,
        JobStatus::InProgress => WorkflowState::Wait,
        JobStatus::Failed | JobStatus::Unstarted => WorkflowState::Failure,
    }
}

/// State that follows `state` once its step has completed with `ctx`.
pub fn next_state(state: WorkflowState, ctx: &WorkflowContext) -> WorkflowState {
    match state {
        WorkflowState::Initialize => WorkflowState::Wait,
        WorkflowState::Wait => WorkflowState::ProcessResults,
        WorkflowState::ProcessResults => WorkflowState::Decide,
        WorkflowState::Decide => decide(ctx),
        WorkflowState::Success => WorkflowState::Success,
        WorkflowState::Failure => WorkflowState::Failure,
    }
}
