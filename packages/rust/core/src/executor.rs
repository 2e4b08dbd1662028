//! Durable local executor for workflow instances.
//!
//! Every execution is a row in the checkpoint database. The executor loads it,
//! runs the step for its current state, and writes the returned context and
//! the next state back before moving on. Step failures are retried according
//! to the configured [`RetryPolicy`](docflow_shared::RetryPolicy); exhausted or
//! non-retryable failures route the execution to `Failure`.
//!
//! `Wait` is a timer, not a sleeping task: entering it persists `resume_at`,
//! so an interrupted process picks the execution up again with
//! [`Executor::resume_pending`].
//!
//! Only one runner drives an execution at a time. `run` claims the row with a
//! lease that every checkpoint extends past the next resume time; a second
//! runner gets a [`DocflowError::Conflict`] (or the outcome, once terminal).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use docflow_shared::{
    DocflowError, ExecutionId, JobStatus, RequestId, Result, StartRequest, WorkflowConfig,
    WorkflowContext, WorkflowState,
};
use docflow_storage::{EventKind, ExecutionRecord, Storage, validate_location};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::contracts::{JobClient, ResultSink};
use crate::workflow::{Steps, next_state};

/// Final view of an execution once `run` returns.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub execution_id: ExecutionId,
    pub request_id: RequestId,
    pub state: WorkflowState,
    pub context: WorkflowContext,
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        self.state == WorkflowState::Success
    }
}

impl From<&ExecutionRecord> for ExecutionOutcome {
    fn from(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.id.clone(),
            request_id: record.request_id.clone(),
            state: record.state,
            context: record.context.clone(),
            error: record.error.clone(),
        }
    }
}

/// Result of resuming every pending execution.
#[derive(Debug, Default)]
pub struct ResumeReport {
    pub outcomes: Vec<ExecutionOutcome>,
    /// Executions whose run aborted, with the cause.
    pub errors: Vec<(ExecutionId, String)>,
}

/// Progress callbacks for an executing workflow.
pub trait ExecutionObserver: Send + Sync {
    /// Called after the execution has been checkpointed in a new state.
    fn state_entered(&self, execution_id: &ExecutionId, state: WorkflowState);
    /// Called when a step attempt fails. `retry_in` is `None` when no retry follows.
    fn step_failed(
        &self,
        execution_id: &ExecutionId,
        state: WorkflowState,
        error: &DocflowError,
        retry_in: Option<Duration>,
    );
    /// Called when `run` returns with a terminal execution.
    fn finished(&self, outcome: &ExecutionOutcome);
}

/// No-op observer for headless/test usage.
pub struct SilentObserver;

impl ExecutionObserver for SilentObserver {
    fn state_entered(&self, _execution_id: &ExecutionId, _state: WorkflowState) {}
    fn step_failed(
        &self,
        _execution_id: &ExecutionId,
        _state: WorkflowState,
        _error: &DocflowError,
        _retry_in: Option<Duration>,
    ) {
    }
    fn finished(&self, _outcome: &ExecutionOutcome) {}
}

/// Runs workflow executions against a checkpoint store.
pub struct Executor<J, S> {
    client: Arc<J>,
    sink: Arc<S>,
    storage: Arc<Storage>,
    config: WorkflowConfig,
    observer: Arc<dyn ExecutionObserver>,
}

impl<J, S> Clone for Executor<J, S> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            sink: Arc::clone(&self.sink),
            storage: Arc::clone(&self.storage),
            config: self.config.clone(),
            observer: Arc::clone(&self.observer),
        }
    }
}

impl<J, S> Executor<J, S>
where
    J: JobClient + 'static,
    S: ResultSink + 'static,
{
    pub fn new(client: Arc<J>, sink: Arc<S>, storage: Arc<Storage>, config: WorkflowConfig) -> Self {
        Self {
            client,
            sink,
            storage,
            config,
            observer: Arc::new(SilentObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Register a new execution for `request`.
    ///
    /// Starting the same request id twice returns the execution created the
    /// first time instead of a second one.
    #[instrument(skip_all, fields(request_id = %request.request_id, document = %request.document))]
    pub async fn start(&self, request: StartRequest) -> Result<ExecutionRecord> {
        validate_request(&request)?;

        let record = ExecutionRecord::new(WorkflowContext::new(request));
        if self.storage.insert_execution(&record).await? {
            self.storage
                .append_event(&record.id, record.state, EventKind::Entered, None)
                .await?;
            info!(execution_id = %record.id, "execution started");
            self.observer.state_entered(&record.id, record.state);
            return Ok(record);
        }

        let existing = self
            .storage
            .get_execution_by_request(&record.request_id)
            .await?
            .ok_or_else(|| {
                DocflowError::Storage(format!(
                    "execution for request {} vanished after conflict",
                    record.request_id
                ))
            })?;
        info!(execution_id = %existing.id, state = %existing.state, "request already started");
        Ok(existing)
    }

    /// Start `request` and drive it to a terminal state.
    pub async fn start_and_run(&self, request: StartRequest) -> Result<ExecutionOutcome> {
        let record = self.start(request).await?;
        self.run(&record.id).await
    }

    /// Drive an execution from its last checkpoint to `Success` or `Failure`.
    ///
    /// Returns an error only when the checkpoint store fails or another runner
    /// holds the execution; step failures end in a `Failure` outcome. Running
    /// an execution that is already terminal returns its outcome unchanged.
    #[instrument(skip_all, fields(execution_id = %id))]
    pub async fn run(&self, id: &ExecutionId) -> Result<ExecutionOutcome> {
        let owner = Uuid::now_v7().to_string();
        let claimed = self
            .storage
            .claim_execution(id, &owner, after(self.config.lease))
            .await?;

        let Some(mut record) = claimed else {
            return self.unclaimed(id).await;
        };
        debug!(%owner, version = record.version, "execution claimed");

        let result = self.drive(&mut record).await;
        if let Err(e) = self.storage.release_execution(id, &owner).await {
            warn!(error = %e, "failed to release execution claim");
        }
        result
    }

    async fn unclaimed(&self, id: &ExecutionId) -> Result<ExecutionOutcome> {
        let record = self
            .storage
            .get_execution(id)
            .await?
            .ok_or_else(|| DocflowError::validation(format!("unknown execution {id}")))?;

        if record.state.is_terminal() {
            return Ok(self.finish(&record));
        }
        Err(DocflowError::conflict(format!(
            "execution {id} is already being run by {}",
            record.owner.as_deref().unwrap_or("another runner")
        )))
    }

    fn finish(&self, record: &ExecutionRecord) -> ExecutionOutcome {
        let outcome = ExecutionOutcome::from(record);
        info!(state = %outcome.state, "execution finished");
        self.observer.finished(&outcome);
        outcome
    }

    async fn drive(&self, record: &mut ExecutionRecord) -> Result<ExecutionOutcome> {
        let steps = Steps::new(self.client.as_ref(), self.sink.as_ref());

        loop {
            if record.state.is_terminal() {
                return Ok(self.finish(record));
            }

            if let Some(at) = record.resume_at {
                if record.lease_expires_at.is_none_or(|lease| lease <= at) {
                    self.renew_lease(record);
                    self.storage.save_execution(record).await?;
                }
                let remaining = (at - Utc::now()).to_std().unwrap_or_default();
                if !remaining.is_zero() {
                    debug!(state = %record.state, ?remaining, "sleeping until resume time");
                    tokio::time::sleep(remaining).await;
                }
            }

            let result = match record.state {
                WorkflowState::Initialize => steps.initialize(record.context.clone()).await,
                WorkflowState::ProcessResults => {
                    steps.process_results(record.context.clone()).await
                }
                _ => Ok(record.context.clone()),
            };

            match result.and_then(|ctx| ctx.validate().map(|()| ctx)) {
                Ok(ctx) => self.transition(record, ctx).await?,
                Err(err) => self.handle_failure(record, err).await?,
            }
        }
    }

    /// Extend the claim to cover the next resume time plus the lease.
    fn renew_lease(&self, record: &mut ExecutionRecord) {
        let now = Utc::now();
        let base = record.resume_at.map_or(now, |at| at.max(now));
        record.lease_expires_at = Some(after_from(base, self.config.lease));
    }

    /// Run every non-terminal execution, at most `max_concurrent_executions` at a time.
    pub async fn resume_pending(&self) -> Result<ResumeReport> {
        let pending = self.storage.list_pending().await?;
        info!(count = pending.len(), "resuming pending executions");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_executions.max(1)));
        let mut handles = Vec::with_capacity(pending.len());

        for record in pending {
            let executor = self.clone();
            let sem = semaphore.clone();
            let id = record.id;

            handles.push((
                id.clone(),
                tokio::spawn(async move {
                    let _permit = sem
                        .acquire()
                        .await
                        .map_err(|e| DocflowError::Storage(format!("resume queue closed: {e}")))?;
                    executor.run(&id).await
                }),
            ));
        }

        let mut report = ResumeReport::default();
        for (id, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) => report.outcomes.push(outcome),
                Ok(Err(e)) => {
                    warn!(execution_id = %id, error = %e, "execution aborted");
                    report.errors.push((id, e.to_string()));
                }
                Err(e) => {
                    warn!(execution_id = %id, error = %e, "execution task panicked");
                    report.errors.push((id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn transition(&self, record: &mut ExecutionRecord, ctx: WorkflowContext) -> Result<()> {
        let from = record.state;
        let to = next_state(from, &ctx);

        record.context = ctx;
        record.state = to;
        record.attempt = 0;
        record.resume_at = (to == WorkflowState::Wait).then(|| after(self.config.wait_interval));
        if to == WorkflowState::Failure {
            record.error = Some(failure_cause(&record.context));
        }
        self.renew_lease(record);

        self.storage.save_execution(record).await?;
        let kind = if to.is_terminal() {
            EventKind::Terminal
        } else {
            EventKind::Entered
        };
        self.storage
            .append_event(&record.id, to, kind, record.error.as_deref())
            .await?;

        info!(%from, %to, job_status = %record.context.job_status, "state transition");
        self.observer.state_entered(&record.id, to);
        Ok(())
    }

    async fn handle_failure(&self, record: &mut ExecutionRecord, err: DocflowError) -> Result<()> {
        record.attempt += 1;
        let detail = err.to_string();
        self.storage
            .append_event(&record.id, record.state, EventKind::StepFailed, Some(&detail))
            .await?;

        let policy = &self.config.retry;
        if err.is_retryable() && policy.allows_retry(record.attempt) {
            let delay = policy.delay_for(record.attempt);
            warn!(
                state = %record.state,
                attempt = record.attempt,
                ?delay,
                error = %err,
                "step failed, retrying"
            );
            record.resume_at = Some(after(delay));
            self.renew_lease(record);
            self.storage.save_execution(record).await?;
            self.storage
                .append_event(
                    &record.id,
                    record.state,
                    EventKind::RetryScheduled,
                    Some(&format!("attempt {} in {delay:?}", record.attempt + 1)),
                )
                .await?;
            self.observer
                .step_failed(&record.id, record.state, &err, Some(delay));
            return Ok(());
        }

        error!(
            state = %record.state,
            attempt = record.attempt,
            error = %err,
            "step failed permanently"
        );
        self.observer.step_failed(&record.id, record.state, &err, None);

        record.state = WorkflowState::Failure;
        record.resume_at = None;
        record.error = Some(detail);
        self.storage.save_execution(record).await?;
        self.storage
            .append_event(
                &record.id,
                WorkflowState::Failure,
                EventKind::Terminal,
                record.error.as_deref(),
            )
            .await?;
        self.observer.state_entered(&record.id, WorkflowState::Failure);
        Ok(())
    }
}

fn validate_request(request: &StartRequest) -> Result<()> {
    if request.request_id.as_str().is_empty() {
        return Err(DocflowError::validation("request id must not be empty"));
    }
    // Result pages are stored next to the document, so its key must be storable.
    validate_location(&request.document.container, &request.document.key)
}

fn failure_cause(ctx: &WorkflowContext) -> String {
    match (&ctx.job_id, ctx.job_status) {
        (Some(job_id), JobStatus::Failed) => format!("job {job_id} reported status FAILED"),
        (Some(job_id), status) => format!("job {job_id} ended in status {status}"),
        (None, _) => "no analysis job was started".to_string(),
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    after_from(Utc::now(), delay)
}

fn after_from(start: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpJobClient;
    use crate::testing::{MemorySink, ScriptedJobClient};
    use docflow_shared::{AnalysisConfig, DocumentRef, JobId, RetryPolicy};
    use docflow_storage::ObjectStore;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::Ordering;
    use uuid::Uuid;

    async fn test_storage() -> Arc<Storage> {
        let tmp = std::env::temp_dir().join(format!("docflow_exec_{}.db", Uuid::now_v7()));
        Arc::new(Storage::open(&tmp).await.expect("open test db"))
    }

    fn fast_config() -> WorkflowConfig {
        WorkflowConfig {
            wait_interval: Duration::ZERO,
            max_concurrent_executions: 2,
            lease: Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts: 3,
                interval: Duration::from_millis(1),
                backoff_rate: 2.0,
                max_interval: Duration::from_millis(5),
            },
        }
    }

    fn request(id: &str) -> StartRequest {
        StartRequest {
            request_id: RequestId(id.into()),
            document: DocumentRef::new("docs", "invoice.pdf"),
        }
    }

    async fn executor(
        client: ScriptedJobClient,
        sink: MemorySink,
    ) -> (
        Executor<ScriptedJobClient, MemorySink>,
        Arc<ScriptedJobClient>,
        Arc<MemorySink>,
        Arc<Storage>,
    ) {
        let client = Arc::new(client);
        let sink = Arc::new(sink);
        let storage = test_storage().await;
        let exec = Executor::new(client.clone(), sink.clone(), storage.clone(), fast_config());
        (exec, client, sink, storage)
    }

    #[tokio::test]
    async fn single_page_job_succeeds() {
        let (exec, client, sink, storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 1), MemorySink::default()).await;

        let outcome = exec.start_and_run(request("r-1")).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.context.job_status, JobStatus::Succeeded);
        assert!(outcome.error.is_none());
        assert_eq!(sink.keys(), vec!["invoice.pdf_raw_1.json"]);
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 1);

        let events = storage.list_events(&outcome.execution_id).await.unwrap();
        let trail: Vec<_> = events
            .iter()
            .map(|e| (e.state.as_str(), e.kind.as_str()))
            .collect();
        assert_eq!(
            trail,
            vec![
                ("Initialize", "entered"),
                ("Wait", "entered"),
                ("ProcessResults", "entered"),
                ("Decide", "entered"),
                ("Success", "terminal"),
            ]
        );
    }

    #[tokio::test]
    async fn multi_page_job_writes_every_page() {
        let (exec, _client, sink, _storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 3), MemorySink::default()).await;

        let outcome = exec.start_and_run(request("r-3")).await.unwrap();

        assert!(outcome.is_success());
        assert!(outcome.context.result_cursor.is_none());
        assert_eq!(
            sink.keys(),
            vec![
                "invoice.pdf_raw_1.json",
                "invoice.pdf_raw_2.json",
                "invoice.pdf_raw_3.json"
            ]
        );
    }

    #[tokio::test]
    async fn in_progress_loops_through_wait() {
        let client = ScriptedJobClient::new(&["IN_PROGRESS", "IN_PROGRESS", "SUCCEEDED"], 1);
        let (exec, client, sink, storage) = executor(client, MemorySink::default()).await;

        let outcome = exec.start_and_run(request("r-loop")).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(client.polls.lock().unwrap().len(), 3);
        assert_eq!(sink.keys().len(), 1);

        let waits = storage
            .list_events(&outcome.execution_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.state == "Wait")
            .count();
        assert_eq!(waits, 3);
    }

    #[tokio::test]
    async fn failed_job_ends_in_failure() {
        let client = ScriptedJobClient::new(&["IN_PROGRESS", "FAILED"], 1);
        let (exec, _client, sink, _storage) = executor(client, MemorySink::default()).await;

        let outcome = exec.start_and_run(request("r-fail")).await.unwrap();

        assert_eq!(outcome.state, WorkflowState::Failure);
        assert_eq!(outcome.context.job_status, JobStatus::Failed);
        assert_eq!(
            outcome.error.as_deref(),
            Some("job job-1 reported status FAILED")
        );
        assert!(sink.keys().is_empty());
    }

    #[tokio::test]
    async fn transient_submission_failure_is_retried() {
        let client = ScriptedJobClient::new(&["SUCCEEDED"], 1).failing_submits(2);
        let (exec, client, sink, storage) = executor(client, MemorySink::default()).await;

        let outcome = exec.start_and_run(request("r-retry")).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 3);
        assert_eq!(client.jobs_created(), 1);
        assert_eq!(sink.keys().len(), 1);

        let retries = storage
            .list_events(&outcome.execution_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == "retry_scheduled")
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn exhausted_submission_retries_fail_without_writes() {
        let client = ScriptedJobClient::new(&["SUCCEEDED"], 1).failing_submits(10);
        let (exec, client, sink, _storage) = executor(client, MemorySink::default()).await;

        let outcome = exec.start_and_run(request("r-down")).await.unwrap();

        assert_eq!(outcome.state, WorkflowState::Failure);
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 3);
        assert!(outcome.context.job_id.is_none());
        assert!(outcome.error.unwrap().contains("submission error"));
        assert!(sink.keys().is_empty());
    }

    #[tokio::test]
    async fn transient_poll_failure_is_retried() {
        let client = ScriptedJobClient::new(&["SUCCEEDED"], 2).failing_polls(1);
        let (exec, client, sink, _storage) = executor(client, MemorySink::default()).await;

        let outcome = exec.start_and_run(request("r-poll")).await.unwrap();

        assert!(outcome.is_success());
        let polls = client.polls.lock().unwrap().clone();
        assert_eq!(polls, vec![None, None, Some("c1".into())]);
        assert_eq!(sink.keys().len(), 2);
    }

    #[tokio::test]
    async fn failed_write_reruns_drain_from_first_page() {
        let (exec, _client, sink, _storage) = executor(
            ScriptedJobClient::new(&["SUCCEEDED"], 3),
            MemorySink::failing_on(2),
        )
        .await;

        let outcome = exec.start_and_run(request("r-write")).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(
            sink.keys(),
            vec![
                "invoice.pdf_raw_1.json",
                "invoice.pdf_raw_1.json",
                "invoice.pdf_raw_2.json",
                "invoice.pdf_raw_3.json"
            ]
        );
    }

    #[tokio::test]
    async fn unrecognized_status_fails_without_retry() {
        let client = ScriptedJobClient::new(&["PARTIAL_SUCCESS"], 1);
        let (exec, client, sink, _storage) = executor(client, MemorySink::default()).await;

        let outcome = exec.start_and_run(request("r-odd")).await.unwrap();

        assert_eq!(outcome.state, WorkflowState::Failure);
        assert_eq!(client.polls.lock().unwrap().len(), 1);
        assert!(outcome.error.unwrap().contains("PARTIAL_SUCCESS"));
        assert_eq!(outcome.context.job_status, JobStatus::InProgress);
        assert!(sink.keys().is_empty());
    }

    #[tokio::test]
    async fn duplicate_start_returns_existing_execution() {
        let (exec, client, _sink, storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 1), MemorySink::default()).await;

        let first = exec.start(request("r-same")).await.unwrap();
        let second = exec.start(request("r-same")).await.unwrap();
        assert_eq!(first.id, second.id);

        exec.run(&first.id).await.unwrap();
        let again = exec.start_and_run(request("r-same")).await.unwrap();

        assert_eq!(again.execution_id, first.id);
        assert!(again.is_success());
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(storage.list_executions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn incomplete_request_is_rejected() {
        let (exec, _client, _sink, storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 1), MemorySink::default()).await;

        let err = exec
            .start(StartRequest {
                request_id: RequestId("r".into()),
                document: DocumentRef::new("docs", ""),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DocflowError::Validation { .. }));
        assert!(storage.list_executions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unstorable_document_key_is_rejected_before_submission() {
        let (exec, client, _sink, storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 1), MemorySink::default()).await;

        for key in ["../outside.pdf", "/abs/doc.pdf", "./doc.pdf"] {
            let err = exec
                .start_and_run(StartRequest {
                    request_id: RequestId(format!("r-{key}")),
                    document: DocumentRef::new("docs", key),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, DocflowError::Validation { .. }), "{key}: {err}");
        }

        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 0);
        assert!(storage.list_executions().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_runs_drive_execution_once() {
        let (exec, client, sink, storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 3), MemorySink::default()).await;
        let record = exec.start(request("r-race")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let exec = exec.clone();
            let id = record.id.clone();
            handles.push(tokio::spawn(async move { exec.run(&id).await }));
        }

        let mut finished = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => {
                    assert!(outcome.is_success());
                    finished += 1;
                }
                Err(err) => assert!(matches!(err, DocflowError::Conflict { .. }), "{err}"),
            }
        }
        assert!(finished >= 1);

        assert_eq!(
            sink.keys(),
            vec![
                "invoice.pdf_raw_1.json",
                "invoice.pdf_raw_2.json",
                "invoice.pdf_raw_3.json"
            ]
        );
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 1);

        let events = storage.list_events(&record.id).await.unwrap();
        let terminal = events.iter().filter(|e| e.kind == "terminal").count();
        assert_eq!(terminal, 1);
        assert_eq!(events.last().map(|e| e.kind.as_str()), Some("terminal"));

        let stored = storage.get_execution(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.state, WorkflowState::Success);
        assert!(stored.owner.is_none());
    }

    #[tokio::test]
    async fn rerunning_terminal_execution_changes_nothing() {
        let (exec, client, sink, storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 2), MemorySink::default()).await;

        let first = exec.start_and_run(request("r-twice")).await.unwrap();
        let events_before = storage.list_events(&first.execution_id).await.unwrap().len();

        let again = exec.run(&first.execution_id).await.unwrap();

        assert!(again.is_success());
        assert_eq!(again.context, first.context);
        assert_eq!(sink.keys().len(), 2);
        assert_eq!(client.polls.lock().unwrap().len(), 2);
        assert_eq!(
            storage.list_events(&first.execution_id).await.unwrap().len(),
            events_before
        );
    }

    #[tokio::test]
    async fn live_claim_blocks_a_second_runner() {
        let (exec, client, sink, storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 1), MemorySink::default()).await;
        let record = exec.start(request("r-held")).await.unwrap();

        storage
            .claim_execution(&record.id, "other-process", Utc::now() + TimeDelta::minutes(5))
            .await
            .unwrap()
            .expect("claim");

        let err = exec.run(&record.id).await.unwrap_err();
        assert!(matches!(err, DocflowError::Conflict { .. }));
        assert!(err.to_string().contains("other-process"));
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 0);
        assert!(sink.keys().is_empty());
    }

    #[tokio::test]
    async fn lapsed_claim_is_taken_over() {
        let (exec, _client, sink, storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 1), MemorySink::default()).await;
        let record = exec.start(request("r-crashed")).await.unwrap();

        storage
            .claim_execution(&record.id, "crashed-process", Utc::now() - TimeDelta::seconds(1))
            .await
            .unwrap()
            .expect("claim");

        let outcome = exec.run(&record.id).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(sink.keys().len(), 1);
    }

    #[tokio::test]
    async fn resume_picks_up_waiting_execution() {
        let (exec, client, sink, storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 2), MemorySink::default()).await;

        // Checkpoint left behind by a process that stopped during Wait.
        let mut record = ExecutionRecord::new(WorkflowContext::new(request("r-resume")));
        storage.insert_execution(&record).await.unwrap();
        record.state = WorkflowState::Wait;
        record.context.job_id = Some(JobId("job-77".into()));
        record.context.job_status = JobStatus::InProgress;
        record.resume_at = Some(Utc::now() - TimeDelta::seconds(1));
        storage.save_execution(&mut record).await.unwrap();

        let mut done = ExecutionRecord::new(WorkflowContext::new(request("r-done")));
        storage.insert_execution(&done).await.unwrap();
        done.state = WorkflowState::Success;
        storage.save_execution(&mut done).await.unwrap();

        let report = exec.resume_pending().await.unwrap();

        assert!(report.errors.is_empty());
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.outcomes[0].execution_id, record.id);
        assert!(report.outcomes[0].is_success());
        assert_eq!(client.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(sink.keys().len(), 2);
        assert!(storage.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_execution_is_an_error() {
        let (exec, _client, _sink, _storage) =
            executor(ScriptedJobClient::new(&["SUCCEEDED"], 1), MemorySink::default()).await;
        let err = exec.run(&ExecutionId::new()).await.unwrap_err();
        assert!(err.to_string().contains("unknown execution"));
    }

    #[derive(Default)]
    struct RecordingObserver {
        states: Mutex<Vec<WorkflowState>>,
        failures: Mutex<Vec<Option<Duration>>>,
        finished: Mutex<u32>,
    }

    impl ExecutionObserver for RecordingObserver {
        fn state_entered(&self, _id: &ExecutionId, state: WorkflowState) {
            self.states.lock().unwrap().push(state);
        }
        fn step_failed(
            &self,
            _id: &ExecutionId,
            _state: WorkflowState,
            _error: &DocflowError,
            retry_in: Option<Duration>,
        ) {
            self.failures.lock().unwrap().push(retry_in);
        }
        fn finished(&self, _outcome: &ExecutionOutcome) {
            *self.finished.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn observer_sees_every_transition() {
        let client = ScriptedJobClient::new(&["SUCCEEDED"], 1).failing_polls(1);
        let (exec, _client, _sink, _storage) = executor(client, MemorySink::default()).await;
        let observer = Arc::new(RecordingObserver::default());
        let exec = exec.with_observer(observer.clone());

        exec.start_and_run(request("r-obs")).await.unwrap();

        assert_eq!(
            *observer.states.lock().unwrap(),
            vec![
                WorkflowState::Initialize,
                WorkflowState::Wait,
                WorkflowState::ProcessResults,
                WorkflowState::Decide,
                WorkflowState::Success,
            ]
        );
        assert_eq!(observer.failures.lock().unwrap().len(), 1);
        assert!(observer.failures.lock().unwrap()[0].is_some());
        assert_eq!(*observer.finished.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn end_to_end_over_http_and_object_store() {
        use wiremock::matchers::{body_partial_json, method, path, query_param, query_param_is_missing};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/jobs"))
            .and(body_partial_json(json!({ "client_request_token": "r-e2e" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "job_id": "job-e2e" })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/jobs/job-e2e"))
            .and(query_param_is_missing("next_token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "job_status": "IN_PROGRESS" })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/jobs/job-e2e"))
            .and(query_param_is_missing("next_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "job_status": "SUCCEEDED",
                "next_token": "t-2",
                "page": { "blocks": ["first"] }
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/jobs/job-e2e"))
            .and(query_param("next_token", "t-2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "job_status": "SUCCEEDED",
                "page": { "blocks": ["second"] }
            })))
            .mount(&server)
            .await;

        let client = HttpJobClient::new(&AnalysisConfig {
            endpoint: server.uri(),
            ..AnalysisConfig::default()
        })
        .unwrap();
        let objects_root = std::env::temp_dir().join(format!("docflow_objects_{}", Uuid::now_v7()));
        let objects = Arc::new(ObjectStore::new(&objects_root));
        let exec = Executor::new(
            Arc::new(client),
            objects.clone(),
            test_storage().await,
            fast_config(),
        );

        let outcome = exec.start_and_run(request("r-e2e")).await.unwrap();

        assert!(outcome.is_success());
        assert_eq!(outcome.context.job_id, Some(JobId("job-e2e".into())));

        let first = objects
            .get("docs", "invoice.pdf_raw_1.json")
            .await
            .unwrap()
            .expect("page 1 stored");
        let first: serde_json::Value = serde_json::from_slice(&first).unwrap();
        assert_eq!(first, json!({ "blocks": ["first"] }));

        let second = objects
            .get("docs", "invoice.pdf_raw_2.json")
            .await
            .unwrap()
            .expect("page 2 stored");
        let second: serde_json::Value = serde_json::from_slice(&second).unwrap();
        assert_eq!(second, json!({ "blocks": ["second"] }));

        assert!(objects.get("docs", "invoice.pdf_raw_3.json").await.unwrap().is_none());
    }
}
