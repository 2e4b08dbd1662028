//! In-memory collaborators for exercising the state machine.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use docflow_shared::{DocflowError, DocumentRef, JobId, RequestId, Result};
use serde_json::json;

use crate::contracts::{JobClient, PollResponse, PutObject, ResultSink};

/// Job client with a scripted status sequence and a fixed page chain.
///
/// Pages are linked by cursors `c1, c2, ...`: the first poll returns page 0
/// with cursor `c1`, a poll with `c1` returns page 1, and so on.
pub(crate) struct ScriptedJobClient {
    statuses: Mutex<Vec<String>>,
    pages: Vec<serde_json::Value>,
    submit_failures: AtomicU32,
    poll_failures: AtomicU32,
    jobs: Mutex<HashMap<String, JobId>>,
    pub submit_calls: AtomicU32,
    pub polls: Mutex<Vec<Option<String>>>,
}

impl ScriptedJobClient {
    /// Job that reports each status in turn (the last one repeats) and serves `page_count` pages.
    pub(crate) fn new(statuses: &[&str], page_count: usize) -> Self {
        let pages = (1..=page_count)
            .map(|n| json!({ "page": n, "blocks": [{ "id": format!("b{n}") }] }))
            .collect();
        Self {
            statuses: Mutex::new(statuses.iter().rev().map(|s| s.to_string()).collect()),
            pages,
            submit_failures: AtomicU32::new(0),
            poll_failures: AtomicU32::new(0),
            jobs: Mutex::new(HashMap::new()),
            submit_calls: AtomicU32::new(0),
            polls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing_submits(self, n: u32) -> Self {
        self.submit_failures.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn failing_polls(self, n: u32) -> Self {
        self.poll_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Distinct jobs created so far.
    pub(crate) fn jobs_created(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn next_status(&self) -> String {
        let mut statuses = self.statuses.lock().unwrap();
        if statuses.len() > 1 {
            statuses.pop().unwrap()
        } else {
            statuses.last().cloned().unwrap_or_else(|| "SUCCEEDED".into())
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn page_response(&self, index: usize) -> PollResponse {
        let next_cursor = (index + 1 < self.pages.len()).then(|| format!("c{}", index + 1));
        PollResponse {
            status: "SUCCEEDED".into(),
            page: self.pages.get(index).cloned(),
            next_cursor,
        }
    }
}

impl JobClient for ScriptedJobClient {
    async fn submit(&self, _document: &DocumentRef, idempotency_key: &RequestId) -> Result<JobId> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.submit_failures) {
            return Err(DocflowError::Submission("service unavailable".into()));
        }
        let mut jobs = self.jobs.lock().unwrap();
        let next = jobs.len() + 1;
        Ok(jobs
            .entry(idempotency_key.as_str().to_string())
            .or_insert_with(|| JobId(format!("job-{next}")))
            .clone())
    }

    async fn poll(&self, _job_id: &JobId, cursor: Option<&str>) -> Result<PollResponse> {
        self.polls.lock().unwrap().push(cursor.map(String::from));
        if Self::take_failure(&self.poll_failures) {
            return Err(DocflowError::Poll("connection reset".into()));
        }
        match cursor {
            None => {
                let status = self.next_status();
                if status == "SUCCEEDED" {
                    Ok(self.page_response(0))
                } else {
                    Ok(PollResponse {
                        status,
                        page: None,
                        next_cursor: None,
                    })
                }
            }
            Some(c) => {
                let index: usize = c
                    .trim_start_matches('c')
                    .parse()
                    .map_err(|_| DocflowError::Poll(format!("unknown cursor {c}")))?;
                Ok(self.page_response(index))
            }
        }
    }
}

/// One recorded sink write.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Written {
    pub container: String,
    pub key: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Sink that records writes and can fail a specific write attempt.
#[derive(Default)]
pub(crate) struct MemorySink {
    pub writes: Mutex<Vec<Written>>,
    attempts: AtomicU32,
    fail_on_attempt: Option<u32>,
}

impl MemorySink {
    /// Sink whose `n`-th write attempt (1-based) fails.
    pub(crate) fn failing_on(n: u32) -> Self {
        Self {
            fail_on_attempt: Some(n),
            ..Self::default()
        }
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.writes.lock().unwrap().iter().map(|w| w.key.clone()).collect()
    }

    pub(crate) fn written(&self) -> Vec<Written> {
        self.writes.lock().unwrap().clone()
    }
}

impl ResultSink for MemorySink {
    async fn write(&self, object: PutObject<'_>) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_attempt == Some(attempt) {
            return Err(DocflowError::Storage(format!("write {} rejected", object.key)));
        }
        self.writes.lock().unwrap().push(Written {
            container: object.container.to_string(),
            key: object.key.to_string(),
            bytes: object.bytes,
            content_type: object.content_type.to_string(),
        });
        Ok(())
    }
}
