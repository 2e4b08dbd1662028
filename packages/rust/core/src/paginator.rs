//! Cursor-driven retrieval of result pages.
//!
//! [`PageCursor`] is a lazy, finite sequence of pages for one job. It cannot be
//! rewound: restarting means building a new cursor from the first page. A
//! service that hands out any cursor twice would never terminate the sequence,
//! so that is reported as a poll error.
//! [`ResultPaginator`] consumes it and persists each page, in retrieval order,
//! under `<key>_raw_<n>.json`.

use std::collections::HashSet;

use docflow_shared::{DocflowError, JobId, JobStatus, Result, WorkflowContext};
use tracing::{debug, info, instrument};

use crate::contracts::{JSON_CONTENT_TYPE, JobClient, PollResponse, PutObject, ResultSink};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Position {
    Start,
    At(String),
    Done,
}

/// Lazy page sequence over a finished job.
pub struct PageCursor<'a, J> {
    client: &'a J,
    job_id: JobId,
    position: Position,
    /// First page already fetched by the status poll.
    seeded: Option<PollResponse>,
    /// Every continuation token handed out so far.
    seen: HashSet<String>,
}

impl<'a, J: JobClient> PageCursor<'a, J> {
    /// Sequence starting from the first page.
    pub fn new(client: &'a J, job_id: JobId) -> Self {
        Self {
            client,
            job_id,
            position: Position::Start,
            seeded: None,
            seen: HashSet::new(),
        }
    }

    /// Sequence whose first page is `first` instead of a fresh fetch.
    pub fn starting_with(client: &'a J, job_id: JobId, first: PollResponse) -> Self {
        Self {
            seeded: Some(first),
            ..Self::new(client, job_id)
        }
    }

    /// Continuation token of the next fetch, if any.
    pub fn cursor(&self) -> Option<&str> {
        match &self.position {
            Position::At(c) => Some(c),
            _ => None,
        }
    }

    /// Fetch the next page, or `None` once the cursor is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<PollResponse>> {
        let cursor = match &self.position {
            Position::Start => None,
            Position::At(c) => Some(c.clone()),
            Position::Done => return Ok(None),
        };

        let response = match self.seeded.take() {
            Some(first) => first,
            None => self.client.poll(&self.job_id, cursor.as_deref()).await?,
        };

        if cursor.is_some() && response.status != JobStatus::Succeeded.as_str() {
            return Err(DocflowError::Poll(format!(
                "job {} reported {} while paging results",
                self.job_id, response.status
            )));
        }

        match &response.next_cursor {
            Some(next) if !self.seen.insert(next.clone()) => {
                self.position = Position::Done;
                return Err(DocflowError::Poll(format!(
                    "job {} repeated cursor {next}",
                    self.job_id
                )));
            }
            Some(next) => self.position = Position::At(next.clone()),
            None => self.position = Position::Done,
        }

        Ok(Some(response))
    }
}

/// Drains every result page of a succeeded job into a [`ResultSink`].
pub struct ResultPaginator<'a, J, S> {
    client: &'a J,
    sink: &'a S,
}

impl<'a, J: JobClient, S: ResultSink> ResultPaginator<'a, J, S> {
    pub fn new(client: &'a J, sink: &'a S) -> Self {
        Self { client, sink }
    }

    /// Retrieve and persist all pages starting from the first one.
    ///
    /// Returns the number of pages written. Keeps `ctx.result_cursor` in step
    /// with the sequence and leaves it cleared once drained.
    pub async fn drain(&self, ctx: &mut WorkflowContext) -> Result<usize> {
        let job_id = succeeded_job(ctx)?;
        let pages = PageCursor::new(self.client, job_id);
        self.persist_all(ctx, pages).await
    }

    /// Like [`drain`](Self::drain), reusing a first page that was already fetched.
    pub async fn drain_from(&self, ctx: &mut WorkflowContext, first: PollResponse) -> Result<usize> {
        let job_id = succeeded_job(ctx)?;
        let pages = PageCursor::starting_with(self.client, job_id, first);
        self.persist_all(ctx, pages).await
    }

    #[instrument(skip_all, fields(request_id = %ctx.request_id, document = %ctx.document))]
    async fn persist_all(
        &self,
        ctx: &mut WorkflowContext,
        mut pages: PageCursor<'_, J>,
    ) -> Result<usize> {
        let mut written = 0;

        while let Some(response) = pages.next_page().await? {
            if let Some(page) = &response.page {
                written += 1;
                let key = ctx.document.page_key(written);
                let bytes = serde_json::to_vec(page)
                    .map_err(|e| DocflowError::Storage(format!("serialize page {written}: {e}")))?;

                self.sink
                    .write(PutObject {
                        container: &ctx.document.container,
                        key: &key,
                        bytes,
                        content_type: JSON_CONTENT_TYPE,
                    })
                    .await?;

                info!(page = written, %key, "saved result page");
            } else {
                debug!("response carried no page body");
            }

            ctx.result_cursor = pages.cursor().map(String::from);
        }

        ctx.result_cursor = None;
        Ok(written)
    }
}

fn succeeded_job(ctx: &WorkflowContext) -> Result<JobId> {
    if ctx.job_status != JobStatus::Succeeded {
        return Err(DocflowError::validation(format!(
            "cannot drain results while job status is {}",
            ctx.job_status
        )));
    }
    ctx.job_id
        .clone()
        .ok_or_else(|| DocflowError::validation("succeeded context has no job id"))
}
