//! HTTP client for the document analysis API.
//!
//! - `POST {endpoint}/jobs` starts a job and returns its id.
//! - `GET {endpoint}/jobs/{job_id}[?next_token=..]` returns the job status and
//!   one page of results.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};
use url::Url;

use docflow_shared::{
    AnalysisConfig, DocflowError, DocumentRef, JobId, RequestId, Result, resolve_api_key,
};

use crate::contracts::{JobClient, PollResponse};

/// User-Agent string for analysis API requests.
const USER_AGENT: &str = concat!("docflow/", env!("CARGO_PKG_VERSION"));

#[derive(Serialize)]
struct SubmitBody<'a> {
    document_location: &'a DocumentRef,
    feature_types: &'a [String],
    client_request_token: &'a str,
}

#[derive(Deserialize)]
struct SubmitReply {
    job_id: String,
}

#[derive(Deserialize)]
struct PollReply {
    job_status: String,
    #[serde(default)]
    next_token: Option<String>,
    #[serde(default)]
    page: Option<serde_json::Value>,
}

/// [`JobClient`] over the analysis service's JSON API.
#[derive(Debug, Clone)]
pub struct HttpJobClient {
    client: Client,
    endpoint: Url,
    feature_types: Vec<String>,
    api_key: Option<String>,
}

impl HttpJobClient {
    /// Build a client from the `[analysis]` config section.
    ///
    /// The bearer token is read from the env var named by `api_key_env`, if set.
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| DocflowError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.endpoint_url()?,
            feature_types: config.feature_types.clone(),
            api_key: resolve_api_key(config),
        })
    }

    /// Override the bearer token.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| DocflowError::config(format!("endpoint {} cannot be a base", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

impl JobClient for HttpJobClient {
    #[instrument(skip_all, fields(document = %document, request_id = %idempotency_key))]
    async fn submit(&self, document: &DocumentRef, idempotency_key: &RequestId) -> Result<JobId> {
        let url = self.url(&["jobs"]).map_err(|e| DocflowError::Submission(e.to_string()))?;
        let body = SubmitBody {
            document_location: document,
            feature_types: &self.feature_types,
            client_request_token: idempotency_key.as_str(),
        };
        debug!(%url, features = ?self.feature_types, "submitting analysis job");

        let response = self
            .authorized(self.client.post(url.clone()).json(&body))
            .send()
            .await
            .map_err(|e| DocflowError::Submission(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DocflowError::Submission(format!("{url}: HTTP {status}: {text}")));
        }

        let reply: SubmitReply = response
            .json()
            .await
            .map_err(|e| DocflowError::Submission(format!("{url}: malformed response: {e}")))?;

        if reply.job_id.is_empty() {
            return Err(DocflowError::Submission(format!("{url}: empty job id")));
        }
        Ok(JobId(reply.job_id))
    }

    #[instrument(skip_all, fields(job_id = %job_id, cursor = ?cursor))]
    async fn poll(&self, job_id: &JobId, cursor: Option<&str>) -> Result<PollResponse> {
        let mut url = self
            .url(&["jobs", job_id.as_str()])
            .map_err(|e| DocflowError::Poll(e.to_string()))?;
        if let Some(token) = cursor {
            url.query_pairs_mut().append_pair("next_token", token);
        }
        debug!(%url, "polling analysis job");

        let response = self
            .authorized(self.client.get(url.clone()))
            .send()
            .await
            .map_err(|e| DocflowError::Poll(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DocflowError::Poll(format!("{url}: HTTP {status}: {text}")));
        }

        let reply: PollReply = response
            .json()
            .await
            .map_err(|e| DocflowError::Poll(format!("{url}: malformed response: {e}")))?;

        Ok(PollResponse {
            status: reply.job_status,
            page: reply.page,
            next_cursor: reply.next_token.filter(|t| !t.is_empty()),
        })
    }
}
