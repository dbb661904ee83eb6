//! HTTP client for the claim and event endpoints.

use async_trait::async_trait;
use reqwest::StatusCode;

use runbox::{ClaimError, ClaimSource, ClaimedJob, EventSink, RunnerEvent};

/// Client speaking the runner side of the job HTTP contract.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl ApiClient {
    /// Client against the given server base URL.
    #[must_use]
    pub fn new(base_url: String, access_token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            access_token,
        }
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// POST one runner event for a job.
    ///
    /// # Errors
    ///
    /// Returns a description of the transport or status failure.
    pub async fn send_event(&self, job_id: &str, event: &RunnerEvent) -> Result<(), String> {
        let url = format!("{}/api/runner/jobs/{job_id}/events", self.base_url);
        let response = self
            .authorized(self.http.post(&url).json(event))
            .send()
            .await
            .map_err(|error| error.to_string())?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("event rejected: {status} {body}"));
        }
        Ok(())
    }
}

#[async_trait]
impl ClaimSource for ApiClient {
    async fn claim(&self) -> Result<Option<ClaimedJob>, ClaimError> {
        let url = format!("{}/api/runner/jobs/claim", self.base_url);
        let response = self
            .authorized(self.http.post(&url))
            .send()
            .await
            .map_err(|error| ClaimError::Transport(error.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ClaimError::Unauthorized(response.status().as_u16()))
            }
            status if status.is_success() => {
                let job = response
                    .json::<ClaimedJob>()
                    .await
                    .map_err(|error| ClaimError::Transport(error.to_string()))?;
                Ok(Some(job))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(ClaimError::Transport(format!(
                    "claim rejected: {status} {body}"
                )))
            }
        }
    }
}

/// Event sink that reports back over HTTP. Delivery failures are logged
/// and swallowed; a lost event must never abort the run that produced it.
#[derive(Debug, Clone)]
pub struct HttpEventSink {
    client: ApiClient,
}

impl HttpEventSink {
    /// Sink reporting through the given client.
    #[must_use]
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn event(&self, job_id: &str, event: RunnerEvent) {
        if let Err(error) = self.client.send_event(job_id, &event).await {
            tracing::warn!(job_id = %job_id, error, "failed to report runner event");
        }
    }
}
