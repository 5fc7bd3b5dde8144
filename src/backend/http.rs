//! REST implementation of the collaborator traits.

use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use super::{ApprovalConfirmer, TaskSnapshot, TaskSource, TraceSnapshot, TraceSource};
use crate::approval::{ConfirmationOutcome, ConfirmationRequest};
use crate::config::BackendConfig;
use crate::error::{FeedError, Result};

/// HTTP client for the agent backend.
///
/// # Example
///
/// ```rust,no_run
/// use agent_feed::backend::{HttpBackend, TaskSource};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let backend = HttpBackend::new("http://localhost:3000")?;
/// let task = backend.load_task("task-42").await?;
/// println!("{} persisted items", task.items.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: Url,
    http: reqwest::Client,
    api_token: Option<String>,
}

impl HttpBackend {
    /// Create a backend client with default transport settings.
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Create a backend client with a custom reqwest client.
    pub fn with_client(base_url: impl AsRef<str>, http: reqwest::Client) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self {
            base_url,
            http,
            api_token: None,
        })
    }

    /// Build from the `backend` config section.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let mut backend = Self::with_client(&config.base_url, http)?;
        backend.api_token = config.api_token.clone().filter(|t| !t.trim().is_empty());
        Ok(backend)
    }

    /// Send a bearer token with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| FeedError::InvalidUrl(url::ParseError::RelativeUrlWithCannotBeABaseBase))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            let body = response.text().await?;
            decode_body(&body)
        } else {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".into());
            Err(FeedError::Api {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Decode a success body. A body that is not the expected JSON surfaces as
/// [`FeedError::Json`], separate from transport failures.
fn decode_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    Ok(serde_json::from_str(body)?)
}

#[async_trait]
impl TaskSource for HttpBackend {
    async fn load_task(&self, task_id: &str) -> Result<TaskSnapshot> {
        let url = self.url(&["api", "tasks", task_id])?;
        tracing::debug!(%url, "Loading task");
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }
}

#[async_trait]
impl ApprovalConfirmer for HttpBackend {
    async fn confirm(&self, request: &ConfirmationRequest) -> Result<ConfirmationOutcome> {
        let url = self.url(&["api", "approvals"])?;
        tracing::debug!(approval_id = %request.approval_id, approved = request.approved, "Confirming approval");
        let response = self
            .authorized(self.http.post(url))
            .json(request)
            .send()
            .await?;
        Self::handle_response(response).await
    }
}

#[async_trait]
impl TraceSource for HttpBackend {
    async fn fetch_traces(&self, task_id: &str, agent_correlation_id: &str) -> Result<TraceSnapshot> {
        let mut url = self.url(&["api", "tasks", task_id, "traces"])?;
        url.query_pairs_mut()
            .append_pair("agentCorrelationId", agent_correlation_id);
        let response = self.authorized(self.http.get(url)).send().await?;
        Self::handle_response(response).await
    }
}
