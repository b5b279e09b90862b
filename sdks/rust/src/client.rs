//! HTTP client for interacting with the relay.

use crate::{
    error::{Error, Result},
    stream::StreamReader,
    types::{CreateJobRequest, CreatedJob},
};
use url::Url;

/// HTTP client for the API.
///
/// # Example
///
/// ```rust,no_run
/// use model_relay_sdk::{Client, CreateJobRequest, ModelSelection};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = Client::new("http://localhost:3000")?;
///
/// let job = client
///     .jobs()
///     .create(&CreateJobRequest::new(
///         "Say hello",
///         vec![ModelSelection::new("openai", "gpt-4o")],
///     ))
///     .await?;
///
/// let mut reader = client.jobs().stream(&job.uid)?;
/// reader.on_text(|e| print!("{}", e.text));
/// reader.run().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    base_url: Url,
    http: reqwest::Client,
    bearer: Option<String>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.bearer.is_some())
            .finish()
    }
}

impl Client {
    /// Create a new client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the server (e.g., "http://localhost:3000")
    pub fn new(base_url: impl AsRef<str>) -> Result<Self> {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Create a new client with a custom reqwest client.
    pub fn with_client(base_url: impl AsRef<str>, http: reqwest::Client) -> Result<Self> {
        let base_url = Url::parse(base_url.as_ref())?;
        Ok(Self {
            base_url,
            http,
            bearer: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Access the Jobs API.
    pub fn jobs(&self) -> JobsApi<'_> {
        JobsApi { client: self }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal helpers
    // ─────────────────────────────────────────────────────────────────────────

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.bearer {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            Ok(response.json().await?)
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(Error::api(status.as_u16(), &body))
        }
    }
}

// =============================================================================
// Jobs API
// =============================================================================

/// Jobs API client.
#[derive(Debug)]
pub struct JobsApi<'a> {
    client: &'a Client,
}

impl JobsApi<'_> {
    /// Create a job. Returns its id and any newly created conversation id.
    pub async fn create(&self, request: &CreateJobRequest) -> Result<CreatedJob> {
        let req = self.client.http.post(self.client.url("/api/jobs")?).json(request);
        let response = self.client.authorize(req).send().await?;
        Client::handle_response(response).await
    }

    /// URL of the event stream for job `uid`.
    pub fn stream_url(&self, uid: &str) -> Result<Url> {
        let mut url = self.client.url("/api/jobs/stream")?;
        url.query_pairs_mut().append_pair("uid", uid);
        Ok(url)
    }

    /// Prepare a reader for job `uid`. Nothing is sent until
    /// [`StreamReader::run`].
    pub fn stream(&self, uid: &str) -> Result<StreamReader> {
        let url = self.stream_url(uid)?;
        let req = self.client.authorize(self.client.http.get(url));
        Ok(StreamReader::new(req))
    }
}
