use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::accumulator::AnswerAccumulator;
use crate::citation::{CitationDetail, CitationSource};
use crate::config::ClientConfig;
use crate::consumer::AnswerStream;
use crate::errors::ClientError;
use crate::request::{AskRequest, ChatRequest};
use crate::response::ChatResponse;
use crate::reveal::Typewriter;
use crate::stream::StreamFormat;

/// HTTP client for the Information Assistant backend.
#[derive(Clone, Debug)]
pub struct InfoAssistClient {
    http: reqwest::Client,
    config: ClientConfig,
}

#[derive(Serialize)]
struct CitationQuery<'a> {
    citation: &'a str,
}

impl InfoAssistClient {
    /// Creates a client from explicit configuration.
    ///
    /// The configured timeout bounds connecting and every whole-body request;
    /// streamed answer bodies are not time-limited.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    /// Creates a client from `INFOASST_*` environment variables.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Creates a typewriter using the configured reveal interval.
    pub fn typewriter(&self) -> Typewriter {
        Typewriter::new(self.config.reveal_interval)
    }

    /// Sends a chat turn and waits for the whole answer.
    pub async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ClientError> {
        req.validate()?;
        debug!(event = "client.chat", approach = %req.approach, turns = req.history.len(), "sending chat request");
        let response = self
            .http
            .post(self.config.endpoint("chat"))
            .timeout(self.config.timeout)
            .json(req)
            .send()
            .await?;
        answer_from(response).await
    }

    /// Asks a one-shot question without history.
    pub async fn ask(&self, req: &AskRequest) -> Result<ChatResponse, ClientError> {
        req.validate()?;
        debug!(event = "client.ask", approach = %req.approach, "sending ask request");
        let response = self
            .http
            .post(self.config.endpoint("ask"))
            .timeout(self.config.timeout)
            .json(req)
            .send()
            .await?;
        answer_from(response).await
    }

    /// Sends a chat turn and streams the NDJSON answer.
    ///
    /// `typewriter` is reset before the request so the new answer never
    /// shares the display with a previous one.
    pub async fn chat_stream(
        &self,
        req: &ChatRequest,
        typewriter: Typewriter,
    ) -> Result<AnswerStream, ClientError> {
        req.validate()?;
        typewriter.reset();
        debug!(event = "client.chat_stream", approach = %req.approach, turns = req.history.len(), "starting streamed chat");
        let response = self
            .http
            .post(self.config.endpoint("chat"))
            .json(req)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(AnswerStream::spawn(
            StreamFormat::Ndjson,
            response.bytes_stream(),
            typewriter,
            AnswerAccumulator::for_approach(req.approach),
        ))
    }

    /// Opens a server-sent event stream at `path` (GET).
    pub async fn event_stream(
        &self,
        path: &str,
        typewriter: Typewriter,
    ) -> Result<AnswerStream, ClientError> {
        typewriter.reset();
        debug!(event = "client.event_stream", path, "opening event stream");
        let response = self
            .http
            .get(self.config.endpoint(path))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(AnswerStream::spawn(
            StreamFormat::EventStream,
            response.bytes_stream(),
            typewriter,
            AnswerAccumulator::new(),
        ))
    }

    /// GETs an opaque JSON document such as a status or feature-flag endpoint.
    ///
    /// Transport failures and 5xx responses are retried according to the
    /// configured [`crate::config::RetryPolicy`].
    pub async fn get_opaque(&self, path: &str) -> Result<serde_json::Value, ClientError> {
        self.get_json(path).await
    }

    /// Typed variant of [`InfoAssistClient::get_opaque`].
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = self.config.endpoint(path);
        let retry = self.config.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match self.http.get(&url).timeout(self.config.timeout).send().await {
                Ok(response) => match ensure_success(response).await {
                    Ok(response) => response.json::<T>().await.map_err(ClientError::from),
                    Err(err) => Err(err),
                },
                Err(err) => Err(err.into()),
            };
            match result {
                Err(err) if err.is_retryable() && retry.can_retry(attempts) => {
                    warn!(event = "client.retry", path, attempt = attempts, error = %err, "request failed; retrying");
                    tokio::time::sleep(retry.delay).await;
                }
                other => return other,
            }
        }
    }

    /// Fetches chunk metadata for a citation path (POST `/getcitation`).
    pub async fn resolve(&self, citation_path: &str) -> Result<CitationDetail, ClientError> {
        if citation_path.trim().is_empty() {
            return Err(ClientError::Validation("citation path must not be empty".into()));
        }
        let response = self
            .http
            .post(self.config.endpoint("getcitation"))
            .timeout(self.config.timeout)
            .json(&CitationQuery {
                citation: citation_path,
            })
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.json().await?)
    }

    /// Fetches the raw bytes of a cited file (GET `/content/{key}`).
    pub async fn fetch_content(&self, citation_key: &str) -> Result<Vec<u8>, ClientError> {
        if citation_key.trim().is_empty() {
            return Err(ClientError::Validation("citation key must not be empty".into()));
        }
        let mut url = reqwest::Url::parse(&self.config.endpoint("content"))
            .map_err(|e| ClientError::Config(format!("invalid content URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ClientError::Config("base_url cannot carry a path".into()))?
            .push(citation_key);
        let response = self
            .http
            .get(url)
            .timeout(self.config.timeout)
            .send()
            .await?;
        let response = ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait::async_trait]
impl CitationSource for InfoAssistClient {
    async fn resolve(&self, citation_path: &str) -> Result<CitationDetail, ClientError> {
        InfoAssistClient::resolve(self, citation_path).await
    }

    async fn fetch_content(&self, citation_key: &str) -> Result<Vec<u8>, ClientError> {
        InfoAssistClient::fetch_content(self, citation_key).await
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::api(status.as_u16(), error_text(&body)))
}

async fn answer_from(response: reqwest::Response) -> Result<ChatResponse, ClientError> {
    let status = response.status();
    let response = ensure_success(response).await?;
    let answer: ChatResponse = response.json().await?;
    if let Some(message) = answer.error_message() {
        return Err(ClientError::api(status.as_u16(), message));
    }
    Ok(answer)
}

/// Pulls the `error` field out of a JSON error body, falling back to the raw
/// text.
fn error_text(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => match value.get("error") {
            Some(serde_json::Value::String(message)) => message.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => body.trim().to_string(),
        },
        Err(_) => body.trim().to_string(),
    }
}
