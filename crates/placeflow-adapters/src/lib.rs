//! External collaborators of the readiness pipeline: crawler, description generator, embedder.
//!
//! Each collaborator is a trait so the pipeline can be driven by fakes; the HTTP
//! implementations share one retry/backoff policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use placeflow_core::{BusinessHours, DEFAULT_KEYWORD_ARITY};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "placeflow-adapters";

pub const DEFAULT_DESCRIPTION_MODEL: &str = "gpt-4.1-mini";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// No retries at all; the crawler is expensive enough to be called once.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            concurrency: 8,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response: {0}")]
    Decode(String),
    #[error("{0}")]
    Unavailable(String),
}

/// A reqwest client bounded by a semaphore and retrying per [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct JsonHttpClient {
    client: reqwest::Client,
    limit: Arc<Semaphore>,
    backoff: BackoffPolicy,
}

impl JsonHttpClient {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            backoff: config.backoff,
        })
    }

    /// POST `body` as JSON; returns the status and raw body of the last attempt.
    ///
    /// Non-2xx statuses are returned, not raised, once retries are spent so callers
    /// can map specific codes (the crawler's 404) themselves.
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<(StatusCode, Vec<u8>), CollaboratorError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|_| CollaboratorError::Unavailable("http client shut down".to_string()))?;

        let mut attempt = 0;
        loop {
            let mut request = self.client.post(url).json(body);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success()
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, status = status.as_u16(), attempt, "retrying collaborator call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    let bytes = resp.bytes().await?.to_vec();
                    return Ok((status, bytes));
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(url, error = %err, attempt, "retrying collaborator call");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(CollaboratorError::Request(err));
                }
            }
        }
    }
}

fn join_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrawlRequest {
    #[serde(rename = "searchQuery")]
    pub search_query: String,
    #[serde(rename = "placeName")]
    pub place_name: String,
}

impl CrawlRequest {
    /// The crawler searches for `"<query> <name>"`.
    pub fn new(query: &str, place_name: &str) -> Self {
        Self {
            search_query: format!("{} {}", query.trim(), place_name).trim().to_string(),
            place_name: place_name.to_string(),
        }
    }
}

/// Attributes the crawler extracted for one place.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CrawledPlace {
    /// Arrives as text ("1,234") or a number depending on the crawler version.
    pub review_count: Option<JsonValue>,
    pub business_hours: Option<BusinessHours>,
    #[serde(deserialize_with = "null_as_default")]
    pub ai_summary: Vec<String>,
    pub original_description: Option<String>,
    pub parking_available: Option<bool>,
    pub pet_friendly: Option<bool>,
    #[serde(deserialize_with = "null_as_default")]
    pub image_urls: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub sns_urls: BTreeMap<String, String>,
    #[serde(deserialize_with = "null_as_default")]
    pub reviews: Vec<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl CrawledPlace {
    pub fn review_count(&self) -> Option<i32> {
        match self.review_count.as_ref()? {
            JsonValue::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
            JsonValue::String(s) => {
                let digits: String = s.chars().filter(char::is_ascii_digit).collect();
                digits.parse().ok()
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CrawlEnvelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<CrawledPlace>,
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("place not found by crawler")]
    NotFound,
    #[error("crawler returned http status {status}")]
    Server { status: u16 },
    #[error("crawler unreachable: {0}")]
    Transport(String),
    #[error("crawler rejected the request: {0}")]
    Rejected(String),
    #[error("undecodable crawler response: {0}")]
    Decode(String),
}

impl From<CollaboratorError> for CrawlError {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::HttpStatus { status, .. } if status == 404 => Self::NotFound,
            CollaboratorError::HttpStatus { status, .. } => Self::Server { status },
            CollaboratorError::Decode(message) => Self::Decode(message),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Map a crawler HTTP exchange onto the crawl result.
pub fn interpret_crawl_response(status: StatusCode, body: &[u8]) -> Result<CrawledPlace, CrawlError> {
    if status == StatusCode::NOT_FOUND {
        return Err(CrawlError::NotFound);
    }
    if !status.is_success() {
        return Err(CrawlError::Server {
            status: status.as_u16(),
        });
    }
    let envelope: CrawlEnvelope =
        serde_json::from_slice(body).map_err(|err| CrawlError::Decode(err.to_string()))?;
    let message = envelope.message.unwrap_or_default();
    if envelope.success != Some(true) {
        return Err(CrawlError::Rejected(message));
    }
    envelope
        .data
        .ok_or_else(|| CrawlError::Rejected(format!("no data: {message}")))
}

#[async_trait]
pub trait CrawlClient: Send + Sync {
    async fn crawl(&self, query: &str, place_name: &str) -> Result<CrawledPlace, CrawlError>;
}

#[derive(Debug, Clone)]
pub struct HttpCrawlClient {
    http: JsonHttpClient,
    endpoint: String,
}

impl HttpCrawlClient {
    pub fn new(base_url: &str, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: JsonHttpClient::new(config)?,
            endpoint: join_url(base_url, "/api/v1/place"),
        })
    }
}

#[async_trait]
impl CrawlClient for HttpCrawlClient {
    async fn crawl(&self, query: &str, place_name: &str) -> Result<CrawledPlace, CrawlError> {
        let request = CrawlRequest::new(query, place_name);
        let span = info_span!("crawl", endpoint = %self.endpoint, search_query = %request.search_query);
        async {
            let (status, body) = self
                .http
                .post_json(&self.endpoint, &request, None)
                .await
                .map_err(CrawlError::from)?;
            debug!(status = status.as_u16(), bytes = body.len(), "crawler responded");
            interpret_crawl_response(status, &body)
        }
        .instrument(span)
        .await
    }
}

/// Input handed to the description model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DescriptionRequest {
    pub ai_summary: String,
    pub review: String,
    pub description: String,
    pub category: String,
    pub pet_friendly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DescriptionDraft {
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
}

#[async_trait]
pub trait DescriptionGenerator: Send + Sync {
    /// `None` on any failure; callers fall back to their own text.
    async fn generate(&self, request: &DescriptionRequest) -> Option<DescriptionDraft>;
}

const DESCRIPTION_PROMPT: &str = "\
You write short, friendly introductions of places for a travel and leisure app.
The user message is JSON with ai_summary, review, description, category and pet_friendly.
Answer with JSON only: {\"description\": string, \"keywords\": [9 strings]}.
Rules:
1. One paragraph of 160 to 230 characters.
2. Open with the location or the defining feature of the place.
3. Use only facts supported by the input and reviews.
4. Mention pets naturally when pet_friendly is true.
5. No emoji, no markdown bold, no place name in bold.
6. Keywords: 2 mood, 2 weather, 2 atmosphere, 3 key nouns.";

#[derive(Debug, Clone)]
pub struct OpenAiDescriptionGenerator {
    http: JsonHttpClient,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiDescriptionGenerator {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        model: impl Into<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: JsonHttpClient::new(config)?,
            endpoint: join_url(base_url, "/chat/completions"),
            api_key: api_key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty()),
            model: model.into(),
        })
    }

    fn request_body(&self, request: &DescriptionRequest) -> Result<JsonValue, serde_json::Error> {
        Ok(json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": DESCRIPTION_PROMPT },
                { "role": "user", "content": serde_json::to_string(request)? },
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "place_description",
                    "strict": true,
                    "schema": {
                        "type": "object",
                        "additionalProperties": false,
                        "required": ["description", "keywords"],
                        "properties": {
                            "description": { "type": "string" },
                            "keywords": {
                                "type": "array",
                                "items": { "type": "string" },
                                "minItems": DEFAULT_KEYWORD_ARITY,
                                "maxItems": DEFAULT_KEYWORD_ARITY,
                            },
                        },
                    },
                },
            },
            "temperature": 0.7,
            "max_completion_tokens": 600,
        }))
    }
}

/// Pull the structured draft out of a chat-completions response body.
pub fn parse_completion(body: &JsonValue) -> Option<DescriptionDraft> {
    let content = body
        .pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .filter(|c| !c.trim().is_empty())?;
    let draft: DescriptionDraft = serde_json::from_str(content).ok()?;
    let description = draft.description.trim().to_string();
    if description.is_empty() {
        return None;
    }
    let keywords = draft
        .keywords
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect();
    Some(DescriptionDraft {
        description,
        keywords,
    })
}

#[async_trait]
impl DescriptionGenerator for OpenAiDescriptionGenerator {
    async fn generate(&self, request: &DescriptionRequest) -> Option<DescriptionDraft> {
        let Some(api_key) = self.api_key.as_deref() else {
            error!("description model api key is not configured; skipping generation");
            return None;
        };
        let body = match self.request_body(request) {
            Ok(body) => body,
            Err(err) => {
                error!(error = %err, "could not encode description request");
                return None;
            }
        };

        let (status, raw) = match self.http.post_json(&self.endpoint, &body, Some(api_key)).await {
            Ok(resp) => resp,
            Err(err) => {
                error!(error = %err, "description model call failed");
                return None;
            }
        };
        if !status.is_success() {
            error!(status = status.as_u16(), "description model returned an error status");
            return None;
        }

        let parsed = serde_json::from_slice::<JsonValue>(&raw)
            .ok()
            .and_then(|value| parse_completion(&value));
        if parsed.is_none() {
            error!(data_quality = true, "description model response had no usable description");
        }
        parsed
    }
}

#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError>;
}

#[derive(Debug, Clone, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    http: JsonHttpClient,
    endpoint: String,
}

impl HttpEmbeddingClient {
    pub fn new(base_url: &str, config: &HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: JsonHttpClient::new(config)?,
            endpoint: join_url(base_url, "/embed"),
        })
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let (status, body) = self.http.post_json(&self.endpoint, texts, None).await?;
        if !status.is_success() {
            return Err(CollaboratorError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }
        let parsed: EmbedResponse = serde_json::from_slice(&body)
            .map_err(|err| CollaboratorError::Decode(err.to_string()))?;
        debug!(requested = texts.len(), returned = parsed.embeddings.len(), "embedded keywords");
        Ok(parsed.embeddings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
        assert_eq!(BackoffPolicy::none().max_retries, 0);
    }

    #[test]
    fn only_server_errors_and_throttling_are_retried() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), RetryDisposition::NonRetryable);
    }

    #[test]
    fn crawl_request_joins_query_and_name() {
        let request = CrawlRequest::new("Seoul Mapo-gu 12", "Moon Cafe");
        assert_eq!(request.search_query, "Seoul Mapo-gu 12 Moon Cafe");
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(encoded["searchQuery"], "Seoul Mapo-gu 12 Moon Cafe");
        assert_eq!(encoded["placeName"], "Moon Cafe");

        assert_eq!(CrawlRequest::new("  ", "Moon Cafe").search_query, "Moon Cafe");
    }

    #[test]
    fn crawl_response_decodes_place_data() {
        let body = br#"{
            "success": true,
            "message": "ok",
            "data": {
                "review_count": "1,204",
                "ai_summary": ["Quiet brunch spot", "Ocean view"],
                "original_description": "Brunch by the sea.",
                "parking_available": true,
                "pet_friendly": false,
                "image_urls": ["https://img/1.jpg"],
                "sns_urls": {"instagram": "https://instagram.com/moon"},
                "reviews": ["Great eggs"],
                "business_hours": {"today_status": "open", "weekly": {"mon": {"open": "09:00", "close": "18:00", "is_operating": true}}}
            }
        }"#;
        let place = interpret_crawl_response(StatusCode::OK, body).unwrap();
        assert_eq!(place.review_count(), Some(1204));
        assert_eq!(place.ai_summary.len(), 2);
        assert_eq!(place.sns_urls["instagram"], "https://instagram.com/moon");
        let hours = place.business_hours.unwrap();
        assert!(hours.weekly["mon"].is_operating);
    }

    #[test]
    fn crawl_statuses_map_to_errors() {
        assert!(matches!(
            interpret_crawl_response(StatusCode::NOT_FOUND, b""),
            Err(CrawlError::NotFound)
        ));
        assert!(matches!(
            interpret_crawl_response(StatusCode::INTERNAL_SERVER_ERROR, b""),
            Err(CrawlError::Server { status: 500 })
        ));
        assert!(matches!(
            interpret_crawl_response(StatusCode::OK, br#"{"success": false, "message": "blocked"}"#),
            Err(CrawlError::Rejected(message)) if message == "blocked"
        ));
        assert!(matches!(
            interpret_crawl_response(StatusCode::OK, br#"{"success": true, "data": null}"#),
            Err(CrawlError::Rejected(_))
        ));
        assert!(matches!(
            interpret_crawl_response(StatusCode::OK, b"<html>"),
            Err(CrawlError::Decode(_))
        ));
    }

    #[test]
    fn numeric_review_count_and_null_lists_are_accepted() {
        let place: CrawledPlace =
            serde_json::from_str(r#"{"review_count": 42, "reviews": null, "sns_urls": null}"#).unwrap();
        assert_eq!(place.review_count(), Some(42));
        assert_eq!(CrawledPlace::default().review_count(), None);
    }

    #[test]
    fn completion_parsing_trims_and_rejects_blank_descriptions() {
        let body = json!({
            "choices": [{
                "message": {
                    "content": "{\"description\": \"  A calm cafe by the sea.  \", \"keywords\": [\"calm\", \" \", \"sea\"]}"
                }
            }]
        });
        let draft = parse_completion(&body).unwrap();
        assert_eq!(draft.description, "A calm cafe by the sea.");
        assert_eq!(draft.keywords, vec!["calm", "sea"]);

        let blank = json!({
            "choices": [{ "message": { "content": "{\"description\": \"   \", \"keywords\": []}" } }]
        });
        assert!(parse_completion(&blank).is_none());
        assert!(parse_completion(&json!({ "choices": [] })).is_none());
    }

    #[tokio::test]
    async fn generator_without_api_key_returns_none() {
        let generator = OpenAiDescriptionGenerator::new(
            "http://127.0.0.1:9",
            Some("   ".to_string()),
            DEFAULT_DESCRIPTION_MODEL,
            &HttpClientConfig::default(),
        )
        .unwrap();
        assert!(generator.generate(&DescriptionRequest::default()).await.is_none());
    }

    #[test]
    fn request_body_pins_keyword_arity() {
        let generator = OpenAiDescriptionGenerator::new(
            "https://api.openai.com/v1/",
            Some("key".to_string()),
            DEFAULT_DESCRIPTION_MODEL,
            &HttpClientConfig::default(),
        )
        .unwrap();
        assert_eq!(generator.endpoint, "https://api.openai.com/v1/chat/completions");
        let body = generator.request_body(&DescriptionRequest::default()).unwrap();
        assert_eq!(
            body.pointer("/response_format/json_schema/schema/properties/keywords/maxItems"),
            Some(&json!(DEFAULT_KEYWORD_ARITY))
        );
        assert_eq!(body["model"], DEFAULT_DESCRIPTION_MODEL);
    }
}
