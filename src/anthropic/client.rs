use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::error::AnthropicError;
use super::types::{Message, MessagesRequest, MessagesResponse};
use crate::collaborators::{
    Completion, CompletionRequest, ResponseFormat, TextCompletion, strip_code_fences,
};
use crate::error::FlowError;
use crate::state_machine::RetryConfig;

const API_URL: &str = "https://api.anthropic.com/v1/messages";

const JSON_ONLY: &str = "Respond with a single JSON object and nothing else. \
Do not wrap it in markdown and do not add commentary.";

pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
    retry: RetryConfig,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Result<Self, AnthropicError> {
        Self::with_base_url(api_key, API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(api_key: String, base_url: String) -> Result<Self, AnthropicError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            api_key,
            client,
            base_url,
            retry: RetryConfig::default(),
        })
    }

    /// Sets how often a rate-limited request is resent before giving up.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sends `req`, waiting out 429 responses up to `max_retries` times.
    ///
    /// Each wait is the server's `retry-after` or the backoff delay for the
    /// attempt, whichever is longer.
    async fn send_with_retry(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let mut attempt = 0;
        loop {
            match self.send_message(req).await {
                Err(AnthropicError::RateLimited { retry_after_ms })
                    if attempt < self.retry.max_retries =>
                {
                    attempt += 1;
                    let delay_ms = retry_after_ms.max(self.retry.delay_for_attempt(attempt));
                    warn!(
                        attempt,
                        max = self.retry.max_retries,
                        delay_ms,
                        "rate limited by the Anthropic API, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                result => return result,
            }
        }
    }

    pub async fn send_message(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, AnthropicError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(AnthropicError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(AnthropicError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<MessagesResponse>().await?;
        debug!(
            model = %body.model,
            input_tokens = body.usage.input_tokens,
            output_tokens = body.usage.output_tokens,
            "completion received"
        );
        Ok(body)
    }
}

/// Pulls the JSON object out of a reply, tolerating code fences and stray
/// text around it.
pub fn parse_json_object(text: &str) -> Result<serde_json::Value, AnthropicError> {
    let unfenced = strip_code_fences(text);
    let candidate = match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => {
            return Err(AnthropicError::MalformedResponse(
                "reply contains no JSON object".into(),
            ));
        }
    };
    let value: serde_json::Value = serde_json::from_str(candidate)
        .map_err(|e| AnthropicError::MalformedResponse(format!("invalid JSON: {e}")))?;
    if !value.is_object() {
        return Err(AnthropicError::MalformedResponse(
            "reply is not a JSON object".into(),
        ));
    }
    Ok(value)
}

#[async_trait]
impl TextCompletion for AnthropicClient {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, FlowError> {
        let system = match (request.format, request.system) {
            (ResponseFormat::Json, Some(system)) => Some(format!("{system}\n\n{JSON_ONLY}")),
            (ResponseFormat::Json, None) => Some(JSON_ONLY.to_string()),
            (ResponseFormat::Text, system) => system,
        };
        let req = MessagesRequest {
            model: request.model,
            max_tokens: request.max_tokens,
            system,
            messages: request
                .messages
                .into_iter()
                .map(|m| Message {
                    role: m.role.as_str().to_string(),
                    content: m.content,
                })
                .collect(),
        };

        let text = self.send_with_retry(&req).await?.text();
        match request.format {
            ResponseFormat::Text => Ok(Completion::Text(text)),
            ResponseFormat::Json => Ok(Completion::Json(parse_json_object(&text)?)),
        }
    }
}
