//! Google Gemini extraction backend.
//!
//! Sends the PDF payload as base64 `inline_data` to `generateContent` and
//! returns the concatenated text parts of the first candidate. Requires an
//! API key (`GEMINI_API_KEY`).

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{ExtractionBackend, ExtractionError, ExtractionRequest, TRANSIENT_SERVER_CODES};
use crate::rate_limit::AdaptiveRateLimiter;
use crate::retry::parse_retry_after;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
    temperature: f32,
    max_output_tokens: u32,
    timeout: Duration,
    limiter: Option<Arc<AdaptiveRateLimiter>>,
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    InlineData { inline_data: GeminiInlineData },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    code: Option<u16>,
    message: String,
    status: Option<String>,
}

impl GeminiBackend {
    pub fn new(client: reqwest::Client, api_key: Option<String>) -> Self {
        Self {
            client,
            api_key,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.0,
            max_output_tokens: 65_536,
            timeout: Duration::from_secs(120),
            limiter: None,
        }
    }

    /// Set the model (e.g. "gemini-2.5-flash", "gemini-2.5-pro").
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Point at a different API root (proxies, test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_generation(mut self, temperature: f32, max_output_tokens: u32) -> Self {
        self.temperature = temperature;
        self.max_output_tokens = max_output_tokens;
        self
    }

    /// Client-side request timeout. The worker applies its own hard timeout too.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pace requests through an adaptive limiter.
    pub fn with_rate_limiter(mut self, limiter: Arc<AdaptiveRateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn build_request(&self, request: &ExtractionRequest) -> GeminiRequest {
        let data = base64::engine::general_purpose::STANDARD.encode(&request.payload);
        GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![
                    GeminiPart::InlineData {
                        inline_data: GeminiInlineData {
                            mime_type: "application/pdf".to_string(),
                            data,
                        },
                    },
                    GeminiPart::Text {
                        text: request.prompt.clone(),
                    },
                ],
            }],
            generation_config: GeminiGenerationConfig {
                temperature: self.temperature,
                max_output_tokens: self.max_output_tokens,
            },
        }
    }

    async fn call(&self, request: &ExtractionRequest) -> Result<String, ExtractionError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            ExtractionError::Other(
                "GEMINI_API_KEY not set. Get an API key from https://ai.google.dev/".to_string(),
            )
        })?;

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let body = self.build_request(request);
        tracing::debug!(
            model = %self.model,
            unit = %request.label,
            bytes = request.payload.len(),
            "sending extraction request"
        );

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if let Err(err) = check_status(&response) {
            if matches!(err, ExtractionError::RateLimited { .. })
                && let Some(limiter) = &self.limiter
            {
                limiter.on_rate_limited();
            }
            let detail = response.text().await.unwrap_or_default();
            return Err(with_detail(err, &detail));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| ExtractionError::Other(format!("failed to parse response: {e}")))?;
        response_text(parsed)
    }

    fn transport_error(&self, e: reqwest::Error) -> ExtractionError {
        if e.is_timeout() {
            ExtractionError::Timeout(self.timeout)
        } else if e.is_connect() {
            ExtractionError::Server {
                code: 503,
                message: format!("connection failed: {e}"),
            }
        } else {
            ExtractionError::Other(format!("HTTP request failed: {e}"))
        }
    }
}

impl ExtractionBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    fn extract<'a>(
        &'a self,
        request: &'a ExtractionRequest,
    ) -> Pin<Box<dyn Future<Output = Result<String, ExtractionError>> + Send + 'a>> {
        Box::pin(self.call(request))
    }
}

/// Map a non-success HTTP status to a typed error.
pub fn check_status(resp: &reqwest::Response) -> Result<(), ExtractionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let code = status.as_u16();
    if code == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(ExtractionError::RateLimited { retry_after });
    }
    let message = status.canonical_reason().unwrap_or("unknown status").to_string();
    if TRANSIENT_SERVER_CODES.contains(&code) {
        Err(ExtractionError::Server { code, message })
    } else {
        Err(ExtractionError::Other(format!("API error ({code}): {message}")))
    }
}

fn with_detail(err: ExtractionError, detail: &str) -> ExtractionError {
    let detail = detail.trim();
    if detail.is_empty() {
        return err;
    }
    let detail: String = detail.chars().take(300).collect();
    match err {
        ExtractionError::Server { code, message } => ExtractionError::Server {
            code,
            message: format!("{message}: {detail}"),
        },
        ExtractionError::Other(message) => ExtractionError::Other(format!("{message}: {detail}")),
        other => other,
    }
}

fn api_error(error: GeminiError) -> ExtractionError {
    match error.status.as_deref() {
        Some("RESOURCE_EXHAUSTED") => ExtractionError::RateLimited { retry_after: None },
        Some("UNAVAILABLE") | Some("DEADLINE_EXCEEDED") | Some("INTERNAL") => {
            ExtractionError::Server {
                code: error.code.unwrap_or(503),
                message: error.message,
            }
        }
        _ => match error.code {
            Some(429) => ExtractionError::RateLimited { retry_after: None },
            Some(code) if TRANSIENT_SERVER_CODES.contains(&code) => ExtractionError::Server {
                code,
                message: error.message,
            },
            _ => ExtractionError::Other(format!("Gemini API error: {}", error.message)),
        },
    }
}

fn response_text(response: GeminiResponse) -> Result<String, ExtractionError> {
    if let Some(error) = response.error {
        return Err(api_error(error));
    }
    let candidate = response
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or_else(|| ExtractionError::Other("no candidates in response".to_string()))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".to_string());
        return Err(ExtractionError::Other(format!(
            "empty response (finish reason: {reason})"
        )));
    }
    Ok(text)
}
