//! The LLM provider seam and its OpenRouter adapter.
//!
//! Everything in this crate that needs a model goes through
//! [`LlmProvider::generate`]: the main turn loop, the
//! [`Summarizer`](crate::context::summarizer::Summarizer) and the
//! [`LlmQuestionExtractor`](crate::suspension::extract::LlmQuestionExtractor).
//! Provider-specific details (wire format, auth headers, retries) stay inside
//! the adapter.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::retry::RetryConfig;
use crate::{Item, ItemKind, Role, ToolDef};

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for all LLM calls.
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4";

/// Boxed future returned by [`LlmProvider::generate`].
pub type ProviderFuture<'a> = Pin<Box<dyn Future<Output = Result<Generation, ProviderError>> + Send + 'a>>;

/// Errors from a provider call.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("provider HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("malformed provider response: {0}")]
    Malformed(String),
    #[error("provider error: {0}")]
    Api(String),
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

/// Per-call generation settings.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    /// Model override. `None` uses the provider's default model.
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Tools the model may call this round.
    pub tools: Vec<ToolDef>,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 4096,
            temperature: 0.7,
            tools: Vec::new(),
        }
    }
}

impl GenerateConfig {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Token usage reported by the provider.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// A tool call requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub call_id: String,
    pub name: String,
    /// Raw JSON arguments.
    pub arguments: String,
}

/// Result of one `generate` call.
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub text: String,
    pub tool_calls: Vec<ToolInvocation>,
    pub usage: Usage,
}

impl Generation {
    /// A text-only generation.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// An LLM backend: `generate(messages, config) -> (text, usage)`.
///
/// Implementations must be cheap to share; the crate holds them as
/// `Arc<dyn LlmProvider>`.
pub trait LlmProvider: Send + Sync {
    fn generate<'a>(&'a self, messages: &'a [Item], config: &'a GenerateConfig)
    -> ProviderFuture<'a>;
}

// ── OpenRouter adapter ─────────────────────────────────────────────

/// Provider backed by the OpenRouter chat completions API.
pub struct OpenRouterProvider {
    client: reqwest::Client,
    api_key: String,
    default_model: String,
    referer: String,
    title: String,
    retry: RetryConfig,
}

impl OpenRouterProvider {
    /// Create a provider with the given API key and default headers.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .user_agent("hearth-rs/0.1")
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ProviderError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            default_model: DEFAULT_MODEL.to_string(),
            referer: "https://github.com/hearth-rs/hearth".to_string(),
            title: "hearth-rs".to_string(),
            retry: RetryConfig::with_retries(2),
        })
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn request_body<'a>(&'a self, messages: &[Item], config: &'a GenerateConfig) -> ChatBody<'a> {
        ChatBody {
            model: config.model.as_deref().unwrap_or(&self.default_model),
            messages: to_wire_messages(messages),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            tools: (!config.tools.is_empty()).then_some(&config.tools),
        }
    }

    async fn send_once(&self, body: &ChatBody<'_>) -> Result<Generation, ProviderError> {
        debug!(
            "LLM request: model={}, messages={}, max_tokens={}",
            body.model,
            body.messages.len(),
            body.max_tokens
        );
        let start = Instant::now();

        let resp = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::Transport(format!("failed to read response: {e}")))?;

        debug!(
            "LLM response: HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body: text,
            });
        }
        parse_response(&text)
    }
}

impl LlmProvider for OpenRouterProvider {
    fn generate<'a>(
        &'a self,
        messages: &'a [Item],
        config: &'a GenerateConfig,
    ) -> ProviderFuture<'a> {
        Box::pin(async move {
            let body = self.request_body(messages, config);
            let mut attempt = 0;
            loop {
                match self.send_once(&body).await {
                    Ok(generation) => return Ok(generation),
                    Err(e) if self.retry.should_retry(&e, attempt) => {
                        let delay = self.retry.delay_for_attempt(attempt);
                        warn!(
                            "Transient provider error (attempt {}): {e}. Retrying in {:.1}s",
                            attempt + 1,
                            delay.as_secs_f64()
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}

// ── Wire format ────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a Vec<ToolDef>>,
}

#[derive(Serialize, Debug)]
struct WireMessage {
    role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: WireFunction,
}

#[derive(Serialize, Deserialize, Debug)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

fn to_wire_messages(items: &[Item]) -> Vec<WireMessage> {
    items
        .iter()
        .map(|item| match item.kind {
            ItemKind::ToolCall => WireMessage {
                role: Role::Assistant,
                content: None,
                tool_calls: Some(vec![WireToolCall {
                    id: item.call_id.clone().unwrap_or_default(),
                    call_type: function_type(),
                    function: WireFunction {
                        name: item.tool_name.clone().unwrap_or_default(),
                        arguments: item.content.to_text(),
                    },
                }]),
                tool_call_id: None,
            },
            ItemKind::ToolResult => WireMessage {
                role: Role::Tool,
                content: Some(item.content.to_text()),
                tool_calls: None,
                tool_call_id: item.call_id.clone(),
            },
            _ => WireMessage {
                role: item.role(),
                content: Some(item.content.to_text()),
                tool_calls: None,
                tool_call_id: None,
            },
        })
        .collect()
}

#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

fn parse_response(text: &str) -> Result<Generation, ProviderError> {
    let parsed: RawChatResponse =
        serde_json::from_str(text).map_err(|e| ProviderError::Malformed(e.to_string()))?;

    if let Some(err) = parsed.error {
        return Err(ProviderError::Api(err.message));
    }

    let usage = parsed.usage.unwrap_or_default();
    let Some(choice) = parsed.choices.and_then(|c| c.into_iter().next()) else {
        trace!("LLM output: empty (no choices)");
        return Ok(Generation {
            usage,
            ..Default::default()
        });
    };

    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|tc| ToolInvocation {
            call_id: tc.id,
            name: tc.function.name,
            arguments: tc.function.arguments,
        })
        .collect::<Vec<_>>();

    Ok(Generation {
        text: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
    })
}
