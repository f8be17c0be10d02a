//! Vision API clients: send one page image plus the running conversation to a
//! chat-completion endpoint and return the reply text.
//!
//! ## Message Layout
//!
//! Every request contains, in order:
//! 1. **Coherence instruction**: fixed system message
//!    ([`crate::prompts::COHERENCE_INSTRUCTION`])
//! 2. **History**: the whole conversation so far, system prompt included
//! 3. **User message**: the page prompt and the page image as a data URL
//!
//! No client retries. A failed request is returned as a [`VisionError`] and
//! the orchestrator decides what to do with it.

use crate::config::ProcessingConfig;
use crate::conversation::{ConversationMessage, Role};
use crate::error::{SessionError, VisionError};
use crate::pipeline::encode::{encode_image_file, EncodedImage};
use crate::pipeline::render::PageImage;
use crate::prompts::COHERENCE_INSTRUCTION;
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A remote vision-capable chat model.
#[async_trait]
pub trait VisionApi: Send + Sync {
    /// Analyse one page image in the context of `history`.
    async fn analyze_page(
        &self,
        image: &PageImage,
        prompt: &str,
        api_key: &str,
        history: &[ConversationMessage],
    ) -> Result<String, VisionError>;

    /// Cheap reachability probe. Never fails; `false` means unreachable.
    async fn check_connectivity(&self) -> bool;

    /// Ask the provider whether `api_key` is accepted. Never fails.
    async fn validate_api_key(&self, api_key: &str) -> bool;

    /// Whether `analyze_page` needs the caller-supplied API key.
    fn requires_api_key(&self) -> bool {
        true
    }
}

/// Reject keys that are blank or lack the provider prefix, without any I/O.
///
/// An empty `prefix` only checks for a non-blank key.
pub fn check_api_key_format(api_key: &str, prefix: &str) -> Result<(), VisionError> {
    if api_key.trim().is_empty() {
        return Err(VisionError::InvalidCredential {
            detail: "the API key is empty".to_string(),
        });
    }
    if !api_key.starts_with(prefix) {
        return Err(VisionError::InvalidCredential {
            detail: format!("the API key must start with \"{prefix}\""),
        });
    }
    Ok(())
}

/// Assemble the full message list for one page request.
pub fn build_request_messages(
    prompt: &str,
    image: &EncodedImage,
    history: &[ConversationMessage],
) -> Vec<ConversationMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ConversationMessage::system(COHERENCE_INSTRUCTION));
    messages.extend(history.iter().cloned());
    messages.push(ConversationMessage::user_with_image(prompt, image.data_url()));
    messages
}

// ── OpenRouter (raw HTTP) ────────────────────────────────────────────────

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ConversationMessage],
    max_tokens: usize,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: Option<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

/// Upstream `error.message` from a JSON error body, if there is one.
fn upstream_message(body: &str) -> Option<String> {
    serde_json::from_str::<ApiErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .and_then(|e| e.message)
        .filter(|m| !m.is_empty())
}

/// Map a non-success HTTP status to a [`VisionError`].
pub fn map_status(status: StatusCode, body: &str, model: &str) -> VisionError {
    match status {
        StatusCode::UNAUTHORIZED => VisionError::InvalidCredential {
            detail: upstream_message(body)
                .unwrap_or_else(|| "the provider rejected the API key".to_string()),
        },
        StatusCode::NOT_FOUND => VisionError::EndpointOrModelUnavailable {
            model: model.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => VisionError::RateLimited,
        other => VisionError::TransportError {
            message: upstream_message(body).unwrap_or_else(|| format!("HTTP {other}")),
        },
    }
}

/// Chat-completions client speaking the OpenRouter dialect of the OpenAI API.
#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
    api_timeout: Duration,
    probe_timeout: Duration,
    validate_timeout: Duration,
    key_prefix: String,
    referer: String,
    title: String,
}

impl OpenRouterClient {
    pub fn new(config: &ProcessingConfig) -> Result<Self, SessionError> {
        let http = reqwest::Client::builder()
            .user_agent(format!("{}/{}", config.app_title, env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SessionError::Internal(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            api_timeout: Duration::from_secs(config.api_timeout_secs),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            validate_timeout: Duration::from_secs(config.validate_timeout_secs),
            key_prefix: config.api_key_prefix.clone(),
            referer: config.app_referer.clone(),
            title: config.app_title.clone(),
        })
    }

    fn models_url(&self) -> String {
        format!("{}/models", self.base_url)
    }

    fn authed(&self, req: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        req.bearer_auth(api_key)
            .header("HTTP-Referer", &self.referer)
            .header("X-Title", &self.title)
    }

    fn transport_error(&self, e: reqwest::Error, timeout: Duration) -> VisionError {
        if e.is_timeout() {
            VisionError::TransportError {
                message: format!("request timed out after {}s", timeout.as_secs()),
            }
        } else {
            VisionError::transport(e)
        }
    }
}

#[async_trait]
impl VisionApi for OpenRouterClient {
    async fn analyze_page(
        &self,
        image: &PageImage,
        prompt: &str,
        api_key: &str,
        history: &[ConversationMessage],
    ) -> Result<String, VisionError> {
        check_api_key_format(api_key, &self.key_prefix)?;

        let encoded = encode_image_file(&image.path).await.map_err(|e| {
            VisionError::transport(format!("cannot read {}: {e}", image.path.display()))
        })?;
        let messages = build_request_messages(prompt, &encoded, history);
        let body = ChatRequest {
            model: &self.model,
            messages: &messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let start = Instant::now();
        debug!(
            "Page {}: sending {} messages to {}",
            image.page_number,
            messages.len(),
            self.model
        );

        let response = self
            .authed(
                self.http
                    .post(format!("{}/chat/completions", self.base_url))
                    .timeout(self.api_timeout),
                api_key,
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e, self.api_timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(e, self.api_timeout))?;

        if !status.is_success() {
            let err = map_status(status, &text, &self.model);
            warn!("Page {}: HTTP {}: {}", image.page_number, status, err);
            return Err(err);
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| VisionError::transport(format!("malformed response: {e}")))?;

        match parsed.choices.into_iter().next().and_then(|c| c.message.content) {
            Some(content) => {
                debug!(
                    "Page {}: {} chars in {:?}",
                    image.page_number,
                    content.len(),
                    start.elapsed()
                );
                Ok(content)
            }
            None => Err(VisionError::TransportError {
                message: parsed
                    .error
                    .and_then(|e| e.message)
                    .unwrap_or_else(|| "the response contained no reply".to_string()),
            }),
        }
    }

    async fn check_connectivity(&self) -> bool {
        match self
            .http
            .get(self.models_url())
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(r) => r.status() == StatusCode::OK,
            Err(e) => {
                debug!("Connectivity probe failed: {e}");
                false
            }
        }
    }

    async fn validate_api_key(&self, api_key: &str) -> bool {
        let req = self
            .authed(self.http.get(self.models_url()), api_key)
            .timeout(self.validate_timeout);
        match req.send().await {
            Ok(r) if r.status() == StatusCode::OK => true,
            Ok(r) => {
                warn!("API key validation rejected: HTTP {}", r.status());
                false
            }
            Err(e) => {
                warn!("API key validation failed: {e}");
                false
            }
        }
    }
}

// ── edgequake-llm providers ──────────────────────────────────────────────

/// Vision backend for any provider `edgequake-llm` knows (OpenAI, Anthropic,
/// Gemini, Ollama, …). Credentials come from the provider's own environment
/// variables, so the session's API key is not used.
pub struct ProviderVisionClient {
    provider: Arc<dyn LLMProvider>,
    model: String,
    temperature: f32,
    max_tokens: usize,
    api_timeout: Duration,
}

impl ProviderVisionClient {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &ProcessingConfig) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            api_timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Construct a named provider (`openai`, `anthropic`, `gemini`, …) for
    /// `config.model`.
    pub fn from_name(provider_name: &str, config: &ProcessingConfig) -> Result<Self, SessionError> {
        let provider = ProviderFactory::create_llm_provider(provider_name, &config.model)
            .map_err(|e| SessionError::ProviderNotConfigured {
                provider: provider_name.to_string(),
                hint: format!("{e}"),
            })?;
        info!("Using {} provider with model {}", provider_name, config.model);
        Ok(Self::new(provider, config))
    }

    fn to_chat_messages(
        prompt: &str,
        image: &EncodedImage,
        history: &[ConversationMessage],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::system(COHERENCE_INSTRUCTION));
        for m in history {
            let text = m.text();
            messages.push(match m.role {
                Role::System => ChatMessage::system(&text),
                Role::User => ChatMessage::user(&text),
                Role::Assistant => ChatMessage::assistant(&text),
            });
        }
        messages.push(ChatMessage::user_with_images(
            prompt,
            vec![ImageData::new(image.base64.clone(), image.mime_type)],
        ));
        messages
    }
}

/// Classify a provider error by its message, since providers only expose text.
fn classify_provider_error(message: &str, model: &str) -> VisionError {
    let lower = message.to_lowercase();
    if lower.contains("401") || lower.contains("unauthorized") || lower.contains("api key") {
        VisionError::InvalidCredential {
            detail: message.to_string(),
        }
    } else if lower.contains("429") || lower.contains("rate limit") {
        VisionError::RateLimited
    } else if lower.contains("404") || lower.contains("not found") {
        VisionError::EndpointOrModelUnavailable {
            model: model.to_string(),
        }
    } else {
        VisionError::transport(message)
    }
}

#[async_trait]
impl VisionApi for ProviderVisionClient {
    async fn analyze_page(
        &self,
        image: &PageImage,
        prompt: &str,
        _api_key: &str,
        history: &[ConversationMessage],
    ) -> Result<String, VisionError> {
        let encoded = encode_image_file(&image.path).await.map_err(|e| {
            VisionError::transport(format!("cannot read {}: {e}", image.path.display()))
        })?;
        let messages = Self::to_chat_messages(prompt, &encoded, history);
        let options = CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        };

        let call = self.provider.chat(&messages, Some(&options));
        match tokio::time::timeout(self.api_timeout, call).await {
            Ok(Ok(response)) => {
                debug!(
                    "Page {}: {} input tokens, {} output tokens",
                    image.page_number, response.prompt_tokens, response.completion_tokens
                );
                Ok(response.content)
            }
            Ok(Err(e)) => Err(classify_provider_error(&e.to_string(), &self.model)),
            Err(_) => Err(VisionError::TransportError {
                message: format!("request timed out after {}s", self.api_timeout.as_secs()),
            }),
        }
    }

    async fn check_connectivity(&self) -> bool {
        true
    }

    async fn validate_api_key(&self, _api_key: &str) -> bool {
        true
    }

    fn requires_api_key(&self) -> bool {
        false
    }
}
