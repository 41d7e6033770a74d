//! OpenAI-compatible chat completion client.

use super::params::customize_body;
use super::provider::ProviderDescriptor;
use super::routing::classify_error;
use crate::error::{ProviderError, ProviderErrorKind};
use crate::{MessagePayload, PromptMessage, Role};

use anyhow::Context as _;
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};

use std::sync::LazyLock;

/// Message used for completions with no usable content.
pub const EMPTY_RESPONSE: &str = "empty response";

static REASONING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(think|thinking)>.*?</(think|thinking)>").expect("hardcoded regex")
});

/// One completion attempt against one provider. The chain owns retries,
/// timeouts, and fallback; implementations make exactly one call.
#[async_trait]
pub trait ProviderClient: Send + Sync + 'static {
    async fn complete(
        &self,
        provider: &ProviderDescriptor,
        payload: &MessagePayload,
    ) -> Result<String, ProviderError>;
}

/// Client for `POST {endpoint}/chat/completions` style APIs.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    http: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("pals/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    async fn complete(
        &self,
        provider: &ProviderDescriptor,
        payload: &MessagePayload,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", provider.endpoint);
        let body = build_request_body(provider, payload);

        let mut request = self
            .http
            .post(&url)
            .timeout(provider.timeout)
            .json(&body);
        if let Some(key) = &provider.credential {
            request = request.bearer_auth(key.expose());
        }

        let response = request
            .send()
            .await
            .map_err(|error| transport_error(provider, &error))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|error| transport_error(provider, &error))?;

        if !status.is_success() {
            let message = error_message(&text).unwrap_or_else(|| truncate(&text, 300));
            let kind = classify_error(Some(status.as_u16()), &message);
            return Err(
                ProviderError::new(&provider.name, kind, format!("HTTP {status}: {message}"))
                    .with_status(status.as_u16()),
            );
        }

        let parsed: Value = serde_json::from_str(&text).map_err(|error| {
            ProviderError::transient(&provider.name, format!("malformed response body: {error}"))
        })?;

        // Some gateways return 200 with an error object.
        if let Some(message) = parsed
            .get("error")
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
        {
            let kind = classify_error(None, message);
            return Err(ProviderError::new(&provider.name, kind, message));
        }

        extract_completion_text(&parsed)
            .ok_or_else(|| ProviderError::transient(&provider.name, EMPTY_RESPONSE))
    }
}

fn transport_error(provider: &ProviderDescriptor, error: &reqwest::Error) -> ProviderError {
    let message = if error.is_timeout() {
        format!("timed out after {}s", provider.timeout.as_secs())
    } else if error.is_connect() {
        format!("connection failed: {error}")
    } else {
        error.to_string()
    };
    let provider_error = ProviderError::new(&provider.name, ProviderErrorKind::Transient, message);
    match error.status() {
        Some(status) => provider_error.with_status(status.as_u16()),
        None => provider_error,
    }
}

/// Build the JSON request body for a provider.
pub fn build_request_body(provider: &ProviderDescriptor, payload: &MessagePayload) -> Value {
    let messages: Vec<Value> = payload.messages.iter().map(message_to_json).collect();

    let mut body = Map::new();
    body.insert("model".into(), json!(provider.model));
    body.insert("messages".into(), Value::Array(messages));
    body.insert(
        "temperature".into(),
        json!(payload.temperature.unwrap_or(provider.temperature)),
    );
    body.insert(
        "max_tokens".into(),
        json!(payload.max_tokens.unwrap_or(provider.max_tokens)),
    );
    customize_body(&mut body, &provider.extra_params, &provider.exclude_params);
    Value::Object(body)
}

fn message_to_json(message: &PromptMessage) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    // Some providers reject null bytes outright.
    let text = message.text.replace('\0', "");

    if message.images.is_empty() {
        return json!({"role": role, "content": text});
    }

    let mut parts = Vec::with_capacity(message.images.len() + 1);
    if !text.is_empty() {
        parts.push(json!({"type": "text", "text": text}));
    }
    for image in &message.images {
        parts.push(json!({"type": "image_url", "image_url": {"url": image.url}}));
    }
    json!({"role": role, "content": parts})
}

fn error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let error = parsed.get("error")?;
    error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .map(str::to_string)
}

/// Pull the first choice's text out of a completion response, with
/// reasoning blocks removed. `None` when nothing visible remains.
pub fn extract_completion_text(response: &Value) -> Option<String> {
    let content = response
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?;

    let raw = match content {
        Value::String(text) => text.clone(),
        // Content-part arrays: concatenate the text parts.
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => return None,
    };

    let cleaned = strip_reasoning(&raw);
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Remove `<think>`/`<thinking>` blocks and surrounding whitespace.
pub fn strip_reasoning(text: &str) -> String {
    REASONING_BLOCK.replace_all(text, "").trim().to_string()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((index, _)) => format!("{}...", &text[..index]),
        None => text.to_string(),
    }
}
