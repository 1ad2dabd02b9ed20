//! Gender inference over an OpenAI-compatible chat completion endpoint.
//!
//! The classifier never fails: transport errors, malformed JSON and out-of-vocabulary labels all
//! degrade to `unknown` at zero confidence, and confidence is always clamped into `[0, 1]`.

use std::time::Duration;

use async_trait::async_trait;
use clientele_core::{Gender, Inference, InferenceInput};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "clientele-enrich";

pub const SYSTEM_PROMPT: &str = "You classify the likely gender of a customer from their name, \
email and country for marketing segmentation. Respond only with a JSON object of the form \
{\"gender\": \"male\" | \"female\" | \"unknown\", \"confidence\": <number between 0 and 1>}. \
Use \"unknown\" when the name is ambiguous, missing or not a personal name.";

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("provider response had no message content")]
    EmptyResponse,
    #[error("invalid provider configuration: {0}")]
    Config(String),
}

/// One chat turn that is expected to answer with a JSON object.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete_json(&self, system: &str, user: &str) -> Result<String, InferenceError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub model: String,
    /// Includes the version prefix, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout: Duration::from_secs(30),
            temperature: 0.1,
            max_tokens: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiChatProvider {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiChatProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, InferenceError> {
        if config.api_key.trim().is_empty() {
            return Err(InferenceError::Config("api key is empty".into()));
        }
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiChatProvider {
    async fn complete_json(&self, system: &str, user: &str) -> Result<String, InferenceError> {
        let resp = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user },
                ],
                "response_format": { "type": "json_object" },
                "temperature": self.config.temperature,
                "max_tokens": self.config.max_tokens,
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(InferenceError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        let value = resp.json::<Value>().await?;
        value
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|v| v.pointer("/message/content"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .filter(|s| !s.trim().is_empty())
            .ok_or(InferenceError::EmptyResponse)
    }
}

/// Seam between the sync pipeline and whatever classifies customers.
#[async_trait]
pub trait GenderClassifier: Send + Sync {
    async fn infer_gender(&self, input: &InferenceInput) -> Inference;
}

/// Prompted classifier with strict output validation.
#[derive(Debug, Clone)]
pub struct GenderInferencer<P> {
    provider: P,
}

impl<P: CompletionProvider> GenderInferencer<P> {
    pub fn new(provider: P) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P: CompletionProvider> GenderClassifier for GenderInferencer<P> {
    async fn infer_gender(&self, input: &InferenceInput) -> Inference {
        let prompt = user_prompt(input);
        match self.provider.complete_json(SYSTEM_PROMPT, &prompt).await {
            Ok(raw) => {
                let inference = parse_inference(&raw);
                debug!(
                    gender = %inference.gender,
                    confidence = inference.confidence,
                    "inferred gender"
                );
                inference
            }
            Err(err) => {
                warn!(error = %err, "gender inference failed; defaulting to unknown");
                Inference::unknown()
            }
        }
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Full name when present, else the email local part with separators as spaces, else `unknown`.
pub fn identifier(input: &InferenceInput) -> String {
    let name = [input.first_name.as_deref(), input.last_name.as_deref()]
        .into_iter()
        .filter_map(non_blank)
        .collect::<Vec<_>>()
        .join(" ");
    if !name.is_empty() {
        return name;
    }

    non_blank(input.email.as_deref())
        .and_then(|email| email.split('@').next())
        .map(|local| {
            local
                .split(['.', '_', '-', '+'])
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|local| !local.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn user_prompt(input: &InferenceInput) -> String {
    let domain = non_blank(input.email.as_deref())
        .and_then(|email| email.split_once('@'))
        .map(|(_, domain)| domain)
        .filter(|d| !d.is_empty())
        .unwrap_or("unknown");
    let country = non_blank(input.country.as_deref()).unwrap_or("unknown");
    format!(
        "Name: {}\nEmail domain: {domain}\nCountry: {country}",
        identifier(input)
    )
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed)
}

/// Validates a provider answer. Anything but an object with a canonical `gender` label and a
/// numeric `confidence` is `unknown` at zero confidence.
pub fn parse_inference(raw: &str) -> Inference {
    let Ok(value) = serde_json::from_str::<Value>(strip_code_fence(raw)) else {
        return Inference::unknown();
    };
    let gender = value.get("gender").and_then(Value::as_str).and_then(Gender::parse);
    let confidence = value.get("confidence").and_then(Value::as_f64);
    match (gender, confidence) {
        (Some(gender), Some(confidence)) => Inference::new(gender, confidence),
        _ => Inference::unknown(),
    }
}
