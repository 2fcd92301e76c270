//! LLM-backed external judge for the canonization engine.
//!
//! This crate asks a Claude model, through the Messages API, whether a
//! deferred proposal is consistent enough to become canon:
//! - One non-streaming completion per proposal
//! - Per-call timeout supplied by the gate
//! - Tolerant parsing of the model's JSON verdict

use async_trait::async_trait;
use canon_core::{ExternalJudge, JudgeError, Proposal};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const API_BASE: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-3-5-haiku-20241022";
const DEFAULT_MAX_TOKENS: usize = 300;

/// Errors constructing a judge.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API key not configured")]
    NoApiKey,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Settings for [`LlmJudge`].
#[derive(Debug, Clone)]
pub struct LlmJudgeConfig {
    pub api_key: String,
    pub model: String,
    pub max_tokens: usize,
    pub base_url: String,
}

impl LlmJudgeConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            base_url: API_BASE.to_string(),
        }
    }

    /// Read `ANTHROPIC_API_KEY`, plus optional `CANON_JUDGE_MODEL` and
    /// `CANON_JUDGE_BASE_URL`.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let api_key = lookup("ANTHROPIC_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or(Error::NoApiKey)?;
        let mut config = Self::new(api_key);
        if let Some(model) = lookup("CANON_JUDGE_MODEL") {
            config.model = model;
        }
        if let Some(base_url) = lookup("CANON_JUDGE_BASE_URL") {
            config.base_url = base_url.trim_end_matches('/').to_string();
        }
        Ok(config)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// Judges deferred proposals with a language model.
#[derive(Clone)]
pub struct LlmJudge {
    client: reqwest::Client,
    headers: HeaderMap,
    config: LlmJudgeConfig,
}

impl LlmJudge {
    pub fn new(config: LlmJudgeConfig) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&config.api_key)
                .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

        Ok(Self {
            client,
            headers,
            config,
        })
    }

    /// Create a judge from environment variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::new(LlmJudgeConfig::from_env()?)
    }

    pub fn config(&self) -> &LlmJudgeConfig {
        &self.config
    }

    async fn ask(&self, prompt: String, timeout: Duration) -> Result<String, JudgeError> {
        let request = ApiRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            temperature: 0.0,
            messages: vec![ApiMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/messages", self.config.base_url))
            .headers(self.headers.clone())
            .timeout(timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    JudgeError::Timeout
                } else {
                    JudgeError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, body));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| JudgeError::Malformed(e.to_string()))?;
        Ok(api_response
            .content
            .into_iter()
            .filter_map(|c| match c {
                ApiContent::Text { text } => Some(text),
                ApiContent::Other => None,
            })
            .collect::<Vec<_>>()
            .join(""))
    }
}

#[async_trait]
impl ExternalJudge for LlmJudge {
    async fn judge(&self, proposal: &Proposal, timeout: Duration) -> Result<bool, JudgeError> {
        let text = self.ask(build_prompt(proposal), timeout).await?;
        let verdict = parse_verdict(&text)?;
        debug!(
            proposal_id = %proposal.id,
            accept = verdict.accept,
            reason = verdict.reason.as_deref().unwrap_or(""),
            "model judgment"
        );
        Ok(verdict.accept)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

/// Rate limits and server errors may clear up; anything else will not.
fn status_error(status: StatusCode, body: String) -> JudgeError {
    let message = format!("status {}: {body}", status.as_u16());
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        JudgeError::Unavailable(message)
    } else {
        JudgeError::Refused(message)
    }
}

fn build_prompt(proposal: &Proposal) -> String {
    let evidence = proposal
        .evidence
        .iter()
        .map(|e| format!("- {e}"))
        .collect::<Vec<_>>()
        .join("\n");
    let supersedes = match proposal.supersedes() {
        Some(fact) => format!("\nIt would replace existing fact {fact}."),
        None => String::new(),
    };

    format!(
        r#"You are the keeper of canon for a shared story world. Decide whether this proposed fact should become permanent canon.

## Proposed Fact
{statement}

## Kind
{kind}

## Proposed By
{authority} (confidence {confidence:.2}){supersedes}

## Evidence
{evidence}

## Instructions
Accept only if the statement is specific, supported by the evidence, and plausible within the story. When unsure, reject.

Respond with ONLY a JSON object (no markdown, no explanation outside the JSON):
{{
  "accept": true,
  "reason": "Brief explanation"
}}"#,
        statement = proposal.payload.assertion.statement(),
        kind = proposal.payload.assertion.kind_name(),
        authority = proposal.authority,
        confidence = proposal.confidence,
    )
}

#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    accept: bool,
    #[serde(default)]
    reason: Option<String>,
}

fn parse_verdict(text: &str) -> Result<JudgeVerdict, JudgeError> {
    let json = extract_json(text);
    serde_json::from_str(json).map_err(|e| JudgeError::Malformed(format!("{e}: {json}")))
}

/// Extract JSON from a response that may be wrapped in markdown code blocks
/// or surrounded by prose.
fn extract_json(text: &str) -> &str {
    let text = text.trim();

    // Handle ```json ... ``` blocks
    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Handle ``` ... ``` blocks (without json specifier)
    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    // Outermost braces
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return &text[start..=end];
        }
    }

    text
}

// ============================================================================
// API types (internal)
// ============================================================================

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    temperature: f32,
    messages: Vec<ApiMessage>,
}

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ApiContent>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContent {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}
