//! Summarizer backed by an OpenAI-compatible chat completions endpoint.

use crate::config::SummarizerConfig;
use async_trait::async_trait;
use mir_conversation::{Message, SummarizeError, Summarizer, render_transcript};
use mir_core::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const SYSTEM_PROMPT: &str = "You maintain a running summary of a conversation between a user \
and an assistant. Merge the previous summary with the new messages into one concise summary. \
Keep the user's goals, preferences, personal details they shared and any decisions or \
commitments made. Drop greetings and small talk. Write in the language of the conversation, \
in the third person. Reply with the summary only.";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Builds the prompt for folding `messages` into `previous_summary`.
fn build_prompt(previous_summary: &str, messages: &[Message]) -> Vec<ChatMessage> {
    let previous = if previous_summary.is_empty() {
        "(none)"
    } else {
        previous_summary
    };
    vec![
        ChatMessage {
            role: "system".to_string(),
            content: SYSTEM_PROMPT.to_string(),
        },
        ChatMessage {
            role: "user".to_string(),
            content: format!(
                "Previous summary:\n{previous}\n\nNew messages:\n{}",
                render_transcript(messages)
            ),
        },
    ]
}

/// Summarizer calling `{base_url}/chat/completions`.
#[derive(Clone)]
pub struct HttpSummarizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl HttpSummarizer {
    /// Creates a summarizer from configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the base URL or model is empty, or the
    /// HTTP client cannot be built.
    pub fn new(config: &SummarizerConfig) -> Result<Self, SummarizeError> {
        if config.base_url.trim().is_empty() {
            return Err(SummarizeError::InvalidConfig {
                reason: "base_url is empty".to_string(),
            }
            .into());
        }
        if config.model.trim().is_empty() {
            return Err(SummarizeError::InvalidConfig {
                reason: "model is empty".to_string(),
            }
            .into());
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .build()
            .map_err(|e| SummarizeError::InvalidConfig {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Summarizer for HttpSummarizer {
    #[tracing::instrument(skip_all, fields(model = %self.model, messages = messages.len()))]
    async fn summarize(
        &self,
        previous_summary: &str,
        messages: &[Message],
    ) -> Result<String, SummarizeError> {
        let body = ChatRequest {
            model: &self.model,
            messages: build_prompt(previous_summary, messages),
            temperature: 0.2,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(request_failed)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SummarizeError::RequestFailed {
                reason: format!("status {status}: {text}"),
            }
            .into());
        }

        let parsed: ChatResponse = response.json().await.map_err(request_failed)?;
        let summary = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();
        if summary.is_empty() {
            return Err(SummarizeError::EmptyResponse.into());
        }
        Ok(summary)
    }
}

fn request_failed(e: reqwest::Error) -> SummarizeError {
    SummarizeError::RequestFailed {
        reason: e.to_string(),
    }
}
