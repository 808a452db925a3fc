//! HTTP worker backend speaking the OpenAI-compatible chat API.

use super::{WorkerBackend, WorkerRequest, WorkerResponse};
use crate::error::WorkerFailure;
use async_trait::async_trait;
use polis_types::TokenUsage;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Value,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: Option<String>,
    model: Option<String>,
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

/// Worker backend for any chat-completions-compatible endpoint.
pub struct HttpWorkerBackend {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl HttpWorkerBackend {
    pub fn new(
        endpoint: Option<&str>,
        model: impl Into<String>,
        api_key: Option<String>,
    ) -> Result<Self, WorkerFailure> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| WorkerFailure::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: resolve_endpoint(endpoint),
            model: model.into(),
            api_key,
        })
    }
}

#[async_trait]
impl WorkerBackend for HttpWorkerBackend {
    async fn complete(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerFailure> {
        let mut system = request.role.instructions().to_string();
        if let Some(hint) = request.schema_hint.as_deref() {
            system.push_str("\n\nRespond as JSON matching this shape:\n");
            system.push_str(hint);
        }

        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": request.prompt },
            ],
        });

        let mut builder = self.client.post(&self.endpoint).json(&payload);
        if let Some(key) = self.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| WorkerFailure::Transport(format!("worker request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerFailure::Status {
                code: status.as_u16(),
                message: truncate(&body, 320),
            });
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| WorkerFailure::InvalidResponse(format!("invalid worker response: {}", e)))?;

        let choice = body
            .choices
            .first()
            .ok_or_else(|| WorkerFailure::InvalidResponse("response did not include choices".into()))?;

        let usage = body
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            })
            .unwrap_or_default();

        Ok(WorkerResponse {
            text: extract_text(&choice.message.content),
            model: body.model.unwrap_or_else(|| self.model.clone()),
            response_id: body.id,
            usage,
        })
    }
}

fn resolve_endpoint(endpoint: Option<&str>) -> String {
    let endpoint = endpoint.unwrap_or(DEFAULT_ENDPOINT);
    if endpoint.contains("/chat/completions") {
        endpoint.to_string()
    } else {
        format!("{}/chat/completions", endpoint.trim_end_matches('/'))
    }
}

fn extract_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let truncated: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", truncated)
    } else {
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_resolution_appends_path() {
        assert_eq!(
            resolve_endpoint(Some("https://llm.internal/v1")),
            "https://llm.internal/v1/chat/completions"
        );
        assert_eq!(
            resolve_endpoint(Some("https://llm.internal/v1/chat/completions")),
            "https://llm.internal/v1/chat/completions"
        );
        assert_eq!(resolve_endpoint(None), DEFAULT_ENDPOINT);
    }

    #[test]
    fn extract_text_handles_content_parts() {
        let parts = json!([
            {"type": "text", "text": "first"},
            {"type": "text", "text": "second"},
        ]);
        assert_eq!(extract_text(&parts), "first\nsecond");
        assert_eq!(extract_text(&json!("plain")), "plain");
    }
}
