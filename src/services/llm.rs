use crate::core::config::LlmConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::warn;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            top_p: 0.8,
            max_tokens: 4096,
        }
    }
}

impl SamplingParams {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            max_tokens: config.max_tokens,
        }
    }
}

/// The external completion capability. Responses may be truncated at the
/// token budget and may carry reasoning preambles; the recovery layer is the
/// sole consumer responsible for tolerating that.
#[async_trait]
pub trait CompletionClient: Send + Sync + Debug {
    async fn complete(&self, system: &str, user: &str, params: SamplingParams) -> Result<String>;
}

pub fn create_completion_client(config: &LlmConfig) -> Box<dyn CompletionClient> {
    Box::new(OpenAiCompatClient::new(
        &config.base_url,
        &config.api_key,
        &config.model,
    ))
}

/// Client for any OpenAI-compatible chat completion endpoint (llama.cpp,
/// ollama, vllm, hosted gateways).
#[derive(Debug)]
pub struct OpenAiCompatClient {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiCompatClient {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    async fn complete(&self, system: &str, user: &str, params: SamplingParams) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: params.temperature,
            top_p: params.top_p,
            max_tokens: params.max_tokens,
        };

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request_body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let error_text = resp.text().await?;
            return Err(anyhow!("completion API error: {}", error_text));
        }

        let result: ChatResponse = resp.json().await?;
        if let Some(choice) = result.choices.first() {
            if choice.finish_reason.as_deref() == Some("length") {
                warn!(
                    "completion truncated at max_tokens={}; downstream recovery will salvage",
                    params.max_tokens
                );
            }
            if let Some(content) = &choice.message.content {
                return Ok(content.clone());
            }
        }

        Err(anyhow!("completion response empty or missing content"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_parsing_success() {
        let json = r#"{
            "id": "chatcmpl-123",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "[{\"speaker\": \"A\"}]"},
                "finish_reason": "stop"
            }]
        }"#;

        let result: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            result.choices[0].message.content.as_deref(),
            Some("[{\"speaker\": \"A\"}]")
        );
        assert_eq!(result.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_response_parsing_truncated() {
        let json = r#"{
            "choices": [{
                "message": {"role": "assistant", "content": "[{\"speaker\""},
                "finish_reason": "length"
            }]
        }"#;

        let result: ChatResponse = serde_json::from_str(json).unwrap();
        assert_eq!(result.choices[0].finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn test_response_parsing_missing_content() {
        let json = r#"{"choices": [{"message": {"role": "assistant"}, "finish_reason": "stop"}]}"#;
        let result: ChatResponse = serde_json::from_str(json).unwrap();
        assert!(result.choices[0].message.content.is_none());
    }
}
