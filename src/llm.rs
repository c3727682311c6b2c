use anyhow::{anyhow, bail, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{AiConfig, AiProvider};

const ANTHROPIC_URL: &str = "https://api.anthropic.com/v1/messages";
const OPENAI_URL: &str = "https://api.openai.com/v1/chat/completions";
const HOSTED_URL: &str = "https://c00d.com/api/ai/chat";
const MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

/// A successful completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub content: String,
    /// Tokens billed for the call (input + output where reported)
    pub tokens: u64,
}

/// Trait for LLM clients to allow mocking and abstraction
pub trait LlmClient: Send + Sync {
    fn chat(&self, system: &str, messages: &[ChatMessage]) -> Result<Completion>;
}

/// Build the client for the configured provider
pub fn client_for(ai: &AiConfig) -> Arc<dyn LlmClient> {
    let http = HttpClient::new();
    match ai.provider {
        AiProvider::Anthropic => Arc::new(AnthropicClient {
            http,
            api_key: ai.api_key.clone(),
            model: ai.model.clone(),
        }),
        AiProvider::OpenAi => Arc::new(OpenAiClient {
            http,
            api_key: ai.api_key.clone(),
            model: ai.model.clone(),
        }),
        AiProvider::Ollama => Arc::new(OllamaClient {
            http,
            base_url: ai.ollama_url.trim_end_matches('/').to_string(),
            model: ai.model.clone(),
        }),
        AiProvider::C00d => Arc::new(HostedClient {
            http,
            license_key: ai.license_key.clone(),
            model: ai.model.clone(),
        }),
    }
}

struct HttpClient {
    agent: ureq::Agent,
}

impl HttpClient {
    fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
        }
    }

    fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Value,
    ) -> Result<T> {
        let mut request = self.agent.post(url).set("Content-Type", "application/json");
        for (name, value) in headers {
            request = request.set(name, value);
        }

        match request.send_json(body) {
            Ok(r) => Ok(r.into_json()?),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                Err(anyhow!("API error {}: {}", code, api_error_message(&body)))
            }
            Err(e) => Err(anyhow!("Request failed: {}", e)),
        }
    }
}

/// Pull `error.message` (or a string `error`) out of an error body
fn api_error_message(body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    parsed
        .as_ref()
        .and_then(|v| v.get("error"))
        .and_then(|e| e.get("message").and_then(Value::as_str).or_else(|| e.as_str()))
        .map(str::to_string)
        .unwrap_or_else(|| body.to_string())
}

fn with_system(system: &str, messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut all = Vec::with_capacity(messages.len() + 1);
    all.push(ChatMessage::new("system", system));
    all.extend_from_slice(messages);
    all
}

pub struct AnthropicClient {
    http: HttpClient,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl LlmClient for AnthropicClient {
    fn chat(&self, system: &str, messages: &[ChatMessage]) -> Result<Completion> {
        if self.api_key.is_empty() {
            bail!("Anthropic API key not configured");
        }

        let resp: AnthropicResponse = self.http.post_json(
            ANTHROPIC_URL,
            &[
                ("x-api-key", self.api_key.as_str()),
                ("anthropic-version", "2023-06-01"),
            ],
            json!({
                "model": self.model,
                "max_tokens": MAX_TOKENS,
                "system": system,
                "messages": messages,
            }),
        )?;

        let usage = resp.usage.unwrap_or_default();
        Ok(Completion {
            content: resp.content.into_iter().next().map(|b| b.text).unwrap_or_default(),
            tokens: usage.input_tokens + usage.output_tokens,
        })
    }
}

pub struct OpenAiClient {
    http: HttpClient,
    api_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    total_tokens: u64,
}

impl LlmClient for OpenAiClient {
    fn chat(&self, system: &str, messages: &[ChatMessage]) -> Result<Completion> {
        if self.api_key.is_empty() {
            bail!("OpenAI API key not configured");
        }

        let bearer = format!("Bearer {}", self.api_key);
        let resp: OpenAiResponse = self.http.post_json(
            OPENAI_URL,
            &[("Authorization", bearer.as_str())],
            json!({
                "model": self.model,
                "messages": with_system(system, messages),
                "max_tokens": MAX_TOKENS,
            }),
        )?;

        Ok(Completion {
            content: resp
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message.content)
                .unwrap_or_default(),
            tokens: resp.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }
}

pub struct OllamaClient {
    http: HttpClient,
    base_url: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: Option<OllamaMessage>,
}

#[derive(Debug, Deserialize)]
struct OllamaMessage {
    #[serde(default)]
    content: String,
}

impl LlmClient for OllamaClient {
    fn chat(&self, system: &str, messages: &[ChatMessage]) -> Result<Completion> {
        let url = format!("{}/api/chat", self.base_url);
        let resp: OllamaResponse = self
            .http
            .post_json(
                &url,
                &[],
                json!({
                    "model": self.model,
                    "messages": with_system(system, messages),
                    "stream": false,
                }),
            )
            .map_err(|e| anyhow!("Cannot connect to Ollama: {}", e))?;

        let message = resp
            .message
            .ok_or_else(|| anyhow!("Invalid response from Ollama"))?;
        Ok(Completion {
            content: message.content,
            tokens: 0,
        })
    }
}

/// The hosted c00d.com endpoint. Without a license key it serves the free
/// tier, which the usage ledger meters locally.
pub struct HostedClient {
    http: HttpClient,
    license_key: String,
    model: String,
}

#[derive(Debug, Deserialize)]
struct HostedResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tokens: Option<u64>,
    #[serde(default)]
    error: Option<Value>,
}

impl LlmClient for HostedClient {
    fn chat(&self, system: &str, messages: &[ChatMessage]) -> Result<Completion> {
        let resp: HostedResponse = self.http.post_json(
            HOSTED_URL,
            &[],
            json!({
                "license_key": self.license_key,
                "system": system,
                "messages": messages,
                "model": self.model,
            }),
        )?;

        if let Some(error) = resp.error {
            let message = error
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            bail!(message);
        }

        Ok(Completion {
            content: resp.content.unwrap_or_default(),
            tokens: resp.tokens.unwrap_or(0),
        })
    }
}
