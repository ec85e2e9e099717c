//! Concrete LLM providers. Grounded on `tandem-providers`'s
//! `OpenAICompatibleProvider`/`AnthropicProvider`, narrowed to a single
//! `complete` call per provider since the dispatch layer needs one action
//! string per turn, not a token stream.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: String,
    pub display_name: String,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
    ) -> Result<String, ProviderError>;
}

/// Any OpenAI-chat-completions-compatible endpoint: ollama, openai,
/// openrouter, groq, mistral, together, azure, bedrock, vertex, copilot all
/// speak this wire shape in the teacher's registry.
pub struct OpenAiCompatibleProvider {
    id: String,
    display_name: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiCompatibleProvider {
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            base_url: base_url.into(),
            api_key,
            client: Client::new(),
        }
    }
}

fn extract_openai_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|e| e.get("message").or(Some(e)))
        .and_then(|m| m.as_str().map(str::to_string))
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            display_name: self.display_name.clone(),
        }
    }

    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
    ) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(url).json(&json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "stream": false,
        }));
        if self.id == "openrouter" {
            req = req
                .header("HTTP-Referer", "https://example.invalid")
                .header("X-Title", "sim-engine");
        }
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(ProviderError::from)?;
        let status = response.status();
        let value: serde_json::Value = response.json().await.map_err(ProviderError::from)?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {status}"));
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ProviderError::Transient(detail)
            } else {
                ProviderError::Permanent(detail)
            });
        }

        value
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Transient("empty completion response".to_string()))
    }
}

pub struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    client: Client,
}

impl AnthropicProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".to_string(),
            display_name: "Anthropic".to_string(),
        }
    }

    async fn complete(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        model: &str,
    ) -> Result<String, ProviderError> {
        let Some(api_key) = &self.api_key else {
            return Err(ProviderError::Permanent("missing ANTHROPIC_API_KEY".to_string()));
        };
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": model,
                "system": system_prompt,
                "max_tokens": 1024,
                "messages": [{"role": "user", "content": user_prompt}],
            }))
            .send()
            .await
            .map_err(ProviderError::from)?;

        let status = response.status();
        let value: serde_json::Value = response.json().await.map_err(ProviderError::from)?;
        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {status}"));
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                ProviderError::Transient(detail)
            } else {
                ProviderError::Permanent(detail)
            });
        }

        value
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("text"))
            .and_then(|t| t.as_str())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Transient("empty completion response".to_string()))
    }
}
