//! Builds providers from environment variables (same discovery pattern as
//! `tandem-core::config::env_layer`) and resolves a `ModelType` to a
//! `(provider_id, concrete_model)` pair.

use std::collections::HashMap;
use std::sync::Arc;

use sim_engine_types::ModelType;

use crate::provider::{AnthropicProvider, OpenAiCompatibleProvider, Provider, ProviderInfo};

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Static model routing table: which provider serves each `ModelType` and
/// under what concrete model name. A migration, not a runtime-configurable
/// value — mirrors the immutability of `ModelType` itself.
fn route_for(model_type: ModelType) -> (&'static str, &'static str) {
    match model_type {
        ModelType::ClaudeSonnet4 => ("anthropic", "claude-sonnet-4-6"),
        ModelType::ClaudeHaiku => ("anthropic", "claude-haiku-4-5"),
        ModelType::Gpt4oMini => ("openai", "gpt-4o-mini"),
        ModelType::GeminiFlash => ("vertex", "gemini-1.5-flash"),
        ModelType::Llama3_3_70b => ("together", "meta-llama/Llama-3.3-70B-Instruct-Turbo"),
        ModelType::Llama3_1_8b => ("ollama", "llama3.1:8b"),
        ModelType::OrGptOss120b => ("openrouter", "openai/gpt-oss-120b"),
        ModelType::OrQwen3_235bA22b2507 => ("openrouter", "qwen/qwen3-235b-a22b-2507"),
        ModelType::OrDeepseekV3_2 => ("openrouter", "deepseek/deepseek-v3.2"),
        ModelType::OrDeepseekChatV3_1 => ("openrouter", "deepseek/deepseek-chat-v3.1"),
        ModelType::OrGptOss20b => ("openrouter", "openai/gpt-oss-20b"),
        ModelType::OrQwen3_32b => ("openrouter", "qwen/qwen3-32b"),
        ModelType::OrGptOss20bFree => ("openrouter", "openai/gpt-oss-20b:free"),
        ModelType::OrQwen3_4bFree => ("openrouter", "qwen/qwen3-4b:free"),
        ModelType::GrLlama3_1_8bInstant => ("groq", "llama-3.1-8b-instant"),
    }
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn from_env() -> Self {
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();

        if let Some(key) = env_var("ANTHROPIC_API_KEY") {
            providers.insert(
                "anthropic".to_string(),
                Arc::new(AnthropicProvider::new("https://api.anthropic.com/v1", Some(key))),
            );
        }
        Self::add_openai_compatible(&mut providers, "openai", "OpenAI", "OPENAI_API_KEY", "https://api.openai.com/v1");
        Self::add_openai_compatible(
            &mut providers,
            "openrouter",
            "OpenRouter",
            "OPENROUTER_API_KEY",
            "https://openrouter.ai/api/v1",
        );
        Self::add_openai_compatible(&mut providers, "groq", "Groq", "GROQ_API_KEY", "https://api.groq.com/openai/v1");
        Self::add_openai_compatible(
            &mut providers,
            "mistral",
            "Mistral",
            "MISTRAL_API_KEY",
            "https://api.mistral.ai/v1",
        );
        Self::add_openai_compatible(
            &mut providers,
            "together",
            "Together",
            "TOGETHER_API_KEY",
            "https://api.together.xyz/v1",
        );
        Self::add_openai_compatible(
            &mut providers,
            "vertex",
            "Vertex",
            "VERTEX_API_KEY",
            "https://aiplatform.googleapis.com/v1",
        );

        let ollama_url = env_var("OLLAMA_URL").unwrap_or_else(|| "http://127.0.0.1:11434/v1".to_string());
        providers.insert(
            "ollama".to_string(),
            Arc::new(OpenAiCompatibleProvider::new("ollama", "Ollama", ollama_url, None)),
        );

        Self { providers }
    }

    fn add_openai_compatible(
        providers: &mut HashMap<String, Arc<dyn Provider>>,
        id: &str,
        display_name: &str,
        key_env: &str,
        base_url: &str,
    ) {
        if let Some(key) = env_var(key_env) {
            providers.insert(
                id.to_string(),
                Arc::new(OpenAiCompatibleProvider::new(id, display_name, base_url, Some(key))),
            );
        }
    }

    pub fn list(&self) -> Vec<ProviderInfo> {
        self.providers.values().map(|p| p.info()).collect()
    }

    /// Resolves `model_type` to its configured provider and concrete model
    /// name, honoring `route_for`'s static table.
    pub fn resolve(&self, model_type: ModelType) -> Option<(Arc<dyn Provider>, &'static str)> {
        let (provider_id, concrete_model) = route_for(model_type);
        self.providers
            .get(provider_id)
            .cloned()
            .map(|p| (p, concrete_model))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::from_env()
    }
}
