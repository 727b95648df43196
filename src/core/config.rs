use std::env;

use anyhow::{Result, anyhow};

use crate::ai::chat::DEFAULT_API_HOSTNAME;

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    pub openai_api_hostname: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub system_message: String,
}

impl AppConfig {
    /// Reads the configuration from environment variables. Only
    /// `OPENAI_API_KEY` is required.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let openai_api_key = var("OPENAI_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .ok_or(anyhow!("Missing env var OPENAI_API_KEY"))?;
        let openai_api_hostname =
            var("CHATBLOCK_LLM_HOST").unwrap_or_else(|| DEFAULT_API_HOSTNAME.to_string());
        let openai_model = var("CHATBLOCK_LLM_MODEL").unwrap_or_else(|| "gpt-4".to_string());
        let system_message = var("CHATBLOCK_SYSTEM_MESSAGE")
            .unwrap_or_else(|| "You are a helpful assistant.".to_string());

        Ok(Self {
            openai_api_hostname,
            openai_api_key,
            openai_model,
            system_message,
        })
    }
}
