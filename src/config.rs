use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the local Ollama server
    pub base_url: String,

    /// Model passed to the generate endpoint
    pub model: String,

    /// Where the conversation snapshot lives
    pub conversations_file: PathBuf,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            conversations_file: state_dir().join("conversations.json"),
            request_timeout_secs: 120,
        }
    }
}

fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ollama_chat")
}

impl Config {
    /// Load configuration from `~/.ollama_chat/config.toml`, falling back
    /// to defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let config_path = state_dir().join("config.toml");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            Ok(Config::default())
        }
    }

    pub fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_url_joins_without_double_slash() {
        let config = Config {
            base_url: "http://localhost:11434/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.generate_url(), "http://localhost:11434/api/generate");
    }

    #[test]
    fn defaults_target_local_ollama() {
        let config = Config::default();
        assert_eq!(config.model, "llama3.2");
        assert!(config.generate_url().starts_with("http://localhost:11434"));
    }
}
