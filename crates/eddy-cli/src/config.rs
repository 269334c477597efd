//! Configuration file support

use eddy_chat::{RetryConfig, SessionConfig, SummarizationConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for eddy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Conversation server base URL
    pub server_url: Option<String>,
    /// Bearer token (alternative to EDDY_API_TOKEN)
    pub api_token: Option<String>,
    /// Default model
    pub model: Option<String>,
    /// Context window of the model
    pub model_max_tokens: Option<u32>,
    /// Messages per history page
    pub page_size: Option<usize>,
    pub summarization: SummarizationSection,
    pub reconnect: ReconnectSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizationSection {
    pub enabled: Option<bool>,
    pub safety_margin: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSection {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
}

impl Config {
    /// Get the config directory
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("eddy")
    }

    /// Get the config file path
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("EDDY_CONFIG_PATH") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    /// Load config from file
    pub fn load() -> Self {
        let path = Self::config_path();
        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Self::default()
            }),
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Save config to file
    pub fn save(&self) -> std::io::Result<()> {
        let path = Self::config_path();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let content = toml::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Create a default config file if it doesn't exist
    pub fn init() -> std::io::Result<PathBuf> {
        let path = Self::config_path();
        if path.exists() {
            return Ok(path);
        }

        let default_config = Config {
            server_url: Some("http://localhost:8080".to_string()),
            model: Some("gpt-4o".to_string()),
            model_max_tokens: Some(128_000),
            ..Default::default()
        };

        default_config.save()?;
        Ok(path)
    }

    /// API token, from config first then EDDY_API_TOKEN
    pub fn api_token(&self) -> Option<String> {
        self.api_token
            .clone()
            .or_else(|| std::env::var("EDDY_API_TOKEN").ok())
    }

    /// Build the session configuration, filling unset fields with defaults
    pub fn session_config(&self, conversation_id: &str, model_id: &str) -> SessionConfig {
        let mut config = SessionConfig::new(conversation_id, model_id);
        if let Some(max) = self.model_max_tokens {
            config.model_max_tokens = max;
        }
        if let Some(size) = self.page_size {
            config.page_size = size;
        }

        let summarization = SummarizationConfig::default();
        config.summarization = SummarizationConfig {
            enabled: self.summarization.enabled.unwrap_or(summarization.enabled),
            safety_margin: self
                .summarization
                .safety_margin
                .unwrap_or(summarization.safety_margin),
        };

        let mut retry = RetryConfig::default();
        if let Some(attempts) = self.reconnect.max_attempts {
            retry.max_attempts = attempts.max(1);
        }
        if let Some(ms) = self.reconnect.initial_delay_ms {
            retry.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.reconnect.max_delay_ms {
            retry.max_delay = Duration::from_millis(ms);
        }
        config.retry = retry;
        config
    }
}

/// Generate example config content
pub fn example_config() -> &'static str {
    r#"# eddy configuration file
# Place at ~/.config/eddy/config.toml (Linux) or set EDDY_CONFIG_PATH

# Conversation server
server_url = "http://localhost:8080"

# Bearer token (optional - EDDY_API_TOKEN also works)
# api_token = "..."

# Model the conversation runs on, and its context window
model = "gpt-4o"
model_max_tokens = 128000

# Messages fetched per history page
page_size = 50

[summarization]
# Summarize older turns once the context is within safety_margin of full
enabled = true
safety_margin = 1000

[reconnect]
max_attempts = 10
initial_delay_ms = 1000
max_delay_ms = 30000
"#
}
