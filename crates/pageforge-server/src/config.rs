//! Server configuration
//!
//! Loaded from a YAML file (every field has a default) and then overridden
//! by command-line flags, which also read `PAGEFORGE_*` environment variables.

use pageforge_core::adapters::{AnthropicConfig, GeminiConfig};
use pageforge_core::{ControllerConfig, RequestDefaults};
use pageforge_telemetry::UsageLogConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Request defaults and content limit
    #[serde(default)]
    pub limits: RequestDefaults,

    /// Retry, cascade and timeout settings shared by every provider
    #[serde(default)]
    pub generation: ControllerConfig,

    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub usage: UsageLogConfig,

    #[serde(default)]
    pub sessions: SessionConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    /// Events buffered between a running generation and its client
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl ServerConfig {
    /// Load configuration from file (defaults when it does not exist) and
    /// apply overrides
    pub fn load(config_path: impl AsRef<Path>, overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let path = config_path.as_ref();
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            Self::default()
        };

        overrides.apply(&mut config);
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            limits: RequestDefaults::default(),
            generation: ControllerConfig::default(),
            providers: ProvidersConfig::default(),
            usage: UsageLogConfig::default(),
            sessions: SessionConfig::default(),
            cors: CorsConfig::default(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Flags that take precedence over the file
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ConfigOverrides {
    /// Listen address
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Listen port
    #[arg(short = 'P', long)]
    pub port: Option<u16>,

    /// Characters of content kept before going upstream
    #[arg(long, env = "PAGEFORGE_MAX_CONTENT_CHARS")]
    pub max_content_chars: Option<usize>,

    /// Wall-clock budget per request, in seconds
    #[arg(long, env = "PAGEFORGE_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Default output token budget
    #[arg(long, env = "PAGEFORGE_MAX_TOKENS")]
    pub max_tokens: Option<u32>,

    /// Usage log path
    #[arg(long, env = "PAGEFORGE_USAGE_LOG")]
    pub usage_log: Option<PathBuf>,

    /// Serve every route from the offline mock upstream
    #[arg(long)]
    pub mock: bool,
}

impl ConfigOverrides {
    pub fn apply(&self, config: &mut ServerConfig) {
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(chars) = self.max_content_chars {
            config.limits.max_content_chars = chars;
        }
        if let Some(secs) = self.timeout_secs {
            config.generation.timeout_budget_secs = secs;
        }
        if let Some(tokens) = self.max_tokens {
            config.limits.max_output_tokens = tokens;
        }
        if let Some(path) = &self.usage_log {
            config.usage.path = path.clone();
        }
        if self.mock {
            config.providers.mock = true;
        }
    }
}

/// Upstream provider settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub gemini: GeminiConfig,

    #[serde(default)]
    pub anthropic: AnthropicConfig,

    #[serde(default)]
    pub rates: RateConfig,

    /// Replace both providers with the offline mock
    #[serde(default)]
    pub mock: bool,
}

/// Dollars per million tokens, per provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateConfig {
    #[serde(default)]
    pub gemini: f64,

    #[serde(default = "default_anthropic_rate")]
    pub anthropic: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            gemini: 0.0,
            anthropic: default_anthropic_rate(),
        }
    }
}

/// Finished-session cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_session_max")]
    pub max_entries: usize,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            max_entries: default_session_max(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

/// Cross-origin settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorsConfig {
    /// `*` allows any origin
    #[serde(default = "default_origins")]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_cors_max_age")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: default_origins(),
            max_age_secs: default_cors_max_age(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_event_buffer() -> usize {
    64
}

fn default_anthropic_rate() -> f64 {
    3.0
}

fn default_session_ttl() -> u64 {
    600
}

fn default_session_max() -> usize {
    1_000
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_max_age() -> u64 {
    86_400
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageforge_core::Strategy;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
port: 9000
limits:
  max_output_tokens: 8192
  temperature: 0.7
  max_content_chars: 2000
generation:
  cascade: [non_streaming, placeholder]
providers:
  gemini:
    model: gemini-2.0-flash
    streaming: false
"#;
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.port, 9000);
        assert_eq!(config.listen, "0.0.0.0");
        assert_eq!(config.limits.max_content_chars, 2000);
        assert_eq!(
            config.generation.cascade,
            vec![Strategy::NonStreaming, Strategy::Placeholder]
        );
        assert_eq!(config.generation.timeout_budget_secs, 85);
        assert_eq!(config.providers.gemini.model, "gemini-2.0-flash");
        assert!(!config.providers.gemini.streaming);
        assert_eq!(config.providers.gemini.top_k, 64);
        assert_eq!(config.providers.rates.anthropic, 3.0);
        assert_eq!(config.sessions.ttl_secs, 600);
        assert_eq!(config.cors.allowed_origins, vec!["*"]);
    }

    #[test]
    fn test_overrides_win() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "limits:\n  max_output_tokens: 100\n  temperature: 1.0\n  max_content_chars: 5000\n").unwrap();

        let overrides = ConfigOverrides {
            max_content_chars: Some(300),
            timeout_secs: Some(30),
            usage_log: Some(PathBuf::from("/tmp/usage.jsonl")),
            mock: true,
            ..Default::default()
        };
        let config = ServerConfig::load(&path, &overrides).unwrap();

        assert_eq!(config.limits.max_content_chars, 300);
        assert_eq!(config.limits.max_output_tokens, 100);
        assert_eq!(config.generation.timeout_budget_secs, 30);
        assert_eq!(config.usage.path, PathBuf::from("/tmp/usage.jsonl"));
        assert!(config.providers.mock);
    }

    #[test]
    fn test_sample_config_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config.yaml");
        let config = ServerConfig::load(path, &ConfigOverrides::default()).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ServerConfig::load("/nonexistent/pageforge.yaml", &ConfigOverrides::default()).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_bad_yaml_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "port: [not a port").unwrap();

        let err = ServerConfig::load(&path, &ConfigOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("config.yaml"));
    }
}
