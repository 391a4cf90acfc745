use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable overriding `server.base_url`.
pub const ENV_SERVER_URL: &str = "MCP_SERVER_URL";
/// Environment variable overriding `provider.model`.
pub const ENV_MODEL: &str = "MCP_AGENT_MODEL";

/// Models tried after the configured default, in order.
pub const DEFAULT_FALLBACK_MODELS: &[&str] = &["gpt-4o-mini", "gpt-4.1-mini"];

/// Top-level application configuration, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: ProviderConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
}

impl AppConfig {
    /// Load configuration from default path (~/.config/mcp-agent/config.toml),
    /// falling back to defaults if the file doesn't exist.
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Apply environment overrides on top of file values.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_SERVER_URL) {
            if !url.trim().is_empty() {
                self.server.base_url = url.trim().to_string();
            }
        }
        if let Ok(model) = std::env::var(ENV_MODEL) {
            if !model.trim().is_empty() {
                self.provider.model = model.trim().to_string();
            }
        }
    }

    /// Default config file path.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mcp-agent")
            .join("config.toml")
    }

    /// Data directory for REPL history.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mcp-agent")
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL for the OpenAI-compatible API.
    pub api_base: String,
    /// Default model id.
    pub model: String,
    /// API key; takes precedence over `api_key_env`.
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Maximum tokens to generate per round.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
    /// Tried in order when the chosen model is reported as not found.
    pub fallback_models: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            model: "gpt-4o".into(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".into(),
            max_tokens: 4096,
            temperature: 0.2,
            fallback_models: DEFAULT_FALLBACK_MODELS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key from config or the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| {
                std::env::var(&self.api_key_env)
                    .ok()
                    .filter(|k| !k.trim().is_empty())
            })
    }
}

/// Which wire transport to use for the tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Standard MCP streamable HTTP.
    Streamable,
    /// Newline-delimited JSON over a GET stream plus POSTed writes.
    Ndjson,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Streamable => write!(f, "streamable"),
            TransportKind::Ndjson => write!(f, "ndjson"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "streamable" | "http" => Ok(TransportKind::Streamable),
            "ndjson" => Ok(TransportKind::Ndjson),
            other => Err(format!(
                "unknown transport '{}' (expected 'streamable' or 'ndjson')",
                other
            )),
        }
    }
}

/// Tool server connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server base URL.
    pub base_url: String,
    /// Path the protocol endpoint is mounted under.
    pub mount_path: String,
    pub transport: TransportKind,
    /// Per-request timeout for protocol calls.
    pub request_timeout_secs: u64,
    /// Tool used by `--load` to pre-load a data file.
    pub load_tool: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".into(),
            mount_path: "/mcp".into(),
            transport: TransportKind::Streamable,
            request_timeout_secs: 120,
            load_tool: "load_file".into(),
        }
    }
}

impl ServerConfig {
    /// `base_url` joined with `mount_path`, without a trailing slash.
    pub fn endpoint_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let mount = self.mount_path.trim_matches('/');
        if mount.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", base, mount)
        }
    }
}

/// Orchestration loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Prepended to every query's conversation when set.
    pub system_prompt: Option<String>,
    /// Re-fetch the tool catalog before each query.
    pub refresh_tools: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: Some(
                "You are a data-analysis assistant with access to tools on a remote \
                 analysis server. Use tools when they help answer the question, \
                 then give a concise final answer."
                    .into(),
            ),
            refresh_tools: true,
        }
    }
}
