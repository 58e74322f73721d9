pub mod validation;

use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Environment variable that overrides the config file path.
pub const CONFIG_PATH_ENV: &str = "TURNWIRE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub base_path: String,
    /// Capacity of the per-request canonical event channel.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
}

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_stream_buffer() -> usize {
    64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            base_path: String::new(),
            stream_buffer: default_stream_buffer(),
            runtime_worker_threads: None,
        }
    }
}

/// The single OpenAI-compatible upstream the agent talks to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    pub default_model: String,
    /// Bound on establishing the upstream stream. Streaming itself is not timed.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_connect_timeout_secs() -> u64 {
    30
}
fn default_pool_max_idle_per_host() -> usize {
    16
}

/// Client authentication configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientAuthConfig {
    #[serde(default)]
    pub allowed_keys: Vec<String>,
    /// JSON file backing issued `clb_` keys.
    #[serde(default)]
    pub keys_file: Option<String>,
    #[serde(default)]
    pub create_default_key: bool,
}

/// Agent turn settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_prompts_dir")]
    pub prompts_dir: String,
    #[serde(default = "default_skills_dir")]
    pub skills_dir: String,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u64,
}

fn default_prompts_dir() -> String {
    "prompts".to_string()
}
fn default_skills_dir() -> String {
    "skills".to_string()
}
fn default_max_tool_rounds() -> u32 {
    5
}
fn default_max_tokens() -> u64 {
    4096
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            prompts_dir: default_prompts_dir(),
            skills_dir: default_skills_dir(),
            max_tool_rounds: default_max_tool_rounds(),
            default_max_tokens: default_max_tokens(),
        }
    }
}

/// One entry of the `/v1/models` listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    #[serde(default = "default_owned_by")]
    pub owned_by: String,
}

fn default_owned_by() -> String {
    "turnwire".to_string()
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub client_authentication: ClientAuthConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub features: FeaturesConfig,
}

impl AppConfig {
    /// Resolve the upstream model for a client-facing model name.
    ///
    /// The generic aliases `model`, `default` and `auto` map to the configured
    /// default model; anything else is passed through unchanged.
    #[must_use]
    pub fn map_model_name<'a>(&'a self, requested: &'a str) -> &'a str {
        match requested {
            "model" | "default" | "auto" => &self.upstream.default_model,
            other => other,
        }
    }
}

/// Resolve the config path: first CLI argument, then `TURNWIRE_CONFIG`, then `config.yaml`.
#[must_use]
pub fn resolve_config_path(cli_arg: Option<String>) -> String {
    cli_arg
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}
