//! Layered StreamChat Configuration
//!
//! Centralized configuration loading, with a TOML file at
//! `~/.config/streamchat/streamchat.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`STREAMCHAT_*`, plus `OPENAI_API_KEY`,
//!    `GEMINI_API_KEY`, `OLLAMA_HOST`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! socket_path = "/run/user/1000/streamchat.sock"
//!
//! [rate_limit]
//! capacity = 60
//! refill_per_second = 1.0
//! token_cost = 0.01
//! idle_eviction_secs = 600
//!
//! [routing]
//! default_model = "gpt-4o-mini"
//! max_fallback_depth = 4
//!
//! [routing.fallbacks]
//! openai = ["gemini"]
//!
//! [providers.openai]
//! api_key = "sk-..."
//!
//! [providers.gemini]
//! api_key = "..."
//! default_model = "gemini-1.5-flash"
//!
//! [providers.ollama]
//! enabled = true
//! models = ["llama3.2"]
//!
//! [session]
//! context_window = 20
//! idle_timeout_secs = 3600
//!
//! [history]
//! backend = "jsonl"
//! dir = "/var/lib/streamchat/history"
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backend::{GEMINI_BASE_URL, OPENAI_BASE_URL};
use crate::rate_limit::RateLimitConfig;
use crate::routing::{DEFAULT_MAX_FALLBACK_DEPTH, GEMINI_MODELS, OPENAI_MODELS};
use crate::session::SessionManagerConfig;

/// Default model when none is configured
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

// =============================================================================
// Error Types
// =============================================================================

/// Loading or validation failure
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Provenance
// =============================================================================

/// Highest-priority layer that contributed a value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// File Format
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Unix socket path for the daemon
    pub socket_path: Option<String>,
}

/// Rate limiting section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitToml {
    /// Bucket capacity (burst size)
    pub capacity: Option<f64>,

    /// Tokens added per second
    pub refill_per_second: Option<f64>,

    /// Cost charged per relayed fragment
    pub token_cost: Option<f64>,

    /// Seconds before an unused bucket may be evicted
    pub idle_eviction_secs: Option<u64>,

    /// Whether rate limiting is enabled
    pub enabled: Option<bool>,
}

/// Routing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// Default model to use
    pub default_model: Option<String>,

    /// Maximum chain depth (primary plus fallbacks)
    pub max_fallback_depth: Option<usize>,

    /// Provider family -> fallback families, in order
    pub fallbacks: Option<BTreeMap<String, Vec<String>>>,
}

/// One provider family's section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToml {
    /// Register the family even without credentials (local providers)
    pub enabled: Option<bool>,

    /// API key for hosted providers
    pub api_key: Option<String>,

    /// Override the API base URL
    pub base_url: Option<String>,

    /// Host for local providers
    pub host: Option<String>,

    /// Port for local providers
    pub port: Option<u16>,

    /// Models served by this family
    pub models: Option<Vec<String>>,

    /// Model used when this family serves as a fallback
    pub default_model: Option<String>,

    /// Longest wait for the next streamed chunk, in seconds
    pub read_timeout_secs: Option<u64>,
}

/// Providers section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersToml {
    /// OpenAI (or compatible) endpoint
    pub openai: Option<ProviderToml>,
    /// Google Gemini
    pub gemini: Option<ProviderToml>,
    /// Local Ollama server
    pub ollama: Option<ProviderToml>,
    /// Offline echo provider
    pub echo: Option<ProviderToml>,
}

/// Session section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionToml {
    /// System prompt (empty string disables it)
    pub system_prompt: Option<String>,

    /// Prior turns included in the context
    pub context_window: Option<usize>,

    /// Seconds before an idle session is evicted from memory
    pub idle_timeout_secs: Option<u64>,

    /// Longest accepted user message, in characters
    pub max_message_length: Option<usize>,

    /// Create unknown sessions on send
    pub auto_create: Option<bool>,

    /// Capacity of the routed event channel
    pub stream_buffer: Option<usize>,

    /// Seconds between janitor runs
    pub janitor_interval_secs: Option<u64>,

    /// Seconds a stalled client gets to accept the final event of a reply
    pub terminal_emit_timeout_secs: Option<u64>,
}

/// History section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryToml {
    /// Storage backend
    pub backend: Option<HistoryBackend>,

    /// Directory for the JSONL backend
    pub dir: Option<String>,
}

/// Whole `streamchat.toml` document
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamChatToml {
    /// Server section
    pub server: ServerToml,
    /// Rate limiting section
    pub rate_limit: RateLimitToml,
    /// Routing section
    pub routing: RoutingToml,
    /// Providers section
    pub providers: ProvidersToml,
    /// Session section
    pub session: SessionToml,
    /// History section
    pub history: HistoryToml,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// A hosted provider reached with an API key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostedProviderConfig {
    /// API key; the family is only registered when set
    pub api_key: Option<String>,
    /// API base URL
    pub base_url: String,
    /// Models served by this family
    pub models: Vec<String>,
    /// Model used when this family serves as a fallback
    pub default_model: String,
    /// Longest wait for the next streamed chunk
    pub read_timeout: Duration,
}

impl HostedProviderConfig {
    /// OpenAI defaults
    #[must_use]
    pub fn openai() -> Self {
        Self {
            api_key: None,
            base_url: OPENAI_BASE_URL.to_string(),
            models: OPENAI_MODELS.iter().map(ToString::to_string).collect(),
            default_model: DEFAULT_MODEL.to_string(),
            read_timeout: Duration::from_secs(60),
        }
    }

    /// Gemini defaults
    #[must_use]
    pub fn gemini() -> Self {
        Self {
            api_key: None,
            base_url: GEMINI_BASE_URL.to_string(),
            models: GEMINI_MODELS.iter().map(ToString::to_string).collect(),
            default_model: "gemini-1.5-flash".to_string(),
            read_timeout: Duration::from_secs(60),
        }
    }

    /// Whether credentials are present
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/// A local Ollama server
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OllamaConfig {
    /// Register the family
    pub enabled: bool,
    /// Host name
    pub host: String,
    /// Port
    pub port: u16,
    /// Models served
    pub models: Vec<String>,
    /// Model used when this family serves as a fallback
    pub default_model: Option<String>,
    /// Longest wait for the next streamed chunk
    pub read_timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "localhost".to_string(),
            port: 11434,
            models: vec!["llama3.2".to_string()],
            default_model: None,
            read_timeout: Duration::from_secs(120),
        }
    }
}

/// Configured provider families
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvidersConfig {
    /// OpenAI family
    pub openai: HostedProviderConfig,
    /// Gemini family
    pub gemini: HostedProviderConfig,
    /// Ollama family
    pub ollama: OllamaConfig,
    /// Register the offline `echo` model
    pub echo: bool,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            openai: HostedProviderConfig::openai(),
            gemini: HostedProviderConfig::gemini(),
            ollama: OllamaConfig::default(),
            echo: false,
        }
    }
}

/// Routing settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingConfig {
    /// Model used when a request names none
    pub default_model: String,
    /// Maximum chain depth
    pub max_fallback_depth: usize,
    /// Provider family -> fallback families
    pub fallbacks: BTreeMap<String, Vec<String>>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_model: DEFAULT_MODEL.to_string(),
            max_fallback_depth: DEFAULT_MAX_FALLBACK_DEPTH,
            fallbacks: BTreeMap::new(),
        }
    }
}

/// History storage backend
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryBackend {
    /// Process-lifetime storage
    #[default]
    Memory,
    /// One JSONL file per session
    Jsonl,
}

impl std::str::FromStr for HistoryBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "jsonl" => Ok(Self::Jsonl),
            other => Err(ConfigError::ValidationError(format!(
                "unknown history backend: {other}"
            ))),
        }
    }
}

/// History settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryConfig {
    /// Storage backend
    pub backend: HistoryBackend,
    /// Directory for the JSONL backend
    pub dir: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            backend: HistoryBackend::Memory,
            dir: default_history_dir(),
        }
    }
}

/// Centralized configuration
///
/// Consolidates all sources and tracks where values came from. Use
/// [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug)]
pub struct StreamChatConfig {
    /// Daemon socket path (daemon picks a runtime path when `None`)
    pub socket_path: Option<PathBuf>,

    /// Rate limiter settings
    pub rate_limit: RateLimitConfig,

    /// Routing settings
    pub routing: RoutingConfig,

    /// Provider families
    pub providers: ProvidersConfig,

    /// Session manager settings
    pub session: SessionManagerConfig,

    /// Capacity of the routed event channel
    pub stream_buffer: usize,

    /// History settings
    pub history: HistoryConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for StreamChatConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            rate_limit: RateLimitConfig::default(),
            routing: RoutingConfig::default(),
            providers: ProvidersConfig::default(),
            session: SessionManagerConfig::default(),
            stream_buffer: 64,
            history: HistoryConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl StreamChatConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check values that would make the core misbehave
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let rl = &self.rate_limit;
        if !(rl.capacity.is_finite() && rl.capacity > 0.0) {
            return Err(ConfigError::ValidationError(
                "rate_limit.capacity must be positive".to_string(),
            ));
        }
        if !(rl.refill_per_second.is_finite() && rl.refill_per_second >= 0.0) {
            return Err(ConfigError::ValidationError(
                "rate_limit.refill_per_second must not be negative".to_string(),
            ));
        }
        if !(rl.token_cost.is_finite() && rl.token_cost >= 0.0) {
            return Err(ConfigError::ValidationError(
                "rate_limit.token_cost must not be negative".to_string(),
            ));
        }
        if self.routing.max_fallback_depth == 0 {
            return Err(ConfigError::ValidationError(
                "routing.max_fallback_depth must be at least 1".to_string(),
            ));
        }
        if self.session.max_message_length == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_message_length must be at least 1".to_string(),
            ));
        }
        if self.stream_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "session.stream_buffer must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/streamchat/streamchat.toml` or
/// `~/.config/streamchat/streamchat.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("streamchat").join("streamchat.toml"))
}

/// Default directory for JSONL history files
#[must_use]
pub fn default_history_dir() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("./data/history"),
        |p| p.join("streamchat").join("history"),
    )
}

/// Load the default config file (if any), then the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<StreamChatConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<StreamChatConfig, ConfigError> {
    let mut config = StreamChatConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: StreamChatToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Read config file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "No config file, continuing with defaults"
            );
        }
    }

    apply_env_config(&mut config)?;
    config.validate()?;

    Ok(config)
}

fn apply_hosted_toml(target: &mut HostedProviderConfig, toml: &ProviderToml) {
    if toml.api_key.is_some() {
        target.api_key.clone_from(&toml.api_key);
    }
    if let Some(ref url) = toml.base_url {
        target.base_url.clone_from(url);
    }
    if let Some(ref models) = toml.models {
        target.models.clone_from(models);
    }
    if let Some(ref model) = toml.default_model {
        target.default_model.clone_from(model);
    }
    if let Some(secs) = toml.read_timeout_secs {
        target.read_timeout = Duration::from_secs(secs);
    }
}

/// Copy every value present in the file onto `config`
fn apply_toml_config(config: &mut StreamChatConfig, toml: &StreamChatToml) {
    // Server settings
    if let Some(ref path) = toml.server.socket_path {
        config.socket_path = Some(PathBuf::from(path));
    }

    // Rate limit settings
    if let Some(capacity) = toml.rate_limit.capacity {
        config.rate_limit.capacity = capacity;
    }
    if let Some(rate) = toml.rate_limit.refill_per_second {
        config.rate_limit.refill_per_second = rate;
    }
    if let Some(cost) = toml.rate_limit.token_cost {
        config.rate_limit.token_cost = cost;
    }
    if let Some(secs) = toml.rate_limit.idle_eviction_secs {
        config.rate_limit.idle_eviction_secs = secs;
    }
    if let Some(enabled) = toml.rate_limit.enabled {
        config.rate_limit.enabled = enabled;
    }

    // Routing settings
    if let Some(ref model) = toml.routing.default_model {
        config.routing.default_model.clone_from(model);
    }
    if let Some(depth) = toml.routing.max_fallback_depth {
        config.routing.max_fallback_depth = depth;
    }
    if let Some(ref fallbacks) = toml.routing.fallbacks {
        config.routing.fallbacks.clone_from(fallbacks);
    }

    // Provider settings
    if let Some(ref openai) = toml.providers.openai {
        apply_hosted_toml(&mut config.providers.openai, openai);
    }
    if let Some(ref gemini) = toml.providers.gemini {
        apply_hosted_toml(&mut config.providers.gemini, gemini);
    }
    if let Some(ref ollama) = toml.providers.ollama {
        let target = &mut config.providers.ollama;
        // A present section opts in unless it says otherwise
        target.enabled = ollama.enabled.unwrap_or(true);
        if let Some(ref host) = ollama.host {
            target.host.clone_from(host);
        }
        if let Some(port) = ollama.port {
            target.port = port;
        }
        if let Some(ref models) = ollama.models {
            target.models.clone_from(models);
        }
        if ollama.default_model.is_some() {
            target.default_model.clone_from(&ollama.default_model);
        }
        if let Some(secs) = ollama.read_timeout_secs {
            target.read_timeout = Duration::from_secs(secs);
        }
    }
    if let Some(ref echo) = toml.providers.echo {
        config.providers.echo = echo.enabled.unwrap_or(true);
    }

    // Session settings
    if let Some(ref prompt) = toml.session.system_prompt {
        config.session.system_prompt = if prompt.trim().is_empty() {
            None
        } else {
            Some(prompt.clone())
        };
    }
    if let Some(window) = toml.session.context_window {
        config.session.context_window = window;
    }
    if let Some(secs) = toml.session.idle_timeout_secs {
        config.session.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(length) = toml.session.max_message_length {
        config.session.max_message_length = length;
    }
    if let Some(auto_create) = toml.session.auto_create {
        config.session.auto_create_sessions = auto_create;
    }
    if let Some(buffer) = toml.session.stream_buffer {
        config.stream_buffer = buffer;
    }
    if let Some(secs) = toml.session.janitor_interval_secs {
        config.session.janitor_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = toml.session.terminal_emit_timeout_secs {
        config.session.terminal_emit_timeout = Duration::from_secs(secs);
    }

    // History settings
    if let Some(backend) = toml.history.backend {
        config.history.backend = backend;
    }
    if let Some(ref dir) = toml.history.dir {
        config.history.dir = PathBuf::from(dir);
    }
}

/// Split an `OLLAMA_HOST` value such as `http://10.0.0.2:11434`
fn parse_ollama_host(value: &str) -> (String, Option<u16>) {
    let value = value.trim();
    let value = value
        .strip_prefix("http://")
        .or_else(|| value.strip_prefix("https://"))
        .unwrap_or(value)
        .trim_end_matches('/');
    match value.rsplit_once(':') {
        Some((host, port)) => match port.parse() {
            Ok(port) => (host.to_string(), Some(port)),
            Err(_) => (value.to_string(), None),
        },
        None => (value.to_string(), None),
    }
}

fn env_flag(value: &str) -> bool {
    value != "0" && value.to_lowercase() != "false"
}

/// Layer `STREAMCHAT_*` and provider variables onto `config`
fn apply_env_config(config: &mut StreamChatConfig) -> Result<(), ConfigError> {
    // Server settings from environment
    if let Ok(path) = std::env::var("STREAMCHAT_SOCKET") {
        config.socket_path = Some(PathBuf::from(path));
        config.source = ConfigSource::Env;
    }

    // Rate limit settings from environment
    if let Ok(capacity) = std::env::var("STREAMCHAT_RATE_LIMIT_CAPACITY") {
        if let Ok(c) = capacity.parse::<f64>() {
            config.rate_limit.capacity = c;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(rate) = std::env::var("STREAMCHAT_RATE_LIMIT_REFILL") {
        if let Ok(r) = rate.parse::<f64>() {
            config.rate_limit.refill_per_second = r;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(enabled) = std::env::var("STREAMCHAT_RATE_LIMIT") {
        config.rate_limit.enabled = env_flag(&enabled);
        config.source = ConfigSource::Env;
    }

    // Routing settings from environment
    if let Ok(model) = std::env::var("STREAMCHAT_DEFAULT_MODEL") {
        config.routing.default_model = model;
        config.source = ConfigSource::Env;
    }

    // Provider credentials from environment
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        config.providers.openai.api_key = Some(key);
        config.source = ConfigSource::Env;
    }
    if let Ok(url) = std::env::var("OPENAI_BASE_URL") {
        config.providers.openai.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        config.providers.gemini.api_key = Some(key);
        config.source = ConfigSource::Env;
    }
    if let Ok(host) = std::env::var("OLLAMA_HOST") {
        let (host, port) = parse_ollama_host(&host);
        config.providers.ollama.enabled = true;
        config.providers.ollama.host = host;
        if let Some(port) = port {
            config.providers.ollama.port = port;
        }
        config.source = ConfigSource::Env;
    }
    if let Ok(echo) = std::env::var("STREAMCHAT_ECHO") {
        config.providers.echo = env_flag(&echo);
        config.source = ConfigSource::Env;
    }

    // Session settings from environment
    if let Ok(prompt) = std::env::var("STREAMCHAT_SYSTEM_PROMPT") {
        config.session.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        config.source = ConfigSource::Env;
    }
    if let Ok(window) = std::env::var("STREAMCHAT_CONTEXT_WINDOW") {
        if let Ok(w) = window.parse::<usize>() {
            config.session.context_window = w;
            config.source = ConfigSource::Env;
        }
    }

    // History settings from environment
    if let Ok(backend) = std::env::var("STREAMCHAT_HISTORY_BACKEND") {
        config.history.backend = backend.parse()?;
        config.source = ConfigSource::Env;
    }
    if let Ok(dir) = std::env::var("STREAMCHAT_HISTORY_DIR") {
        config.history.dir = PathBuf::from(dir);
        config.source = ConfigSource::Env;
    }

    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Command-line values that win over every other layer
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Socket path override
    pub socket_path: Option<PathBuf>,

    /// Default model override
    pub default_model: Option<String>,

    /// History backend override
    pub history_backend: Option<HistoryBackend>,

    /// History directory override
    pub history_dir: Option<PathBuf>,

    /// Echo provider override
    pub echo: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set socket path override
    #[must_use]
    pub fn with_socket_path(mut self, path: PathBuf) -> Self {
        self.socket_path = Some(path);
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Set history backend override
    #[must_use]
    pub fn with_history_backend(mut self, backend: HistoryBackend) -> Self {
        self.history_backend = Some(backend);
        self
    }

    /// Set history directory override
    #[must_use]
    pub fn with_history_dir(mut self, dir: PathBuf) -> Self {
        self.history_dir = Some(dir);
        self
    }

    /// Set echo provider override
    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = Some(echo);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut StreamChatConfig) {
        if self.socket_path.is_some()
            || self.default_model.is_some()
            || self.history_backend.is_some()
            || self.history_dir.is_some()
            || self.echo.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref path) = self.socket_path {
            config.socket_path = Some(path.clone());
        }
        if let Some(ref model) = self.default_model {
            config.routing.default_model.clone_from(model);
        }
        if let Some(backend) = self.history_backend {
            config.history.backend = backend;
        }
        if let Some(ref dir) = self.history_dir {
            config.history.dir.clone_from(dir);
        }
        if let Some(echo) = self.echo {
            config.providers.echo = echo;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
