//! Configuration loading, validation, and management for agentwire.
//!
//! Loads configuration from `~/.agentwire/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The root configuration structure.
///
/// Maps directly to `~/.agentwire/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Log filter directive (`RUST_LOG` syntax)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Context window management
    #[serde(default)]
    pub context: ContextConfig,

    /// Tool executor
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Session protocol limits and policies
    #[serde(default)]
    pub session: SessionConfig,

    /// Heartbeat configuration
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Model call limits
    #[serde(default)]
    pub model: ModelConfig,

    /// Model call retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Optional shared rate limit for model calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,

    /// Model circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            context: ContextConfig::default(),
            executor: ExecutorConfig::default(),
            session: SessionConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            model: ModelConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: None,
            circuit_breaker: CircuitBreakerConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}
fn default_true() -> bool {
    true
}

/// Which context management policy a session uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStrategy {
    /// Never touch the history.
    Null,
    /// Keep only the most recent messages.
    #[default]
    SlidingWindow,
    /// Fold older messages into a model-written summary.
    Summarizing,
}

/// How often management runs inside a turn, in addition to turn end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManagementCadence {
    #[default]
    Disabled,
    EveryIteration,
    EveryNIterations(u32),
}

impl ManagementCadence {
    /// Whether management should run after the given 1-based iteration.
    pub fn fires_after(self, iteration: u32) -> bool {
        match self {
            ManagementCadence::Disabled => false,
            ManagementCadence::EveryIteration => true,
            ManagementCadence::EveryNIterations(0) => false,
            ManagementCadence::EveryNIterations(n) => iteration % n == 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub strategy: ContextStrategy,

    /// Maximum messages kept by the sliding window
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// Share of the history folded by one summarization (clamped to [0.1, 0.8])
    #[serde(default = "default_summary_ratio")]
    pub summary_ratio: f64,

    /// Trailing messages summarization never touches
    #[serde(default = "default_preserve_recent")]
    pub preserve_recent_messages: usize,

    /// Token budget the summarizing policy keeps the history under
    #[serde(default = "default_context_max_tokens")]
    pub max_tokens: usize,

    #[serde(default)]
    pub cadence: ManagementCadence,
}

fn default_window_size() -> usize {
    40
}
fn default_summary_ratio() -> f64 {
    0.3
}
fn default_preserve_recent() -> usize {
    10
}
fn default_context_max_tokens() -> usize {
    100_000
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            strategy: ContextStrategy::default(),
            window_size: default_window_size(),
            summary_ratio: default_summary_ratio(),
            preserve_recent_messages: default_preserve_recent(),
            max_tokens: default_context_max_tokens(),
            cadence: ManagementCadence::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Dispatch every request at once and fan in.
    #[default]
    Concurrent,
    /// Dispatch strictly one at a time, in request order.
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub mode: ExecutionMode,

    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// Upper bound on tools running at once in concurrent mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
}

fn default_tool_timeout() -> u64 {
    60
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            tool_timeout_secs: default_tool_timeout(),
            max_concurrency: None,
        }
    }
}

impl ExecutorConfig {
    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }
}

/// What a session does with a chat that arrives while a turn is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Answer with a recoverable `BUSY` error.
    #[default]
    Reject,
    /// Run it after the current turn (bounded by `max_queued_chats`).
    Queue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,

    #[serde(default)]
    pub busy_policy: BusyPolicy,

    #[serde(default = "default_max_queued")]
    pub max_queued_chats: usize,

    /// Capacity of the per-session outbound queue
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,

    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}
fn default_max_queued() -> usize {
    8
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_shutdown_grace() -> u64 {
    10
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_message_bytes: default_max_message_bytes(),
            busy_policy: BusyPolicy::default(),
            max_queued_chats: default_max_queued(),
            outbound_buffer: default_outbound_buffer(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl SessionConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Idle time before the server pings
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,

    /// How long to wait for the pong
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    30
}
fn default_heartbeat_timeout() -> u64 {
    10
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_heartbeat_interval(),
            timeout_secs: default_heartbeat_timeout(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Deadline for one model call, stream included
    #[serde(default = "default_model_timeout")]
    pub timeout_secs: u64,

    /// Model calls allowed per turn
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

fn default_model_timeout() -> u64 {
    120
}
fn default_max_iterations() -> u32 {
    25
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_model_timeout(),
            max_iterations: default_max_iterations(),
            system_prompt: None,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per model call, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    8000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,

    /// Tokens available at once; defaults to `requests_per_minute`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive model failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 {
    42618
}
fn default_host() -> String {
    "127.0.0.1".into()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.agentwire/config.toml).
    ///
    /// Environment variables override the file:
    /// - `AGENTWIRE_HOST`, `AGENTWIRE_PORT` for the gateway bind address
    /// - `AGENTWIRE_LOG` for the log filter
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(host) = std::env::var("AGENTWIRE_HOST") {
            self.gateway.host = host;
        }
        if let Ok(port) = std::env::var("AGENTWIRE_PORT") {
            self.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("AGENTWIRE_PORT is not a port: {port}"))
            })?;
        }
        if let Ok(filter) = std::env::var("AGENTWIRE_LOG") {
            self.log_level = filter;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".agentwire")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.context.window_size == 0 {
            return Err(ConfigError::ValidationError(
                "context.window_size must be > 0".into(),
            ));
        }

        if self.context.cadence == ManagementCadence::EveryNIterations(0) {
            return Err(ConfigError::ValidationError(
                "context.cadence every_n_iterations must be > 0".into(),
            ));
        }

        if !(self.context.summary_ratio > 0.0 && self.context.summary_ratio <= 1.0) {
            return Err(ConfigError::ValidationError(
                "context.summary_ratio must be in (0, 1]".into(),
            ));
        }

        if self.heartbeat.enabled && (self.heartbeat.timeout_secs == 0 || self.heartbeat.interval_secs == 0) {
            return Err(ConfigError::ValidationError(
                "heartbeat interval_secs and timeout_secs must be > 0".into(),
            ));
        }

        if self.session.max_message_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "session.max_message_bytes must be > 0".into(),
            ));
        }

        if self.session.outbound_buffer == 0 {
            return Err(ConfigError::ValidationError(
                "session.outbound_buffer must be > 0".into(),
            ));
        }

        if self.executor.max_concurrency == Some(0) {
            return Err(ConfigError::ValidationError(
                "executor.max_concurrency must be > 0 when set".into(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "retry.max_attempts must be >= 1".into(),
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry.multiplier must be >= 1.0".into(),
            ));
        }

        if let Some(rl) = &self.rate_limit {
            if rl.requests_per_minute == 0 || rl.burst == Some(0) {
                return Err(ConfigError::ValidationError(
                    "rate_limit.requests_per_minute and burst must be > 0".into(),
                ));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.gateway.port, 42618);
        assert_eq!(config.context.strategy, ContextStrategy::SlidingWindow);
        assert_eq!(config.context.window_size, 40);
        assert_eq!(config.session.busy_policy, BusyPolicy::Reject);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.gateway.port, config.gateway.port);
        assert_eq!(parsed.retry.max_attempts, config.retry.max_attempts);
        assert_eq!(parsed.context.cadence, ManagementCadence::Disabled);
    }

    #[test]
    fn cadence_forms_parse() {
        let config: AppConfig = toml::from_str(
            r#"
[context]
strategy = "summarizing"
cadence = { every_n_iterations = 3 }
"#,
        )
        .unwrap();
        assert_eq!(config.context.strategy, ContextStrategy::Summarizing);
        assert_eq!(config.context.cadence, ManagementCadence::EveryNIterations(3));

        let config: AppConfig = toml::from_str(
            r#"
[context]
cadence = "every_iteration"
"#,
        )
        .unwrap();
        assert_eq!(config.context.cadence, ManagementCadence::EveryIteration);
    }

    #[test]
    fn cadence_fires_on_schedule() {
        assert!(!ManagementCadence::Disabled.fires_after(1));
        assert!(ManagementCadence::EveryIteration.fires_after(1));
        let every_two = ManagementCadence::EveryNIterations(2);
        assert!(!every_two.fires_after(1));
        assert!(every_two.fires_after(2));
        assert!(every_two.fires_after(4));
    }

    #[test]
    fn invalid_values_rejected() {
        let mut config = AppConfig::default();
        config.context.window_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.context.cadence = ManagementCadence::EveryNIterations(0);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.context.summary_ratio = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.heartbeat.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let result = AppConfig::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_ok());
        assert_eq!(result.unwrap().executor.mode, ExecutionMode::Concurrent);
    }

    #[test]
    fn load_from_file_applies_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[executor]
mode = "sequential"
tool_timeout_secs = 5
max_concurrency = 4

[session]
busy_policy = "queue"

[rate_limit]
requests_per_minute = 60
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.executor.mode, ExecutionMode::Sequential);
        assert_eq!(config.executor.tool_timeout(), Duration::from_secs(5));
        assert_eq!(config.executor.max_concurrency, Some(4));
        assert_eq!(config.session.busy_policy, BusyPolicy::Queue);
        assert_eq!(config.rate_limit.unwrap().requests_per_minute, 60);
        assert_eq!(config.heartbeat.interval_secs, 30);
    }

    #[test]
    fn invalid_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[context\nwindow_size = ").unwrap();
        assert!(matches!(
            AppConfig::load_from(file.path()),
            Err(ConfigError::ParseError { .. })
        ));
    }

    #[test]
    fn default_toml_generation() {
        let toml_str = AppConfig::default_toml();
        assert!(toml_str.contains("sliding_window"));
        assert!(toml_str.contains("42618"));
        assert!(toml_str.contains("log_level = \"info\""));
    }
}
