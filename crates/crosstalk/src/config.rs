use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queues: QueueConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub tools: ToolConfig,
    #[serde(default)]
    pub provider: ProviderRetryConfig,
    #[serde(default)]
    pub routing: Vec<RouteConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

// ============================================================================
// ServerConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_keep_alive_interval")]
    pub keep_alive_interval_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_seconds: default_request_timeout(),
            keep_alive_interval_seconds: default_keep_alive_interval(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    300
}

fn default_keep_alive_interval() -> u64 {
    15
}

// ============================================================================
// StorageConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_sessions_path")]
    pub sessions_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sessions_path: default_sessions_path(),
        }
    }
}

fn default_sessions_path() -> PathBuf {
    PathBuf::from(".crosstalk/sessions")
}

// ============================================================================
// QueueConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Maximum buffered messages per conversation before the oldest
    /// non-critical one is dropped and backpressure is signalled.
    #[serde(default = "default_queue_depth")]
    pub max_depth: usize,
    /// Idle time after which an empty conversation queue is garbage-collected.
    #[serde(default = "default_queue_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// How long to hold out-of-order messages for a missing sequence number
    /// before skipping ahead.
    #[serde(default = "default_reorder_timeout")]
    pub reorder_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_depth: default_queue_depth(),
            idle_timeout_seconds: default_queue_idle_timeout(),
            reorder_timeout_ms: default_reorder_timeout(),
        }
    }
}

fn default_queue_depth() -> usize {
    64
}

fn default_queue_idle_timeout() -> u64 {
    300
}

fn default_reorder_timeout() -> u64 {
    2000
}

// ============================================================================
// DedupConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Retention window for message-id deduplication.
    #[serde(default = "default_dedup_window")]
    pub window_seconds: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_seconds: default_dedup_window(),
        }
    }
}

fn default_dedup_window() -> u64 {
    300
}

// ============================================================================
// BackoffConfig
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_backoff_cap")]
    pub cap_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base(),
            multiplier: default_backoff_multiplier(),
            cap_ms: default_backoff_cap(),
        }
    }
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_cap() -> u64 {
    60_000
}

// ============================================================================
// HeartbeatConfig
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HeartbeatConfig {
    /// Expected interval between connector heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_seconds: u64,
    /// Consecutive missed heartbeats before the connection is torn down.
    #[serde(default = "default_heartbeat_misses")]
    pub misses_to_disconnect: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_heartbeat_interval(),
            misses_to_disconnect: default_heartbeat_misses(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_misses() -> u32 {
    3
}

// ============================================================================
// ToolConfig
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ToolConfig {
    #[serde(default = "default_tool_timeout")]
    pub timeout_seconds: u64,
    /// Largest tool output the executor will accept before classifying the
    /// invocation as a sandbox violation.
    #[serde(default = "default_tool_max_output")]
    pub max_output_bytes: usize,
    /// Most privileged side-effect class tools may declare.
    #[serde(default = "default_tool_side_effects")]
    pub max_side_effects: crate::tools::SideEffectClass,
    /// Re-dispatch a timed-out invocation exactly once before surfacing the
    /// failure to the agent.
    #[serde(default)]
    pub retry_on_timeout: bool,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_tool_timeout(),
            max_output_bytes: default_tool_max_output(),
            max_side_effects: default_tool_side_effects(),
            retry_on_timeout: false,
        }
    }
}

fn default_tool_side_effects() -> crate::tools::SideEffectClass {
    crate::tools::SideEffectClass::FileSystem
}

fn default_tool_timeout() -> u64 {
    30
}

fn default_tool_max_output() -> usize {
    256 * 1024
}

// ============================================================================
// ProviderRetryConfig
// ============================================================================

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProviderRetryConfig {
    /// Attempts per provider call when the provider rate-limits or fails
    /// transiently. Fatal provider errors are never retried.
    #[serde(default = "default_provider_retries")]
    pub max_retries: u32,
    #[serde(default = "default_provider_retry_backoff")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
}

impl Default for ProviderRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_provider_retries(),
            retry_backoff_ms: default_provider_retry_backoff(),
            max_tool_iterations: default_max_tool_iterations(),
        }
    }
}

fn default_provider_retries() -> u32 {
    3
}

fn default_provider_retry_backoff() -> u64 {
    500
}

fn default_max_tool_iterations() -> u32 {
    16
}

// ============================================================================
// RouteConfig / ChannelConfig
// ============================================================================

/// One routing rule: (platform kind, account pattern) → session strategy and
/// agent profile. `account` accepts `"*"` as a wildcard.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    pub platform: String,
    #[serde(default = "default_account_pattern")]
    pub account: String,
    #[serde(default = "default_session_strategy")]
    pub strategy: String,
    pub profile: String,
}

fn default_account_pattern() -> String {
    "*".to_string()
}

fn default_session_strategy() -> String {
    "per_conversation".to_string()
}

/// A channel to register at startup. The platform kind selects a connector
/// factory from the plugin registry.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub platform: String,
    pub account: String,
    #[serde(default)]
    pub token: Option<String>,
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

// ============================================================================
// Tests
// ============================================================================
