//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - facegate.toml (default configuration)
//! - facegate.local.toml (git-ignored local overrides)
//! - Environment variables (FACEGATE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # facegate.toml
//! [http]
//! host = "0.0.0.0"
//! port = 8080
//!
//! [throttle.messages]
//! rate_limit = 10
//! period_secs = 30.0
//!
//! [worker]
//! command = ["/usr/local/bin/identicore-worker"]
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! FACEGATE_HTTP__PORT=9000
//! FACEGATE_DISPATCH__JOB_TIMEOUT_MS=5000
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration struct
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub throttle: ThrottleConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration for the WebSocket API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// HTTP server bind address
    #[serde(default = "default_http_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Path of the WebSocket endpoint (`/ws` is always served as an alias)
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Allowed CORS origins (empty = same-origin only, unless cors_allow_all is true)
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Explicitly allow all CORS origins (dev mode opt-in)
    #[serde(default)]
    pub cors_allow_all: bool,

    /// Maximum size of a single WebSocket message in bytes
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Sliding-window limits for one admission point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions allowed per rolling period
    pub rate_limit: usize,

    /// Length of the rolling period in seconds
    pub period_secs: f64,
}

impl RateLimitConfig {
    /// The period as a `Duration`, or `None` when `period_secs` is not a
    /// positive number that fits in one.
    pub fn period(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.period_secs)
            .ok()
            .filter(|period| !period.is_zero())
    }
}

/// Admission control configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Per-client limit on non-ping frames
    #[serde(default = "default_message_limit")]
    pub messages: RateLimitConfig,

    /// Global limit on new connections
    #[serde(default = "default_connection_limit")]
    pub connections: RateLimitConfig,

    /// Maximum number of client windows kept in memory
    #[serde(default = "default_client_capacity")]
    pub client_capacity: usize,

    /// Client windows idle for longer than this are evicted first when the cache is full
    #[serde(default = "default_client_idle_secs")]
    pub client_idle_secs: u64,
}

impl ThrottleConfig {
    pub fn client_idle(&self) -> Duration {
        Duration::from_secs(self.client_idle_secs)
    }
}

/// Dispatch loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Per-job deadline in milliseconds
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,

    /// How long an idle dispatch loop waits on the queue before re-checking for shutdown
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long the dispatch thread waits for a connection to confirm a send
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,

    /// Upper bound on draining the worker pool at shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl DispatchConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Worker pool and face engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of worker threads. 0 = use all available CPU cores
    #[serde(default)]
    pub threads: usize,

    /// Detection threshold used for identification requests
    #[serde(default = "default_identify_threshold")]
    pub identify_threshold: f64,

    /// Detection threshold used for verification requests
    #[serde(default = "default_verify_threshold")]
    pub verify_threshold: f64,

    /// argv of the external engine program (empty = no engine configured)
    #[serde(default)]
    pub command: Vec<String>,

    /// A child process running longer than this is killed
    #[serde(default = "default_process_timeout_ms")]
    pub process_timeout_ms: u64,
}

impl WorkerConfig {
    /// Resolved pool size.
    pub fn pool_size(&self) -> usize {
        if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        }
    }

    pub fn process_timeout(&self) -> Duration {
        Duration::from_millis(self.process_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full EnvFilter directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path; stdout when unset
    #[serde(default)]
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_http_host() -> String {
    "127.0.0.1".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_ws_path() -> String {
    "/api/v1/core/ws".to_string()
}
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}
fn default_max_message_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}
fn default_message_limit() -> RateLimitConfig {
    RateLimitConfig {
        rate_limit: 10,
        period_secs: 30.0,
    }
}
fn default_connection_limit() -> RateLimitConfig {
    RateLimitConfig {
        rate_limit: 500,
        period_secs: 10.0,
    }
}
fn default_client_capacity() -> usize {
    10_000
}
fn default_client_idle_secs() -> u64 {
    600
}
fn default_job_timeout_ms() -> u64 {
    15_000
}
fn default_poll_interval_ms() -> u64 {
    100
}
fn default_delivery_timeout_ms() -> u64 {
    15_000
}
fn default_shutdown_timeout_ms() -> u64 {
    10_000
}
fn default_identify_threshold() -> f64 {
    0.65
}
fn default_verify_threshold() -> f64 {
    0.7
}
fn default_process_timeout_ms() -> u64 {
    15_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations
    ///
    /// Merges in order:
    /// 1. facegate.toml (base configuration)
    /// 2. facegate.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (FACEGATE_* prefix)
    pub fn load() -> Result<Self, ConfigError> {
        let config: Config = Figment::new()
            .merge(Toml::file("facegate.toml"))
            .merge(Toml::file("facegate.local.toml"))
            .merge(Env::prefixed("FACEGATE_").split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from specific file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("FACEGATE_").split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, limit) in [
            ("throttle.messages", &self.throttle.messages),
            ("throttle.connections", &self.throttle.connections),
        ] {
            if limit.rate_limit == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name}.rate_limit must be a positive integer"
                )));
            }
            if limit.period().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{name}.period_secs must be a positive number"
                )));
            }
        }
        if self.throttle.client_capacity == 0 {
            return Err(ConfigError::Invalid(
                "throttle.client_capacity must be positive".to_string(),
            ));
        }
        if self.dispatch.job_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.job_timeout_ms must be positive".to_string(),
            ));
        }
        if self.dispatch.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            http: HttpConfig::default(),
            throttle: ThrottleConfig::default(),
            dispatch: DispatchConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            host: default_http_host(),
            port: default_http_port(),
            ws_path: default_ws_path(),
            cors_origins: default_cors_origins(),
            cors_allow_all: false,
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            messages: default_message_limit(),
            connections: default_connection_limit(),
            client_capacity: default_client_capacity(),
            client_idle_secs: default_client_idle_secs(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            job_timeout_ms: default_job_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            threads: 0, // 0 = use all available CPU cores
            identify_threshold: default_identify_threshold(),
            verify_threshold: default_verify_threshold(),
            command: Vec::new(),
            process_timeout_ms: default_process_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}
