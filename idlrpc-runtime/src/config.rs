//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via IDLRPC_CONFIG)
//! 3. Environment variables

use idlrpc_protocol::{MAX_FRAME_SIZE, MAX_WIRE_LENGTH};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default call timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;
/// Default upper bound for per-call retries.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
/// Default capacity of each service's call queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Timeout applied when a call passes 0.
    pub default_timeout_ms: u64,
    /// Retries requested by a caller are clamped to this value.
    pub max_retries: u32,
    /// Per-service admission queue size.
    pub call_queue_capacity: usize,
    /// Worker count for services that declare a concurrency of 0.
    pub default_workers: usize,
    /// Frames declaring a larger length are rejected.
    pub max_frame_size: usize,
    /// Capture a backtrace when a service panics.
    pub stack_trace: bool,
    /// Log every call at debug level.
    pub call_trace: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            call_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            default_workers: 1,
            max_frame_size: MAX_FRAME_SIZE,
            stack_trace: false,
            call_trace: false,
        }
    }
}

impl RuntimeConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("IDLRPC_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: RuntimeConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(timeout) = std::env::var("IDLRPC_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.default_timeout_ms = ms;
            }
        }

        if let Ok(retries) = std::env::var("IDLRPC_MAX_RETRIES") {
            if let Ok(n) = retries.parse() {
                self.max_retries = n;
            }
        }

        if let Ok(capacity) = std::env::var("IDLRPC_QUEUE_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.call_queue_capacity = n;
            }
        }

        if let Ok(workers) = std::env::var("IDLRPC_DEFAULT_WORKERS") {
            if let Ok(n) = workers.parse() {
                self.default_workers = n;
            }
        }

        if let Ok(size) = std::env::var("IDLRPC_MAX_FRAME_SIZE") {
            if let Ok(n) = size.parse() {
                self.max_frame_size = n;
            }
        }

        if let Ok(enabled) = std::env::var("IDLRPC_STACK_TRACE") {
            self.stack_trace = enabled == "1" || enabled.to_lowercase() == "true";
        }

        if let Ok(enabled) = std::env::var("IDLRPC_CALL_TRACE") {
            self.call_trace = enabled == "1" || enabled.to_lowercase() == "true";
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_queue_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "call_queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::ValidationError(
                "max_frame_size must be greater than 0".to_string(),
            ));
        }
        if self.max_frame_size >= MAX_WIRE_LENGTH as usize {
            return Err(ConfigError::ValidationError(format!(
                "max_frame_size must be less than {}",
                MAX_WIRE_LENGTH
            )));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }

    /// Returns the timeout for a call, substituting the default for 0.
    pub fn call_timeout(&self, timeout_ms: u64) -> Duration {
        if timeout_ms == 0 {
            Duration::from_millis(self.default_timeout_ms)
        } else {
            Duration::from_millis(timeout_ms)
        }
    }

    /// Returns the worker count for a declared service concurrency.
    pub fn workers_for(&self, concurrency: usize) -> usize {
        if concurrency == 0 {
            self.default_workers.max(1)
        } else {
            concurrency
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
