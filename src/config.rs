//! Writer, pool and buffer configuration
//!
//! Every struct deserializes with defaults for missing fields, so a config
//! file only has to name what it changes. Validation happens once, when a
//! [`ConcurrentWriter`](crate::ConcurrentWriter) is constructed.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Invalid construction parameters. Raised at construction, never at runtime.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A parameter or combination of parameters is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// Config file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Config file extension is not yaml, yml or json
    #[error("Unsupported config format: {0}")]
    UnsupportedFormat(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// What a producer experiences when the buffer is at its safe capacity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait until a flush frees capacity
    #[default]
    Block,
    /// Flush synchronously on the producer's thread, then buffer
    FlushInline,
    /// Fail with `CapacityExceeded`
    Reject,
}

/// Whether pattern reads see buffered-but-unflushed updates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConsistency {
    /// Overlay buffered updates on backend results
    #[default]
    ReadYourWrites,
    /// Backend results only
    Eventual,
}

/// Session pool configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Sessions opened when the pool is created
    pub initial_size: usize,
    /// Sessions the pool may add on top of `initial_size` (None = unlimited)
    pub max_growth: Option<usize>,
    /// Idle sessions kept open when load subsides
    pub spare_sessions: usize,
    /// Borrow wait limit in milliseconds (None = wait forever)
    pub wait_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 2,
            max_growth: Some(8),
            spare_sessions: 2,
            wait_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    /// Upper bound on open sessions (None = unlimited)
    pub fn max_size(&self) -> Option<usize> {
        self.max_growth.map(|growth| self.initial_size + growth)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    /// Validate pool parameters
    pub fn validate(&self) -> ConfigResult<()> {
        if self.initial_size == 0 {
            return Err(ConfigError::Invalid(
                "pool initial_size must be at least 1".to_string(),
            ));
        }
        if let Some(max) = self.max_size() {
            if self.spare_sessions > max {
                return Err(ConfigError::Invalid(format!(
                    "pool spare_sessions ({}) exceeds the pool maximum size ({})",
                    self.spare_sessions, max
                )));
            }
        }
        Ok(())
    }
}

/// Update buffer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Hard ceiling on buffered-but-unflushed updates
    pub safe_capacity: usize,
    /// Maximum updates sent per flush batch
    pub flush_batch_size: usize,
    /// Behaviour at safe capacity
    pub overflow: OverflowPolicy,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            safe_capacity: 10_000,
            flush_batch_size: 500,
            overflow: OverflowPolicy::Block,
        }
    }
}

impl BufferConfig {
    /// Validate buffer parameters on their own
    pub fn validate(&self) -> ConfigResult<()> {
        if self.flush_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "buffer flush_batch_size must be at least 1".to_string(),
            ));
        }
        if self.safe_capacity == 0 {
            return Err(ConfigError::Invalid(
                "buffer safe_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration of a [`ConcurrentWriter`](crate::ConcurrentWriter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    pub pool: PoolConfig,
    pub buffer: BufferConfig,
    /// Buffer size that triggers an immediate background flush
    pub auto_flush_buffer_size: usize,
    /// Seconds without buffer activity before a background flush
    pub auto_flush_dormant_seconds: u64,
    /// Default consistency of pattern reads
    pub read_consistency: ReadConsistency,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            buffer: BufferConfig::default(),
            auto_flush_buffer_size: 1_000,
            auto_flush_dormant_seconds: 5,
            read_consistency: ReadConsistency::ReadYourWrites,
        }
    }
}

impl WriterConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a `.yaml`, `.yml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            Some("json") => Self::from_json_str(&contents),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or_default().to_string(),
            )),
        }
    }

    pub fn dormant_interval(&self) -> Duration {
        Duration::from_secs(self.auto_flush_dormant_seconds)
    }

    /// Validate all parameters and their relations
    pub fn validate(&self) -> ConfigResult<()> {
        self.pool.validate()?;
        self.buffer.validate()?;

        if self.auto_flush_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "auto_flush_buffer_size must be at least 1".to_string(),
            ));
        }
        if self.buffer.safe_capacity <= self.auto_flush_buffer_size {
            return Err(ConfigError::Invalid(format!(
                "buffer safe_capacity ({}) must exceed auto_flush_buffer_size ({})",
                self.buffer.safe_capacity, self.auto_flush_buffer_size
            )));
        }
        if self.buffer.flush_batch_size > self.auto_flush_buffer_size {
            return Err(ConfigError::Invalid(format!(
                "buffer flush_batch_size ({}) must not exceed auto_flush_buffer_size ({})",
                self.buffer.flush_batch_size, self.auto_flush_buffer_size
            )));
        }
        if self.auto_flush_dormant_seconds == 0 {
            return Err(ConfigError::Invalid(
                "auto_flush_dormant_seconds must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
