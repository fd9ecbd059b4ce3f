use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Largest number of bind parameters a single PostgreSQL statement accepts.
pub const MAX_BIND_PARAMS: usize = 65_535;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 500_000;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_BATCH_SIZE: usize = 5_000;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_TABLE: &str = "messages";

/// An opaque payload handed to the pipeline by a message source.
///
/// Cloning is cheap: the bytes are shared, never copied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Message(Arc<[u8]>);

impl Message {
    pub fn new(payload: impl Into<Arc<[u8]>>) -> Self {
        Self(payload.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Text view of the payload; invalid UTF-8 sequences are replaced.
    pub fn to_text_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self::from(value.into_bytes())
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self(Arc::from(value.as_bytes()))
    }
}

/// Write path used to persist accepted messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkMode {
    /// One single-row write per message on the caller's own path.
    Direct,
    /// Messages are queued; a worker pool issues one single-row write per message.
    DeferredSingle,
    /// Messages are queued; each worker accumulates a batch and writes it as one statement.
    BatchedMulti,
}

impl SinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkMode::Direct => "direct",
            SinkMode::DeferredSingle => "deferred",
            SinkMode::BatchedMulti => "batched",
        }
    }

    /// Whether messages pass through the intake channel and a worker pool.
    pub fn is_queued(&self) -> bool {
        !matches!(self, SinkMode::Direct)
    }
}

impl fmt::Display for SinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SinkMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" | "naive" => Ok(SinkMode::Direct),
            "deferred" | "deferred-single" | "buffered" => Ok(SinkMode::DeferredSingle),
            "batched" | "batched-multi" | "bulk" => Ok(SinkMode::BatchedMulti),
            _ => Err(ConfigError::UnknownMode(s.to_string())),
        }
    }
}

/// Which counter gates the one-shot completion signal.
///
/// `Attempted` counts failed writes too, so completion means "every expected message was
/// attempted". `Persisted` only counts writes the store acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CompletionPolicy {
    #[default]
    Attempted,
    Persisted,
}

impl CompletionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionPolicy::Attempted => "attempted",
            CompletionPolicy::Persisted => "persisted",
        }
    }
}

impl fmt::Display for CompletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompletionPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "attempted" => Ok(CompletionPolicy::Attempted),
            "persisted" => Ok(CompletionPolicy::Persisted),
            _ => Err(ConfigError::UnknownCompletionPolicy(s.to_string())),
        }
    }
}

/// Bounded retry for failed store writes. The default performs no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based); doubles each time.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.initial_backoff.saturating_mul(1u32 << retry.min(16))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown sink mode {0:?} (expected direct|deferred|batched)")]
    UnknownMode(String),
    #[error("unknown completion policy {0:?} (expected attempted|persisted)")]
    UnknownCompletionPolicy(String),
    #[error("worker count must be > 0")]
    ZeroWorkers,
    #[error("intake channel capacity must be > 0")]
    ZeroChannelCapacity,
    #[error("batch size {batch_size} out of range (expected 1..={max})")]
    BatchSizeOutOfRange { batch_size: usize, max: usize },
    #[error("flush interval must be > 0")]
    ZeroFlushInterval,
    #[error("invalid table name {0:?}")]
    InvalidTable(String),
    #[error("expected total must be > 0 when set")]
    ZeroExpectedTotal,
}

/// Pipeline configuration, fixed for the lifetime of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    pub mode: SinkMode,
    /// Size of the worker pool for queued modes. Ignored by `Direct`.
    pub workers: usize,
    /// Size flush threshold for `BatchedMulti`.
    pub batch_size: usize,
    /// Time flush threshold for `BatchedMulti`.
    pub flush_interval: Duration,
    pub channel_capacity: usize,
    /// Message count that triggers the one-shot completion signal, if known.
    pub expected_total: Option<u64>,
    pub completion: CompletionPolicy,
    pub retry: RetryPolicy,
    pub table: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            mode: SinkMode::Direct,
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            expected_total: None,
            completion: CompletionPolicy::default(),
            retry: RetryPolicy::default(),
            table: DEFAULT_TABLE.to_string(),
        }
    }
}

impl SinkConfig {
    pub fn with_mode(mode: SinkMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::ZeroWorkers);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        if self.batch_size == 0 || self.batch_size > MAX_BIND_PARAMS {
            return Err(ConfigError::BatchSizeOutOfRange {
                batch_size: self.batch_size,
                max: MAX_BIND_PARAMS,
            });
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        if !is_valid_table_name(&self.table) {
            return Err(ConfigError::InvalidTable(self.table.clone()));
        }
        if self.expected_total == Some(0) {
            return Err(ConfigError::ZeroExpectedTotal);
        }
        Ok(())
    }
}

/// Accepts `name` or `schema.name`, each part a plain unquoted SQL identifier.
fn is_valid_table_name(table: &str) -> bool {
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        let mut chars = part.chars();
        let Some(first) = chars.next() else {
            return false;
        };
        part.len() <= 63
            && (first.is_ascii_alphabetic() || first == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}
