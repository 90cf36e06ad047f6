//! Host services reachable from a bound shard context.
//!
//! The host decides once, at construction, which backend implements each
//! service. Shards only ever see the traits.

use crate::descriptor::ShardDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Logging
// ============================================================================

/// Severity of a shard log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    /// Unrecoverable condition inside the shard; the host keeps running
    Fatal,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination of shard log lines.
pub trait LogSink: Send + Sync {
    fn emit(&self, shard_id: &str, level: LogLevel, message: &str);
}

/// Log handle given to a shard, already tagged with its id.
#[derive(Clone)]
pub struct LogEmitter {
    shard_id: Arc<str>,
    sink: Arc<dyn LogSink>,
}

impl LogEmitter {
    pub fn new(shard_id: impl Into<Arc<str>>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            shard_id: shard_id.into(),
            sink,
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn emit(&self, level: LogLevel, message: impl AsRef<str>) {
        self.sink.emit(&self.shard_id, level, message.as_ref());
    }

    pub fn trace(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Trace, message);
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Debug, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Info, message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Error, message);
    }

    pub fn fatal(&self, message: impl AsRef<str>) {
        self.emit(LogLevel::Fatal, message);
    }
}

impl fmt::Debug for LogEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogEmitter")
            .field("shard_id", &self.shard_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Storage
// ============================================================================

/// Failures of host-provided services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The control-plane channel failed or returned an error
    #[error("channel error: {0}")]
    Channel(String),
    /// Local persistence failed
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Key/value storage grouped into named stores.
///
/// Writes are fire-and-forget. A read issued after a write is only guaranteed
/// to observe it when the backend is local; remote backends give no ordering
/// between an emitted write and a later read.
#[async_trait]
pub trait StorageService: Send + Sync {
    fn save(&self, store: &str, key: &str, value: Value);

    async fn get(&self, store: &str, key: &str) -> Option<Value>;

    /// Blocking variant of [`get`](Self::get).
    fn get_sync(&self, store: &str, key: &str) -> Option<Value>;

    fn delete(&self, store: &str, key: &str);
}

// ============================================================================
// Config schema
// ============================================================================

/// Receives a shard's configuration schema for an external dashboard.
///
/// Publishing the same shard twice replaces the earlier document.
pub trait ConfigPublisher: Send + Sync {
    fn publish(&self, shard: &ShardDescriptor, schema: Value) -> Result<(), ServiceError>;
}

/// The bundle of service handles bound into every shard context.
#[derive(Clone)]
pub struct ShardServices {
    pub storage: Arc<dyn StorageService>,
    pub log: Arc<dyn LogSink>,
    pub config: Arc<dyn ConfigPublisher>,
}
