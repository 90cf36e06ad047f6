//! Local service backend: JSON files, `tracing`, and an in-process schema registry.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use shard_api::{ConfigPublisher, LogLevel, LogSink, ServiceError, ShardDescriptor, StorageService};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, trace, warn};

fn is_valid_store_name(store: &str) -> bool {
    !store.is_empty()
        && !store.starts_with('.')
        && store
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Key/value stores kept in memory and persisted as `<directory>/<store>.json`.
pub struct LocalStorage {
    directory: Option<PathBuf>,
    stores: DashMap<String, Map<String, Value>>,
}

impl LocalStorage {
    /// Storage that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            directory: None,
            stores: DashMap::new(),
        }
    }

    /// Opens a storage directory, loading every `*.json` store in it.
    pub async fn open(directory: impl Into<PathBuf>) -> Result<Self, ServiceError> {
        let directory = directory.into();
        let storage_error = |e: std::io::Error| ServiceError::Storage(format!("{}: {}", directory.display(), e));

        tokio::fs::create_dir_all(&directory).await.map_err(storage_error)?;
        let stores = DashMap::new();
        let mut entries = tokio::fs::read_dir(&directory).await.map_err(storage_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(storage_error)? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(store) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let contents = tokio::fs::read_to_string(&path).await.map_err(storage_error)?;
            match serde_json::from_str::<Map<String, Value>>(&contents) {
                Ok(values) => {
                    debug!("Loaded store '{}' ({} keys)", store, values.len());
                    stores.insert(store.to_string(), values);
                }
                Err(e) => warn!("Ignoring unreadable store {}: {}", path.display(), e),
            }
        }

        Ok(Self {
            directory: Some(directory),
            stores,
        })
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_deref()
    }

    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    fn read(&self, store: &str, key: &str) -> Option<Value> {
        self.stores.get(store)?.get(key).cloned()
    }

    /// Writes every store back to its file. A no-op for in-memory storage.
    pub async fn flush(&self) -> Result<(), ServiceError> {
        let Some(directory) = &self.directory else {
            return Ok(());
        };

        // Serialize first so no map guard is held across an await.
        let snapshots: Vec<(String, String)> = self
            .stores
            .iter()
            .map(|entry| {
                serde_json::to_string_pretty(entry.value())
                    .map(|body| (entry.key().clone(), body))
                    .map_err(|e| ServiceError::Serialization(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        for (store, body) in &snapshots {
            let path = directory.join(format!("{}.json", store));
            tokio::fs::write(&path, body)
                .await
                .map_err(|e| ServiceError::Storage(format!("{}: {}", path.display(), e)))?;
        }
        debug!("Flushed {} store(s) to {}", snapshots.len(), directory.display());
        Ok(())
    }
}

#[async_trait]
impl StorageService for LocalStorage {
    fn save(&self, store: &str, key: &str, value: Value) {
        if !is_valid_store_name(store) {
            warn!("Rejected write to invalid store name '{}'", store);
            return;
        }
        self.stores
            .entry(store.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    async fn get(&self, store: &str, key: &str) -> Option<Value> {
        self.read(store, key)
    }

    fn get_sync(&self, store: &str, key: &str) -> Option<Value> {
        self.read(store, key)
    }

    fn delete(&self, store: &str, key: &str) {
        if let Some(mut values) = self.stores.get_mut(store) {
            values.remove(key);
        }
    }
}

/// Forwards shard log lines into `tracing` with the shard id as a field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, shard_id: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => trace!(shard = %shard_id, "{}", message),
            LogLevel::Debug => debug!(shard = %shard_id, "{}", message),
            LogLevel::Info => info!(shard = %shard_id, "{}", message),
            LogLevel::Warn => warn!(shard = %shard_id, "{}", message),
            LogLevel::Error => error!(shard = %shard_id, "{}", message),
            LogLevel::Fatal => error!(shard = %shard_id, fatal = true, "{}", message),
        }
    }
}

/// Keeps the latest schema per shard. Nothing is forwarded anywhere.
#[derive(Default)]
pub struct LocalConfigPublisher {
    schemas: DashMap<String, Value>,
}

impl LocalConfigPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schema(&self, shard_id: &str) -> Option<Value> {
        self.schemas.get(shard_id).map(|schema| schema.clone())
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

impl ConfigPublisher for LocalConfigPublisher {
    fn publish(&self, shard: &ShardDescriptor, schema: Value) -> Result<(), ServiceError> {
        let replaced = self.schemas.insert(shard.id.clone(), schema).is_some();
        warn!(
            shard = %shard.id,
            "No control plane connected; config schema kept locally{}",
            if replaced { " (replaced)" } else { "" }
        );
        Ok(())
    }
}
