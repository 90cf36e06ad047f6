//! Remote service backend: everything forwarded over an [`RpcChannel`].

use async_trait::async_trait;
use serde_json::{json, Value};
use shard_api::{ConfigPublisher, LogLevel, LogSink, ServiceError, ShardDescriptor, StorageService};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

pub const EVENT_STORAGE_SET: &str = "data_service:set";
pub const EVENT_STORAGE_GET: &str = "data_service:get";
pub const EVENT_STORAGE_DELETE: &str = "data_service:delete";
pub const EVENT_LOG: &str = "log";
pub const EVENT_CONFIG_REGISTER: &str = "config:register";

/// An opaque bidirectional channel to the control plane.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Sends an event without waiting for an answer.
    fn emit(&self, event: &str, payload: Value) -> Result<(), ServiceError>;

    /// Sends an event and waits for its acknowledgement payload.
    async fn request(&self, event: &str, payload: Value) -> Result<Value, ServiceError>;
}

pub struct RemoteStorage {
    channel: Arc<dyn RpcChannel>,
}

impl RemoteStorage {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }

    fn send(&self, event: &str, payload: Value) {
        if let Err(e) = self.channel.emit(event, payload) {
            warn!("Storage event '{}' was not delivered: {}", event, e);
        }
    }
}

#[async_trait]
impl StorageService for RemoteStorage {
    fn save(&self, store: &str, key: &str, value: Value) {
        self.send(EVENT_STORAGE_SET, json!({ "store": store, "key": key, "value": value }));
    }

    async fn get(&self, store: &str, key: &str) -> Option<Value> {
        match self
            .channel
            .request(EVENT_STORAGE_GET, json!({ "store": store, "key": key }))
            .await
        {
            Ok(Value::Null) => None,
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Storage read {}/{} failed: {}", store, key, e);
                None
            }
        }
    }

    fn get_sync(&self, store: &str, key: &str) -> Option<Value> {
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(self.get(store, key)))
            }
            Ok(_) => {
                warn!(
                    "Blocking storage read {}/{} on a current-thread runtime would deadlock; use get()",
                    store, key
                );
                None
            }
            Err(_) => futures::executor::block_on(self.get(store, key)),
        }
    }

    fn delete(&self, store: &str, key: &str) {
        self.send(EVENT_STORAGE_DELETE, json!({ "store": store, "key": key }));
    }
}

pub struct RemoteLogSink {
    channel: Arc<dyn RpcChannel>,
}

impl RemoteLogSink {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }
}

impl LogSink for RemoteLogSink {
    fn emit(&self, shard_id: &str, level: LogLevel, message: &str) {
        let payload = json!({ "shard": shard_id, "level": level, "message": message });
        if let Err(e) = self.channel.emit(EVENT_LOG, payload) {
            // Fall back to the host log so the line is not lost.
            warn!(shard = %shard_id, "[{}] {} (log channel failed: {})", level, message, e);
        }
    }
}

pub struct RemoteConfigPublisher {
    channel: Arc<dyn RpcChannel>,
}

impl RemoteConfigPublisher {
    pub fn new(channel: Arc<dyn RpcChannel>) -> Self {
        Self { channel }
    }
}

impl ConfigPublisher for RemoteConfigPublisher {
    fn publish(&self, shard: &ShardDescriptor, schema: Value) -> Result<(), ServiceError> {
        self.channel.emit(
            EVENT_CONFIG_REGISTER,
            json!({
                "shard": shard.id,
                "name": shard.name,
                "version": shard.version,
                "schema": schema,
            }),
        )
    }
}
