//! Host services handed to shards.
//!
//! The backend is chosen once, when [`HostServices`] is built: either every
//! service is local (files, `tracing`, an in-process schema registry) or every
//! service forwards through one [`RpcChannel`]. Nothing branches per call.

mod local;
mod remote;

pub use local::{LocalConfigPublisher, LocalStorage, TracingLogSink};
pub use remote::{
    RemoteConfigPublisher, RemoteLogSink, RemoteStorage, RpcChannel, EVENT_CONFIG_REGISTER,
    EVENT_LOG, EVENT_STORAGE_DELETE, EVENT_STORAGE_GET, EVENT_STORAGE_SET,
};

use shard_api::{ConfigPublisher, LogSink, ServiceError, ShardServices, StorageService};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    Local,
    Remote,
}

/// The service backends shared by every shard of one manager.
#[derive(Clone)]
pub struct HostServices {
    storage: Arc<dyn StorageService>,
    log: Arc<dyn LogSink>,
    config: Arc<dyn ConfigPublisher>,
    local_storage: Option<Arc<LocalStorage>>,
    local_config: Option<Arc<LocalConfigPublisher>>,
    mode: ServiceMode,
}

impl HostServices {
    /// Local backend persisting stores under `store_directory`.
    pub async fn local(store_directory: impl Into<PathBuf>) -> Result<Self, ServiceError> {
        let storage = Arc::new(LocalStorage::open(store_directory).await?);
        if let Some(directory) = storage.directory() {
            info!("Local storage at {}", directory.display());
        }
        Ok(Self::with_local_storage(storage))
    }

    /// Local backend that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::with_local_storage(Arc::new(LocalStorage::in_memory()))
    }

    fn with_local_storage(storage: Arc<LocalStorage>) -> Self {
        let config = Arc::new(LocalConfigPublisher::new());
        Self {
            storage: storage.clone(),
            log: Arc::new(TracingLogSink),
            config: config.clone(),
            local_storage: Some(storage),
            local_config: Some(config),
            mode: ServiceMode::Local,
        }
    }

    /// Remote backend forwarding every call through `channel`.
    pub fn remote(channel: Arc<dyn RpcChannel>) -> Self {
        Self {
            storage: Arc::new(RemoteStorage::new(channel.clone())),
            log: Arc::new(RemoteLogSink::new(channel.clone())),
            config: Arc::new(RemoteConfigPublisher::new(channel)),
            local_storage: None,
            local_config: None,
            mode: ServiceMode::Remote,
        }
    }

    pub fn mode(&self) -> ServiceMode {
        self.mode
    }

    /// The handles bound into each shard context.
    pub fn shard_services(&self) -> ShardServices {
        ShardServices {
            storage: self.storage.clone(),
            log: self.log.clone(),
            config: self.config.clone(),
        }
    }

    pub fn local_storage(&self) -> Option<&Arc<LocalStorage>> {
        self.local_storage.as_ref()
    }

    /// Schemas published while running locally.
    pub fn local_config(&self) -> Option<&Arc<LocalConfigPublisher>> {
        self.local_config.as_ref()
    }

    /// Persists local stores. Remote backends own their persistence.
    pub async fn flush(&self) -> Result<(), ServiceError> {
        match &self.local_storage {
            Some(storage) => storage.flush().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_local_services_share_one_store() {
        let dir = TempDir::new().unwrap();
        let services = HostServices::local(dir.path().join("store")).await.unwrap();
        assert_eq!(services.mode(), ServiceMode::Local);

        let first = services.shard_services();
        let second = services.shard_services();
        first.storage.save("shared", "k", serde_json::json!(true));
        assert_eq!(second.storage.get_sync("shared", "k"), Some(serde_json::json!(true)));

        services.flush().await.unwrap();
        assert!(dir.path().join("store").join("shared.json").exists());
    }
}
