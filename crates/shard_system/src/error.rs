use crate::loader::LoaderError;
use crate::resolver::{DependencyResolutionError, FetchError};
use shard_api::{LifecycleState, ServiceError, ShardError, TransitionError};
use std::path::PathBuf;
use thiserror::Error;

/// Why a single shard did not reach `ACTIVE`.
///
/// Every variant is contained to the shard it names: the manager records it
/// in the load report and carries on with everything that does not depend on
/// that shard.
#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("{0}")]
    Archive(LoaderError),
    #[error("{path}: {reason}")]
    MissingDescriptor { path: PathBuf, reason: String },
    #[error("shard id '{id}' is already provided by {}", existing.display())]
    DuplicateShardId { id: String, existing: PathBuf },
    #[error("archive does not export a shard factory")]
    MissingFactory,
    #[error("{phase}: {source}")]
    Hook {
        phase: LifecycleState,
        source: ShardError,
    },
    #[error("dependency loader failed: {source}")]
    DependencyDeclaration { source: ShardError },
    #[error("{0}")]
    DependencyResolution(#[from] DependencyResolutionError),
    #[error("missing dependency '{missing}'")]
    MissingDependency { missing: String },
    #[error("{}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },
    #[error("dependency '{dependency}' failed to load")]
    DependencyFailed { dependency: String },
    #[error("illegal lifecycle transition: {0}")]
    Lifecycle(#[from] TransitionError),
    #[error("cannot prepare data directory {path}: {reason}")]
    DataDirectory { path: PathBuf, reason: String },
}

impl LoadError {
    /// Stable tag naming the failure class, used as the report's line prefix.
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::Archive(LoaderError::IncompatibleAbi { .. }) => "IncompatibleArchiveError",
            LoadError::Archive(_) => "ArchiveOpenError",
            LoadError::MissingDescriptor { .. } => "MissingDescriptorError",
            LoadError::DuplicateShardId { .. } => "DuplicateShardIdError",
            LoadError::MissingFactory => "MissingFactoryError",
            LoadError::Hook {
                source: ShardError::ContextNotBound { .. },
                ..
            } => "ContextNotBoundError",
            LoadError::Hook { .. } => "LifecycleHookError",
            LoadError::DependencyDeclaration { .. } => "DependencyDeclarationError",
            LoadError::DependencyResolution(_) => "DependencyResolutionError",
            LoadError::MissingDependency { .. } => "MissingDependencyError",
            LoadError::CircularDependency { .. } => "CircularDependencyError",
            LoadError::DependencyFailed { .. } => "DependencyFailedError",
            LoadError::Lifecycle(_) => "LifecycleTransitionError",
            LoadError::DataDirectory { .. } => "DataDirectoryError",
        }
    }

    /// One-line summary: `"<kind>: <message>"`.
    pub fn summary(&self) -> String {
        let message = self.to_string().replace('\n', " ");
        format!("{}: {}", self.kind(), message)
    }
}

/// Errors that stop the manager itself rather than a single shard.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cannot read shard directory {path}: {source}")]
    ShardDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shards are already loaded; shut down before loading again")]
    AlreadyLoaded,
    #[error("artifact fetcher could not be created: {0}")]
    Fetcher(#[from] FetchError),
    #[error("host services failed: {0}")]
    Services(#[from] ServiceError),
}
