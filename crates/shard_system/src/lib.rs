//! Shard lifecycle manager with isolated loading and runtime dependency resolution.
//!
//! The manager discovers shard archives, gives each its own symbol namespace,
//! resolves the libraries each shard declares, computes a dependency-first
//! install order and drives every shard through its lifecycle:
//!
//! ```text
//! DISCOVERED -> CONTEXT_BOUND -> PRE_SETUP_RUNNING -> PRE_SETUP_DONE
//!   -> DEPENDENCIES_RESOLVED -> SETUP_RUNNING -> ACTIVE
//!   -> TEARDOWN_RUNNING -> TERMINATED
//! ```
//!
//! Failures stay contained to the smallest affected unit: one shard, one
//! command, one dependency edge. Every outcome lands in the [`LoadReport`].

pub mod commands;
pub mod error;
pub mod loader;
pub mod manager;
pub mod ordering;
pub mod report;
pub mod resolver;
pub mod services;

pub use commands::{
    CommandBinding, CommandBindingError, CommandDispatcher, CommandRegistrar, CommandRoute,
    CommandTable, DispatchError, RegistrationSummary, RouteOutcome,
};
pub use error::{LoadError, ManagerError};
pub use loader::{
    ArchiveOpener, DylibOpener, IsolatedLoader, LibraryEntry, LoaderArena, LoaderError,
    SharedNamespace, StaticArchives, SymbolSource, TableSource,
};
pub use manager::{ManagerConfig, ShardManager, ShardManagerBuilder};
pub use ordering::{plan_install, InstallPlan, OrderFailure};
pub use report::{LoadReport, ShardLoadResult, TeardownReport, TeardownResult};
pub use resolver::{
    ArtifactFetcher, DependencyResolutionError, FetchError, HttpFetcher, LibraryResolver,
    MemoryFetcher, ResolutionCause, ResolverConfig,
};
pub use services::{HostServices, LocalStorage, RpcChannel, ServiceMode};

// Re-export the plugin-facing API so hosts need a single dependency.
pub use shard_api;
