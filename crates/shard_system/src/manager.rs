//! # Shard Lifecycle Manager
//!
//! Discovers shard archives and drives each one through its lifecycle. Loading
//! runs in five phases:
//!
//! 1. **Discovery**: open every archive, read its descriptor, reject duplicate
//!    ids and construct the shard through its factory
//! 2. **Binding**: assign data directory, services and symbol resolver
//! 3. **Preparation**: per shard and in parallel, run pre-setup and resolve the
//!    declared libraries; all tasks are joined before ordering starts
//! 4. **Ordering**: compute the dependency-first install order
//! 5. **Setup**: run setup in install order and bind commands
//!
//! A failure in any phase is recorded against the shard it belongs to and
//! propagates only to the shards that depend on it.

use crate::commands::{CommandDispatcher, CommandRegistrar, CommandTable};
use crate::error::{LoadError, ManagerError};
use crate::loader::{ArchiveOpener, DylibOpener, IsolatedLoader, LoaderArena, SharedNamespace};
use crate::ordering::{plan_install, OrderFailure};
use crate::report::{LoadReport, ShardLoadResult, TeardownReport, TeardownResult};
use crate::resolver::{ArtifactFetcher, HttpFetcher, LibraryResolver, ResolverConfig};
use crate::services::HostServices;
use futures::future::join_all;
use futures::FutureExt;
use shard_api::{
    panic_message, BoundContext, ContextController, DependencyLoader, ExportTable, LifecycleState,
    Shard, ShardContext, ShardDescriptor, ShardError,
};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Filesystem layout and resolver settings of one manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub data_directory: PathBuf,
    /// Archives live here; each shard's data directory is `<shard_directory>/<id>`
    pub shard_directory: PathBuf,
    pub resolver: ResolverConfig,
}

impl ManagerConfig {
    /// Default layout under `data_directory`: `shards/` and `libraries/`.
    pub fn new(data_directory: impl Into<PathBuf>) -> Self {
        let data_directory = data_directory.into();
        Self {
            shard_directory: data_directory.join("shards"),
            resolver: ResolverConfig {
                local_repository: data_directory.join("libraries"),
                ..ResolverConfig::default()
            },
            data_directory,
        }
    }
}

/// Builder for [`ShardManager`].
pub struct ShardManagerBuilder {
    config: ManagerConfig,
    services: Option<HostServices>,
    opener: Option<Arc<dyn ArchiveOpener>>,
    fetcher: Option<Arc<dyn ArtifactFetcher>>,
    dispatcher: Option<Arc<dyn CommandDispatcher>>,
    shared: ExportTable,
}

impl ShardManagerBuilder {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            services: None,
            opener: None,
            fetcher: None,
            dispatcher: None,
            shared: ExportTable::new(),
        }
    }

    /// Service backends; in-memory local services when not set.
    pub fn services(mut self, services: HostServices) -> Self {
        self.services = Some(services);
        self
    }

    /// How archives are opened; native dynamic libraries when not set.
    pub fn opener(mut self, opener: Arc<dyn ArchiveOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    /// How artifacts are downloaded; HTTP when not set.
    pub fn fetcher(mut self, fetcher: Arc<dyn ArtifactFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Where commands are registered; a fresh [`CommandTable`] when not set.
    pub fn dispatcher(mut self, dispatcher: Arc<dyn CommandDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Adds a host-provided symbol to the shared namespace.
    pub fn shared_export<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: T) -> Self {
        self.shared = self.shared.export(name, value);
        self
    }

    pub fn build(self) -> Result<ShardManager, ManagerError> {
        let fetcher: Arc<dyn ArtifactFetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(HttpFetcher::new(self.config.resolver.timeout)?),
        };
        let dispatcher: Arc<dyn CommandDispatcher> = self
            .dispatcher
            .unwrap_or_else(|| Arc::new(CommandTable::new()));

        Ok(ShardManager {
            services: self.services.unwrap_or_else(HostServices::in_memory),
            opener: self.opener.unwrap_or_else(|| Arc::new(DylibOpener)),
            fetcher,
            shared: Arc::new(SharedNamespace::new(self.shared)),
            arena: Arc::new(LoaderArena::new()),
            registrar: CommandRegistrar::new(dispatcher),
            records: RwLock::new(Vec::new()),
            install_order: parking_lot::Mutex::new(Vec::new()),
            activation_order: parking_lot::Mutex::new(Vec::new()),
            loaded: AtomicBool::new(false),
            config: self.config,
        })
    }
}

// ============================================================================
// Per-shard state
// ============================================================================

#[derive(Default)]
struct Progress {
    elapsed: Duration,
    error: Option<LoadError>,
    libraries: Vec<PathBuf>,
    commands_bound: usize,
    command_errors: Vec<String>,
}

/// Everything the manager owns for one shard.
///
/// Field order is drop order. The instance, the context and anything the
/// shard handed over must go before the loader, which keeps the archive mapped.
struct ShardRecord {
    instance: Mutex<Option<Box<dyn Shard>>>,
    controller: ContextController,
    context: ShardContext,
    descriptor: Arc<ShardDescriptor>,
    loader: Arc<IsolatedLoader>,
    archive_path: PathBuf,
    discovery_index: usize,
    progress: parking_lot::Mutex<Progress>,
    arena: Arc<LoaderArena>,
}

impl ShardRecord {
    fn id(&self) -> &str {
        &self.descriptor.id
    }

    fn state(&self) -> LifecycleState {
        self.controller.state()
    }

    fn is_active(&self) -> bool {
        self.state() == LifecycleState::Active && !self.controller.is_failed()
    }

    fn add_elapsed(&self, elapsed: Duration) {
        self.progress.lock().elapsed += elapsed;
    }

    /// Freezes the lifecycle, hides the loader from peers and keeps the first
    /// error recorded.
    fn fail(&self, error: LoadError) {
        let state = self.controller.mark_failed();
        self.arena.mark_unready(self.id());
        error!(shard = %self.id(), phase = %state, "{}", error.summary());
        let mut progress = self.progress.lock();
        if progress.error.is_none() {
            progress.error = Some(error);
        }
    }

    fn advance(&self, to: LifecycleState) -> Result<(), LoadError> {
        self.controller.advance(to).map_err(LoadError::from)
    }

    fn result(&self) -> ShardLoadResult {
        let progress = self.progress.lock();
        ShardLoadResult {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            version: Some(self.descriptor.version.clone()),
            archive: self.archive_path.clone(),
            duration_ms: progress.elapsed.as_millis() as u64,
            success: self.is_active(),
            state: self.state(),
            error: progress.error.as_ref().map(LoadError::summary),
            commands_bound: progress.commands_bound,
            command_errors: progress.command_errors.clone(),
            libraries: progress.libraries.clone(),
        }
    }
}

/// Runs a hook future, turning a panic into [`ShardError::Panicked`].
async fn guarded<F>(hook: F) -> Result<(), ShardError>
where
    F: std::future::Future<Output = Result<(), ShardError>>,
{
    match AssertUnwindSafe(hook).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ShardError::Panicked(panic_message(panic.as_ref()))),
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owns every shard for the lifetime of the process.
pub struct ShardManager {
    config: ManagerConfig,
    services: HostServices,
    opener: Arc<dyn ArchiveOpener>,
    fetcher: Arc<dyn ArtifactFetcher>,
    shared: Arc<SharedNamespace>,
    arena: Arc<LoaderArena>,
    registrar: CommandRegistrar,
    records: RwLock<Vec<Arc<ShardRecord>>>,
    install_order: parking_lot::Mutex<Vec<String>>,
    activation_order: parking_lot::Mutex<Vec<String>>,
    loaded: AtomicBool,
}

impl ShardManager {
    pub fn builder(config: ManagerConfig) -> ShardManagerBuilder {
        ShardManagerBuilder::new(config)
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn shard_directory(&self) -> &Path {
        &self.config.shard_directory
    }

    pub fn services(&self) -> &HostServices {
        &self.services
    }

    pub fn registrar(&self) -> &CommandRegistrar {
        &self.registrar
    }

    pub fn arena(&self) -> &Arc<LoaderArena> {
        &self.arena
    }

    pub fn loader_of(&self, id: &str) -> Option<Arc<IsolatedLoader>> {
        self.arena.get(id)
    }

    /// Ids in the computed install order of the last load.
    pub fn install_order(&self) -> Vec<String> {
        self.install_order.lock().clone()
    }

    /// Ids in the order they reached `ACTIVE`.
    pub fn activation_order(&self) -> Vec<String> {
        self.activation_order.lock().clone()
    }

    pub async fn state_of(&self, id: &str) -> Option<LifecycleState> {
        self.find(id).await.map(|record| record.state())
    }

    /// The context handed to a shard, for host-side capability calls.
    pub async fn context_of(&self, id: &str) -> Option<ShardContext> {
        self.find(id).await.map(|record| record.context.clone())
    }

    pub async fn active_shards(&self) -> Vec<String> {
        self.records
            .read()
            .await
            .iter()
            .filter(|record| record.is_active())
            .map(|record| record.id().to_string())
            .collect()
    }

    async fn find(&self, id: &str) -> Option<Arc<ShardRecord>> {
        self.records
            .read()
            .await
            .iter()
            .find(|record| record.id() == id)
            .cloned()
    }

    /// Lists the archives in the shard directory, sorted by file name.
    ///
    /// Creates the directory when it does not exist. Sub-directories are
    /// ignored; files the archive opener does not accept are skipped with a
    /// warning.
    pub async fn discover_archives(&self) -> Result<Vec<PathBuf>, ManagerError> {
        let directory = &self.config.shard_directory;
        let directory_error = |source| ManagerError::ShardDirectory {
            path: directory.clone(),
            source,
        };

        tokio::fs::create_dir_all(directory).await.map_err(directory_error)?;
        let mut entries = tokio::fs::read_dir(directory).await.map_err(directory_error)?;
        let mut archives = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(directory_error)? {
            let path = entry.path();
            if entry.file_type().await.map(|kind| kind.is_dir()).unwrap_or(false) {
                continue;
            }
            if self.opener.accepts(&path) {
                archives.push(path);
            } else {
                warn!("Skipping {}: not a shard archive", path.display());
            }
        }

        archives.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        debug!("Discovered {} archive(s) in {}", archives.len(), directory.display());
        Ok(archives)
    }

    /// Loads every shard in the shard directory.
    ///
    /// # Returns
    ///
    /// The load report. Per-shard failures are part of the report; an `Err`
    /// means the manager could not run at all.
    pub async fn load_all(&self) -> Result<LoadReport, ManagerError> {
        if self.loaded.swap(true, Ordering::SeqCst) {
            return Err(ManagerError::AlreadyLoaded);
        }
        let started = Instant::now();

        let archives = match self.discover_archives().await {
            Ok(archives) => archives,
            Err(e) => {
                self.loaded.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        info!(
            "Starting shard loading for {} discovered archive(s)",
            archives.len()
        );

        // Phase 1: open archives and construct instances
        info!("Phase 1: Opening archives");
        let mut early: Vec<(usize, ShardLoadResult)> = Vec::new();
        let mut failed_ids: HashSet<String> = HashSet::new();
        let mut records: Vec<Arc<ShardRecord>> = Vec::new();
        let mut claimed: HashMap<String, PathBuf> = HashMap::new();

        for (index, path) in archives.into_iter().enumerate() {
            let opened = Instant::now();
            match self.open_archive(index, &path, &claimed) {
                Ok(record) => {
                    record.add_elapsed(opened.elapsed());
                    info!(
                        shard = %record.id(),
                        "Opened {} v{}",
                        record.descriptor.name,
                        record.descriptor.version
                    );
                    claimed.insert(record.id().to_string(), path);
                    records.push(record);
                }
                Err((descriptor, error)) => {
                    error!("Failed to open {}: {}", path.display(), error.summary());
                    if let Some(descriptor) = &descriptor {
                        if !claimed.contains_key(&descriptor.id) {
                            failed_ids.insert(descriptor.id.clone());
                        }
                    }
                    early.push((index, discovery_failure(&path, descriptor.as_ref(), error, opened.elapsed())));
                }
            }
        }
        info!("Phase 1 complete: {} shard(s) constructed", records.len());

        *self.records.write().await = records.clone();

        // Phase 2: bind contexts
        info!("Phase 2: Binding shard contexts");
        for record in &records {
            let bound = Instant::now();
            if let Err(error) = self.bind(record).await {
                record.fail(error);
            }
            record.add_elapsed(bound.elapsed());
        }

        // Phase 3: pre-setup and dependency resolution, one task per shard
        info!("Phase 3: Running pre-setup and resolving dependencies");
        let preparing: Vec<Arc<ShardRecord>> = records
            .iter()
            .filter(|record| record.state() == LifecycleState::ContextBound && !record.controller.is_failed())
            .cloned()
            .collect();
        let tasks = preparing.iter().map(|record| {
            let record = record.clone();
            let fetcher = self.fetcher.clone();
            let config = self.config.resolver.clone();
            tokio::spawn(async move {
                let prepared = Instant::now();
                if let Err(error) = prepare(&record, fetcher, &config).await {
                    record.fail(error);
                }
                record.add_elapsed(prepared.elapsed());
            })
        });
        for (record, joined) in preparing.iter().zip(join_all(tasks).await) {
            if let Err(e) = joined {
                record.fail(LoadError::Hook {
                    phase: record.state(),
                    source: ShardError::Panicked(e.to_string()),
                });
            }
        }

        // Phase 4: install order
        info!("Phase 4: Computing install order");
        for record in records.iter().filter(|record| record.controller.is_failed()) {
            failed_ids.insert(record.id().to_string());
        }
        let candidates: Vec<(String, Vec<String>)> = records
            .iter()
            .filter(|record| {
                record.state() == LifecycleState::DependenciesResolved && !record.controller.is_failed()
            })
            .map(|record| (record.id().to_string(), record.descriptor.dependencies.clone()))
            .collect();
        let plan = plan_install(&candidates, &failed_ids);
        for (id, failure) in plan.failures {
            if let Some(record) = records.iter().find(|record| record.id() == id) {
                record.fail(match failure {
                    OrderFailure::Missing { missing } => LoadError::MissingDependency { missing },
                    OrderFailure::Cycle { cycle } => LoadError::CircularDependency { cycle },
                    OrderFailure::DependencyFailed { dependency } => LoadError::DependencyFailed { dependency },
                });
            }
        }
        info!("Install order: [{}]", plan.order.join(", "));
        *self.install_order.lock() = plan.order.clone();

        // Phase 5: setup in install order
        info!("Phase 5: Setting up shards");
        for id in &plan.order {
            let Some(record) = records.iter().find(|record| record.id() == id.as_str()) else {
                continue;
            };
            let setup = Instant::now();
            match self.set_up(record, &records).await {
                Ok(()) => {
                    self.activation_order.lock().push(id.clone());
                    self.bind_commands(record);
                    info!(shard = %id, "Shard is active");
                }
                Err(error) => record.fail(error),
            }
            record.add_elapsed(setup.elapsed());
        }

        let mut results: Vec<(usize, ShardLoadResult)> = records
            .iter()
            .map(|record| (record.discovery_index, record.result()))
            .collect();
        results.extend(early);
        results.sort_by_key(|(index, _)| *index);

        let report = LoadReport {
            results: results.into_iter().map(|(_, result)| result).collect(),
            install_order: plan.order,
            total_duration_ms: started.elapsed().as_millis() as u64,
        };
        if report.failures() > 0 {
            warn!("Failed to load {} shard(s)", report.failures());
        }
        info!(
            "Shard loading complete: {} of {} shard(s) active from {}",
            report.successes(),
            report.results.len(),
            self.config.shard_directory.display()
        );
        report.log();
        Ok(report)
    }

    /// Opens one archive and constructs its shard instance.
    ///
    /// On failure returns the descriptor, if it could be read, with the error.
    fn open_archive(
        &self,
        index: usize,
        path: &Path,
        claimed: &HashMap<String, PathBuf>,
    ) -> Result<Arc<ShardRecord>, (Option<ShardDescriptor>, LoadError)> {
        let source = self
            .opener
            .open(path)
            .map_err(|e| (None, LoadError::Archive(e)))?;
        let loader = Arc::new(IsolatedLoader::new(path, source, self.shared.clone()));

        let descriptor = match loader.metadata() {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                return Err((
                    None,
                    LoadError::MissingDescriptor {
                        path: path.to_path_buf(),
                        reason: "archive embeds no descriptor".to_string(),
                    },
                ))
            }
            Err(e) => {
                return Err((
                    None,
                    LoadError::MissingDescriptor {
                        path: path.to_path_buf(),
                        reason: e.to_string(),
                    },
                ))
            }
        };

        if let Some(existing) = claimed.get(&descriptor.id) {
            let error = LoadError::DuplicateShardId {
                id: descriptor.id.clone(),
                existing: existing.clone(),
            };
            return Err((Some(descriptor), error));
        }

        let Some(factory) = loader.exports().and_then(ExportTable::factory) else {
            return Err((Some(descriptor), LoadError::MissingFactory));
        };

        let controller = ContextController::new();
        let context = controller.context();
        let created = std::panic::catch_unwind(AssertUnwindSafe(|| factory.create(context.clone())))
            .unwrap_or_else(|panic| Err(ShardError::Panicked(panic_message(panic.as_ref()))));
        let instance = match created {
            Ok(instance) => instance,
            Err(source) => {
                let error = LoadError::Hook {
                    phase: LifecycleState::Discovered,
                    source,
                };
                return Err((Some(descriptor), error));
            }
        };

        self.arena
            .insert(&descriptor.id, loader.clone(), descriptor.dependencies.clone());

        Ok(Arc::new(ShardRecord {
            instance: Mutex::new(Some(instance)),
            controller,
            context,
            descriptor: Arc::new(descriptor),
            loader,
            archive_path: path.to_path_buf(),
            discovery_index: index,
            progress: parking_lot::Mutex::new(Progress::default()),
            arena: self.arena.clone(),
        }))
    }

    /// `DISCOVERED -> CONTEXT_BOUND`.
    async fn bind(&self, record: &ShardRecord) -> Result<(), LoadError> {
        let data_directory = self.config.shard_directory.join(record.id());
        tokio::fs::create_dir_all(&data_directory)
            .await
            .map_err(|e| LoadError::DataDirectory {
                path: data_directory.clone(),
                reason: e.to_string(),
            })?;

        record.controller.bind(BoundContext {
            descriptor: record.descriptor.clone(),
            data_directory,
            services: self.services.shard_services(),
            symbols: self.arena.resolver_for(record.id()),
        })?;
        self.arena.mark_ready(record.id());
        debug!(shard = %record.id(), "Context bound");
        Ok(())
    }

    /// `DEPENDENCIES_RESOLVED -> SETUP_RUNNING -> ACTIVE`.
    async fn set_up(&self, record: &ShardRecord, records: &[Arc<ShardRecord>]) -> Result<(), LoadError> {
        for dependency in &record.descriptor.dependencies {
            let active = records
                .iter()
                .find(|other| other.id() == dependency.as_str())
                .is_some_and(|other| other.is_active());
            if !active {
                return Err(LoadError::DependencyFailed {
                    dependency: dependency.clone(),
                });
            }
        }

        record.advance(LifecycleState::SetupRunning)?;
        let mut instance = record.instance.lock().await;
        let Some(shard) = instance.as_mut() else {
            return Err(LoadError::MissingFactory);
        };
        guarded(shard.setup(&record.context))
            .await
            .map_err(|source| LoadError::Hook {
                phase: LifecycleState::SetupRunning,
                source,
            })?;
        record.advance(LifecycleState::Active)
    }

    /// Binds the commands an active shard exports or registered.
    fn bind_commands(&self, record: &ShardRecord) {
        let mut commands = record
            .loader
            .exports()
            .map(ExportTable::commands)
            .unwrap_or_default();
        commands.extend(record.controller.take_commands());
        if commands.is_empty() {
            return;
        }

        let summary = self.registrar.register_all(record.id(), &commands);
        let mut progress = record.progress.lock();
        progress.commands_bound = summary.commands;
        progress.command_errors = summary.errors;
    }

    /// Tears every active shard down in reverse activation order.
    ///
    /// Teardown failures are recorded and never stop the remaining teardowns.
    /// Each shard's command routes are unregistered and its loader released.
    pub async fn shutdown_all(&self) -> TeardownReport {
        let records = std::mem::take(&mut *self.records.write().await);
        let activation = std::mem::take(&mut *self.activation_order.lock());
        info!("Shutting down {} shard(s)", activation.len());

        let mut report = TeardownReport::default();
        for id in activation.iter().rev() {
            let Some(record) = records.iter().find(|record| record.id() == id.as_str()) else {
                continue;
            };
            if !record.is_active() {
                continue;
            }
            report.results.push(self.tear_down(record).await);
        }

        for record in &records {
            self.arena.remove(record.id());
        }
        drop(records);
        self.install_order.lock().clear();

        if let Err(e) = self.services.flush().await {
            error!("Failed to flush storage: {}", e);
        }
        self.loaded.store(false, Ordering::SeqCst);

        report.log();
        info!("All shards shut down");
        report
    }

    /// `ACTIVE -> TEARDOWN_RUNNING -> TERMINATED`.
    async fn tear_down(&self, record: &ShardRecord) -> TeardownResult {
        let started = Instant::now();
        info!(shard = %record.id(), "Tearing down");

        let outcome = match record.advance(LifecycleState::TeardownRunning) {
            Ok(()) => {
                let mut instance = record.instance.lock().await;
                let outcome = match instance.as_mut() {
                    Some(shard) => guarded(shard.teardown(&record.context))
                        .await
                        .map_err(|source| LoadError::Hook {
                            phase: LifecycleState::TeardownRunning,
                            source,
                        }),
                    None => Ok(()),
                };
                // The instance goes first; its code lives in the archive.
                *instance = None;
                outcome.and_then(|_| record.advance(LifecycleState::Terminated))
            }
            Err(e) => Err(e),
        };

        let error = match outcome {
            Ok(()) => None,
            Err(error) => {
                record.controller.mark_failed();
                error!(shard = %record.id(), "Error shutting down: {}", error.summary());
                Some(error.summary())
            }
        };
        let routes_removed = self.registrar.unregister(record.id());

        TeardownResult {
            id: record.id().to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            success: error.is_none(),
            error,
            routes_removed,
        }
    }
}

/// Report entry for an archive that never produced a shard record.
fn discovery_failure(
    path: &Path,
    descriptor: Option<&ShardDescriptor>,
    error: LoadError,
    elapsed: Duration,
) -> ShardLoadResult {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    ShardLoadResult {
        id: descriptor.map(|d| d.id.clone()).unwrap_or_else(|| file_name.clone()),
        name: descriptor.map(|d| d.name.clone()).unwrap_or(file_name),
        version: descriptor.map(|d| d.version.clone()),
        archive: path.to_path_buf(),
        duration_ms: elapsed.as_millis() as u64,
        success: false,
        state: LifecycleState::Discovered,
        error: Some(error.summary()),
        commands_bound: 0,
        command_errors: Vec::new(),
        libraries: Vec::new(),
    }
}

/// Pre-setup followed by dependency resolution, for one shard.
async fn prepare(
    record: &ShardRecord,
    fetcher: Arc<dyn ArtifactFetcher>,
    config: &ResolverConfig,
) -> Result<(), LoadError> {
    // CONTEXT_BOUND -> PRE_SETUP_RUNNING -> PRE_SETUP_DONE
    record.advance(LifecycleState::PreSetupRunning)?;
    {
        let mut instance = record.instance.lock().await;
        if let Some(shard) = instance.as_mut() {
            guarded(shard.pre_setup(&record.context))
                .await
                .map_err(|source| LoadError::Hook {
                    phase: LifecycleState::PreSetupRunning,
                    source,
                })?;
        }
    }
    record.advance(LifecycleState::PreSetupDone)?;

    // PRE_SETUP_DONE -> DEPENDENCIES_RESOLVED
    let declared = record
        .controller
        .take_dependency_loader()
        .or_else(|| record.loader.exports().and_then(ExportTable::dependency_loader));
    if let Some(dependency_loader) = declared {
        let paths = resolve_with_retry(record.id(), dependency_loader.as_ref(), fetcher, config).await?;
        let mut libraries = Vec::with_capacity(paths.len());
        for path in &paths {
            let entry = record.loader.add_library_path(path).map_err(LoadError::Archive)?;
            debug!(shard = %record.id(), "Added library {}", entry.path().display());
            libraries.push(entry.path().to_path_buf());
        }
        if !libraries.is_empty() {
            info!(shard = %record.id(), "Resolved {} dependenc(ies)", libraries.len());
        }
        record.progress.lock().libraries = libraries;
    }
    record.advance(LifecycleState::DependenciesResolved)
}

/// Runs the dependency loader against fresh resolver sessions until one
/// succeeds, a non-retryable error occurs, or the attempts run out.
async fn resolve_with_retry(
    shard_id: &str,
    dependency_loader: &dyn DependencyLoader,
    fetcher: Arc<dyn ArtifactFetcher>,
    config: &ResolverConfig,
) -> Result<Vec<PathBuf>, LoadError> {
    let attempts = config.attempts.max(1);
    let mut attempt = 1;
    loop {
        let mut session = LibraryResolver::new(config, fetcher.clone());
        {
            let mut collector = session.collector(shard_id);
            let declared = std::panic::catch_unwind(AssertUnwindSafe(|| {
                dependency_loader.load_dependencies(&mut collector)
            }))
            .unwrap_or_else(|panic| Err(ShardError::Panicked(panic_message(panic.as_ref()))));
            declared.map_err(|source| LoadError::DependencyDeclaration { source })?;
        }

        match session.resolve().await {
            Ok(paths) => return Ok(paths.into_iter().collect()),
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(
                    shard = %shard_id,
                    "Dependency resolution attempt {}/{} failed: {}; retrying",
                    attempt,
                    attempts,
                    e
                );
                attempt += 1;
                tokio::time::sleep(config.retry_backoff).await;
            }
            Err(e) => return Err(LoadError::DependencyResolution(e)),
        }
    }
}
