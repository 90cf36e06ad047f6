//! The shard context: host capabilities gated by lifecycle state.
//!
//! A [`ShardContext`] is created unbound and handed to the shard factory. The
//! host keeps the matching [`ContextController`] and binds the context once the
//! shard's descriptor, data directory and services are known. Every capability
//! fails with [`ShardError::ContextNotBound`] until then.

use crate::command::ShardCommand;
use crate::dependency::DependencyLoader;
use crate::descriptor::ShardDescriptor;
use crate::error::ShardError;
use crate::lang::{bundle_name, Lang, LangError, LANG_EXPORT_PREFIX};
use crate::lifecycle::{LifecycleCell, LifecycleState, TransitionError};
use crate::services::{LogEmitter, ShardServices, StorageService};
use crate::symbol::{Symbol, SymbolOrigin, SymbolResolver};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// Everything the host assigns to a shard at the context-binding transition.
pub struct BoundContext {
    pub descriptor: Arc<ShardDescriptor>,
    pub data_directory: PathBuf,
    pub services: ShardServices,
    pub symbols: Arc<dyn SymbolResolver>,
}

struct ContextInner {
    lifecycle: LifecycleCell,
    bound: OnceLock<BoundContext>,
    dependency_loader: Mutex<Option<Arc<dyn DependencyLoader>>>,
    commands: Mutex<Vec<Arc<dyn ShardCommand>>>,
}

/// Capabilities available to a shard. Cheap to clone.
#[derive(Clone)]
pub struct ShardContext {
    inner: Arc<ContextInner>,
}

impl ShardContext {
    fn new() -> Self {
        Self {
            inner: Arc::new(ContextInner {
                lifecycle: LifecycleCell::new(),
                bound: OnceLock::new(),
                dependency_loader: Mutex::new(None),
                commands: Mutex::new(Vec::new()),
            }),
        }
    }

    fn bound(&self, call: &'static str) -> Result<&BoundContext, ShardError> {
        self.inner
            .bound
            .get()
            .ok_or(ShardError::ContextNotBound { call })
    }

    fn require_state(
        &self,
        call: &'static str,
        allowed: &[LifecycleState],
    ) -> Result<&BoundContext, ShardError> {
        let bound = self.bound(call)?;
        let state = self.lifecycle();
        if !allowed.contains(&state) {
            return Err(ShardError::WrongPhase { call, state });
        }
        Ok(bound)
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.inner.lifecycle.current()
    }

    pub fn is_bound(&self) -> bool {
        self.inner.bound.get().is_some()
    }

    pub fn descriptor(&self) -> Result<Arc<ShardDescriptor>, ShardError> {
        Ok(self.bound("descriptor")?.descriptor.clone())
    }

    /// Directory reserved for this shard's files, created by the host.
    pub fn data_directory(&self) -> Result<&Path, ShardError> {
        Ok(&self.bound("data_directory")?.data_directory)
    }

    pub fn logger(&self) -> Result<LogEmitter, ShardError> {
        let bound = self.bound("logger")?;
        Ok(LogEmitter::new(
            bound.descriptor.id.as_str(),
            bound.services.log.clone(),
        ))
    }

    pub fn storage(&self) -> Result<Arc<dyn StorageService>, ShardError> {
        Ok(self.bound("storage")?.services.storage.clone())
    }

    /// Resolves a symbol through this shard's loader chain.
    pub fn lookup_symbol(&self, name: &str) -> Result<Symbol, ShardError> {
        Ok(self.bound("lookup_symbol")?.symbols.resolve(name)?)
    }

    /// Loads the `<title>_<lang>_<variant>` message bundle.
    ///
    /// The bundle is copied from this shard's own archive into
    /// `<data directory>/lang/` unless a copy already exists there; the copy on
    /// disk is what gets loaded.
    pub fn lang(&self, title: &str, lang: &str, variant: &str) -> Result<Lang, ShardError> {
        let bound = self.bound("lang")?;
        let name = bundle_name(title, lang, variant);
        let directory = bound.data_directory.join("lang");
        let path = directory.join(format!("{}.properties", name));
        let io = |e: std::io::Error| LangError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if !path.exists() {
            let export = format!("{}{}", LANG_EXPORT_PREFIX, name);
            let document = bound
                .symbols
                .resolve(&export)
                .ok()
                .filter(|symbol| symbol.origin() == &SymbolOrigin::Archive)
                .and_then(|symbol| symbol.downcast_ref::<String>().cloned())
                .ok_or_else(|| LangError::MissingBundle(name.clone()))?;
            std::fs::create_dir_all(&directory).map_err(io)?;
            std::fs::write(&path, document).map_err(io)?;
        }

        let source = std::fs::read_to_string(&path).map_err(io)?;
        Ok(Lang::parse(name, &source))
    }

    /// Declares the loader whose dependencies are resolved after pre-setup.
    ///
    /// Only allowed while pre-setup runs. A second call replaces the first.
    pub fn set_dependency_loader(&self, loader: Arc<dyn DependencyLoader>) -> Result<(), ShardError> {
        self.require_state("set_dependency_loader", &[LifecycleState::PreSetupRunning])?;
        *self.inner.dependency_loader.lock() = Some(loader);
        Ok(())
    }

    /// Queues a command for binding once the shard becomes active.
    pub fn register_command(&self, command: Arc<dyn ShardCommand>) -> Result<(), ShardError> {
        self.require_state(
            "register_command",
            &[LifecycleState::PreSetupRunning, LifecycleState::SetupRunning],
        )?;
        self.inner.commands.lock().push(command);
        Ok(())
    }

    /// Publishes this shard's configuration schema. Only allowed during setup.
    pub fn publish_config_schema(&self, schema: Value) -> Result<(), ShardError> {
        let bound = self.require_state("publish_config_schema", &[LifecycleState::SetupRunning])?;
        bound
            .services
            .config
            .publish(&bound.descriptor, schema)
            .map_err(ShardError::from)
    }
}

impl fmt::Debug for ShardContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardContext")
            .field("lifecycle", &self.lifecycle())
            .field(
                "shard",
                &self.inner.bound.get().map(|bound| bound.descriptor.id.as_str()),
            )
            .finish()
    }
}

/// Host-side handle of a [`ShardContext`]: binding and lifecycle transitions.
pub struct ContextController {
    context: ShardContext,
}

impl Default for ContextController {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextController {
    pub fn new() -> Self {
        Self {
            context: ShardContext::new(),
        }
    }

    /// A shard-facing handle on the same context.
    pub fn context(&self) -> ShardContext {
        self.context.clone()
    }

    /// Performs the `DISCOVERED -> CONTEXT_BOUND` transition.
    pub fn bind(&self, bound: BoundContext) -> Result<(), TransitionError> {
        let inner = &self.context.inner;
        let state = inner.lifecycle.current();
        if state != LifecycleState::Discovered || inner.lifecycle.is_failed() {
            return Err(TransitionError::Illegal {
                from: state,
                to: LifecycleState::ContextBound,
            });
        }
        if inner.bound.set(bound).is_err() {
            return Err(TransitionError::Illegal {
                from: state,
                to: LifecycleState::ContextBound,
            });
        }
        inner.lifecycle.advance(LifecycleState::ContextBound).map(|_| ())
    }

    pub fn advance(&self, to: LifecycleState) -> Result<(), TransitionError> {
        self.context.inner.lifecycle.advance(to).map(|_| ())
    }

    /// Freezes the lifecycle and returns the state it froze at.
    pub fn mark_failed(&self) -> LifecycleState {
        self.context.inner.lifecycle.mark_failed()
    }

    pub fn state(&self) -> LifecycleState {
        self.context.lifecycle()
    }

    pub fn is_failed(&self) -> bool {
        self.context.inner.lifecycle.is_failed()
    }

    pub fn take_dependency_loader(&self) -> Option<Arc<dyn DependencyLoader>> {
        self.context.inner.dependency_loader.lock().take()
    }

    pub fn take_commands(&self) -> Vec<Arc<dyn ShardCommand>> {
        std::mem::take(&mut *self.context.inner.commands.lock())
    }
}
