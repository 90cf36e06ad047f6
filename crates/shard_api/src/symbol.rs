//! Named exports and resolved symbols.
//!
//! An archive publishes an [`ExportTable`]: a set of named, type-erased values.
//! A few names are well known to the host (factory, descriptor, dependency
//! loader, commands); everything else is an ordinary symbol that other code can
//! resolve through the loader chain.

use crate::command::ShardCommand;
use crate::dependency::DependencyLoader;
use crate::shard::ShardFactory;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

/// C symbol returning the archive's ABI string.
pub const ABI_VERSION_SYMBOL: &[u8] = b"frost_shard_abi_version";
/// C symbol returning the archive's boxed [`ExportTable`].
pub const EXPORTS_SYMBOL: &[u8] = b"frost_shard_exports";

pub const FACTORY_EXPORT: &str = "shard::factory";
pub const DESCRIPTOR_EXPORT: &str = "shard::descriptor";
pub const DEPENDENCY_LOADER_EXPORT: &str = "shard::dependency_loader";
pub const COMMAND_EXPORT_PREFIX: &str = "shard::command::";

/// A type-erased exported value.
pub type ExportValue = Arc<dyn Any + Send + Sync>;

/// The named exports of one archive, in declaration order.
#[derive(Default)]
pub struct ExportTable {
    entries: HashMap<String, ExportValue>,
    order: Vec<String>,
    commands: usize,
}

impl ExportTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Embeds the TOML descriptor document.
    pub fn with_descriptor(self, document: impl Into<String>) -> Self {
        self.export(DESCRIPTOR_EXPORT, document.into())
    }

    pub fn with_factory<F: ShardFactory + 'static>(self, factory: F) -> Self {
        let factory: Arc<dyn ShardFactory> = Arc::new(factory);
        self.export(FACTORY_EXPORT, factory)
    }

    pub fn with_dependency_loader<L: DependencyLoader + 'static>(self, loader: L) -> Self {
        let loader: Arc<dyn DependencyLoader> = Arc::new(loader);
        self.export(DEPENDENCY_LOADER_EXPORT, loader)
    }

    /// Embeds a `.properties` message bundle under `<title>_<lang>_<variant>`.
    pub fn with_lang(self, title: &str, lang: &str, variant: &str, document: impl Into<String>) -> Self {
        let name = format!("{}{}", crate::lang::LANG_EXPORT_PREFIX, crate::lang::bundle_name(title, lang, variant));
        self.export(name, document.into())
    }

    /// Adds a command export; commands keep the order they were added in.
    pub fn with_command<C: ShardCommand + 'static>(mut self, command: C) -> Self {
        let command: Arc<dyn ShardCommand> = Arc::new(command);
        let name = format!("{}{}", COMMAND_EXPORT_PREFIX, self.commands);
        self.commands += 1;
        self.export(name, command)
    }

    /// Adds an arbitrary named export.
    pub fn export<T: Any + Send + Sync>(mut self, name: impl Into<String>, value: T) -> Self {
        self.insert(name, Arc::new(value));
        self
    }

    /// Inserts or replaces an export. Replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, value: ExportValue) {
        let name = name.into();
        if self.entries.insert(name.clone(), value).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&ExportValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn factory(&self) -> Option<Arc<dyn ShardFactory>> {
        self.get(FACTORY_EXPORT)?
            .downcast_ref::<Arc<dyn ShardFactory>>()
            .cloned()
    }

    pub fn descriptor_document(&self) -> Option<&str> {
        self.get(DESCRIPTOR_EXPORT)?
            .downcast_ref::<String>()
            .map(String::as_str)
    }

    pub fn dependency_loader(&self) -> Option<Arc<dyn DependencyLoader>> {
        self.get(DEPENDENCY_LOADER_EXPORT)?
            .downcast_ref::<Arc<dyn DependencyLoader>>()
            .cloned()
    }

    pub fn commands(&self) -> Vec<Arc<dyn ShardCommand>> {
        self.order
            .iter()
            .filter(|name| name.starts_with(COMMAND_EXPORT_PREFIX))
            .filter_map(|name| self.entries.get(name))
            .filter_map(|value| value.downcast_ref::<Arc<dyn ShardCommand>>().cloned())
            .collect()
    }
}

impl fmt::Debug for ExportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportTable")
            .field("exports", &self.order)
            .finish()
    }
}

// ============================================================================
// Resolved symbols
// ============================================================================

/// Where a resolved symbol was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolOrigin {
    /// The requesting shard's own archive
    Archive,
    /// A library appended to the loader after dependency resolution
    Library(PathBuf),
    /// The host's shared namespace
    Shared,
    /// Another shard's namespace, by id
    Peer(String),
}

/// The payload of a resolved symbol.
#[derive(Clone)]
pub enum SymbolValue {
    /// A value from an export table
    Export(ExportValue),
    /// A raw address from a native library
    Address(usize),
}

/// A resolved symbol.
///
/// Symbols that came out of a dynamically loaded library hold that library
/// alive until the last clone is dropped.
#[derive(Clone)]
pub struct Symbol {
    name: String,
    origin: SymbolOrigin,
    // Declared before `keepalive`: the value must drop while its library is still mapped.
    value: SymbolValue,
    keepalive: Option<Arc<dyn Any + Send + Sync>>,
}

impl Symbol {
    pub fn from_export(name: impl Into<String>, value: ExportValue, origin: SymbolOrigin) -> Self {
        Self {
            name: name.into(),
            origin,
            value: SymbolValue::Export(value),
            keepalive: None,
        }
    }

    pub fn from_address(name: impl Into<String>, address: usize, origin: SymbolOrigin) -> Self {
        Self {
            name: name.into(),
            origin,
            value: SymbolValue::Address(address),
            keepalive: None,
        }
    }

    /// Attaches an owner that must outlive the symbol value.
    pub fn with_keepalive(mut self, keepalive: Arc<dyn Any + Send + Sync>) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// Returns the same symbol re-attributed to another origin.
    pub fn with_origin(mut self, origin: SymbolOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> &SymbolOrigin {
        &self.origin
    }

    pub fn value(&self) -> &SymbolValue {
        &self.value
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        match &self.value {
            SymbolValue::Export(value) => value.downcast_ref::<T>(),
            SymbolValue::Address(_) => None,
        }
    }

    pub fn address(&self) -> Option<usize> {
        match self.value {
            SymbolValue::Address(address) => Some(address),
            SymbolValue::Export(_) => None,
        }
    }

    /// True when both symbols point at the same underlying value.
    pub fn same_value(&self, other: &Symbol) -> bool {
        match (&self.value, &other.value) {
            (SymbolValue::Export(a), SymbolValue::Export(b)) => Arc::ptr_eq(a, b),
            (SymbolValue::Address(a), SymbolValue::Address(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.value {
            SymbolValue::Export(_) => "export",
            SymbolValue::Address(_) => "address",
        };
        f.debug_struct("Symbol")
            .field("name", &self.name)
            .field("origin", &self.origin)
            .field("kind", &kind)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SymbolError {
    #[error("symbol '{0}' not found")]
    NotFound(String),
}

/// Resolves symbols on behalf of one shard.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Symbol, SymbolError>;
}
