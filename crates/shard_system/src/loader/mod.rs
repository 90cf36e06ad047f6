//! Isolated Loader: one symbol namespace per shard archive.
//!
//! Lookup order inside a loader is fixed:
//!
//! 1. the loader's own cache of already resolved symbols
//! 2. the shard's own archive
//! 3. libraries appended after dependency resolution, in append order
//! 4. the shared namespace the host built at startup
//!
//! The first match wins and stays cached for the loader's lifetime. Lookups
//! that miss all four fall through to peer shards via the [`LoaderArena`].

mod arena;
mod archive;
mod native;

pub use arena::{ArenaResolver, LoaderArena};
pub use archive::{ArchiveOpener, StaticArchives};
pub use native::{DylibOpener, NativeArchive, NativeLibrary};

use dashmap::DashMap;
use parking_lot::RwLock;
use shard_api::{
    DescriptorError, ExportTable, ShardDescriptor, Symbol, SymbolError, SymbolOrigin,
};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    #[error("failed to open {path}: {reason}")]
    Open { path: PathBuf, reason: String },
    #[error("{path} was built against shard API {found}, host expects {expected}")]
    IncompatibleAbi {
        path: PathBuf,
        found: String,
        expected: String,
    },
    #[error("{path} did not produce an export table")]
    NoExports { path: PathBuf },
    #[error("no archive opener accepts {path}")]
    Unsupported { path: PathBuf },
    #[error("shard id '{0}' is already registered")]
    DuplicateId(String),
}

/// Anything symbols can be looked up in.
pub trait SymbolSource: Send + Sync {
    /// Looks a symbol up. The origin is assigned by the caller.
    fn lookup(&self, name: &str) -> Option<Symbol>;

    /// The export table, when the source has one.
    fn exports(&self) -> Option<&ExportTable> {
        None
    }
}

/// A symbol source backed by an in-memory [`ExportTable`].
pub struct TableSource {
    table: ExportTable,
}

impl TableSource {
    pub fn new(table: ExportTable) -> Self {
        Self { table }
    }
}

impl SymbolSource for TableSource {
    fn lookup(&self, name: &str) -> Option<Symbol> {
        self.table
            .get(name)
            .map(|value| Symbol::from_export(name, value.clone(), SymbolOrigin::Archive))
    }

    fn exports(&self) -> Option<&ExportTable> {
        Some(&self.table)
    }
}

/// The host's shared namespace. Built once by the manager, read-only afterward.
pub struct SharedNamespace {
    table: ExportTable,
}

impl SharedNamespace {
    pub fn new(table: ExportTable) -> Self {
        Self { table }
    }

    pub fn empty() -> Self {
        Self::new(ExportTable::new())
    }

    pub fn lookup(&self, name: &str) -> Option<Symbol> {
        self.table
            .get(name)
            .map(|value| Symbol::from_export(name, value.clone(), SymbolOrigin::Shared))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

/// A library appended to a loader's search path.
pub struct LibraryEntry {
    path: PathBuf,
    source: Option<Arc<dyn SymbolSource>>,
}

impl LibraryEntry {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the library contributes symbols, as opposed to being a plain
    /// search-path entry (a resource archive, for instance).
    pub fn has_symbols(&self) -> bool {
        self.source.is_some()
    }

    fn lookup(&self, name: &str) -> Option<Symbol> {
        self.source
            .as_ref()?
            .lookup(name)
            .map(|symbol| symbol.with_origin(SymbolOrigin::Library(self.path.clone())))
    }
}

impl fmt::Debug for LibraryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryEntry")
            .field("path", &self.path)
            .field("has_symbols", &self.has_symbols())
            .finish()
    }
}

/// The symbol namespace of one shard archive.
pub struct IsolatedLoader {
    cache: DashMap<String, Symbol>,
    libraries: RwLock<Vec<Arc<LibraryEntry>>>,
    shared: Arc<SharedNamespace>,
    archive_path: PathBuf,
    // Last: symbols and libraries above may reference code mapped by the archive.
    archive: Arc<dyn SymbolSource>,
}

impl IsolatedLoader {
    pub fn new(
        archive_path: impl Into<PathBuf>,
        archive: Arc<dyn SymbolSource>,
        shared: Arc<SharedNamespace>,
    ) -> Self {
        Self {
            cache: DashMap::new(),
            libraries: RwLock::new(Vec::new()),
            shared,
            archive_path: archive_path.into(),
            archive,
        }
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    pub fn exports(&self) -> Option<&ExportTable> {
        self.archive.exports()
    }

    /// Parses the descriptor document embedded in the archive.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when the archive embeds no descriptor; the caller decides
    /// whether that is an error.
    pub fn metadata(&self) -> Result<Option<ShardDescriptor>, DescriptorError> {
        match self.exports().and_then(ExportTable::descriptor_document) {
            Some(document) => ShardDescriptor::parse(document).map(Some),
            None => Ok(None),
        }
    }

    /// Resolves a symbol through cache, archive, libraries and the shared namespace.
    pub fn load_symbol(&self, name: &str) -> Result<Symbol, SymbolError> {
        if let Some(hit) = self.cache.get(name) {
            return Ok(hit.clone());
        }

        let symbol = self
            .archive
            .lookup(name)
            .map(|symbol| symbol.with_origin(SymbolOrigin::Archive))
            .or_else(|| self.libraries.read().iter().find_map(|library| library.lookup(name)))
            .or_else(|| self.shared.lookup(name))
            .ok_or_else(|| SymbolError::NotFound(name.to_string()))?;

        Ok(self.remember(name, symbol))
    }

    /// Caches a symbol unless a concurrent lookup already did; returns the cached one.
    pub(crate) fn remember(&self, name: &str, symbol: Symbol) -> Symbol {
        self.cache
            .entry(name.to_string())
            .or_insert(symbol)
            .value()
            .clone()
    }

    /// Lookup on behalf of a peer shard. Never blocks: if the library list is
    /// being modified the libraries are skipped. The shared namespace is not
    /// consulted, the requester has already searched it.
    pub(crate) fn lookup_for_peer(&self, name: &str) -> Option<Symbol> {
        if let Some(hit) = self.cache.get(name) {
            if !matches!(hit.origin(), SymbolOrigin::Shared | SymbolOrigin::Peer(_)) {
                return Some(hit.clone());
            }
        }
        if let Some(symbol) = self.archive.lookup(name) {
            return Some(symbol);
        }
        let libraries = self.libraries.try_read()?;
        libraries.iter().find_map(|library| library.lookup(name))
    }

    /// Appends a library to the search path.
    ///
    /// Appending the same path twice returns the entry created the first time.
    /// Native libraries (`so`, `dll`, `dylib`) are opened and contribute
    /// symbols; anything else is recorded without symbols.
    pub fn add_library_path(&self, path: &Path) -> Result<Arc<LibraryEntry>, LoaderError> {
        let path = match std::fs::canonicalize(path) {
            Ok(canonical) => canonical,
            Err(_) => {
                warn!("Library path {} does not exist", path.display());
                path.to_path_buf()
            }
        };

        if let Some(existing) = self.find_library(&path) {
            return Ok(existing);
        }

        let source: Option<Arc<dyn SymbolSource>> = if native::is_native_library(&path) && path.exists() {
            Some(Arc::new(NativeLibrary::open(&path)?))
        } else {
            None
        };
        Ok(self.add_library(path, source))
    }

    /// Appends a library with an explicit symbol source.
    pub fn add_library(&self, path: PathBuf, source: Option<Arc<dyn SymbolSource>>) -> Arc<LibraryEntry> {
        let mut libraries = self.libraries.write();
        if let Some(existing) = libraries.iter().find(|entry| entry.path == path) {
            return existing.clone();
        }
        let entry = Arc::new(LibraryEntry { path, source });
        libraries.push(entry.clone());
        entry
    }

    fn find_library(&self, path: &Path) -> Option<Arc<LibraryEntry>> {
        self.libraries
            .read()
            .iter()
            .find(|entry| entry.path == path)
            .cloned()
    }

    pub fn library_paths(&self) -> Vec<PathBuf> {
        self.libraries
            .read()
            .iter()
            .map(|entry| entry.path.clone())
            .collect()
    }

    pub fn cached_symbols(&self) -> usize {
        self.cache.len()
    }
}

impl fmt::Debug for IsolatedLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolatedLoader")
            .field("archive", &self.archive_path)
            .field("libraries", &self.library_paths())
            .field("cached_symbols", &self.cache.len())
            .finish()
    }
}
