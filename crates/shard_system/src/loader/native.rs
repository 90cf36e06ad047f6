use super::{ArchiveOpener, LoaderError, SymbolSource};
use libloading::Library;
use shard_api::{ExportTable, Symbol, SymbolOrigin, ABI_VERSION, ABI_VERSION_SYMBOL, EXPORTS_SYMBOL};
use std::any::Any;
use std::ffi::{c_char, c_void, CStr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const NATIVE_EXTENSIONS: [&str; 3] = ["so", "dll", "dylib"];

pub(crate) fn is_native_library(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| NATIVE_EXTENSIONS.contains(&ext))
}

fn open_library(path: &Path) -> Result<Library, LoaderError> {
    // SAFETY: loading runs the library's initializers; archives are trusted code.
    unsafe { Library::new(path) }.map_err(|e| LoaderError::Open {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// A shard archive compiled as a native dynamic library.
pub struct NativeArchive {
    // Dropped before `library`: the table's values live in the library's code.
    table: ExportTable,
    library: Arc<Library>,
}

impl NativeArchive {
    /// Opens an archive, checks its ABI string and takes ownership of its export table.
    pub fn open(path: &Path) -> Result<Self, LoaderError> {
        debug!("Opening shard archive {}", path.display());
        let library = open_library(path)?;

        let found = unsafe {
            let abi = library
                .get::<unsafe extern "C" fn() -> *const c_char>(ABI_VERSION_SYMBOL)
                .map_err(|e| LoaderError::Open {
                    path: path.to_path_buf(),
                    reason: format!("missing ABI symbol: {}", e),
                })?;
            let raw = abi();
            if raw.is_null() {
                String::new()
            } else {
                CStr::from_ptr(raw).to_string_lossy().into_owned()
            }
        };
        if found != ABI_VERSION {
            return Err(LoaderError::IncompatibleAbi {
                path: path.to_path_buf(),
                found,
                expected: ABI_VERSION.to_string(),
            });
        }

        let table = unsafe {
            let exports = library
                .get::<unsafe extern "C" fn() -> *mut ExportTable>(EXPORTS_SYMBOL)
                .map_err(|e| LoaderError::Open {
                    path: path.to_path_buf(),
                    reason: format!("missing exports symbol: {}", e),
                })?;
            let raw = exports();
            if raw.is_null() {
                return Err(LoaderError::NoExports {
                    path: path.to_path_buf(),
                });
            }
            // SAFETY: the ABI check above guarantees an identical ExportTable layout.
            *Box::from_raw(raw)
        };

        Ok(Self {
            table,
            library: Arc::new(library),
        })
    }
}

impl SymbolSource for NativeArchive {
    fn lookup(&self, name: &str) -> Option<Symbol> {
        let value = self.table.get(name)?.clone();
        let keepalive: Arc<dyn Any + Send + Sync> = self.library.clone();
        Some(Symbol::from_export(name, value, SymbolOrigin::Archive).with_keepalive(keepalive))
    }

    fn exports(&self) -> Option<&ExportTable> {
        Some(&self.table)
    }
}

/// A plain native library appended to a loader. Exposes raw symbol addresses.
pub struct NativeLibrary {
    path: PathBuf,
    library: Arc<Library>,
}

impl NativeLibrary {
    pub fn open(path: &Path) -> Result<Self, LoaderError> {
        Ok(Self {
            path: path.to_path_buf(),
            library: Arc::new(open_library(path)?),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SymbolSource for NativeLibrary {
    fn lookup(&self, name: &str) -> Option<Symbol> {
        let address = unsafe {
            let symbol = self.library.get::<*const c_void>(name.as_bytes()).ok()?;
            *symbol as usize
        };
        let keepalive: Arc<dyn Any + Send + Sync> = self.library.clone();
        Some(
            Symbol::from_address(name, address, SymbolOrigin::Library(self.path.clone()))
                .with_keepalive(keepalive),
        )
    }
}

/// Opens native shard archives (`.so`, `.dll`, `.dylib`).
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibOpener;

impl ArchiveOpener for DylibOpener {
    fn accepts(&self, path: &Path) -> bool {
        is_native_library(path)
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn SymbolSource>, LoaderError> {
        Ok(Arc::new(NativeArchive::open(path)?))
    }
}
