use super::{LoaderError, SymbolSource, TableSource};
use shard_api::ExportTable;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Turns an archive file into a symbol source.
pub trait ArchiveOpener: Send + Sync {
    /// Whether discovery should consider this file at all.
    fn accepts(&self, path: &Path) -> bool;

    fn open(&self, path: &Path) -> Result<Arc<dyn SymbolSource>, LoaderError>;
}

/// Archives linked into the host binary, keyed by file name.
///
/// Discovery still walks the shard directory; a file whose name is registered
/// here is served from the in-process export table instead of being loaded
/// from disk. Used for built-in shards and for exercising the manager without
/// building native archives.
#[derive(Default)]
pub struct StaticArchives {
    archives: HashMap<String, Arc<TableSource>>,
}

impl StaticArchives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, file_name: impl Into<String>, table: ExportTable) -> Self {
        self.archives
            .insert(file_name.into(), Arc::new(TableSource::new(table)));
        self
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }

    fn file_name(path: &Path) -> Option<&str> {
        path.file_name().and_then(|name| name.to_str())
    }
}

impl ArchiveOpener for StaticArchives {
    fn accepts(&self, path: &Path) -> bool {
        Self::file_name(path).is_some_and(|name| self.archives.contains_key(name))
    }

    fn open(&self, path: &Path) -> Result<Arc<dyn SymbolSource>, LoaderError> {
        let source: Arc<dyn SymbolSource> = Self::file_name(path)
            .and_then(|name| self.archives.get(name))
            .ok_or_else(|| LoaderError::Unsupported {
                path: path.to_path_buf(),
            })?
            .clone();
        Ok(source)
    }
}
