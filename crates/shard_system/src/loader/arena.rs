use super::IsolatedLoader;
use parking_lot::RwLock;
use shard_api::{Symbol, SymbolError, SymbolOrigin, SymbolResolver};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

struct Slot {
    shard_id: String,
    loader: Arc<IsolatedLoader>,
    dependencies: Vec<String>,
    ready: AtomicBool,
}

#[derive(Default)]
struct Slots {
    ordered: Vec<Arc<Slot>>,
    index: HashMap<String, usize>,
}

/// Every shard's loader, indexed by shard id, in discovery order.
///
/// A slot takes part in peer lookups only after [`mark_ready`](Self::mark_ready),
/// which the manager calls once the shard's context is bound.
#[derive(Default)]
pub struct LoaderArena {
    slots: RwLock<Slots>,
}

impl LoaderArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a loader. Returns `false` if the id is already taken.
    pub fn insert(&self, shard_id: &str, loader: Arc<IsolatedLoader>, dependencies: Vec<String>) -> bool {
        let mut slots = self.slots.write();
        if slots.index.contains_key(shard_id) {
            return false;
        }
        let position = slots.ordered.len();
        slots.ordered.push(Arc::new(Slot {
            shard_id: shard_id.to_string(),
            loader,
            dependencies,
            ready: AtomicBool::new(false),
        }));
        slots.index.insert(shard_id.to_string(), position);
        true
    }

    pub fn mark_ready(&self, shard_id: &str) {
        if let Some(slot) = self.slot(shard_id) {
            slot.ready.store(true, Ordering::Release);
        }
    }

    /// Hides a failed shard from peer lookups. Its own chain keeps working.
    pub fn mark_unready(&self, shard_id: &str) {
        if let Some(slot) = self.slot(shard_id) {
            slot.ready.store(false, Ordering::Release);
        }
    }

    /// Removes a shard's slot and returns its loader.
    pub fn remove(&self, shard_id: &str) -> Option<Arc<IsolatedLoader>> {
        let mut slots = self.slots.write();
        let position = slots.index.remove(shard_id)?;
        let slot = slots.ordered.remove(position);
        for index in slots.index.values_mut() {
            if *index > position {
                *index -= 1;
            }
        }
        Some(slot.loader.clone())
    }

    pub fn get(&self, shard_id: &str) -> Option<Arc<IsolatedLoader>> {
        self.slot(shard_id).map(|slot| slot.loader.clone())
    }

    pub fn len(&self) -> usize {
        self.slots.read().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, shard_id: &str) -> Option<Arc<Slot>> {
        let slots = self.slots.read();
        slots
            .index
            .get(shard_id)
            .map(|&position| slots.ordered[position].clone())
    }

    /// Resolves a symbol for `requester`: its own loader chain first, then every
    /// ready peer in discovery order. A peer hit is cached in the requester.
    pub fn resolve(&self, requester: &str, name: &str) -> Result<Symbol, SymbolError> {
        let own = self
            .slot(requester)
            .ok_or_else(|| SymbolError::NotFound(name.to_string()))?;

        if let Ok(symbol) = own.loader.load_symbol(name) {
            return Ok(symbol);
        }

        // Snapshot so no arena lock is held while peers are searched.
        let peers: Vec<Arc<Slot>> = match self.slots.try_read() {
            Some(slots) => slots.ordered.clone(),
            None => {
                debug!("Loader arena busy, skipping peer lookup for '{}'", name);
                return Err(SymbolError::NotFound(name.to_string()));
            }
        };

        for peer in peers
            .iter()
            .filter(|peer| peer.shard_id != requester && peer.ready.load(Ordering::Acquire))
        {
            let Some(symbol) = peer.loader.lookup_for_peer(name) else {
                continue;
            };
            if !own.dependencies.contains(&peer.shard_id) {
                warn!(
                    shard = %requester,
                    provider = %peer.shard_id,
                    "Symbol '{}' resolved from a shard that is not a declared dependency",
                    name
                );
            }
            let symbol = symbol.with_origin(SymbolOrigin::Peer(peer.shard_id.clone()));
            return Ok(own.loader.remember(name, symbol));
        }

        Err(SymbolError::NotFound(name.to_string()))
    }

    /// A resolver bound to one shard, handed to that shard's context.
    pub fn resolver_for(self: &Arc<Self>, shard_id: &str) -> Arc<dyn SymbolResolver> {
        Arc::new(ArenaResolver {
            arena: Arc::downgrade(self),
            shard_id: shard_id.to_string(),
        })
    }
}

/// Resolves symbols for one shard through a [`LoaderArena`].
pub struct ArenaResolver {
    arena: Weak<LoaderArena>,
    shard_id: String,
}

impl SymbolResolver for ArenaResolver {
    fn resolve(&self, name: &str) -> Result<Symbol, SymbolError> {
        match self.arena.upgrade() {
            Some(arena) => arena.resolve(&self.shard_id, name),
            None => Err(SymbolError::NotFound(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::{SharedNamespace, TableSource};
    use shard_api::ExportTable;

    fn loader(table: ExportTable) -> Arc<IsolatedLoader> {
        Arc::new(IsolatedLoader::new(
            "x.shard",
            Arc::new(TableSource::new(table)),
            Arc::new(SharedNamespace::empty()),
        ))
    }

    #[test]
    fn test_peer_lookup_in_discovery_order() {
        let arena = Arc::new(LoaderArena::new());
        arena.insert("first", loader(ExportTable::new().export("shared-type", "first")), vec![]);
        arena.insert("second", loader(ExportTable::new().export("shared-type", "second")), vec![]);
        arena.insert("consumer", loader(ExportTable::new()), vec!["second".to_string()]);
        for id in ["first", "second", "consumer"] {
            arena.mark_ready(id);
        }

        let resolver = arena.resolver_for("consumer");
        let symbol = resolver.resolve("shared-type").unwrap();
        assert_eq!(symbol.downcast_ref::<&str>(), Some(&"first"));
        assert_eq!(symbol.origin(), &SymbolOrigin::Peer("first".to_string()));

        // Cached in the requester.
        assert_eq!(arena.get("consumer").unwrap().cached_symbols(), 1);
    }

    #[test]
    fn test_unready_peers_are_skipped() {
        let arena = Arc::new(LoaderArena::new());
        arena.insert("provider", loader(ExportTable::new().export("t", 1u8)), vec![]);
        arena.insert("consumer", loader(ExportTable::new()), vec![]);
        arena.mark_ready("consumer");

        assert!(arena.resolve("consumer", "t").is_err());
        arena.mark_ready("provider");
        assert!(arena.resolve("consumer", "t").is_ok());
    }

    #[test]
    fn test_failed_peer_is_hidden_again() {
        let arena = Arc::new(LoaderArena::new());
        arena.insert("provider", loader(ExportTable::new().export("t", 1u8)), vec![]);
        arena.insert("consumer", loader(ExportTable::new()), vec![]);
        arena.mark_ready("provider");
        arena.mark_ready("consumer");

        arena.mark_unready("provider");
        assert!(arena.resolve("consumer", "t").is_err());
        // The failed shard still sees its own exports.
        assert!(arena.resolve("provider", "t").is_ok());
    }

    #[test]
    fn test_remove_keeps_index_consistent() {
        let arena = LoaderArena::new();
        assert!(arena.insert("a", loader(ExportTable::new()), vec![]));
        assert!(arena.insert("b", loader(ExportTable::new()), vec![]));
        assert!(arena.insert("c", loader(ExportTable::new()), vec![]));
        assert!(!arena.insert("b", loader(ExportTable::new()), vec![]));

        assert!(arena.remove("a").is_some());
        assert!(arena.get("c").is_some());
        assert!(arena.get("a").is_none());
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_resolver_outliving_arena() {
        let arena = Arc::new(LoaderArena::new());
        arena.insert("a", loader(ExportTable::new().export("t", 1u8)), vec![]);
        let resolver = arena.resolver_for("a");
        drop(arena);

        assert!(resolver.resolve("t").is_err());
    }
}
