use std::collections::HashMap;
use std::sync::Arc;

use quarry_core::IndexId;

use crate::externalizer::DataExternalizer;
use crate::forward::InputData;
use crate::map_reduce::{InputContent, InputMeta, UpdatableIndex};
use crate::rebuild::RebuildStatus;
use crate::{IndexError, Result};

/// An index definition: what to extract from which inputs, plus the codecs for the
/// extracted keys and values.
///
/// `map` must be a pure function of the content: the engine assumes that re-running it
/// on unchanged bytes yields the same data, and runs it outside all storage locks.
pub trait IndexExtension<K, V>: Send + Sync + 'static {
    /// Stable identifier; doubles as the on-disk directory name for this index.
    fn name(&self) -> &str;

    /// Bumping the version discards all persisted data for this index on next open.
    fn version(&self) -> u32;

    /// Extracts the key/value entries for one input. Errors are per-input: the engine
    /// logs them and skips the input for this index without failing the whole update.
    fn map(&self, content: &InputContent) -> std::result::Result<InputData<K, V>, String>;

    /// Input filter; inputs it rejects never reach `map` and are never stored.
    fn accepts(&self, meta: &InputMeta) -> bool;

    fn indexes_directories(&self) -> bool {
        false
    }

    /// Opt out only for indexes whose removals are driven externally; without a forward
    /// index the engine cannot diff, so every update is add-only.
    fn needs_forward_index(&self) -> bool {
        true
    }

    /// Use the content-hash forward layout, deduplicating identical extracted data
    /// across inputs (worthwhile for indexes over heavily copied files).
    fn shares_forward_index_by_content(&self) -> bool {
        false
    }

    fn key_externalizer(&self) -> Arc<dyn DataExternalizer<K>>;

    fn value_externalizer(&self) -> Arc<dyn DataExternalizer<V>>;
}

pub(crate) struct RegistryEntry {
    pub id: IndexId,
    pub name: String,
    pub engine: Arc<dyn UpdatableIndex>,
    pub rebuild: Arc<RebuildStatus>,
}

/// The set of registered indexes. Mutable while the engine is being assembled, frozen
/// before any update or query runs, so lookups need no locking.
///
/// Ids are dense and assigned in registration order; iteration follows that order.
#[derive(Default)]
pub struct IndexRegistry {
    entries: Vec<RegistryEntry>,
    by_name: HashMap<String, usize>,
    frozen: bool,
}

impl IndexRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The id the next successful registration will receive.
    pub fn next_id(&self) -> IndexId {
        IndexId::from_raw(self.entries.len() as u32)
    }

    pub(crate) fn insert(&mut self, engine: Arc<dyn UpdatableIndex>) -> Result<()> {
        if self.frozen {
            return Err(IndexError::RegistryFrozen);
        }
        let name = engine.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(IndexError::DuplicateIndex { name });
        }
        let id = self.next_id();
        debug_assert_eq!(id, engine.id());
        self.by_name.insert(name.clone(), self.entries.len());
        self.entries.push(RegistryEntry {
            id,
            name,
            engine,
            rebuild: Arc::new(RebuildStatus::new()),
        });
        Ok(())
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub(crate) fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub(crate) fn get(&self, id: IndexId) -> Result<&RegistryEntry> {
        self.entries
            .get(id.to_raw() as usize)
            .ok_or(IndexError::UnknownIndex(id))
    }

    pub fn rebuild_status(&self, id: IndexId) -> Result<&RebuildStatus> {
        Ok(&self.get(id)?.rebuild)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::InputId;

    struct FakeIndex {
        id: IndexId,
        name: &'static str,
    }

    impl UpdatableIndex for FakeIndex {
        fn id(&self) -> IndexId {
            self.id
        }
        fn name(&self) -> &str {
            self.name
        }
        fn version(&self) -> u32 {
            1
        }
        fn accepts(&self, _meta: &InputMeta) -> bool {
            true
        }
        fn update(&self, _input_id: InputId, _content: Option<&InputContent>) -> Result<()> {
            Ok(())
        }
        fn flush(&self) -> Result<()> {
            Ok(())
        }
        fn is_dirty(&self) -> bool {
            false
        }
        fn clear(&self) -> Result<()> {
            Ok(())
        }
        fn set_buffering(&self, _enabled: bool) {}
        fn clear_memory_map(&self) {}
        fn indexed_input_ids(&self) -> Result<Vec<InputId>> {
            Ok(Vec::new())
        }
    }

    fn fake(registry: &IndexRegistry, name: &'static str) -> Arc<dyn UpdatableIndex> {
        Arc::new(FakeIndex {
            id: registry.next_id(),
            name,
        })
    }

    #[test]
    fn ids_are_dense_and_ordered() {
        let mut registry = IndexRegistry::new();
        registry.insert(fake(&registry, "alpha")).unwrap();
        registry.insert(fake(&registry, "beta")).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(IndexId::from_raw(0)).unwrap().name, "alpha");
        assert_eq!(registry.get(IndexId::from_raw(1)).unwrap().name, "beta");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["alpha", "beta"]);
        assert!(matches!(
            registry.get(IndexId::from_raw(9)),
            Err(IndexError::UnknownIndex(_))
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = IndexRegistry::new();
        registry.insert(fake(&registry, "alpha")).unwrap();
        match registry.insert(fake(&registry, "alpha")) {
            Err(IndexError::DuplicateIndex { name }) => assert_eq!(name, "alpha"),
            other => panic!("expected duplicate error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let mut registry = IndexRegistry::new();
        registry.insert(fake(&registry, "alpha")).unwrap();
        registry.freeze();
        assert!(matches!(
            registry.insert(fake(&registry, "beta")),
            Err(IndexError::RegistryFrozen)
        ));
        // Existing entries stay reachable.
        assert_eq!(registry.get(IndexId::from_raw(0)).unwrap().name, "alpha");
    }
}
