use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use quarry_core::{CancellationToken, IndexId, InputId};

use crate::container::ValueContainerImpl;
use crate::forward::{diff_input_data, ForwardIndex, InputData};
use crate::registry::IndexExtension;
use crate::storage::{Flushable, IndexStorageRead, IndexStorageWrite, MemoryIndexStorage};
use crate::{IndexError, Result};

/// Per-file metadata the input filters see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputMeta {
    pub name: String,
    pub file_type: String,
    pub charset: Option<String>,
    pub is_directory: bool,
}

impl InputMeta {
    pub fn file(name: impl Into<String>, file_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            file_type: file_type.into(),
            charset: None,
            is_directory: false,
        }
    }
}

/// Content blob plus metadata for one input, supplied by the host's content-loading
/// layer.
#[derive(Debug, Clone)]
pub struct InputContent {
    pub meta: InputMeta,
    pub bytes: Vec<u8>,
}

impl InputContent {
    pub fn new(meta: InputMeta, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            meta,
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Object-safe surface the engine facade drives for every registered index, regardless
/// of its key/value types.
pub trait UpdatableIndex: Send + Sync {
    fn id(&self) -> IndexId;
    fn name(&self) -> &str;
    fn version(&self) -> u32;
    fn accepts(&self, meta: &InputMeta) -> bool;
    fn update(&self, input_id: InputId, content: Option<&InputContent>) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn is_dirty(&self) -> bool;
    fn clear(&self) -> Result<()>;
    fn set_buffering(&self, enabled: bool);
    fn clear_memory_map(&self);
    fn indexed_input_ids(&self) -> Result<Vec<InputId>>;
}

struct IndexState<K, V> {
    storage: MemoryIndexStorage<K, V>,
    forward: Option<Box<dyn ForwardIndex<K, V>>>,
    /// In-memory forward entries for transient (buffered) updates. The persistent
    /// forward index must never see transient contributions, or the first diff after
    /// the overlay is dropped would remove keys the file still contributes.
    transient_forward: HashMap<InputId, InputData<K, V>>,
}

/// The per-index engine: applies the extension's key/value extraction to raw input,
/// diffs old vs new forward entries, and applies add/remove operations to storage.
///
/// One read/write lock guards all mutation of storage and forward index together;
/// readers of different keys proceed concurrently, writers serialize. The extraction
/// function runs outside the lock and is required to be pure.
pub struct MapReduceIndex<K, V> {
    id: IndexId,
    extension: Arc<dyn IndexExtension<K, V>>,
    state: RwLock<IndexState<K, V>>,
}

impl<K, V> MapReduceIndex<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(
        id: IndexId,
        extension: Arc<dyn IndexExtension<K, V>>,
        storage: MemoryIndexStorage<K, V>,
        forward: Option<Box<dyn ForwardIndex<K, V>>>,
    ) -> Self {
        Self {
            id,
            extension,
            state: RwLock::new(IndexState {
                storage,
                forward,
                transient_forward: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> IndexId {
        self.id
    }

    /// Point lookup: runs `f` against the merged container for `key`.
    pub fn with_data<R>(&self, key: &K, f: impl FnOnce(&ValueContainerImpl<V>) -> R) -> Result<R> {
        let state = self.state.read();
        state.storage.with_data(key, f)
    }

    /// Full key enumeration with early stop and cooperative cancellation.
    pub fn process_all_keys(
        &self,
        token: &CancellationToken,
        processor: impl FnMut(&K) -> bool,
    ) -> Result<bool> {
        let state = self.state.read();
        state.storage.process_keys(token, processor)
    }

    fn apply(&self, input_id: InputId, new_data: InputData<K, V>) -> Result<()> {
        let mut state = self.state.write();
        let buffering = state.storage.is_buffering();

        let old_data = match state.transient_forward.get(&input_id) {
            Some(data) if buffering => data.clone(),
            _ => match &state.forward {
                Some(forward) => forward.input_data(input_id)?,
                None => InputData::new(),
            },
        };
        let diff = diff_input_data(&old_data, &new_data);

        for key in &diff.removed_keys {
            state.storage.remove_all_values(key, input_id)?;
        }
        for (key, value) in diff.added_entries {
            state.storage.add_value(&key, input_id, value)?;
        }

        if buffering {
            state.transient_forward.insert(input_id, new_data);
        } else {
            if let Some(forward) = &state.forward {
                forward.put(input_id, &new_data)?;
            }
            // A persistent update supersedes any transient version of the same input.
            state.transient_forward.remove(&input_id);
        }
        Ok(())
    }
}

impl<K, V> UpdatableIndex for MapReduceIndex<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn id(&self) -> IndexId {
        self.id
    }

    fn name(&self) -> &str {
        self.extension.name()
    }

    fn version(&self) -> u32 {
        self.extension.version()
    }

    fn accepts(&self, meta: &InputMeta) -> bool {
        if meta.is_directory && !self.extension.indexes_directories() {
            return false;
        }
        self.extension.accepts(meta)
    }

    /// The core mutation entry point: `None` content is a pure deletion.
    ///
    /// Extraction runs before the write lock is taken; the forward-index diff and
    /// storage mutations run under it and are not cancellable, since an interrupted
    /// half-applied update would leave the two indices inconsistent.
    fn update(&self, input_id: InputId, content: Option<&InputContent>) -> Result<()> {
        let new_data = match content {
            Some(content) => self
                .extension
                .map(content)
                .map_err(|message| IndexError::Mapper { message })?,
            None => InputData::new(),
        };
        self.apply(input_id, new_data)
    }

    fn flush(&self) -> Result<()> {
        let state = self.state.read();
        state.storage.flush()?;
        if let Some(forward) = &state.forward {
            forward.flush()?;
        }
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.state.read().storage.is_dirty()
    }

    /// Discards all data, persisted and pending (used by rebuild).
    fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        state.transient_forward.clear();
        state.storage.clear()?;
        if let Some(forward) = &state.forward {
            forward.clear()?;
        }
        Ok(())
    }

    fn set_buffering(&self, enabled: bool) {
        self.state.read().storage.set_buffering(enabled);
    }

    fn clear_memory_map(&self) {
        let mut state = self.state.write();
        state.transient_forward.clear();
        state.storage.clear_memory_map();
    }

    fn indexed_input_ids(&self) -> Result<Vec<InputId>> {
        let state = self.state.read();
        match &state.forward {
            Some(forward) => forward.all_input_ids(),
            None => Ok(Vec::new()),
        }
    }
}
