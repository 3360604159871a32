use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quarry_core::{CancellationToken, IndexId, InputId};
use quarry_storage::{
    CorruptionMarker, DirLock, PersistentLogMap, StorageError, VersionCheck, VersionStamp,
};

use crate::access::enter_index;
use crate::container::ValueContainerImpl;
use crate::flush::{FlushScheduler, FLUSH_IDLE_WINDOW};
use crate::forward::{ForwardIndex, MapForwardIndex, SharedContentForwardIndex};
use crate::guard::{StorageGuard, StripedLock};
use crate::map_reduce::{InputContent, MapReduceIndex};
use crate::registry::{IndexExtension, IndexRegistry, RegistryEntry};
use crate::storage::{MemoryIndexStorage, PersistentIndexStorage};
use crate::{IndexError, Result};

const STAMP_FILE_NAME: &str = "version.stamp";
const INVERTED_FILE_NAME: &str = "inverted.qlm";
const FORWARD_FILE_NAME: &str = "forward.qlm";
const FORWARD_IDS_FILE_NAME: &str = "forward-ids.qlm";
const FORWARD_BLOBS_FILE_NAME: &str = "forward-blobs.qlm";

/// Assembles a [`CorpusIndex`]: acquires the root directory, registers extensions, then
/// freezes the set with [`CorpusIndexBuilder::open`].
///
/// Registration is where version checks happen: a missing or mismatched version stamp
/// (or a pending corruption marker) discards that index's persisted files before the
/// storage is opened, so a stale on-disk layout is never read.
pub struct CorpusIndexBuilder {
    root: PathBuf,
    registry: IndexRegistry,
    rebuild_all: bool,
    marker: CorruptionMarker,
    dir_lock: DirLock,
}

impl CorpusIndexBuilder {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(StorageError::from)?;
        let dir_lock = DirLock::acquire(&root)?;

        let marker = CorruptionMarker::new(&root);
        let rebuild_all = marker.consume()?;
        if rebuild_all {
            tracing::warn!(
                target = "quarry.index",
                root = %root.display(),
                "corruption marker found; every index rebuilds from scratch"
            );
        }

        Ok(Self {
            root,
            registry: IndexRegistry::new(),
            rebuild_all,
            marker,
            dir_lock,
        })
    }

    /// Registers one index definition and opens its storage.
    ///
    /// The returned handle is the typed query surface for this index; pass it to
    /// [`CorpusIndex::read`] / [`CorpusIndex::process_all_keys`].
    pub fn register<K, V>(
        &mut self,
        extension: Arc<dyn IndexExtension<K, V>>,
    ) -> Result<Arc<MapReduceIndex<K, V>>>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Eq + Hash + Clone + Send + Sync + 'static,
    {
        let id = self.registry.next_id();
        let name = extension.name().to_string();
        let dir = self.root.join(&name);
        let stamp_path = dir.join(STAMP_FILE_NAME);

        let check = if self.rebuild_all {
            VersionCheck::Mismatched
        } else {
            VersionStamp::check(&stamp_path, extension.version())?
        };
        if check == VersionCheck::Mismatched && dir.exists() {
            tracing::info!(
                target = "quarry.index",
                index = %name,
                "discarding persisted index data"
            );
            std::fs::remove_dir_all(&dir).map_err(StorageError::from)?;
        }
        std::fs::create_dir_all(&dir).map_err(StorageError::from)?;
        if check != VersionCheck::Current {
            VersionStamp::now(extension.version()).write(&stamp_path)?;
        }

        let inverted = PersistentLogMap::open(&dir.join(INVERTED_FILE_NAME))?;
        let storage = MemoryIndexStorage::new(PersistentIndexStorage::new(
            inverted,
            extension.key_externalizer(),
            extension.value_externalizer(),
        ));

        let forward: Option<Box<dyn ForwardIndex<K, V>>> = if extension.needs_forward_index() {
            Some(if extension.shares_forward_index_by_content() {
                Box::new(SharedContentForwardIndex::new(
                    PersistentLogMap::open(&dir.join(FORWARD_IDS_FILE_NAME))?,
                    PersistentLogMap::open(&dir.join(FORWARD_BLOBS_FILE_NAME))?,
                    extension.key_externalizer(),
                    extension.value_externalizer(),
                ))
            } else {
                Box::new(MapForwardIndex::new(
                    PersistentLogMap::open(&dir.join(FORWARD_FILE_NAME))?,
                    extension.key_externalizer(),
                    extension.value_externalizer(),
                ))
            })
        } else {
            None
        };

        let index = Arc::new(MapReduceIndex::new(id, extension, storage, forward));
        self.registry.insert(index.clone())?;
        Ok(index)
    }

    /// Freezes the registry and starts the background flusher.
    pub fn open(self) -> Result<CorpusIndex> {
        let Self {
            root,
            mut registry,
            rebuild_all: _,
            marker,
            dir_lock,
        } = self;

        registry.freeze();
        let registry = Arc::new(registry);

        let scheduler_registry = Arc::clone(&registry);
        let scheduler = FlushScheduler::new(
            FLUSH_IDLE_WINDOW,
            Arc::new(move || {
                for entry in scheduler_registry.entries() {
                    if !entry.engine.is_dirty() {
                        continue;
                    }
                    if let Err(err) = entry.engine.flush() {
                        tracing::warn!(
                            target = "quarry.index",
                            index = %entry.name,
                            error = %err,
                            "background flush failed; index will rebuild"
                        );
                        entry.rebuild.request_rebuild();
                    }
                }
            }),
        )
        .map_err(StorageError::from)?;

        tracing::info!(
            target = "quarry.index",
            root = %root.display(),
            indices = registry.len(),
            "index engine opened"
        );

        Ok(CorpusIndex {
            root,
            registry,
            guard: StorageGuard::new(),
            striped: StripedLock::new(),
            marker,
            scheduler,
            _dir_lock: dir_lock,
        })
    }
}

/// The engine facade: routes file updates to every registered index, serves queries,
/// and owns the shared machinery (mode guard, striped per-file locks, background
/// flusher, rebuild coordination).
pub struct CorpusIndex {
    root: PathBuf,
    registry: Arc<IndexRegistry>,
    guard: StorageGuard,
    striped: StripedLock,
    marker: CorruptionMarker,
    scheduler: FlushScheduler,
    _dir_lock: DirLock,
}

impl CorpusIndex {
    pub fn builder(root: impl Into<PathBuf>) -> Result<CorpusIndexBuilder> {
        CorpusIndexBuilder::new(root)
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn registry(&self) -> &IndexRegistry {
        &self.registry
    }

    /// Applies one file event (changed content, or `None` for deletion) to every index
    /// that accepts the input. This is the authoritative, persisted path.
    ///
    /// Per-index failures degrade rather than abort: a failed extraction skips the
    /// input for that index, a storage failure flags that index for rebuild. The other
    /// indexes still see the update.
    pub fn update_file(&self, input_id: InputId, content: Option<&InputContent>) -> Result<()> {
        let _mode = self.guard.enter(false);
        let _stripe = self.striped.lock(input_id);
        self.apply_update(input_id, content, false)?;
        self.scheduler.notify();
        Ok(())
    }

    /// Applies a transient (unsaved in-editor document) version of the input. The
    /// resulting state lives only in the in-memory overlay and is visible to queries
    /// until [`CorpusIndex::drop_transient_state`].
    pub fn update_transient(&self, input_id: InputId, content: Option<&InputContent>) -> Result<()> {
        let _mode = self.guard.enter(true);
        let _stripe = self.striped.lock(input_id);
        self.apply_update(input_id, content, true)
    }

    fn apply_update(
        &self,
        input_id: InputId,
        content: Option<&InputContent>,
        buffering: bool,
    ) -> Result<()> {
        for entry in self.registry.entries() {
            let applies = match content {
                Some(content) => entry.engine.accepts(&content.meta),
                // Deletions go everywhere: the forward index decides whether this
                // input ever contributed to this index.
                None => true,
            };
            if !applies {
                continue;
            }
            if !entry.rebuild.is_ok() {
                tracing::debug!(
                    target = "quarry.index",
                    index = %entry.name,
                    input = %input_id,
                    "skipping update; rebuild pending"
                );
                continue;
            }

            entry.engine.set_buffering(buffering);
            let _access = enter_index(entry.id)?;
            match entry.engine.update(input_id, content) {
                Ok(()) => {}
                Err(IndexError::Mapper { message }) => {
                    tracing::warn!(
                        target = "quarry.index",
                        index = %entry.name,
                        input = %input_id,
                        error = %message,
                        "extraction failed; input skipped for this index"
                    );
                }
                Err(
                    err @ (IndexError::Storage(_)
                    | IndexError::Decode { .. }
                    | IndexError::Bincode(_)),
                ) => {
                    tracing::warn!(
                        target = "quarry.index",
                        index = %entry.name,
                        input = %input_id,
                        error = %err,
                        "storage failure during update; index will rebuild"
                    );
                    entry.rebuild.request_rebuild();
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Discards all transient overlays and returns every index to persistent mode.
    pub fn drop_transient_state(&self) {
        let _mode = self.guard.enter(true);
        for entry in self.registry.entries() {
            entry.engine.clear_memory_map();
            entry.engine.set_buffering(false);
        }
    }

    /// Point query against one index. Blocks behind any pending rebuild of that index
    /// and clears it first if one is required.
    pub fn read<K, V, R>(
        &self,
        index: &MapReduceIndex<K, V>,
        key: &K,
        f: impl FnOnce(&ValueContainerImpl<V>) -> R,
    ) -> Result<R>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Eq + Hash + Clone + Send + Sync + 'static,
    {
        let entry = self.registry.get(index.id())?;
        self.ensure_up_to_date(entry)?;
        let _access = enter_index(entry.id)?;
        index.with_data(key, f)
    }

    /// Enumerates every key of one index, with the same rebuild gating as
    /// [`CorpusIndex::read`].
    pub fn process_all_keys<K, V>(
        &self,
        index: &MapReduceIndex<K, V>,
        token: &CancellationToken,
        processor: impl FnMut(&K) -> bool,
    ) -> Result<bool>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        V: Eq + Hash + Clone + Send + Sync + 'static,
    {
        let entry = self.registry.get(index.id())?;
        self.ensure_up_to_date(entry)?;
        let _access = enter_index(entry.id)?;
        index.process_all_keys(token, processor)
    }

    fn ensure_up_to_date(&self, entry: &RegistryEntry) -> Result<()> {
        entry.rebuild.clear_index_if_necessary(|| {
            tracing::info!(
                target = "quarry.index",
                index = %entry.name,
                "clearing index for rebuild"
            );
            entry.engine.clear()?;
            let stamp_path = self.root.join(&entry.name).join(STAMP_FILE_NAME);
            VersionStamp::now(entry.engine.version()).write(&stamp_path)?;
            Ok(())
        })
    }

    /// Flags one index for rebuild; returns whether this call made the transition.
    pub fn request_rebuild(&self, id: IndexId) -> Result<bool> {
        let entry = self.registry.get(id)?;
        let requested = entry.rebuild.request_rebuild();
        if requested {
            tracing::info!(
                target = "quarry.index",
                index = %entry.name,
                "rebuild requested"
            );
        }
        Ok(requested)
    }

    /// Drops the corruption marker: every index rebuilds on the next startup. Used when
    /// corruption looks pervasive rather than scoped to one index.
    pub fn mark_corrupted(&self) -> Result<()> {
        self.marker.request()?;
        Ok(())
    }

    /// Removes every trace of inputs the host no longer knows (deleted while the engine
    /// was not running, or never reported). Returns the number of entries removed.
    ///
    /// A storage failure while sweeping one index flags that index for rebuild and the
    /// sweep continues with the others, matching the per-index degradation of
    /// [`CorpusIndex::update_file`].
    pub fn sweep_stale_ids(&self, is_live: impl Fn(InputId) -> bool) -> Result<usize> {
        let _mode = self.guard.enter(false);
        let mut removed = 0usize;
        for entry in self.registry.entries() {
            if !entry.rebuild.is_ok() {
                continue;
            }
            match self.sweep_entry(entry, &is_live, &mut removed) {
                Ok(()) => {}
                Err(
                    err @ (IndexError::Storage(_)
                    | IndexError::Decode { .. }
                    | IndexError::Bincode(_)),
                ) => {
                    tracing::warn!(
                        target = "quarry.index",
                        index = %entry.name,
                        error = %err,
                        "storage failure during sweep; index will rebuild"
                    );
                    entry.rebuild.request_rebuild();
                }
                Err(err) => return Err(err),
            }
        }
        if removed > 0 {
            tracing::info!(
                target = "quarry.index",
                removed,
                "swept stale input ids"
            );
            self.scheduler.notify();
        }
        Ok(removed)
    }

    fn sweep_entry(
        &self,
        entry: &RegistryEntry,
        is_live: &impl Fn(InputId) -> bool,
        removed: &mut usize,
    ) -> Result<()> {
        for id in entry.engine.indexed_input_ids()? {
            if is_live(id) {
                continue;
            }
            let _stripe = self.striped.lock(id);
            let _access = enter_index(entry.id)?;
            entry.engine.update(id, None)?;
            *removed += 1;
        }
        Ok(())
    }

    /// Flushes every index now, on the calling thread. A failed flush flags that index
    /// for rebuild; the first error is reported after all indexes were attempted.
    pub fn flush_all(&self) -> Result<()> {
        let mut first_err = None;
        for entry in self.registry.entries() {
            if let Err(err) = entry.engine.flush() {
                tracing::warn!(
                    target = "quarry.index",
                    index = %entry.name,
                    error = %err,
                    "flush failed; index will rebuild"
                );
                entry.rebuild.request_rebuild();
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for CorpusIndex {
    fn drop(&mut self) {
        if let Err(err) = self.flush_all() {
            tracing::warn!(
                target = "quarry.index",
                error = %err,
                "final flush failed during shutdown"
            );
        }
    }
}
