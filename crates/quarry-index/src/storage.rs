use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use quarry_core::{CancellationToken, InputId};
use quarry_storage::PersistentLogMap;

use crate::change_tracking::{ChangeTrackingValueContainer, FlushOp};
use crate::container::{ValueContainer as _, ValueContainerImpl};
use crate::externalizer::DataExternalizer;
use crate::Result;

/// Log maps whose retired-record share crosses this ratio get compacted at flush time.
const COMPACT_WASTED_RATIO: f64 = 0.5;

/// Cancellation is checked every this many keys during enumeration.
const CANCELLATION_CHECK_INTERVAL: usize = 128;

/// Read access to a key → value-container store.
pub trait IndexStorageRead<K, V> {
    /// Runs `f` against the merged container for `key` (empty if the key is absent).
    ///
    /// Safe to call concurrently with writes to other keys; concurrent access to the
    /// same key is coordinated by the owning index's read/write lock.
    fn with_data<R>(&self, key: &K, f: impl FnOnce(&ValueContainerImpl<V>) -> R) -> Result<R>;

    /// Enumerates all keys present in the store. The processor returning `false` stops
    /// the enumeration early; the result is then `false`.
    fn process_keys(
        &self,
        token: &CancellationToken,
        processor: impl FnMut(&K) -> bool,
    ) -> Result<bool>;
}

/// Mutation access to a key → value-container store.
pub trait IndexStorageWrite<K, V> {
    fn add_value(&self, key: &K, id: InputId, value: V) -> Result<()>;
    fn remove_all_values(&self, key: &K, id: InputId) -> Result<()>;
    /// Discards all data, persisted and pending.
    fn clear(&self) -> Result<()>;
}

/// Persistence control.
pub trait Flushable {
    fn flush(&self) -> Result<()>;
    fn is_dirty(&self) -> bool;
}

/// Observer for the buffering-mode protocol of [`MemoryIndexStorage`].
///
/// Composed index engines that distinguish transient-document passes from the
/// authoritative pass react to these notifications.
pub trait BufferingStateListener: Send + Sync {
    fn buffering_changed(&self, _enabled: bool) {}
    fn memory_map_cleared(&self) {}
}

/// Persistent key → ValueContainer store backed by an append-only log map.
///
/// Mutations land in per-key [`ChangeTrackingValueContainer`]s and reach the log only
/// at flush time; base containers are loaded lazily under the log map's own mutex so
/// two threads can never materialize two different bases for the same key.
pub struct PersistentIndexStorage<K, V> {
    map: Arc<Mutex<PersistentLogMap>>,
    cache: Mutex<HashMap<Vec<u8>, Arc<ChangeTrackingValueContainer<V>>>>,
    key_ext: Arc<dyn DataExternalizer<K>>,
    value_ext: Arc<dyn DataExternalizer<V>>,
}

impl<K, V> PersistentIndexStorage<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(
        map: PersistentLogMap,
        key_ext: Arc<dyn DataExternalizer<K>>,
        value_ext: Arc<dyn DataExternalizer<V>>,
    ) -> Self {
        Self {
            map: Arc::new(Mutex::new(map)),
            cache: Mutex::new(HashMap::new()),
            key_ext,
            value_ext,
        }
    }

    fn encode_key(&self, key: &K) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.key_ext.save(&mut bytes, key)?;
        Ok(bytes)
    }

    fn container_for(&self, key: &K) -> Result<Arc<ChangeTrackingValueContainer<V>>> {
        let key_bytes = self.encode_key(key)?;
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.get(&key_bytes) {
            return Ok(Arc::clone(existing));
        }

        let loader = {
            let map = Arc::clone(&self.map);
            let key_bytes = key_bytes.clone();
            let value_ext = Arc::clone(&self.value_ext);
            Box::new(move || {
                let mut map = map.lock();
                let chunks = map.read_chunks(&key_bytes)?.unwrap_or_default();
                let chunk_count = chunks.len();
                let container = ValueContainerImpl::from_chunks(&chunks, value_ext.as_ref())?;
                Ok((container, chunk_count))
            })
        };

        let container = Arc::new(ChangeTrackingValueContainer::new(loader));
        cache.insert(key_bytes, Arc::clone(&container));
        Ok(container)
    }
}

impl<K, V> IndexStorageRead<K, V> for PersistentIndexStorage<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn with_data<R>(&self, key: &K, f: impl FnOnce(&ValueContainerImpl<V>) -> R) -> Result<R> {
        self.container_for(key)?.with_merged(f)
    }

    fn process_keys(
        &self,
        token: &CancellationToken,
        mut processor: impl FnMut(&K) -> bool,
    ) -> Result<bool> {
        // Union of persisted keys and keys with only pending (unflushed) content.
        let mut key_blobs: HashSet<Vec<u8>> = HashSet::new();
        {
            let map = self.map.lock();
            map.for_each_key(|key| {
                key_blobs.insert(key.to_vec());
                true
            });
        }
        // Pending state can also net a key out of existence (an unflushed deletion),
        // so dirty containers both contribute keys and veto them.
        let dirty: HashMap<Vec<u8>, Arc<ChangeTrackingValueContainer<V>>> = {
            let cache = self.cache.lock();
            cache
                .iter()
                .filter(|(_, container)| container.is_dirty())
                .map(|(bytes, container)| (bytes.clone(), Arc::clone(container)))
                .collect()
        };
        for bytes in dirty.keys() {
            key_blobs.insert(bytes.clone());
        }

        for (i, bytes) in key_blobs.iter().enumerate() {
            if i % CANCELLATION_CHECK_INTERVAL == 0 {
                token.checkpoint()?;
            }
            if let Some(container) = dirty.get(bytes) {
                if container.with_merged(|c| c.is_empty())? {
                    continue;
                }
            }
            let mut input = bytes.as_slice();
            let key = self.key_ext.read(&mut input)?;
            if !processor(&key) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<K, V> IndexStorageWrite<K, V> for PersistentIndexStorage<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn add_value(&self, key: &K, id: InputId, value: V) -> Result<()> {
        self.container_for(key)?.add_value(id, value);
        Ok(())
    }

    fn remove_all_values(&self, key: &K, id: InputId) -> Result<()> {
        self.container_for(key)?.remove_all_values(id);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.cache.lock().clear();
        self.map.lock().clear()?;
        Ok(())
    }
}

impl<K, V> Flushable for PersistentIndexStorage<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn flush(&self) -> Result<()> {
        // Drain the cache first so no per-key container mutex is held while the log
        // map is locked for the actual writes.
        let entries: Vec<(Vec<u8>, Arc<ChangeTrackingValueContainer<V>>)> =
            self.cache.lock().drain().collect();

        for (key_bytes, container) in entries {
            match container.prepare_flush(self.value_ext.as_ref())? {
                FlushOp::Clean => {}
                FlushOp::AppendDelta(chunk) => {
                    self.map.lock().append(&key_bytes, &chunk)?;
                    container.mark_flushed();
                }
                FlushOp::ReplaceMerged(chunk) => {
                    let mut map = self.map.lock();
                    if chunk_is_empty_container(&chunk) {
                        map.remove(&key_bytes)?;
                    } else {
                        map.replace(&key_bytes, &chunk)?;
                    }
                    container.mark_flushed();
                }
            }
        }

        let mut map = self.map.lock();
        if map.wasted_ratio() > COMPACT_WASTED_RATIO {
            map.compact()?;
        }
        map.flush()?;
        Ok(())
    }

    fn is_dirty(&self) -> bool {
        self.cache.lock().values().any(|c| c.is_dirty())
    }
}

/// A full chunk encoding zero values means the container became empty; persist that as
/// a tombstone rather than an empty record chain.
fn chunk_is_empty_container(chunk: &[u8]) -> bool {
    // Zigzag encoding of 0 is a single zero byte.
    chunk == [0]
}

/// In-memory overlay over a persistent backend, used during buffering (transient /
/// unsaved-document) indexing.
///
/// When buffering is enabled writes land in overlay containers whose base reads through
/// to the backend's merged data; the overlay never reaches disk and is discarded
/// wholesale by [`MemoryIndexStorage::clear_memory_map`]. Reads always consult the
/// overlay first so transient state is visible until dropped.
pub struct MemoryIndexStorage<K, V> {
    backend: Arc<PersistentIndexStorage<K, V>>,
    buffering: AtomicBool,
    overlay: Mutex<HashMap<Vec<u8>, Arc<ChangeTrackingValueContainer<V>>>>,
    listeners: Mutex<Vec<Arc<dyn BufferingStateListener>>>,
}

impl<K, V> MemoryIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(backend: PersistentIndexStorage<K, V>) -> Self {
        Self {
            backend: Arc::new(backend),
            buffering: AtomicBool::new(false),
            overlay: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add_buffering_state_listener(&self, listener: Arc<dyn BufferingStateListener>) {
        self.listeners.lock().push(listener);
    }

    #[must_use]
    pub fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::Acquire)
    }

    pub fn set_buffering(&self, enabled: bool) {
        let was = self.buffering.swap(enabled, Ordering::AcqRel);
        if was != enabled {
            for listener in self.listeners.lock().iter() {
                listener.buffering_changed(enabled);
            }
        }
    }

    /// Discards the transient overlay (rolls back unsaved-document indexing).
    pub fn clear_memory_map(&self) {
        self.overlay.lock().clear();
        for listener in self.listeners.lock().iter() {
            listener.memory_map_cleared();
        }
    }

    fn overlay_container_for(&self, key: &K) -> Result<Arc<ChangeTrackingValueContainer<V>>> {
        let mut key_bytes = Vec::new();
        self.backend.key_ext.save(&mut key_bytes, key)?;

        let mut overlay = self.overlay.lock();
        if let Some(existing) = overlay.get(&key_bytes) {
            return Ok(Arc::clone(existing));
        }

        // The overlay base is the backend's merged view; overlay deltas sit on top and
        // are never persisted, so the chunk count is irrelevant.
        let loader = {
            let backend = Arc::clone(&self.backend);
            let key = key.clone();
            Box::new(move || backend.with_data(&key, |c| (c.clone(), 0)))
        };

        let container = Arc::new(ChangeTrackingValueContainer::new(loader));
        overlay.insert(key_bytes, Arc::clone(&container));
        Ok(container)
    }

    fn overlay_lookup(&self, key: &K) -> Result<Option<Arc<ChangeTrackingValueContainer<V>>>> {
        let mut key_bytes = Vec::new();
        self.backend.key_ext.save(&mut key_bytes, key)?;
        Ok(self.overlay.lock().get(&key_bytes).map(Arc::clone))
    }
}

impl<K, V> IndexStorageRead<K, V> for MemoryIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn with_data<R>(&self, key: &K, f: impl FnOnce(&ValueContainerImpl<V>) -> R) -> Result<R> {
        if let Some(container) = self.overlay_lookup(key)? {
            return container.with_merged(f);
        }
        self.backend.with_data(key, f)
    }

    fn process_keys(
        &self,
        token: &CancellationToken,
        mut processor: impl FnMut(&K) -> bool,
    ) -> Result<bool> {
        let overlay: Vec<(Vec<u8>, Arc<ChangeTrackingValueContainer<V>>)> = self
            .overlay
            .lock()
            .iter()
            .map(|(bytes, container)| (bytes.clone(), Arc::clone(container)))
            .collect();
        // Overlay containers shadow the backend for their keys even when the net state
        // is empty, so every overlay key is withheld from the backend pass below.
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        for (i, (bytes, container)) in overlay.iter().enumerate() {
            if i % CANCELLATION_CHECK_INTERVAL == 0 {
                token.checkpoint()?;
            }
            seen.insert(bytes.clone());
            if container.with_merged(|c| c.is_empty())? {
                continue;
            }
            let mut input = bytes.as_slice();
            let key = self.backend.key_ext.read(&mut input)?;
            if !processor(&key) {
                return Ok(false);
            }
        }
        self.backend.process_keys(token, |key| {
            let mut bytes = Vec::new();
            if self.backend.key_ext.save(&mut bytes, key).is_err() {
                return true;
            }
            if seen.contains(&bytes) {
                return true;
            }
            processor(key)
        })
    }
}

impl<K, V> IndexStorageWrite<K, V> for MemoryIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn add_value(&self, key: &K, id: InputId, value: V) -> Result<()> {
        if self.is_buffering() {
            self.overlay_container_for(key)?.add_value(id, value);
            return Ok(());
        }
        // Readers consult resident overlay containers first, so an authoritative write
        // must land in both the overlay's view and the backend.
        if let Some(container) = self.overlay_lookup(key)? {
            container.add_value(id, value.clone());
        }
        self.backend.add_value(key, id, value)
    }

    fn remove_all_values(&self, key: &K, id: InputId) -> Result<()> {
        if self.is_buffering() {
            self.overlay_container_for(key)?.remove_all_values(id);
            return Ok(());
        }
        if let Some(container) = self.overlay_lookup(key)? {
            container.remove_all_values(id);
        }
        self.backend.remove_all_values(key, id)
    }

    fn clear(&self) -> Result<()> {
        self.clear_memory_map();
        self.backend.clear()
    }
}

impl<K, V> Flushable for MemoryIndexStorage<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Flushes the persistent backend only; overlay content is transient by contract.
    fn flush(&self) -> Result<()> {
        self.backend.flush()
    }

    fn is_dirty(&self) -> bool {
        self.backend.is_dirty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ValueContainer as _;
    use crate::externalizer::{StringExternalizer, U32Externalizer};
    use std::sync::atomic::AtomicUsize;

    fn id(raw: u32) -> InputId {
        InputId::from_raw(raw)
    }

    fn open_storage(dir: &std::path::Path) -> PersistentIndexStorage<String, u32> {
        let map = PersistentLogMap::open(&dir.join("inverted.qlm")).unwrap();
        PersistentIndexStorage::new(
            map,
            Arc::new(StringExternalizer),
            Arc::new(U32Externalizer),
        )
    }

    fn ids_for(storage: &impl IndexStorageRead<String, u32>, key: &str, value: u32) -> Vec<u32> {
        let mut ids: Vec<u32> = storage
            .with_data(&key.to_string(), |c| {
                c.input_ids(&value).map(InputId::to_raw).collect()
            })
            .unwrap();
        ids.sort_unstable();
        ids
    }

    #[test]
    fn writes_survive_flush_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();

        let storage = open_storage(dir.path());
        storage.add_value(&"alpha".to_string(), id(1), 10).unwrap();
        storage.add_value(&"alpha".to_string(), id(2), 10).unwrap();
        storage.add_value(&"beta".to_string(), id(1), 20).unwrap();
        assert!(storage.is_dirty());
        storage.flush().unwrap();
        assert!(!storage.is_dirty());
        drop(storage);

        let storage = open_storage(dir.path());
        assert_eq!(ids_for(&storage, "alpha", 10), vec![1, 2]);
        assert_eq!(ids_for(&storage, "beta", 20), vec![1]);
    }

    #[test]
    fn remove_all_persists_as_invalidation() {
        let dir = tempfile::TempDir::new().unwrap();

        let storage = open_storage(dir.path());
        storage.add_value(&"k".to_string(), id(1), 10).unwrap();
        storage.add_value(&"k".to_string(), id(2), 10).unwrap();
        storage.flush().unwrap();

        storage.remove_all_values(&"k".to_string(), id(1)).unwrap();
        storage.flush().unwrap();
        drop(storage);

        let storage = open_storage(dir.path());
        assert_eq!(ids_for(&storage, "k", 10), vec![2]);
    }

    #[test]
    fn unflushed_keys_are_enumerated() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = open_storage(dir.path());
        storage.add_value(&"pending".to_string(), id(1), 1).unwrap();

        let mut keys = Vec::new();
        let all = storage
            .process_keys(&CancellationToken::new(), |k| {
                keys.push(k.clone());
                true
            })
            .unwrap();
        assert!(all);
        assert_eq!(keys, vec!["pending".to_string()]);
    }

    #[test]
    fn process_keys_honours_cancellation() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = open_storage(dir.path());
        for i in 0..10 {
            storage.add_value(&format!("k{i}"), id(i), 1).unwrap();
        }
        storage.flush().unwrap();

        let token = CancellationToken::new();
        token.cancel();
        match storage.process_keys(&token, |_| true) {
            Err(crate::IndexError::Cancelled(_)) => {}
            other => panic!("expected cancellation, got {other:?}"),
        }
    }

    #[test]
    fn buffering_writes_stay_out_of_the_backend() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = MemoryIndexStorage::new(open_storage(dir.path()));

        storage.add_value(&"k".to_string(), id(1), 1).unwrap();
        storage.flush().unwrap();

        storage.set_buffering(true);
        storage.add_value(&"k".to_string(), id(2), 1).unwrap();

        // Transient state is visible through the overlay.
        assert_eq!(ids_for(&storage, "k", 1), vec![1, 2]);
        // The backend never saw it.
        assert_eq!(ids_for(storage.backend.as_ref(), "k", 1), vec![1]);

        storage.clear_memory_map();
        assert_eq!(ids_for(&storage, "k", 1), vec![1]);
    }

    #[test]
    fn persistent_writes_reach_memoized_overlay_containers() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = MemoryIndexStorage::new(open_storage(dir.path()));

        storage.add_value(&"k".to_string(), id(1), 1).unwrap();
        storage.flush().unwrap();

        storage.set_buffering(true);
        storage.add_value(&"k".to_string(), id(2), 1).unwrap();
        // Memoize the overlay's merged view before the authoritative write lands.
        assert_eq!(ids_for(&storage, "k", 1), vec![1, 2]);

        storage.set_buffering(false);
        storage.add_value(&"k".to_string(), id(3), 1).unwrap();
        assert_eq!(ids_for(&storage, "k", 1), vec![1, 2, 3]);

        storage.remove_all_values(&"k".to_string(), id(1)).unwrap();
        assert_eq!(ids_for(&storage, "k", 1), vec![2, 3]);

        // Dropping the overlay leaves exactly the authoritative state.
        storage.clear_memory_map();
        assert_eq!(ids_for(&storage, "k", 1), vec![3]);
    }

    #[test]
    fn keys_netted_out_by_pending_deletions_are_not_enumerated() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = open_storage(dir.path());

        let keys_of = |storage: &PersistentIndexStorage<String, u32>| {
            let mut keys = Vec::new();
            storage
                .process_keys(&CancellationToken::new(), |k| {
                    keys.push(k.clone());
                    true
                })
                .unwrap();
            keys.sort();
            keys
        };

        // Added and deleted again without an intervening flush.
        storage.add_value(&"pending".to_string(), id(1), 1).unwrap();
        storage.remove_all_values(&"pending".to_string(), id(1)).unwrap();
        assert_eq!(keys_of(&storage), Vec::<String>::new());

        // Persisted, then deleted with the deletion still unflushed.
        storage.add_value(&"stored".to_string(), id(2), 2).unwrap();
        storage.flush().unwrap();
        storage.remove_all_values(&"stored".to_string(), id(2)).unwrap();
        assert_eq!(keys_of(&storage), Vec::<String>::new());

        storage.flush().unwrap();
        assert_eq!(keys_of(&storage), Vec::<String>::new());
    }

    #[test]
    fn buffering_listener_sees_flips_and_clears() {
        #[derive(Default)]
        struct Counting {
            flips: AtomicUsize,
            clears: AtomicUsize,
        }
        impl BufferingStateListener for Counting {
            fn buffering_changed(&self, _enabled: bool) {
                self.flips.fetch_add(1, Ordering::SeqCst);
            }
            fn memory_map_cleared(&self) {
                self.clears.fetch_add(1, Ordering::SeqCst);
            }
        }

        let dir = tempfile::TempDir::new().unwrap();
        let storage = MemoryIndexStorage::new(open_storage(dir.path()));
        let listener = Arc::new(Counting::default());
        storage.add_buffering_state_listener(listener.clone());

        storage.set_buffering(true);
        storage.set_buffering(true); // no-op, no notification
        storage.set_buffering(false);
        storage.clear_memory_map();

        assert_eq!(listener.flips.load(Ordering::SeqCst), 2);
        assert_eq!(listener.clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn emptied_container_is_tombstoned_on_flush() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = open_storage(dir.path());
        storage.add_value(&"k".to_string(), id(1), 1).unwrap();
        storage.flush().unwrap();

        // remove_value path: forces a full rewrite of an now-empty container.
        storage
            .with_data(&"k".to_string(), |c| assert_eq!(c.total_associations(), 1))
            .unwrap();
        let container = storage.container_for(&"k".to_string()).unwrap();
        container.remove_value(id(1), &1);
        storage.flush().unwrap();

        let mut keys = Vec::new();
        storage
            .process_keys(&CancellationToken::new(), |k| {
                keys.push(k.clone());
                true
            })
            .unwrap();
        assert!(keys.is_empty());
    }
}
