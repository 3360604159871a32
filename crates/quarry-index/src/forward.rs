use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use quarry_core::InputId;
use quarry_storage::PersistentLogMap;

use crate::externalizer::{read_uvarint, write_uvarint, DataExternalizer};
use crate::{IndexError, Result};

/// The key → value mapping one file currently contributes to an index.
pub type InputData<K, V> = HashMap<K, V>;

/// Diff between a file's previously recorded contribution and its new one.
#[derive(Debug)]
pub struct InputDiff<K, V> {
    /// Keys in old whose entry has no equal counterpart in new.
    pub removed_keys: Vec<K>,
    /// Entries in new with no equal counterpart in old.
    pub added_entries: Vec<(K, V)>,
}

/// A key present in both maps with a changed value counts as removed-old and added-new.
pub fn diff_input_data<K, V>(old: &InputData<K, V>, new: &InputData<K, V>) -> InputDiff<K, V>
where
    K: Eq + Hash + Clone,
    V: PartialEq + Clone,
{
    let mut diff = InputDiff {
        removed_keys: Vec::new(),
        added_entries: Vec::new(),
    };
    for (key, old_value) in old {
        if new.get(key) != Some(old_value) {
            diff.removed_keys.push(key.clone());
        }
    }
    for (key, new_value) in new {
        if old.get(key) != Some(new_value) {
            diff.added_entries.push((key.clone(), new_value.clone()));
        }
    }
    diff
}

/// File-id → contributed-keys store, consulted to compute removal sets on the next
/// update of the same file (or on its deletion).
pub trait ForwardIndex<K, V>: Send + Sync {
    /// The previously recorded contribution of `id`, empty if none.
    fn input_data(&self, id: InputId) -> Result<InputData<K, V>>;

    /// Records the new contribution; an empty map removes the entry.
    fn put(&self, id: InputId, data: &InputData<K, V>) -> Result<()>;

    /// Every input id with a recorded entry. Used by the stale-id sweep.
    fn all_input_ids(&self) -> Result<Vec<InputId>>;

    fn flush(&self) -> Result<()>;

    fn clear(&self) -> Result<()>;
}

fn serialize_input_data<K, V>(
    data: &InputData<K, V>,
    key_ext: &dyn DataExternalizer<K>,
    value_ext: &dyn DataExternalizer<V>,
) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    write_uvarint(&mut out, data.len() as u64);
    for (key, value) in data {
        key_ext.save(&mut out, key)?;
        value_ext.save(&mut out, value)?;
    }
    Ok(out)
}

fn deserialize_input_data<K, V>(
    mut input: &[u8],
    key_ext: &dyn DataExternalizer<K>,
    value_ext: &dyn DataExternalizer<V>,
) -> Result<InputData<K, V>>
where
    K: Eq + Hash,
{
    let count = read_uvarint(&mut input)? as usize;
    let mut data = InputData::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let key = key_ext.read(&mut input)?;
        let value = value_ext.read(&mut input)?;
        data.insert(key, value);
    }
    if !input.is_empty() {
        return Err(IndexError::decode("trailing bytes after forward entry"));
    }
    Ok(data)
}

fn input_id_key(id: InputId) -> [u8; 4] {
    id.to_raw().to_le_bytes()
}

fn decode_input_id(bytes: &[u8]) -> Result<InputId> {
    let raw: [u8; 4] = bytes
        .try_into()
        .map_err(|_| IndexError::decode("bad forward index key"))?;
    Ok(InputId::from_raw(u32::from_le_bytes(raw)))
}

/// Forward index storing each file's key set as an inline per-file blob.
pub struct MapForwardIndex<K, V> {
    map: Mutex<PersistentLogMap>,
    key_ext: Arc<dyn DataExternalizer<K>>,
    value_ext: Arc<dyn DataExternalizer<V>>,
}

impl<K, V> MapForwardIndex<K, V> {
    pub fn new(
        map: PersistentLogMap,
        key_ext: Arc<dyn DataExternalizer<K>>,
        value_ext: Arc<dyn DataExternalizer<V>>,
    ) -> Self {
        Self {
            map: Mutex::new(map),
            key_ext,
            value_ext,
        }
    }
}

impl<K, V> ForwardIndex<K, V> for MapForwardIndex<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
{
    fn input_data(&self, id: InputId) -> Result<InputData<K, V>> {
        let chunks = self.map.lock().read_chunks(&input_id_key(id))?;
        match chunks.as_deref() {
            // Entries are written with `replace`, so a single chunk is the whole blob.
            Some([blob]) => {
                deserialize_input_data(blob, self.key_ext.as_ref(), self.value_ext.as_ref())
            }
            Some(_) => Err(IndexError::decode("forward entry has multiple chunks")),
            None => Ok(InputData::new()),
        }
    }

    fn put(&self, id: InputId, data: &InputData<K, V>) -> Result<()> {
        let mut map = self.map.lock();
        if data.is_empty() {
            map.remove(&input_id_key(id))?;
            return Ok(());
        }
        let blob = serialize_input_data(data, self.key_ext.as_ref(), self.value_ext.as_ref())?;
        map.replace(&input_id_key(id), &blob)?;
        Ok(())
    }

    fn all_input_ids(&self) -> Result<Vec<InputId>> {
        let map = self.map.lock();
        let mut ids = Vec::with_capacity(map.len());
        let mut decode_err = None;
        map.for_each_key(|bytes| match decode_input_id(bytes) {
            Ok(id) => {
                ids.push(id);
                true
            }
            Err(err) => {
                decode_err = Some(err);
                false
            }
        });
        match decode_err {
            Some(err) => Err(err),
            None => Ok(ids),
        }
    }

    fn flush(&self) -> Result<()> {
        Ok(self.map.lock().flush()?)
    }

    fn clear(&self) -> Result<()> {
        Ok(self.map.lock().clear()?)
    }
}

/// Content-addressed forward index: the per-file entry is a blake3 hash that indirects
/// into a shared snapshot store, so files with identical contributions share one blob.
///
/// Orphaned blobs (hashes no id references anymore) are reclaimed only by `clear`; the
/// dedup win dominates for the snapshot-style workloads this variant targets.
pub struct SharedContentForwardIndex<K, V> {
    ids: Mutex<PersistentLogMap>,
    blobs: Mutex<PersistentLogMap>,
    key_ext: Arc<dyn DataExternalizer<K>>,
    value_ext: Arc<dyn DataExternalizer<V>>,
}

impl<K, V> SharedContentForwardIndex<K, V> {
    pub fn new(
        ids: PersistentLogMap,
        blobs: PersistentLogMap,
        key_ext: Arc<dyn DataExternalizer<K>>,
        value_ext: Arc<dyn DataExternalizer<V>>,
    ) -> Self {
        Self {
            ids: Mutex::new(ids),
            blobs: Mutex::new(blobs),
            key_ext,
            value_ext,
        }
    }

    #[cfg(test)]
    pub(crate) fn blob_count(&self) -> usize {
        self.blobs.lock().len()
    }
}

impl<K, V> ForwardIndex<K, V> for SharedContentForwardIndex<K, V>
where
    K: Eq + Hash + Send + Sync,
    V: Send + Sync,
{
    fn input_data(&self, id: InputId) -> Result<InputData<K, V>> {
        let hash = match self.ids.lock().read_chunks(&input_id_key(id))?.as_deref() {
            Some([hash]) => hash.clone(),
            Some(_) => return Err(IndexError::decode("forward entry has multiple chunks")),
            None => return Ok(InputData::new()),
        };
        match self.blobs.lock().read_chunks(&hash)?.as_deref() {
            Some([blob]) => {
                deserialize_input_data(blob, self.key_ext.as_ref(), self.value_ext.as_ref())
            }
            _ => Err(IndexError::decode("missing shared forward blob")),
        }
    }

    fn put(&self, id: InputId, data: &InputData<K, V>) -> Result<()> {
        if data.is_empty() {
            self.ids.lock().remove(&input_id_key(id))?;
            return Ok(());
        }

        let blob = serialize_input_data(data, self.key_ext.as_ref(), self.value_ext.as_ref())?;
        let hash = blake3::hash(&blob);
        {
            let mut blobs = self.blobs.lock();
            if !blobs.contains_key(hash.as_bytes()) {
                blobs.replace(hash.as_bytes(), &blob)?;
            }
        }
        self.ids.lock().replace(&input_id_key(id), hash.as_bytes())?;
        Ok(())
    }

    fn all_input_ids(&self) -> Result<Vec<InputId>> {
        let ids = self.ids.lock();
        let mut out = Vec::with_capacity(ids.len());
        let mut decode_err = None;
        ids.for_each_key(|bytes| match decode_input_id(bytes) {
            Ok(id) => {
                out.push(id);
                true
            }
            Err(err) => {
                decode_err = Some(err);
                false
            }
        });
        match decode_err {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    fn flush(&self) -> Result<()> {
        self.blobs.lock().flush()?;
        self.ids.lock().flush()?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.ids.lock().clear()?;
        self.blobs.lock().clear()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::externalizer::{StringExternalizer, U32Externalizer};

    fn id(raw: u32) -> InputId {
        InputId::from_raw(raw)
    }

    fn data(entries: &[(&str, u32)]) -> InputData<String, u32> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn open_map(dir: &std::path::Path, name: &str) -> PersistentLogMap {
        PersistentLogMap::open(&dir.join(name)).unwrap()
    }

    #[test]
    fn diff_reports_changed_values_as_removed_and_added() {
        let old = data(&[("a", 1), ("b", 2), ("c", 3)]);
        let new = data(&[("a", 1), ("b", 9), ("d", 4)]);

        let mut diff = diff_input_data(&old, &new);
        diff.removed_keys.sort();
        diff.added_entries.sort();

        assert_eq!(diff.removed_keys, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(
            diff.added_entries,
            vec![("b".to_string(), 9), ("d".to_string(), 4)]
        );
    }

    #[test]
    fn map_forward_index_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let forward = MapForwardIndex::new(
            open_map(dir.path(), "fwd.qlm"),
            Arc::new(StringExternalizer),
            Arc::new(U32Externalizer),
        );

        assert!(forward.input_data(id(1)).unwrap().is_empty());

        forward.put(id(1), &data(&[("a", 1), ("b", 2)])).unwrap();
        assert_eq!(forward.input_data(id(1)).unwrap(), data(&[("a", 1), ("b", 2)]));

        forward.put(id(1), &data(&[("c", 3)])).unwrap();
        assert_eq!(forward.input_data(id(1)).unwrap(), data(&[("c", 3)]));

        forward.put(id(1), &InputData::new()).unwrap();
        assert!(forward.input_data(id(1)).unwrap().is_empty());
        assert!(forward.all_input_ids().unwrap().is_empty());
    }

    #[test]
    fn shared_forward_index_deduplicates_identical_contributions() {
        let dir = tempfile::TempDir::new().unwrap();
        let forward = SharedContentForwardIndex::new(
            open_map(dir.path(), "fwd-ids.qlm"),
            open_map(dir.path(), "fwd-blobs.qlm"),
            Arc::new(StringExternalizer),
            Arc::new(U32Externalizer),
        );

        // HashMap iteration order varies, so single-entry maps are the reliable way to
        // get identical serialized blobs.
        forward.put(id(1), &data(&[("same", 7)])).unwrap();
        forward.put(id(2), &data(&[("same", 7)])).unwrap();
        forward.put(id(3), &data(&[("other", 8)])).unwrap();

        assert_eq!(forward.blob_count(), 2);
        assert_eq!(forward.input_data(id(1)).unwrap(), data(&[("same", 7)]));
        assert_eq!(forward.input_data(id(2)).unwrap(), data(&[("same", 7)]));

        let mut ids: Vec<u32> = forward
            .all_input_ids()
            .unwrap()
            .into_iter()
            .map(InputId::to_raw)
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
