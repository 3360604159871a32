use std::collections::HashMap;
use std::hash::Hash;

use quarry_core::InputId;

use crate::externalizer::{
    read_ivarint, read_uvarint, write_ivarint, write_uvarint, DataExternalizer,
};
use crate::id_set::InputIdSet;
use crate::{IndexError, Result};

/// Read contract for a value → input-id-set mapping.
///
/// Iteration order of both values and ids is unspecified.
pub trait ValueContainer<V> {
    /// Distinct values present in the container. Each call restarts the sequence.
    fn values(&self) -> Box<dyn Iterator<Item = &V> + '_>;

    /// Input ids associated with `value`.
    fn input_ids<'a>(&'a self, value: &V) -> Box<dyn Iterator<Item = InputId> + 'a>;

    /// Membership test "is `id` associated with `value`".
    fn is_associated(&self, value: &V, id: InputId) -> bool;

    /// Number of (value, input-id) associations.
    fn total_associations(&self) -> usize;
}

/// Concrete, updatable value container.
///
/// For a given key, each (value, input-id) pair appears at most once; whether one input
/// id may carry several values for the same key is the index's business, not enforced
/// here.
#[derive(Debug, Clone)]
pub struct ValueContainerImpl<V> {
    map: HashMap<V, InputIdSet>,
}

impl<V> Default for ValueContainerImpl<V> {
    fn default() -> Self {
        Self {
            map: HashMap::new(),
        }
    }
}

impl<V> ValueContainerImpl<V>
where
    V: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Associates `id` with `value`; returns whether the container changed.
    pub fn add(&mut self, id: InputId, value: V) -> bool {
        self.map.entry(value).or_default().insert(id.to_raw())
    }

    /// Drops the (value, id) association; returns whether it was present.
    pub fn remove(&mut self, id: InputId, value: &V) -> bool {
        let Some(ids) = self.map.get_mut(value) else {
            return false;
        };
        let removed = ids.remove(id.to_raw());
        if removed && ids.is_empty() {
            self.map.remove(value);
        }
        removed
    }

    /// Drops every association `id` holds in this container.
    pub fn remove_all(&mut self, id: InputId) -> bool {
        let raw = id.to_raw();
        let before = self.map.len();
        let mut changed = false;
        self.map.retain(|_, ids| {
            if ids.remove(raw) {
                changed = true;
            }
            !ids.is_empty()
        });
        changed || self.map.len() != before
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn values_len(&self) -> usize {
        self.map.len()
    }

    /// Serializes the full container as a non-negative count-prefixed chunk.
    pub fn save_full(&self, out: &mut Vec<u8>, ext: &dyn DataExternalizer<V>) -> Result<()> {
        write_ivarint(out, self.map.len() as i64);
        for (value, ids) in &self.map {
            ext.save(out, value)?;
            write_id_list(out, &ids.to_sorted_vec());
        }
        Ok(())
    }

    /// Serializes an incremental delta chunk: a negative-count sentinel listing
    /// invalidated input ids ("drop everything this id contributed"), followed by the
    /// added associations.
    pub fn save_delta(
        out: &mut Vec<u8>,
        invalidated: &[u32],
        added: &Self,
        ext: &dyn DataExternalizer<V>,
    ) -> Result<()> {
        if !invalidated.is_empty() {
            write_ivarint(out, -(invalidated.len() as i64));
            for &id in invalidated {
                write_uvarint(out, u64::from(id));
            }
        }
        added.save_full(out, ext)
    }

    /// Replays one serialized chunk into this container.
    pub fn read_delta_into(
        &mut self,
        input: &mut &[u8],
        ext: &dyn DataExternalizer<V>,
    ) -> Result<()> {
        let header = read_ivarint(input)?;
        let pair_count = if header < 0 {
            let invalidated = header
                .checked_neg()
                .ok_or_else(|| IndexError::decode("invalid chunk header"))?
                as usize;
            for _ in 0..invalidated {
                let raw = read_uvarint(input)?;
                let raw = u32::try_from(raw)
                    .map_err(|_| IndexError::decode("input id out of range"))?;
                self.remove_all(InputId::from_raw(raw));
            }
            let count = read_ivarint(input)?;
            if count < 0 {
                return Err(IndexError::decode("chunk has two invalidation sections"));
            }
            count as usize
        } else {
            header as usize
        };

        for _ in 0..pair_count {
            let value = ext.read(input)?;
            for id in read_id_list(input)? {
                self.add(InputId::from_raw(id), value.clone());
            }
        }
        Ok(())
    }

    /// Reconstructs a container by replaying `chunks` in append order.
    pub fn from_chunks(chunks: &[Vec<u8>], ext: &dyn DataExternalizer<V>) -> Result<Self> {
        let mut container = Self::new();
        for chunk in chunks {
            let mut input = chunk.as_slice();
            container.read_delta_into(&mut input, ext)?;
            if !input.is_empty() {
                return Err(IndexError::decode("trailing bytes after container chunk"));
            }
        }
        Ok(container)
    }
}

impl<V> ValueContainer<V> for ValueContainerImpl<V>
where
    V: Eq + Hash + Clone,
{
    fn values(&self) -> Box<dyn Iterator<Item = &V> + '_> {
        Box::new(self.map.keys())
    }

    fn input_ids<'a>(&'a self, value: &V) -> Box<dyn Iterator<Item = InputId> + 'a> {
        match self.map.get(value) {
            Some(ids) => Box::new(ids.iter().map(InputId::from_raw)),
            None => Box::new(std::iter::empty()),
        }
    }

    fn is_associated(&self, value: &V, id: InputId) -> bool {
        self.map
            .get(value)
            .is_some_and(|ids| ids.contains(id.to_raw()))
    }

    fn total_associations(&self) -> usize {
        self.map.values().map(InputIdSet::len).sum()
    }
}

fn write_id_list(out: &mut Vec<u8>, sorted_ids: &[u32]) {
    write_uvarint(out, sorted_ids.len() as u64);
    let mut prev = 0u32;
    for &id in sorted_ids {
        write_uvarint(out, u64::from(id - prev));
        prev = id;
    }
}

fn read_id_list(input: &mut &[u8]) -> Result<Vec<u32>> {
    let count = read_uvarint(input)? as usize;
    let mut ids = Vec::with_capacity(count.min(1 << 16));
    let mut prev = 0u64;
    for _ in 0..count {
        let delta = read_uvarint(input)?;
        prev = prev
            .checked_add(delta)
            .ok_or_else(|| IndexError::decode("input id out of range"))?;
        let id =
            u32::try_from(prev).map_err(|_| IndexError::decode("input id out of range"))?;
        ids.push(id);
    }
    Ok(ids)
}
