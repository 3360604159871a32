use std::collections::HashSet;
use std::hash::Hash;

use parking_lot::Mutex;
use quarry_core::InputId;

use crate::container::{ValueContainer as _, ValueContainerImpl};
use crate::externalizer::DataExternalizer;
use crate::Result;

/// Number of on-disk chunks for one key above which the next flush rewrites the key as
/// a single merged chunk instead of appending another delta.
pub const COMPACT_CHUNK_THRESHOLD: usize = 8;

/// Loads the persisted base container for a key, returning it together with the number
/// of chunks it was reconstructed from.
///
/// The loader must perform the physical read under the storage's own lock; the
/// change-tracking container serializes calls so the base is computed at most once.
pub type BaseLoader<V> = Box<dyn Fn() -> Result<(ValueContainerImpl<V>, usize)> + Send + Sync>;

/// What a flush should do for one key.
#[derive(Debug, PartialEq, Eq)]
pub enum FlushOp {
    /// Nothing pending.
    Clean,
    /// Append this delta chunk.
    AppendDelta(Vec<u8>),
    /// Replace all chunks for the key with this merged full chunk.
    ReplaceMerged(Vec<u8>),
}

#[derive(Debug)]
struct TrackerState<V> {
    /// Memoized merged view; computed at most once, then kept current on every
    /// mutation (double-write) to avoid recomputation storms.
    merged: Option<ValueContainerImpl<V>>,
    added: ValueContainerImpl<V>,
    removed: ValueContainerImpl<V>,
    invalidated: HashSet<u32>,
    /// Set when the base load saw a tombstone-heavy chunk chain; the next flush
    /// rewrites the key wholesale.
    needs_compacting: bool,
}

/// Wraps a lazily-materialized base container with added/removed deltas and an
/// invalidated-id set, so a burst of updates to the same key does not repeatedly hit
/// storage.
///
/// Merge order is fixed: base, minus invalidated ids' associations, minus the removed
/// delta, plus the added delta. The final merged state depends only on the net delta
/// state, not on call interleaving.
pub struct ChangeTrackingValueContainer<V> {
    state: Mutex<TrackerState<V>>,
    loader: BaseLoader<V>,
}

impl<V> std::fmt::Debug for ChangeTrackingValueContainer<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeTrackingValueContainer").finish_non_exhaustive()
    }
}

impl<V> ChangeTrackingValueContainer<V>
where
    V: Eq + Hash + Clone,
{
    pub fn new(loader: BaseLoader<V>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                merged: None,
                added: ValueContainerImpl::new(),
                removed: ValueContainerImpl::new(),
                invalidated: HashSet::new(),
                needs_compacting: false,
            }),
            loader,
        }
    }

    pub fn add_value(&self, id: InputId, value: V) {
        let mut state = self.state.lock();
        if let Some(merged) = &mut state.merged {
            merged.add(id, value.clone());
        }
        // A pending unflushed removal of the same association cancels out.
        if !state.removed.remove(id, &value) {
            state.added.add(id, value);
        }
    }

    pub fn remove_value(&self, id: InputId, value: &V) {
        let mut state = self.state.lock();
        if let Some(merged) = &mut state.merged {
            merged.remove(id, value);
        }
        // Mirror of add: cancel a pending unflushed add first.
        if !state.added.remove(id, value) && !state.invalidated.contains(&id.to_raw()) {
            state.removed.add(id, value.clone());
        }
    }

    /// Drops whatever the base says about `id` entirely; later adds for the same id
    /// proceed normally.
    pub fn remove_all_values(&self, id: InputId) {
        let mut state = self.state.lock();
        if let Some(merged) = &mut state.merged {
            merged.remove_all(id);
        }
        state.added.remove_all(id);
        state.removed.remove_all(id);
        state.invalidated.insert(id.to_raw());
    }

    /// Runs `f` against the merged view, computing and memoizing it on first use.
    pub fn with_merged<R>(&self, f: impl FnOnce(&ValueContainerImpl<V>) -> R) -> Result<R> {
        let mut state = self.state.lock();
        if state.merged.is_none() {
            let (mut base, chunk_count) = (self.loader)()?;
            if chunk_count > COMPACT_CHUNK_THRESHOLD {
                state.needs_compacting = true;
            }
            for &raw in &state.invalidated {
                base.remove_all(InputId::from_raw(raw));
            }
            for value in state.removed.values().cloned().collect::<Vec<_>>() {
                for id in state.removed.input_ids(&value).collect::<Vec<_>>() {
                    base.remove(id, &value);
                }
            }
            for value in state.added.values().cloned().collect::<Vec<_>>() {
                for id in state.added.input_ids(&value).collect::<Vec<_>>() {
                    base.add(id, value.clone());
                }
            }
            state.merged = Some(base);
        }
        Ok(f(state.merged.as_ref().expect("merged just computed")))
    }

    /// True if any pending delta exists or the persisted shape should be rewritten.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        let state = self.state.lock();
        !state.added.is_empty()
            || !state.removed.is_empty()
            || !state.invalidated.is_empty()
            || state.needs_compacting
    }

    /// Encodes the pending state for persistence.
    ///
    /// Pure adds (with optional wholesale invalidations) append a delta chunk. Any
    /// per-value removals cannot be expressed in the append format, so they force a
    /// full rewrite of the merged container, as does a tombstone-heavy base.
    pub fn prepare_flush(&self, ext: &dyn DataExternalizer<V>) -> Result<FlushOp> {
        if !self.is_dirty() {
            return Ok(FlushOp::Clean);
        }

        let (mut needs_replace, adds_nothing) = {
            let state = self.state.lock();
            (
                !state.removed.is_empty() || state.needs_compacting,
                state.added.is_empty(),
            )
        };
        // An invalidation-only delta can net the key empty; only the merged view knows,
        // and an empty key must persist as a rewrite (a tombstone), not another chunk.
        if !needs_replace && adds_nothing {
            needs_replace = self.with_merged(|merged| merged.is_empty())?;
        }

        if needs_replace {
            let chunk = self.with_merged(|merged| {
                let mut out = Vec::new();
                merged.save_full(&mut out, ext).map(|()| out)
            })??;
            Ok(FlushOp::ReplaceMerged(chunk))
        } else {
            let state = self.state.lock();
            let mut invalidated: Vec<u32> = state.invalidated.iter().copied().collect();
            invalidated.sort_unstable();
            let mut out = Vec::new();
            ValueContainerImpl::save_delta(&mut out, &invalidated, &state.added, ext)?;
            Ok(FlushOp::AppendDelta(out))
        }
    }

    /// Clears the pending deltas after the corresponding [`FlushOp`] reached storage.
    /// The memoized merged view stays valid.
    pub fn mark_flushed(&self) {
        let mut state = self.state.lock();
        state.added = ValueContainerImpl::new();
        state.removed = ValueContainerImpl::new();
        state.invalidated.clear();
        state.needs_compacting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ValueContainer as _;
    use crate::externalizer::StringExternalizer;

    fn id(raw: u32) -> InputId {
        InputId::from_raw(raw)
    }

    fn with_base(base: Vec<(u32, &str)>) -> ChangeTrackingValueContainer<String> {
        with_base_chunks(base, 1)
    }

    fn with_base_chunks(
        base: Vec<(u32, &str)>,
        chunk_count: usize,
    ) -> ChangeTrackingValueContainer<String> {
        let base: Vec<(u32, String)> =
            base.into_iter().map(|(i, v)| (i, v.to_string())).collect();
        ChangeTrackingValueContainer::new(Box::new(move || {
            let mut container = ValueContainerImpl::new();
            for (raw, value) in &base {
                container.add(id(*raw), value.clone());
            }
            Ok((container, chunk_count))
        }))
    }

    fn snapshot(tracker: &ChangeTrackingValueContainer<String>) -> Vec<(String, Vec<u32>)> {
        tracker
            .with_merged(|merged| {
                let mut out: Vec<(String, Vec<u32>)> = merged
                    .values()
                    .map(|v| {
                        let mut ids: Vec<u32> =
                            merged.input_ids(v).map(InputId::to_raw).collect();
                        ids.sort_unstable();
                        (v.clone(), ids)
                    })
                    .collect();
                out.sort();
                out
            })
            .unwrap()
    }

    #[test]
    fn merge_applies_fixed_order_regardless_of_interleaving() {
        // Base: 1→a, 2→a, 3→b. Net effect wanted: 1 wholesale-invalidated then re-adds
        // c, 2 loses a, 3 keeps b, 4 adds a.
        let build = |tracker: &ChangeTrackingValueContainer<String>, order: u8| {
            match order {
                0 => {
                    tracker.remove_all_values(id(1));
                    tracker.add_value(id(1), "c".to_string());
                    tracker.remove_value(id(2), &"a".to_string());
                    tracker.add_value(id(4), "a".to_string());
                }
                _ => {
                    tracker.add_value(id(4), "a".to_string());
                    tracker.remove_value(id(2), &"a".to_string());
                    tracker.remove_all_values(id(1));
                    tracker.add_value(id(1), "c".to_string());
                }
            };
        };

        let mut snapshots = Vec::new();
        for order in 0..2 {
            let tracker = with_base(vec![(1, "a"), (2, "a"), (3, "b")]);
            build(&tracker, order);
            snapshots.push(snapshot(&tracker));
        }
        assert_eq!(snapshots[0], snapshots[1]);
        assert_eq!(
            snapshots[0],
            vec![
                ("a".to_string(), vec![4]),
                ("b".to_string(), vec![3]),
                ("c".to_string(), vec![1]),
            ]
        );
    }

    #[test]
    fn add_then_remove_cancels_out() {
        let tracker = with_base(vec![(1, "a")]);
        tracker.add_value(id(2), "a".to_string());
        tracker.remove_value(id(2), &"a".to_string());

        assert_eq!(snapshot(&tracker), vec![("a".to_string(), vec![1])]);
        // The cancelled pair leaves no pending delta.
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn remove_then_add_cancels_out() {
        let tracker = with_base(vec![(1, "a")]);
        tracker.remove_value(id(1), &"a".to_string());
        tracker.add_value(id(1), "a".to_string());

        assert_eq!(snapshot(&tracker), vec![("a".to_string(), vec![1])]);
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn mutations_after_merge_keep_cache_current() {
        let tracker = with_base(vec![(1, "a")]);
        assert_eq!(snapshot(&tracker), vec![("a".to_string(), vec![1])]);

        // The merged view exists now; mutations must double-write into it.
        tracker.add_value(id(2), "a".to_string());
        tracker.remove_all_values(id(1));
        assert_eq!(snapshot(&tracker), vec![("a".to_string(), vec![2])]);
    }

    #[test]
    fn remove_after_invalidation_is_not_recorded() {
        let tracker = with_base(vec![(1, "a")]);
        tracker.remove_all_values(id(1));
        tracker.remove_value(id(1), &"a".to_string());
        assert_eq!(snapshot(&tracker), Vec::<(String, Vec<u32>)>::new());
    }

    #[test]
    fn pure_adds_flush_as_append_delta() {
        let tracker = with_base(vec![(1, "a")]);
        tracker.add_value(id(2), "b".to_string());
        tracker.remove_all_values(id(3));
        tracker.add_value(id(3), "c".to_string());

        match tracker.prepare_flush(&StringExternalizer).unwrap() {
            FlushOp::AppendDelta(chunk) => {
                let mut replay = ValueContainerImpl::<String>::new();
                replay.add(id(3), "stale".to_string());
                let mut input = chunk.as_slice();
                replay.read_delta_into(&mut input, &StringExternalizer).unwrap();
                assert!(replay.is_associated(&"b".to_string(), id(2)));
                assert!(replay.is_associated(&"c".to_string(), id(3)));
                assert!(!replay.is_associated(&"stale".to_string(), id(3)));
            }
            other => panic!("expected append delta, got {other:?}"),
        }

        tracker.mark_flushed();
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn per_value_removal_forces_full_rewrite() {
        let tracker = with_base(vec![(1, "a"), (2, "a")]);
        tracker.remove_value(id(1), &"a".to_string());

        match tracker.prepare_flush(&StringExternalizer).unwrap() {
            FlushOp::ReplaceMerged(chunk) => {
                let restored =
                    ValueContainerImpl::from_chunks(&[chunk], &StringExternalizer).unwrap();
                assert!(!restored.is_associated(&"a".to_string(), id(1)));
                assert!(restored.is_associated(&"a".to_string(), id(2)));
            }
            other => panic!("expected full rewrite, got {other:?}"),
        }
    }

    #[test]
    fn invalidation_that_empties_the_base_flushes_as_rewrite() {
        let tracker = with_base(vec![(1, "a")]);
        tracker.remove_all_values(id(1));

        match tracker.prepare_flush(&StringExternalizer).unwrap() {
            FlushOp::ReplaceMerged(chunk) => {
                let restored =
                    ValueContainerImpl::from_chunks(&[chunk], &StringExternalizer).unwrap();
                assert!(restored.is_empty());
            }
            other => panic!("expected full rewrite, got {other:?}"),
        }
    }

    #[test]
    fn invalidation_of_a_populated_base_still_appends() {
        let tracker = with_base(vec![(1, "a"), (2, "b")]);
        tracker.remove_all_values(id(1));

        match tracker.prepare_flush(&StringExternalizer).unwrap() {
            FlushOp::AppendDelta(_) => {}
            other => panic!("expected append delta, got {other:?}"),
        }
    }

    #[test]
    fn fragmented_base_forces_full_rewrite() {
        let tracker = with_base_chunks(vec![(1, "a")], COMPACT_CHUNK_THRESHOLD + 1);
        tracker.add_value(id(2), "a".to_string());
        // Trigger the base load so the chunk count is observed.
        let _ = snapshot(&tracker);

        match tracker.prepare_flush(&StringExternalizer).unwrap() {
            FlushOp::ReplaceMerged(_) => {}
            other => panic!("expected full rewrite, got {other:?}"),
        }
    }
}
