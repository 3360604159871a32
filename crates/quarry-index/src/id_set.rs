use std::collections::HashSet;

use roaring::RoaringBitmap;

/// Element count above which a [`InputIdSet::Small`] hash set is promoted to a roaring
/// bitmap representation.
pub const BITMAP_PROMOTION_THRESHOLD: usize = 20_000;

/// Element count below which a [`InputIdSet::Bitmap`] is demoted back to a hash set.
///
/// Kept below [`BITMAP_PROMOTION_THRESHOLD`] so a set oscillating around one size does
/// not thrash between representations.
pub const SMALL_DEMOTION_THRESHOLD: usize = 18_000;

/// Set of input ids associated with one value.
///
/// The representation switch is an internal memory optimization, not an observable
/// contract; iteration order is unspecified and may change across transitions.
#[derive(Debug, Clone)]
pub enum InputIdSet {
    Small(HashSet<u32>),
    Bitmap(RoaringBitmap),
}

impl Default for InputIdSet {
    fn default() -> Self {
        Self::Small(HashSet::new())
    }
}

impl InputIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `id`; returns whether the set changed.
    pub fn insert(&mut self, id: u32) -> bool {
        let inserted = match self {
            Self::Small(set) => set.insert(id),
            Self::Bitmap(bits) => bits.insert(id),
        };
        if inserted {
            self.maybe_promote();
        }
        inserted
    }

    /// Removes `id`; returns whether it was present.
    pub fn remove(&mut self, id: u32) -> bool {
        let removed = match self {
            Self::Small(set) => set.remove(&id),
            Self::Bitmap(bits) => bits.remove(id),
        };
        if removed {
            self.maybe_demote();
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, id: u32) -> bool {
        match self {
            Self::Small(set) => set.contains(&id),
            Self::Bitmap(bits) => bits.contains(id),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Small(set) => set.len(),
            Self::Bitmap(bits) => bits.len() as usize,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = u32> + '_> {
        match self {
            Self::Small(set) => Box::new(set.iter().copied()),
            Self::Bitmap(bits) => Box::new(bits.iter()),
        }
    }

    /// Ids in ascending order, for the delta-encoded on-disk form.
    #[must_use]
    pub fn to_sorted_vec(&self) -> Vec<u32> {
        match self {
            Self::Small(set) => {
                let mut ids: Vec<u32> = set.iter().copied().collect();
                ids.sort_unstable();
                ids
            }
            // Roaring iteration is already ascending.
            Self::Bitmap(bits) => bits.iter().collect(),
        }
    }

    fn maybe_promote(&mut self) {
        if let Self::Small(set) = self {
            if set.len() > BITMAP_PROMOTION_THRESHOLD {
                let bits: RoaringBitmap = set.iter().copied().collect();
                *self = Self::Bitmap(bits);
            }
        }
    }

    fn maybe_demote(&mut self) {
        if let Self::Bitmap(bits) = self {
            if (bits.len() as usize) < SMALL_DEMOTION_THRESHOLD {
                let set: HashSet<u32> = bits.iter().collect();
                *self = Self::Small(set);
            }
        }
    }
}

impl FromIterator<u32> for InputIdSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        let mut set = Self::new();
        for id in iter {
            set.insert(id);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_promotes_past_threshold() {
        let mut set = InputIdSet::new();
        for id in 0..=(BITMAP_PROMOTION_THRESHOLD as u32) {
            set.insert(id);
        }
        assert!(matches!(set, InputIdSet::Bitmap(_)));
        assert_eq!(set.len(), BITMAP_PROMOTION_THRESHOLD + 1);
    }

    #[test]
    fn remove_demotes_below_threshold() {
        let mut set: InputIdSet = (0..=(BITMAP_PROMOTION_THRESHOLD as u32)).collect();
        assert!(matches!(set, InputIdSet::Bitmap(_)));

        let mut id = BITMAP_PROMOTION_THRESHOLD as u32;
        while set.len() >= SMALL_DEMOTION_THRESHOLD {
            assert!(set.remove(id));
            id -= 1;
        }
        assert!(matches!(set, InputIdSet::Small(_)));
    }

    #[test]
    fn membership_is_preserved_across_representation_transitions() {
        // Drive the set across the promotion/demotion thresholds repeatedly, mirroring
        // every operation in a plain hash set, and check they always agree.
        let mut set = InputIdSet::new();
        let mut mirror = HashSet::new();

        let upper = (BITMAP_PROMOTION_THRESHOLD + 500) as u32;
        let lower = (SMALL_DEMOTION_THRESHOLD - 500) as u32;

        for cycle in 0..2 {
            for id in 0..upper {
                assert_eq!(set.insert(id), mirror.insert(id), "cycle {cycle} insert {id}");
            }
            assert!(matches!(set, InputIdSet::Bitmap(_)));

            for id in lower..upper {
                assert_eq!(set.remove(id), mirror.remove(&id), "cycle {cycle} remove {id}");
            }
            assert!(matches!(set, InputIdSet::Small(_)));

            assert_eq!(set.len(), mirror.len());
            for id in 0..upper {
                assert_eq!(set.contains(id), mirror.contains(&id), "cycle {cycle} contains {id}");
            }

            let mut iterated: Vec<u32> = set.iter().collect();
            iterated.sort_unstable();
            let mut expected: Vec<u32> = mirror.iter().copied().collect();
            expected.sort_unstable();
            assert_eq!(iterated, expected);

            for id in lower..upper {
                set.remove(id);
                mirror.remove(&id);
            }
            for id in 0..lower {
                set.remove(id);
                mirror.remove(&id);
            }
            assert!(set.is_empty());
        }
    }

    #[test]
    fn sorted_vec_is_ascending_in_both_representations() {
        let mut small = InputIdSet::new();
        for id in [5u32, 1, 9, 3] {
            small.insert(id);
        }
        assert_eq!(small.to_sorted_vec(), vec![1, 3, 5, 9]);

        let big: InputIdSet = (0..=(BITMAP_PROMOTION_THRESHOLD as u32)).collect();
        let sorted = big.to_sorted_vec();
        assert!(sorted.windows(2).all(|w| w[0] < w[1]));
    }
}
