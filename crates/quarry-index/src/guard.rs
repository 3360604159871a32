use parking_lot::{Condvar, Mutex, MutexGuard};
use quarry_core::InputId;

/// Number of stripes in a [`StripedLock`]. Power of two so stripe selection is a mask.
pub const STRIPE_COUNT: usize = 16;

/// Global buffering-vs-persistent mode gate.
///
/// Buffering holders are counted positive, persistent holders negative. Entering a mode
/// blocks while any thread holds the opposite mode; all holders of one mode proceed
/// concurrently. This keeps in-memory-only writes from interleaving with persistent
/// writes, which would corrupt the "which overlay is authoritative" invariant.
#[derive(Debug, Default)]
pub struct StorageGuard {
    holds: Mutex<i32>,
    cond: Condvar,
}

/// RAII handle for one mode holder; leaves the mode on drop.
#[derive(Debug)]
pub struct StorageModeHolder<'a> {
    guard: &'a StorageGuard,
    buffering: bool,
}

impl StorageGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters the given mode (`true` = buffering, `false` = persistent), blocking until
    /// no thread holds the opposite mode.
    pub fn enter(&self, buffering: bool) -> StorageModeHolder<'_> {
        let mut holds = self.holds.lock();
        if buffering {
            while *holds < 0 {
                self.cond.wait(&mut holds);
            }
            *holds += 1;
        } else {
            while *holds > 0 {
                self.cond.wait(&mut holds);
            }
            *holds -= 1;
        }
        StorageModeHolder {
            guard: self,
            buffering,
        }
    }
}

impl Drop for StorageModeHolder<'_> {
    fn drop(&mut self) {
        let mut holds = self.guard.holds.lock();
        *holds += if self.buffering { -1 } else { 1 };
        if *holds == 0 {
            self.guard.cond.notify_all();
        }
    }
}

/// 16-way lock split by input-id hash.
///
/// Used on hot per-file paths (the "is this file currently being applied" section of
/// the engine) where a single global mutex would serialize unrelated files. Two
/// unrelated files may hash to the same stripe; that costs a brief wait, not
/// correctness.
#[derive(Debug)]
pub struct StripedLock {
    stripes: Vec<Mutex<()>>,
}

impl Default for StripedLock {
    fn default() -> Self {
        Self {
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
        }
    }
}

impl StripedLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, id: InputId) -> MutexGuard<'_, ()> {
        self.stripes[id.to_raw() as usize & (STRIPE_COUNT - 1)].lock()
    }
}
