use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use fs2::FileExt as _;

use crate::{Result, StorageError};

const LOCK_FILE_NAME: &str = ".lock";

/// Exclusive ownership of an index root directory.
///
/// The persisted backing files of an index are owned by exactly one engine instance; no
/// two instances may open them concurrently. The lock is advisory across processes (via
/// `fs2`) and backed by an in-process mutex table because `fs2` file locks do not
/// exclude threads within the same process on Unix platforms.
///
/// Released when the value is dropped.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    _path: PathBuf,
    _guard: std::sync::MutexGuard<'static, ()>,
}

impl DirLock {
    /// Acquires the lock for `dir`, failing immediately if another instance holds it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOCK_FILE_NAME);

        let mutex = process_lock_for_path(&path);
        let Ok(guard) = mutex.try_lock() else {
            return Err(StorageError::AlreadyLocked {
                path: dir.display().to_string(),
            });
        };

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(StorageError::AlreadyLocked {
                path: dir.display().to_string(),
            });
        }

        Ok(Self {
            file,
            _path: path,
            _guard: guard,
        })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn process_lock_for_path(path: &Path) -> &'static Mutex<()> {
    static PROCESS_LOCKS: OnceLock<Mutex<HashMap<PathBuf, &'static Mutex<()>>>> = OnceLock::new();
    let locks = PROCESS_LOCKS.get_or_init(|| Mutex::new(HashMap::new()));

    let mut map = locks
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(existing) = map.get(path) {
        return existing;
    }

    let mutex: &'static Mutex<()> = Box::leak(Box::new(Mutex::new(())));
    map.insert(path.to_path_buf(), mutex);
    mutex
}
