use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Result;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Writes `bytes` to `path` atomically: unique temporary file, fsync, rename.
///
/// Readers either see the previous content or the full new content, never a torn write.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Err(io::Error::other("path has no parent").into());
    };
    let parent = if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    };

    fs::create_dir_all(parent)?;

    let (tmp_path, mut file) = open_unique_tmp_file(path, parent)?;
    let write_result = (|| -> io::Result<()> {
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    })();
    drop(file);

    if let Err(err) = write_result {
        remove_tmp_best_effort(&tmp_path);
        return Err(err.into());
    }

    match fs::rename(&tmp_path, path) {
        Ok(()) => {
            sync_dir_best_effort(parent);
            Ok(())
        }
        Err(err) => {
            remove_tmp_best_effort(&tmp_path);
            Err(err.into())
        }
    }
}

fn remove_tmp_best_effort(tmp_path: &Path) {
    if let Err(err) = fs::remove_file(tmp_path) {
        if err.kind() != io::ErrorKind::NotFound {
            tracing::debug!(
                target = "quarry.storage",
                path = %tmp_path.display(),
                error = %err,
                "failed to remove temporary file after write failure"
            );
        }
    }
}

fn sync_dir_best_effort(dir: &Path) {
    #[cfg(unix)]
    {
        match fs::File::open(dir).and_then(|dir| dir.sync_all()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::debug!(
                    target = "quarry.storage",
                    dir = %dir.display(),
                    error = %err,
                    "failed to sync directory (best effort)"
                );
            }
        }
    }

    #[cfg(not(unix))]
    let _ = dir;
}

fn open_unique_tmp_file(dest: &Path, parent: &Path) -> io::Result<(PathBuf, fs::File)> {
    let file_name = dest
        .file_name()
        .ok_or_else(|| io::Error::other("destination path has no file name"))?;
    let pid = std::process::id();

    loop {
        let counter = TMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = file_name.to_os_string();
        tmp_name.push(format!(".tmp.{pid}.{counter}"));
        let tmp_path = parent.join(tmp_name);

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
        {
            Ok(file) => return Ok((tmp_path, file)),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
}
