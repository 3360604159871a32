use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{Result, StorageError};

const MAGIC: &[u8; 8] = b"QRYLOGMP";
pub const LOG_FORMAT_VERSION: u32 = 1;
const HEADER_LEN: u64 = 12;

/// Hard upper bound for a single record payload.
///
/// Corrupted length prefixes should degrade to a rebuild, not an out-of-memory crash.
const MAX_PAYLOAD_BYTES: u32 = 1 << 30;

const TAG_APPEND: u8 = 1;
const TAG_REPLACE: u8 = 2;
const TAG_REMOVE: u8 = 3;

#[derive(Debug, Clone, Copy)]
struct Chunk {
    /// Logical offset of the payload (header-relative file offset; offsets at or past
    /// `disk_len` live in the pending tail).
    offset: u64,
    len: u32,
    /// Full record size including framing, for waste accounting.
    record_len: u32,
}

/// Append-only persistent map from raw key bytes to an ordered sequence of payload
/// chunks.
///
/// Every put appends a delta record; reconstruction replays all chunks for a key in
/// append order. `Replace` drops a key's prior chunks, `Remove` tombstones the key.
/// Appends are buffered in a pending tail until [`PersistentLogMap::flush`]; the
/// in-memory directory reflects them immediately.
#[derive(Debug)]
pub struct PersistentLogMap {
    path: PathBuf,
    file: File,
    /// Bytes durably on disk, including the header.
    disk_len: u64,
    pending: Vec<u8>,
    directory: HashMap<Vec<u8>, Vec<Chunk>>,
    live_bytes: u64,
    wasted_bytes: u64,
}

impl PersistentLogMap {
    /// Opens (or creates) the map at `path`, scanning existing records to rebuild the
    /// directory. A torn final record is truncated away; a bad header is corruption.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let file_len = file.metadata()?.len();
        if file_len == 0 {
            write_header(&mut file)?;
            return Ok(Self {
                path: path.to_path_buf(),
                file,
                disk_len: HEADER_LEN,
                pending: Vec::new(),
                directory: HashMap::new(),
                live_bytes: 0,
                wasted_bytes: 0,
            });
        }

        if file_len < HEADER_LEN {
            return Err(StorageError::corrupted(path, "file shorter than header"));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(StorageError::corrupted(path, "bad magic"));
        }
        let format = file.read_u32::<LittleEndian>()?;
        if format != LOG_FORMAT_VERSION {
            return Err(StorageError::IncompatibleFormat {
                expected: LOG_FORMAT_VERSION,
                found: format,
            });
        }

        let mut map = Self {
            path: path.to_path_buf(),
            file,
            disk_len: HEADER_LEN,
            pending: Vec::new(),
            directory: HashMap::new(),
            live_bytes: 0,
            wasted_bytes: 0,
        };
        map.scan_records(file_len)?;
        Ok(map)
    }

    fn scan_records(&mut self, file_len: u64) -> Result<()> {
        let mut offset = HEADER_LEN;
        let mut data = Vec::with_capacity((file_len - HEADER_LEN) as usize);
        self.file.seek(SeekFrom::Start(HEADER_LEN))?;
        self.file.read_to_end(&mut data)?;

        let mut cursor = &data[..];
        loop {
            let remaining = cursor.len() as u64;
            if remaining == 0 {
                break;
            }

            match parse_record(&mut cursor) {
                Ok(Some((tag, key, payload_offset_in_record, payload_len))) => {
                    let record_len = (remaining - cursor.len() as u64) as u32;
                    let payload_offset = offset + payload_offset_in_record;
                    self.apply_scanned(tag, key, payload_offset, payload_len, record_len)
                        .map_err(|reason| StorageError::corrupted(&self.path, reason))?;
                    offset += u64::from(record_len);
                }
                Ok(None) => {
                    // Torn tail from a crash mid-append. Drop the partial record.
                    tracing::warn!(
                        target = "quarry.storage",
                        path = %self.path.display(),
                        offset,
                        "truncating torn record at end of log"
                    );
                    self.file.set_len(offset)?;
                    self.file.sync_data()?;
                    break;
                }
                Err(reason) => {
                    return Err(StorageError::corrupted(&self.path, reason));
                }
            }
        }

        self.disk_len = offset;
        Ok(())
    }

    fn apply_scanned(
        &mut self,
        tag: u8,
        key: Vec<u8>,
        payload_offset: u64,
        payload_len: u32,
        record_len: u32,
    ) -> std::result::Result<(), String> {
        let chunk = Chunk {
            offset: payload_offset,
            len: payload_len,
            record_len,
        };
        match tag {
            TAG_APPEND => {
                self.live_bytes += u64::from(record_len);
                self.directory.entry(key).or_default().push(chunk);
            }
            TAG_REPLACE => {
                self.live_bytes += u64::from(record_len);
                let prior = self.directory.insert(key, vec![chunk]);
                self.retire(prior.as_deref().unwrap_or(&[]));
            }
            TAG_REMOVE => {
                self.wasted_bytes += u64::from(record_len);
                let prior = self.directory.remove(&key);
                self.retire(prior.as_deref().unwrap_or(&[]));
            }
            other => return Err(format!("unknown record tag {other}")),
        }
        Ok(())
    }

    fn retire(&mut self, chunks: &[Chunk]) {
        for chunk in chunks {
            self.live_bytes = self.live_bytes.saturating_sub(u64::from(chunk.record_len));
            self.wasted_bytes += u64::from(chunk.record_len);
        }
    }

    /// Appends a delta chunk for `key`.
    pub fn append(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        let chunk = self.push_record(TAG_APPEND, key, payload)?;
        self.live_bytes += u64::from(chunk.record_len);
        self.directory.entry(key.to_vec()).or_default().push(chunk);
        Ok(())
    }

    /// Replaces all existing chunks for `key` with a single fresh one.
    pub fn replace(&mut self, key: &[u8], payload: &[u8]) -> Result<()> {
        let chunk = self.push_record(TAG_REPLACE, key, payload)?;
        self.live_bytes += u64::from(chunk.record_len);
        let prior = self.directory.insert(key.to_vec(), vec![chunk]);
        self.retire(prior.as_deref().unwrap_or(&[]));
        Ok(())
    }

    /// Tombstones `key`. A later append recreates it.
    pub fn remove(&mut self, key: &[u8]) -> Result<()> {
        if !self.directory.contains_key(key) {
            return Ok(());
        }
        let chunk = self.push_record(TAG_REMOVE, key, &[])?;
        self.wasted_bytes += u64::from(chunk.record_len);
        let prior = self.directory.remove(key);
        self.retire(prior.as_deref().unwrap_or(&[]));
        Ok(())
    }

    fn push_record(&mut self, tag: u8, key: &[u8], payload: &[u8]) -> Result<Chunk> {
        debug_assert!(payload.len() <= MAX_PAYLOAD_BYTES as usize);
        let record_start = self.logical_len();
        self.pending.push(tag);
        self.pending
            .write_u32::<LittleEndian>(key.len() as u32)
            .expect("vec write is infallible");
        self.pending.extend_from_slice(key);
        self.pending
            .write_u32::<LittleEndian>(payload.len() as u32)
            .expect("vec write is infallible");
        let payload_offset = self.logical_len();
        self.pending.extend_from_slice(payload);
        Ok(Chunk {
            offset: payload_offset,
            len: payload.len() as u32,
            record_len: (self.logical_len() - record_start) as u32,
        })
    }

    fn logical_len(&self) -> u64 {
        self.disk_len + self.pending.len() as u64
    }

    /// Returns the payload chunks recorded for `key`, oldest first.
    pub fn read_chunks(&mut self, key: &[u8]) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(chunks) = self.directory.get(key) else {
            return Ok(None);
        };
        let chunks = chunks.clone();
        let mut out = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            out.push(self.read_payload(chunk)?);
        }
        Ok(Some(out))
    }

    fn read_payload(&mut self, chunk: Chunk) -> Result<Vec<u8>> {
        let len = chunk.len as usize;
        if chunk.offset >= self.disk_len {
            let start = (chunk.offset - self.disk_len) as usize;
            let Some(slice) = self.pending.get(start..start + len) else {
                return Err(StorageError::corrupted(&self.path, "pending chunk out of range"));
            };
            return Ok(slice.to_vec());
        }

        let mut buf = vec![0u8; len];
        self.file.seek(SeekFrom::Start(chunk.offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.directory.contains_key(key)
    }

    pub fn chunk_count(&self, key: &[u8]) -> usize {
        self.directory.get(key).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.directory.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.directory.is_empty()
    }

    /// Enumerates all keys; the callback returning `false` stops early (the result then
    /// is `false`, mirroring the early stop).
    pub fn for_each_key(&self, mut f: impl FnMut(&[u8]) -> bool) -> bool {
        for key in self.directory.keys() {
            if !f(key) {
                return false;
            }
        }
        true
    }

    /// Fraction of file bytes occupied by retired records.
    #[must_use]
    pub fn wasted_ratio(&self) -> f64 {
        let total = self.live_bytes + self.wasted_bytes;
        if total == 0 {
            0.0
        } else {
            self.wasted_bytes as f64 / total as f64
        }
    }

    /// Writes and fsyncs the pending tail.
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.disk_len))?;
        self.file.write_all(&self.pending)?;
        self.file.sync_data()?;
        self.disk_len += self.pending.len() as u64;
        self.pending.clear();
        Ok(())
    }

    /// Rewrites the log keeping only live chunks, reclaiming tombstoned space.
    pub fn compact(&mut self) -> Result<()> {
        let keys: Vec<Vec<u8>> = self.directory.keys().cloned().collect();
        let tmp_path = self.path.with_extension("compact");

        let mut new_file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_path)?;
        write_header(&mut new_file)?;

        let mut new_directory: HashMap<Vec<u8>, Vec<Chunk>> = HashMap::new();
        let mut offset = HEADER_LEN;
        let mut live = 0u64;
        for key in keys {
            let chunks = self.directory.get(&key).cloned().unwrap_or_default();
            let mut new_chunks = Vec::with_capacity(chunks.len());
            for chunk in chunks {
                let payload = self.read_payload(chunk)?;
                let record = encode_record(TAG_APPEND, &key, &payload);
                new_file.write_all(&record)?;
                let payload_offset = offset + (record.len() - payload.len()) as u64;
                new_chunks.push(Chunk {
                    offset: payload_offset,
                    len: payload.len() as u32,
                    record_len: record.len() as u32,
                });
                offset += record.len() as u64;
                live += record.len() as u64;
            }
            new_directory.insert(key, new_chunks);
        }
        new_file.sync_all()?;
        drop(new_file);

        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        self.disk_len = offset;
        self.pending.clear();
        self.directory = new_directory;
        self.live_bytes = live;
        self.wasted_bytes = 0;

        tracing::debug!(
            target = "quarry.storage",
            path = %self.path.display(),
            keys = self.directory.len(),
            bytes = offset,
            "compacted log map"
        );
        Ok(())
    }

    /// Discards every record, leaving an empty map.
    pub fn clear(&mut self) -> Result<()> {
        self.file.set_len(HEADER_LEN)?;
        self.file.seek(SeekFrom::Start(0))?;
        write_header(&mut self.file)?;
        self.disk_len = HEADER_LEN;
        self.pending.clear();
        self.directory.clear();
        self.live_bytes = 0;
        self.wasted_bytes = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_header(file: &mut File) -> Result<()> {
    file.write_all(MAGIC)?;
    file.write_u32::<LittleEndian>(LOG_FORMAT_VERSION)?;
    file.sync_data()?;
    Ok(())
}

fn encode_record(tag: u8, key: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + key.len() + payload.len());
    out.push(tag);
    out.write_u32::<LittleEndian>(key.len() as u32)
        .expect("vec write is infallible");
    out.extend_from_slice(key);
    out.write_u32::<LittleEndian>(payload.len() as u32)
        .expect("vec write is infallible");
    out.extend_from_slice(payload);
    out
}

/// Parses one record from `cursor`.
///
/// `Ok(None)` means the remaining bytes are a torn prefix of a record (crash tail);
/// `Err` means structurally invalid data.
#[allow(clippy::type_complexity)]
fn parse_record(
    cursor: &mut &[u8],
) -> std::result::Result<Option<(u8, Vec<u8>, u64, u32)>, String> {
    let full = *cursor;
    if full.len() < 9 {
        return Ok(None);
    }

    let mut rd = full;
    let tag = rd.read_u8().map_err(|e| e.to_string())?;
    if !matches!(tag, TAG_APPEND | TAG_REPLACE | TAG_REMOVE) {
        return Err(format!("unknown record tag {tag}"));
    }
    let key_len = rd.read_u32::<LittleEndian>().map_err(|e| e.to_string())? as usize;
    if key_len > MAX_PAYLOAD_BYTES as usize {
        return Err(format!("unreasonable key length {key_len}"));
    }
    if rd.len() < key_len + 4 {
        return Ok(None);
    }
    let key = rd[..key_len].to_vec();
    rd = &rd[key_len..];
    let payload_len = rd.read_u32::<LittleEndian>().map_err(|e| e.to_string())?;
    if payload_len > MAX_PAYLOAD_BYTES {
        return Err(format!("unreasonable payload length {payload_len}"));
    }
    if rd.len() < payload_len as usize {
        return Ok(None);
    }
    rd = &rd[payload_len as usize..];

    let consumed = full.len() - rd.len();
    let payload_offset_in_record = (consumed - payload_len as usize) as u64;
    *cursor = rd;
    Ok(Some((tag, key, payload_offset_in_record, payload_len)))
}
