//! File-backed store for persistent queues.

use crate::error::{StorageError, StorageResult};
use crate::record::{decode_record, encode_record, Decoded};
use crate::store::{BatchOp, KvStore, WriteBatch};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Tuning knobs for a [`FileStore`].
#[derive(Debug, Clone)]
pub struct FileStoreOptions {
    /// Whether to fsync after every write. Disabling this trades crash
    /// safety for throughput and is only sensible for tests.
    pub sync_on_write: bool,
    /// Upper bound for the log file size in bytes.
    ///
    /// Only batches that add keys are refused at the limit. Overwrites and
    /// deletes are folded into a compacted log instead, so a full store can
    /// always drain.
    pub max_bytes: Option<u64>,
    /// Compact automatically once the log is this many times larger than
    /// its live data. `None` disables automatic compaction.
    pub compact_ratio: Option<f64>,
    /// Logs smaller than this are never compacted automatically.
    pub compact_min_bytes: u64,
}

impl FileStoreOptions {
    /// Sets the size limit.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }

    /// Sets the automatic compaction ratio.
    pub fn with_compact_ratio(mut self, ratio: f64) -> Self {
        self.compact_ratio = Some(ratio);
        self
    }

    /// Disables automatic compaction.
    pub fn without_auto_compaction(mut self) -> Self {
        self.compact_ratio = None;
        self
    }

    /// Sets whether every write is fsynced.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            sync_on_write: true,
            max_bytes: None,
            compact_ratio: Some(4.0),
            compact_min_bytes: 64 * 1024,
        }
    }
}

/// Summary produced by [`FileStore::verify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// Number of complete records.
    pub records: usize,
    /// Number of live keys after replay.
    pub live_keys: usize,
    /// Bytes covered by complete records.
    pub valid_bytes: u64,
    /// Total file size.
    pub file_bytes: u64,
    /// Whether the log ends in an incomplete record.
    pub torn_tail: bool,
}

struct Inner {
    file: File,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    /// Current log size in bytes.
    size: u64,
}

/// A persistent key-value store backed by an append-only log.
///
/// Each [`WriteBatch`] becomes one framed, checksummed record appended to
/// the log. The live key set is held in memory and rebuilt by replaying the
/// log on open.
///
/// # Durability
///
/// - `write()` appends the record and calls `File::sync_data()` before
///   returning (unless `sync_on_write` is disabled)
/// - A crash mid-append leaves a truncated tail, which is discarded on the
///   next open
/// - A complete record with a bad checksum is treated as corruption and
///   the store refuses to open
///
/// # Locking
///
/// An exclusive advisory lock on `<path>.lock` is held for the lifetime of
/// the store, so two processes cannot append to the same log.
///
/// # Example
///
/// ```no_run
/// use outbox_storage::{FileStore, FileStoreOptions, KvStore};
/// use std::path::Path;
///
/// let store = FileStore::open(Path::new("queue.log"), FileStoreOptions::default()).unwrap();
/// store.put(b"op/1", b"payload").unwrap();
/// ```
pub struct FileStore {
    path: PathBuf,
    options: FileStoreOptions,
    inner: Mutex<Inner>,
    _lock_file: File,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl FileStore {
    /// Opens or creates a store at the given path, replaying the log.
    ///
    /// Parent directories are created if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the lock (`Locked`)
    /// - A complete record fails validation (`Corrupted`, `ChecksumMismatch`)
    /// - I/O errors occur
    pub fn open(path: &Path, options: FileStoreOptions) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = sidecar(path, "lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }

        // A leftover temp file means a compaction died before its rename;
        // the original log is still authoritative.
        let temp_path = sidecar(path, "compact");
        if temp_path.exists() {
            warn!(path = %temp_path.display(), "removing stale compaction file");
            fs::remove_file(&temp_path)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let replay = replay(&buf)?;
        if replay.torn_tail {
            warn!(
                path = %path.display(),
                valid_bytes = replay.valid_bytes,
                file_bytes = buf.len(),
                "discarding truncated record at end of log"
            );
            file.set_len(replay.valid_bytes)?;
            file.sync_all()?;
        }

        debug!(
            path = %path.display(),
            records = replay.records,
            keys = replay.index.len(),
            "opened file store"
        );

        Ok(Self {
            path: path.to_path_buf(),
            options,
            inner: Mutex::new(Inner {
                file,
                index: replay.index,
                size: replay.valid_bytes,
            }),
            _lock_file: lock_file,
        })
    }

    /// Opens a store with default options.
    ///
    /// # Errors
    ///
    /// See [`FileStore::open`].
    pub fn open_default(path: &Path) -> StorageResult<Self> {
        Self::open(path, FileStoreOptions::default())
    }

    /// Returns the path to the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the current log size in bytes.
    pub fn log_size(&self) -> u64 {
        self.inner.lock().size
    }

    /// Rewrites the log so it contains only the live key set.
    ///
    /// The new log is written to a temp file, fsynced and atomically
    /// renamed over the old one.
    ///
    /// Returns the number of bytes reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the new log cannot be written. The old log stays
    /// authoritative in that case.
    pub fn compact(&self) -> StorageResult<u64> {
        let mut inner = self.inner.lock();
        self.compact_locked(&mut inner)
    }

    /// Scans a log without opening it for writing.
    ///
    /// Does not take the lock and never modifies the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a complete record
    /// fails validation.
    pub fn verify(path: &Path) -> StorageResult<VerifyReport> {
        let buf = fs::read(path)?;
        let replay = replay(&buf)?;
        Ok(VerifyReport {
            records: replay.records,
            live_keys: replay.index.len(),
            valid_bytes: replay.valid_bytes,
            file_bytes: buf.len() as u64,
            torn_tail: replay.torn_tail,
        })
    }

    /// Replays a log without opening it for writing and returns its live
    /// entries in key order.
    ///
    /// # Errors
    ///
    /// Same as [`FileStore::verify`].
    pub fn read_snapshot(path: &Path) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let buf = fs::read(path)?;
        Ok(replay(&buf)?.index.into_iter().collect())
    }

    fn compact_locked(&self, inner: &mut Inner) -> StorageResult<u64> {
        let before = inner.size;
        let data = encode_snapshot(&inner.index)?;
        self.replace_log(inner, &data)?;

        let reclaimed = before.saturating_sub(inner.size);
        info!(
            path = %self.path.display(),
            before,
            after = inner.size,
            "compacted log"
        );
        Ok(reclaimed)
    }

    /// Atomically swaps the log for `data`.
    fn replace_log(&self, inner: &mut Inner, data: &[u8]) -> StorageResult<()> {
        let temp_path = sidecar(&self.path, "compact");
        {
            let mut temp = File::create(&temp_path)?;
            temp.write_all(data)?;
            temp.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;
        sync_parent_dir(&self.path)?;

        inner.file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)?;
        inner.size = data.len() as u64;
        Ok(())
    }

    /// Commits `batch` by rewriting the log with the batch already applied.
    ///
    /// Used when appending would cross `limit`. Fails with `Full` only if
    /// the batch adds keys and the compacted result is still over the limit.
    fn write_compacted(
        &self,
        inner: &mut Inner,
        batch: WriteBatch,
        limit: u64,
    ) -> StorageResult<()> {
        let mut next = inner.index.clone();
        apply(&mut next, batch);
        let adds_keys = next.len() > inner.index.len();

        let data = encode_snapshot(&next)?;
        if adds_keys && data.len() as u64 > limit {
            return Err(StorageError::Full {
                used: inner.size,
                limit,
            });
        }

        let before = inner.size;
        self.replace_log(inner, &data)?;
        inner.index = next;
        debug!(before, after = inner.size, limit, "folded write into compacted log");
        Ok(())
    }

    fn maybe_compact(&self, inner: &mut Inner) -> StorageResult<()> {
        let Some(ratio) = self.options.compact_ratio else {
            return Ok(());
        };
        if inner.size < self.options.compact_min_bytes {
            return Ok(());
        }
        let live = live_bytes(&inner.index).max(1);
        if inner.size as f64 > live as f64 * ratio {
            self.compact_locked(inner)?;
        }
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().index.get(key).cloned())
    }

    fn write(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let record = encode_record(&batch)?;
        let mut inner = self.inner.lock();

        if let Some(limit) = self.options.max_bytes {
            if inner.size + record.len() as u64 > limit {
                return self.write_compacted(&mut inner, batch, limit);
            }
        }

        let start = inner.size;
        if let Err(e) = append_record(&mut inner.file, &record, self.options.sync_on_write) {
            // Drop whatever part of the record made it to disk so the next
            // append starts on a record boundary.
            let _ = inner.file.set_len(start);
            return Err(e.into());
        }

        inner.size += record.len() as u64;
        apply(&mut inner.index, batch);

        // The batch is committed; a failed compaction leaves a longer log
        if let Err(e) = self.maybe_compact(&mut inner) {
            warn!(path = %self.path.display(), error = %e, "auto-compaction failed");
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let inner = self.inner.lock();
        Ok(inner
            .index
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn len(&self) -> usize {
        self.inner.lock().index.len()
    }
}

struct Replay {
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    records: usize,
    valid_bytes: u64,
    torn_tail: bool,
}

fn replay(buf: &[u8]) -> StorageResult<Replay> {
    let mut index = BTreeMap::new();
    let mut records = 0;
    let mut offset = 0usize;
    let mut torn_tail = false;

    while offset < buf.len() {
        match decode_record(&buf[offset..], offset as u64)? {
            Decoded::Record { batch, size } => {
                apply(&mut index, batch);
                records += 1;
                offset += size;
            }
            Decoded::Truncated => {
                torn_tail = true;
                break;
            }
        }
    }

    Ok(Replay {
        index,
        records,
        valid_bytes: offset as u64,
        torn_tail,
    })
}

fn append_record(file: &mut File, record: &[u8], sync: bool) -> std::io::Result<()> {
    file.write_all(record)?;
    if sync {
        file.sync_data()?;
    }
    Ok(())
}

fn apply(index: &mut BTreeMap<Vec<u8>, Vec<u8>>, batch: WriteBatch) {
    for op in batch.into_ops() {
        match op {
            BatchOp::Put { key, value } => {
                index.insert(key, value);
            }
            BatchOp::Delete { key } => {
                index.remove(&key);
            }
        }
    }
}

fn encode_snapshot(index: &BTreeMap<Vec<u8>, Vec<u8>>) -> StorageResult<Vec<u8>> {
    if index.is_empty() {
        return Ok(Vec::new());
    }
    let mut batch = WriteBatch::new();
    for (key, value) in index {
        batch.put(key.clone(), value.clone());
    }
    encode_record(&batch)
}

fn live_bytes(index: &BTreeMap<Vec<u8>, Vec<u8>>) -> u64 {
    index
        .iter()
        .map(|(k, v)| (k.len() + v.len()) as u64)
        .sum()
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> StorageResult<()> {
    if let Some(parent) = path.parent() {
        let dir = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> StorageResult<()> {
    // NTFS journals metadata; directory handles cannot be fsynced
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn no_compaction() -> FileStoreOptions {
        FileStoreOptions::default().without_auto_compaction()
    }

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let store = FileStore::open(&path, no_compaction()).unwrap();
        assert!(store.is_empty());
        assert_eq!(store.log_size(), 0);
        assert!(path.exists());
        assert_eq!(store.path(), path);
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        {
            let store = FileStore::open(&path, no_compaction()).unwrap();
            store.put(b"op/1", b"one").unwrap();
            store.put(b"op/2", b"two").unwrap();
            store.delete(b"op/1").unwrap();
        }

        let store = FileStore::open(&path, no_compaction()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"op/1").unwrap(), None);
        assert_eq!(store.get(b"op/2").unwrap(), Some(b"two".to_vec()));
    }

    #[test]
    fn file_second_open_is_locked() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let _first = FileStore::open(&path, no_compaction()).unwrap();
        let second = FileStore::open(&path, no_compaction());
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn file_torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let intact_size = {
            let store = FileStore::open(&path, no_compaction()).unwrap();
            store.put(b"op/1", b"kept").unwrap();
            store.log_size()
        };

        // Simulate a crash halfway through appending a second record
        let mut batch = WriteBatch::new();
        batch.put(b"op/2".to_vec(), b"lost".to_vec());
        let record = encode_record(&batch).unwrap();
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&record[..record.len() / 2]).unwrap();
        }

        let report = FileStore::verify(&path).unwrap();
        assert!(report.torn_tail);
        assert_eq!(report.valid_bytes, intact_size);
        let snapshot = FileStore::read_snapshot(&path).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, b"op/1".to_vec());

        let store = FileStore::open(&path, no_compaction()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"op/2").unwrap(), None);
        assert_eq!(store.log_size(), intact_size);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_size);

        // Appends continue on a record boundary
        store.put(b"op/3", b"new").unwrap();
        drop(store);
        let store = FileStore::open(&path, no_compaction()).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn file_checksum_corruption_refuses_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        {
            let store = FileStore::open(&path, no_compaction()).unwrap();
            store.put(b"op/1", b"value").unwrap();
        }

        let mut bytes = fs::read(&path).unwrap();
        let last_payload_byte = bytes.len() - 5;
        bytes[last_payload_byte] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let result = FileStore::open(&path, no_compaction());
        assert!(matches!(result, Err(StorageError::ChecksumMismatch { .. })));
        assert!(FileStore::verify(&path).is_err());
    }

    #[test]
    fn file_compaction_preserves_live_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");

        let store = FileStore::open(&path, no_compaction()).unwrap();
        for i in 0..50u32 {
            let key = format!("op/{i:04}");
            store.put(key.as_bytes(), b"payload").unwrap();
            if i % 5 != 0 {
                store.delete(key.as_bytes()).unwrap();
            }
        }
        let before = store.log_size();
        let reclaimed = store.compact().unwrap();
        assert!(reclaimed > 0);
        assert_eq!(store.log_size(), before - reclaimed);
        assert_eq!(store.len(), 10);

        store.put(b"op/9999", b"after").unwrap();
        drop(store);

        let store = FileStore::open(&path, no_compaction()).unwrap();
        assert_eq!(store.len(), 11);
        assert_eq!(store.get(b"op/0005").unwrap(), Some(b"payload".to_vec()));
        assert_eq!(store.get(b"op/0006").unwrap(), None);
        assert!(!sidecar(&path, "compact").exists());
    }

    #[test]
    fn file_auto_compaction() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let mut options = FileStoreOptions::default().with_compact_ratio(2.0);
        options.compact_min_bytes = 256;

        let store = FileStore::open(&path, options).unwrap();
        for _ in 0..100 {
            store.put(b"op/1", b"rewritten over and over").unwrap();
        }
        // One live key: the log never grows far past a couple of records
        assert!(store.log_size() < 512);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn file_failed_auto_compaction_keeps_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let mut options = FileStoreOptions::default().with_compact_ratio(2.0);
        options.compact_min_bytes = 0;

        let store = FileStore::open(&path, options.clone()).unwrap();
        // A directory in the way makes every compaction attempt fail
        fs::create_dir(sidecar(&path, "compact")).unwrap();
        for i in 0..10u8 {
            store.put(b"op/1", &[i; 16]).unwrap();
        }
        assert_eq!(store.get(b"op/1").unwrap(), Some(vec![9u8; 16]));
        drop(store);

        fs::remove_dir(sidecar(&path, "compact")).unwrap();
        let store = FileStore::open(&path, options).unwrap();
        assert_eq!(store.get(b"op/1").unwrap(), Some(vec![9u8; 16]));
    }

    #[test]
    fn file_size_limit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let options = no_compaction().with_max_bytes(200);

        let store = FileStore::open(&path, options).unwrap();
        let big = vec![7u8; 120];
        store.put(b"op/1", &big).unwrap();

        let result = store.put(b"op/2", &big);
        assert!(matches!(result, Err(StorageError::Full { .. })));
        assert_eq!(store.get(b"op/2").unwrap(), None);

        // Deletes are always accepted
        store.delete(b"op/1").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn file_full_store_accepts_overwrites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        let options = no_compaction().with_max_bytes(1024);

        let store = FileStore::open(&path, options.clone()).unwrap();
        let value = vec![1u8; 100];
        let mut keys = Vec::new();
        for i in 0.. {
            let key = format!("op/{i:04}").into_bytes();
            match store.put(&key, &value) {
                Ok(()) => keys.push(key),
                Err(StorageError::Full { .. }) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(keys.len() > 2);

        // Status rewrites of existing keys keep working at the limit
        let grown = vec![2u8; 104];
        for _ in 0..3 {
            for key in &keys {
                store.put(key, &grown).unwrap();
            }
        }
        assert!(store.log_size() <= 1024 + 128);

        // A batch that moves a key under a new name adds nothing
        let mut batch = WriteBatch::new();
        batch.delete(keys[0].clone());
        batch.put(b"dead/0000".to_vec(), grown.clone());
        store.write(batch).unwrap();

        for key in &keys[1..] {
            store.delete(key).unwrap();
        }
        assert_eq!(store.len(), 1);
        drop(store);

        let store = FileStore::open(&path, options).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(b"dead/0000").unwrap(), Some(grown));
    }

    #[test]
    fn file_stale_compaction_file_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.log");
        fs::write(sidecar(&path, "compact"), b"garbage").unwrap();

        let store = FileStore::open(&path, no_compaction()).unwrap();
        assert!(store.is_empty());
        assert!(!sidecar(&path, "compact").exists());
    }

    #[test]
    fn file_nested_path_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("queue.log");

        let store = FileStore::open_default(&path).unwrap();
        store.put(b"k", b"v").unwrap();
        assert!(path.exists());
    }
}
