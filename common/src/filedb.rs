//! The file database: a content-addressed index of destination files.
//!
//! Maps every destination file the system has seen to its 128-bit content
//! hash so later copies can reuse what is already on disk, either by hard
//! linking an identical file or by picking a similar file as the basis for a
//! delta transfer. Three structures cooperate:
//!
//! - `files`: `FileKey -> FileRecord`, the authoritative index
//! - `file_hashes`: `FileHash -> FileKey`, content lookup into `files`
//! - `history`: insertion-ordered list driving LRU eviction
//!
//! The history list is an indexable arena with a free list; records hold an
//! opaque node index and nodes hold only the key, so removal is O(1) and
//! there are no cyclic references. All three are mutated under one mutex
//! held only for the duration of individual operations.
//!
//! Priming walks an existing destination tree in the background, hashing
//! every file and inserting it, so link reuse works from the first copy of
//! a run rather than only for files this run has written.

use anyhow::{Context, Result};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use crate::copy::CopyContext;
use crate::fileio::{self, AccessType, FileInfo, FileTime, MAX_PATH};
use crate::hash::{get_file_hash, FileHash, HashContext};
use crate::iostats::IoStats;

const DB_MAGIC: [u8; 4] = *b"rmdb";
const DB_VERSION: u32 = 1;

fn folded(name: &str) -> impl Iterator<Item = char> + '_ {
    name.chars().flat_map(|c| c.to_lowercase())
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Identity of one version of a destination file.
///
/// Names compare case-insensitively; ordering is name, then write time,
/// then size, so different versions of the same file sort together.
#[derive(Debug, Clone)]
pub struct FileKey {
    pub name: String,
    pub last_write_time: FileTime,
    pub file_size: u64,
}

impl PartialEq for FileKey {
    fn eq(&self, other: &Self) -> bool {
        self.last_write_time == other.last_write_time
            && self.file_size == other.file_size
            && folded(&self.name).eq(folded(&other.name))
    }
}

impl Eq for FileKey {}

impl std::hash::Hash for FileKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        for c in folded(&self.name) {
            state.write_u32(c as u32);
        }
        self.last_write_time.hash(state);
        self.file_size.hash(state);
    }
}

impl Ord for FileKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        folded(&self.name)
            .cmp(folded(&other.name))
            .then(self.last_write_time.cmp(&other.last_write_time))
            .then(self.file_size.cmp(&other.file_size))
    }
}

impl PartialOrd for FileKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// What the database knows about one destination file. An empty record
/// (invalid hash) means "never seen".
#[derive(Debug, Clone, Default)]
pub struct FileRecord {
    /// Full destination path, case-preserving.
    pub name: String,
    pub hash: FileHash,
    history_index: usize,
}

#[derive(Debug)]
struct HistoryNode {
    key: FileKey,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Doubly-linked insertion-order list backed by an arena with a free list.
#[derive(Debug, Default)]
struct FilesHistory {
    nodes: Vec<Option<HistoryNode>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl FilesHistory {
    fn len(&self) -> usize {
        self.len
    }

    fn push_back(&mut self, key: FileKey) -> usize {
        let node = HistoryNode {
            key,
            prev: self.tail,
            next: None,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                index
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        if let Some(tail) = self.tail {
            if let Some(tail_node) = self.nodes[tail].as_mut() {
                tail_node.next = Some(index);
            }
        } else {
            self.head = Some(index);
        }
        self.tail = Some(index);
        self.len += 1;
        index
    }

    fn remove(&mut self, index: usize) -> Option<FileKey> {
        let node = self.nodes.get_mut(index)?.take()?;
        match node.prev {
            Some(prev) => {
                if let Some(prev_node) = self.nodes[prev].as_mut() {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next_node) = self.nodes[next].as_mut() {
                    next_node.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.free.push(index);
        self.len -= 1;
        Some(node.key)
    }

    fn pop_front(&mut self) -> Option<FileKey> {
        let head = self.head?;
        self.remove(head)
    }

    fn iter_oldest_first(&self) -> HistoryIter<'_> {
        HistoryIter {
            history: self,
            cursor: self.head,
            newest_first: false,
        }
    }

    fn iter_newest_first(&self) -> HistoryIter<'_> {
        HistoryIter {
            history: self,
            cursor: self.tail,
            newest_first: true,
        }
    }
}

struct HistoryIter<'a> {
    history: &'a FilesHistory,
    cursor: Option<usize>,
    newest_first: bool,
}

impl<'a> Iterator for HistoryIter<'a> {
    type Item = &'a FileKey;
    fn next(&mut self) -> Option<Self::Item> {
        let index = self.cursor?;
        let node = self.history.nodes[index].as_ref()?;
        self.cursor = if self.newest_first {
            node.prev
        } else {
            node.next
        };
        Some(&node.key)
    }
}

#[derive(Debug, Default)]
struct DbInner {
    files: HashMap<FileKey, FileRecord>,
    file_hashes: HashMap<FileHash, FileKey>,
    history: FilesHistory,
}

#[derive(Debug, Clone)]
struct PrimeDir {
    dir: PathBuf,
    /// When set, keys are named relative to this root.
    root: Option<PathBuf>,
}

#[derive(Debug)]
pub struct FileDatabase {
    inner: Mutex<DbInner>,
    prime_dirs: Mutex<VecDeque<PrimeDir>>,
    prime_active: AtomicUsize,
    prime_workers: AtomicUsize,
    prime_notify: tokio::sync::Notify,
    prime_stats: Mutex<IoStats>,
    /// Back-reference handed to background scan workers.
    me: Weak<FileDatabase>,
}

struct PrimeActiveGuard<'a>(&'a FileDatabase);

impl Drop for PrimeActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.prime_active.fetch_sub(1, Ordering::SeqCst);
        self.0.prime_notify.notify_waiters();
    }
}

impl FileDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| FileDatabase {
            inner: Mutex::default(),
            prime_dirs: Mutex::default(),
            prime_active: AtomicUsize::new(0),
            prime_workers: AtomicUsize::new(0),
            prime_notify: tokio::sync::Notify::new(),
            prime_stats: Mutex::default(),
            me: me.clone(),
        })
    }

    fn lock_inner(&self) -> MutexGuard<'_, DbInner> {
        self.inner.lock().expect("file database mutex poisoned")
    }

    fn lock_prime_dirs(&self) -> MutexGuard<'_, VecDeque<PrimeDir>> {
        self.prime_dirs.lock().expect("prime queue mutex poisoned")
    }

    pub fn is_empty(&self) -> bool {
        self.lock_inner().files.is_empty()
    }

    pub fn history_size(&self) -> usize {
        self.lock_inner().history.len()
    }

    /// Record for a key, or an empty record (invalid hash) when unseen.
    pub fn get_record(&self, key: &FileKey) -> FileRecord {
        let inner = self.lock_inner();
        inner.files.get(key).cloned().unwrap_or_default()
    }

    /// Record holding a given content hash, or an empty record.
    pub fn get_record_by_hash(&self, hash: &FileHash) -> FileRecord {
        let inner = self.lock_inner();
        inner
            .file_hashes
            .get(hash)
            .and_then(|key| inner.files.get(key))
            .cloned()
            .unwrap_or_default()
    }

    /// Picks the best basis file for a delta transfer of `key`: an entry
    /// with the same base name but a different version, the most recently
    /// seen one first.
    pub fn find_file_for_delta_copy(&self, key: &FileKey) -> Option<PathBuf> {
        let inner = self.lock_inner();
        let wanted = base_name(&key.name);
        for candidate in inner.history.iter_newest_first() {
            if candidate == key {
                continue;
            }
            if !folded(base_name(&candidate.name)).eq(folded(wanted)) {
                continue;
            }
            if let Some(record) = inner.files.get(candidate) {
                return Some(PathBuf::from(&record.name));
            }
        }
        None
    }

    /// Inserts or refreshes a record. Reinserting an existing key moves its
    /// history node to the tail and updates the hash and name if changed.
    pub fn add_to_files_history(&self, key: FileKey, hash: FileHash, full_name: String) {
        let mut inner = self.lock_inner();
        if let Some(old) = inner.files.remove(&key) {
            inner.history.remove(old.history_index);
            if old.hash.is_valid() && old.hash != hash {
                let owned = inner
                    .file_hashes
                    .get(&old.hash)
                    .map_or(false, |owner| owner == &key);
                if owned {
                    inner.file_hashes.remove(&old.hash);
                }
            }
        }
        let history_index = inner.history.push_back(key.clone());
        if hash.is_valid() {
            inner.file_hashes.insert(hash, key.clone());
        }
        inner.files.insert(
            key,
            FileRecord {
                name: full_name,
                hash,
                history_index,
            },
        );
    }

    /// Evicts whichever record currently holds `hash`, if any. Used when a
    /// re-read of the file no longer matches the recorded content.
    pub fn remove_record_by_hash(&self, hash: &FileHash) {
        let key = {
            let inner = self.lock_inner();
            inner.file_hashes.get(hash).cloned()
        };
        if let Some(key) = key {
            self.remove_file_history(&key);
        }
    }

    /// Erases a key from all three structures.
    pub fn remove_file_history(&self, key: &FileKey) {
        let mut inner = self.lock_inner();
        if let Some(record) = inner.files.remove(key) {
            inner.history.remove(record.history_index);
            if record.hash.is_valid() {
                let owned = inner
                    .file_hashes
                    .get(&record.hash)
                    .map_or(false, |owner| owner == key);
                if owned {
                    inner.file_hashes.remove(&record.hash);
                }
            }
        }
    }

    /// Evicts from the head of history until at most `max_history` records
    /// remain. Returns the number of evicted records.
    pub fn garbage_collect(&self, max_history: usize) -> usize {
        let mut inner = self.lock_inner();
        let mut removed = 0;
        while inner.history.len() > max_history {
            let Some(key) = inner.history.pop_front() else {
                break;
            };
            if let Some(record) = inner.files.remove(&key) {
                if record.hash.is_valid() {
                    let owned = inner
                        .file_hashes
                        .get(&record.hash)
                        .map_or(false, |owner| owner == &key);
                    if owned {
                        inner.file_hashes.remove(&record.hash);
                    }
                }
            }
            removed += 1;
        }
        removed
    }

    /// Enqueues a directory for a priming scan. With `flush` the queue is
    /// drained in the caller before returning; otherwise a background scan
    /// worker is started if none is running.
    pub async fn prime_directory(
        &self,
        directory: &Path,
        io: &mut IoStats,
        use_relative_path: bool,
        flush: bool,
    ) {
        let record = PrimeDir {
            dir: directory.to_path_buf(),
            root: use_relative_path.then(|| directory.to_path_buf()),
        };
        self.lock_prime_dirs().push_back(record);
        if flush {
            let mut ctx = CopyContext::new();
            let mut hash_ctx = HashContext::new();
            while self.prime_update(io, &mut ctx, &mut hash_ctx).await {}
        } else if self.prime_workers.load(Ordering::SeqCst) == 0 {
            self.spawn_prime_worker();
        }
    }

    fn spawn_prime_worker(&self) {
        let Some(db) = self.me.upgrade() else {
            return;
        };
        self.prime_workers.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let mut ctx = CopyContext::new();
            let mut hash_ctx = HashContext::new();
            let mut io = IoStats::default();
            while db.prime_update(&mut io, &mut ctx, &mut hash_ctx).await {}
            {
                let mut stats = db.prime_stats.lock().expect("prime stats mutex poisoned");
                *stats = *stats + io;
            }
            db.prime_workers.fetch_sub(1, Ordering::SeqCst);
            db.prime_notify.notify_waiters();
        });
    }

    /// Scans one queued directory: hashes the files in it, inserts them,
    /// and re-enqueues subdirectories. Returns true if a directory was
    /// consumed. Scan errors are logged and do not stop the queue.
    pub async fn prime_update(
        &self,
        io: &mut IoStats,
        ctx: &mut CopyContext,
        hash_ctx: &mut HashContext,
    ) -> bool {
        let record = {
            let mut queue = self.lock_prime_dirs();
            match queue.pop_front() {
                Some(record) => {
                    self.prime_active.fetch_add(1, Ordering::SeqCst);
                    record
                }
                None => return false,
            }
        };
        let _active = PrimeActiveGuard(self);
        self.scan_directory(&record, io, ctx, hash_ctx).await;
        true
    }

    async fn scan_directory(
        &self,
        record: &PrimeDir,
        io: &mut IoStats,
        ctx: &mut CopyContext,
        hash_ctx: &mut HashContext,
    ) {
        let start = Instant::now();
        let read_dir = tokio::fs::read_dir(&record.dir).await;
        io.find_file_count += 1;
        io.find_file_time += start.elapsed();
        let mut entries = match read_dir {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!("cannot scan directory {:?}: {}", record.dir, error);
                return;
            }
        };
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    tracing::error!("failed traversing {:?}: {}", record.dir, error);
                    break;
                }
            };
            let file_type = match entry.file_type().await {
                Ok(file_type) => file_type,
                Err(error) => {
                    tracing::error!("cannot stat {:?}: {}", entry.path(), error);
                    continue;
                }
            };
            let full_path = entry.path();
            if file_type.is_dir() {
                self.lock_prime_dirs().push_back(PrimeDir {
                    dir: full_path,
                    root: record.root.clone(),
                });
                // the new work may outlive every running scan
                if self.prime_workers.load(Ordering::SeqCst) == 0 {
                    self.spawn_prime_worker();
                }
                continue;
            }
            if !file_type.is_file() {
                tracing::debug!("priming skips non-regular file {:?}", full_path);
                continue;
            }
            let info = match entry.metadata().await {
                Ok(metadata) => FileInfo::from_metadata(&metadata),
                Err(error) => {
                    tracing::error!("cannot stat {:?}: {}", full_path, error);
                    continue;
                }
            };
            io.file_info_count += 1;
            let key_name = match &record.root {
                Some(root) => full_path
                    .strip_prefix(root)
                    .unwrap_or(&full_path)
                    .to_string_lossy()
                    .into_owned(),
                None => full_path.to_string_lossy().into_owned(),
            };
            let hash = match get_file_hash(&full_path, ctx, io, hash_ctx).await {
                Ok(hash) => hash,
                Err(error) => {
                    tracing::error!("failed hashing {:?}: {:#}", full_path, error);
                    continue;
                }
            };
            let key = FileKey {
                name: key_name,
                last_write_time: info.last_write_time,
                file_size: info.file_size,
            };
            self.add_to_files_history(key, hash, full_path.to_string_lossy().into_owned());
        }
    }

    /// Blocks until the prime queue is empty and no scan is active,
    /// helping to drain the queue while it waits. Stats collected by
    /// background workers are merged into `io`.
    pub async fn prime_wait(&self, io: &mut IoStats) {
        let mut ctx = CopyContext::new();
        let mut hash_ctx = HashContext::new();
        loop {
            if self.prime_update(io, &mut ctx, &mut hash_ctx).await {
                continue;
            }
            let notified = self.prime_notify.notified();
            if self.lock_prime_dirs().is_empty() && self.prime_active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        let mut stats = self.prime_stats.lock().expect("prime stats mutex poisoned");
        *io = *io + std::mem::take(&mut *stats);
    }

    /// Serializes the database: a header, then the records in history order
    /// (oldest first) so a reload reconstructs the same eviction order.
    pub async fn write_file(&self, path: &Path, io: &mut IoStats) -> Result<()> {
        let payload = {
            let inner = self.lock_inner();
            let mut records = Vec::new();
            let mut count: u32 = 0;
            for key in inner.history.iter_oldest_first() {
                let Some(record) = inner.files.get(key) else {
                    continue;
                };
                let name = record.name.as_bytes();
                let key_name = key.name.as_bytes();
                if name.is_empty() || name.len() >= MAX_PATH || key_name.len() > name.len() {
                    tracing::warn!("not persisting record with unusable name {:?}", record.name);
                    continue;
                }
                records.extend((name.len() as u16).to_le_bytes());
                records.extend((key_name.len() as u16).to_le_bytes());
                records.extend_from_slice(name);
                records.extend(key.last_write_time.as_raw().to_le_bytes());
                records.extend(key.file_size.to_le_bytes());
                records.extend(record.hash.hi.to_le_bytes());
                records.extend(record.hash.lo.to_le_bytes());
                count += 1;
            }
            let mut payload = Vec::with_capacity(12 + records.len());
            payload.extend_from_slice(&DB_MAGIC);
            payload.extend(DB_VERSION.to_le_bytes());
            payload.extend(count.to_le_bytes());
            payload.extend_from_slice(&records);
            payload
        };
        let mut file = match fileio::open_file_write(path, io, false).await? {
            fileio::OpenWrite::Opened(file) => file,
            fileio::OpenWrite::Existed => unreachable!("open without fail_if_exists"),
        };
        let start = Instant::now();
        tokio::io::AsyncWriteExt::write_all(&mut file, &payload)
            .await
            .with_context(|| format!("failed writing database {:?}", path))?;
        io.write_count += 1;
        io.write_time += start.elapsed();
        fileio::close_file(path, file, AccessType::Write, io).await
    }

    /// Loads a previously serialized database. A missing file is fine; a
    /// malformed one is discarded and the database starts empty.
    pub async fn read_file(&self, path: &Path, io: &mut IoStats) -> Result<()> {
        let start = Instant::now();
        let data = match tokio::fs::read(path).await {
            Ok(data) => data,
            Err(error) => {
                tracing::debug!("no database loaded from {:?}: {}", path, error);
                return Ok(());
            }
        };
        io.read_count += 1;
        io.read_time += start.elapsed();
        if !self.load_bytes(&data) {
            tracing::info!("database file {:?} is malformed, starting empty", path);
            *self.lock_inner() = DbInner::default();
        }
        Ok(())
    }

    fn load_bytes(&self, data: &[u8]) -> bool {
        let mut cursor = ByteCursor { data, pos: 0 };
        if cursor.take(4) != Some(&DB_MAGIC[..]) {
            return false;
        }
        if cursor.take_u32() != Some(DB_VERSION) {
            return false;
        }
        let Some(count) = cursor.take_u32() else {
            return false;
        };
        for _ in 0..count {
            let Some(name_len) = cursor.take_u16() else {
                return false;
            };
            let Some(key_len) = cursor.take_u16() else {
                return false;
            };
            if name_len == 0 || name_len as usize >= MAX_PATH || key_len > name_len {
                return false;
            }
            let Some(name_bytes) = cursor.take(name_len as usize) else {
                return false;
            };
            let Ok(name) = std::str::from_utf8(name_bytes) else {
                return false;
            };
            let Some(time) = cursor.take_u64() else {
                return false;
            };
            let Some(size) = cursor.take_u64() else {
                return false;
            };
            let Some(hi) = cursor.take_u64() else {
                return false;
            };
            let Some(lo) = cursor.take_u64() else {
                return false;
            };
            // the key name is the trailing portion of the stored name
            let Some(key_name) = name.get(name.len() - key_len as usize..) else {
                return false;
            };
            let key = FileKey {
                name: key_name.to_owned(),
                last_write_time: FileTime::from_raw(time),
                file_size: size,
            };
            self.add_to_files_history(key, FileHash { hi, lo }, name.to_owned());
        }
        cursor.pos == data.len()
    }

    #[cfg(test)]
    fn snapshot(&self) -> (Vec<FileKey>, usize, usize) {
        let inner = self.lock_inner();
        let order: Vec<FileKey> = inner.history.iter_oldest_first().cloned().collect();
        (order, inner.files.len(), inner.file_hashes.len())
    }
}

struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn take_u16(&mut self) -> Option<u16> {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(self.take(2)?);
        Some(u16::from_le_bytes(bytes))
    }

    fn take_u32(&mut self) -> Option<u32> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Some(u32::from_le_bytes(bytes))
    }

    fn take_u64(&mut self) -> Option<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Some(u64::from_le_bytes(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils;

    fn key(name: &str, time: u64, size: u64) -> FileKey {
        FileKey {
            name: name.to_owned(),
            last_write_time: FileTime::from_raw(time),
            file_size: size,
        }
    }

    fn hash(seed: u64) -> FileHash {
        FileHash { hi: seed, lo: !seed }
    }

    #[test]
    fn keys_compare_case_insensitively() {
        let a = key("Sub/File.TXT", 7, 42);
        let b = key("sub/file.txt", 7, 42);
        assert_eq!(a, b);
        assert!(key("a", 1, 1) < key("b", 0, 0));
        assert!(key("a", 1, 1) < key("a", 2, 0));
        assert!(key("a", 1, 1) < key("a", 1, 2));
    }

    #[test]
    fn lookups_return_empty_record_when_absent() {
        let db = FileDatabase::new();
        assert!(!db.get_record(&key("x", 1, 1)).hash.is_valid());
        assert!(!db.get_record_by_hash(&hash(9)).hash.is_valid());
    }

    #[test]
    fn maps_and_history_stay_consistent() {
        let db = FileDatabase::new();
        for i in 0..6u64 {
            db.add_to_files_history(
                key(&format!("f{}", i), i, i),
                hash(i + 1),
                format!("/dst/f{}", i),
            );
        }
        let (order, files, hashes) = db.snapshot();
        assert_eq!(order.len(), 6);
        assert_eq!(files, 6);
        assert_eq!(hashes, 6);

        db.remove_file_history(&key("f2", 2, 2));
        let (order, files, hashes) = db.snapshot();
        assert_eq!(order.len(), 5);
        assert_eq!(files, 5);
        assert_eq!(hashes, 5);
        assert!(!order.iter().any(|k| k.name == "f2"));
        assert!(!db.get_record_by_hash(&hash(3)).hash.is_valid());
    }

    #[test]
    fn reinsertion_moves_to_tail_and_refreshes() {
        let db = FileDatabase::new();
        db.add_to_files_history(key("a", 1, 1), hash(1), "/dst/a".to_owned());
        db.add_to_files_history(key("b", 2, 2), hash(2), "/dst/b".to_owned());
        db.add_to_files_history(key("a", 1, 1), hash(3), "/dst/A".to_owned());
        let (order, files, hashes) = db.snapshot();
        assert_eq!(files, 2);
        assert_eq!(order.last().map(|k| k.name.as_str()), Some("a"));
        let record = db.get_record(&key("a", 1, 1));
        assert_eq!(record.hash, hash(3));
        assert_eq!(record.name, "/dst/A");
        // the superseded hash pointer is gone, the new one resolves
        assert!(!db.get_record_by_hash(&hash(1)).hash.is_valid());
        assert_eq!(db.get_record_by_hash(&hash(3)).name, "/dst/A");
        assert_eq!(hashes, 2);
    }

    #[test]
    fn garbage_collect_keeps_newest() {
        let db = FileDatabase::new();
        for i in 0..10u64 {
            db.add_to_files_history(
                key(&format!("f{}", i), i, 1),
                hash(i + 1),
                format!("/dst/f{}", i),
            );
        }
        assert_eq!(db.garbage_collect(5), 5);
        let (order, files, hashes) = db.snapshot();
        assert_eq!(order.len(), 5);
        assert_eq!(files, 5);
        assert_eq!(hashes, 5);
        let names: Vec<&str> = order.iter().map(|k| k.name.as_str()).collect();
        assert_eq!(names, ["f5", "f6", "f7", "f8", "f9"]);
        // already below the bound: nothing to do
        assert_eq!(db.garbage_collect(5), 0);
        assert_eq!(db.garbage_collect(0), 5);
        assert_eq!(db.history_size(), 0);
    }

    #[test]
    fn delta_candidate_prefers_most_recent_same_name() {
        let db = FileDatabase::new();
        db.add_to_files_history(key("sub/foo.bin", 1, 100), hash(1), "/dst/sub/foo.bin".to_owned());
        db.add_to_files_history(key("other.bin", 2, 100), hash(2), "/dst/other.bin".to_owned());
        db.add_to_files_history(key("old/foo.bin", 3, 150), hash(3), "/dst/old/foo.bin".to_owned());
        let wanted = key("sub/foo.bin", 9, 120);
        assert_eq!(
            db.find_file_for_delta_copy(&wanted),
            Some(PathBuf::from("/dst/old/foo.bin"))
        );
        // no candidate for a name the database has never seen
        assert!(db.find_file_for_delta_copy(&key("nope.bin", 1, 1)).is_none());
        // the only entry with the name is the key itself
        let only = key("other.bin", 2, 100);
        assert!(db.find_file_for_delta_copy(&only).is_none());
    }

    #[tokio::test]
    async fn persistence_round_trips_history_order() -> Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let db_path = tmp_dir.join("files.db");
        let db = FileDatabase::new();
        db.add_to_files_history(key("sub/a.txt", 11, 1), hash(1), "/dst/sub/a.txt".to_owned());
        db.add_to_files_history(key("b.txt", 22, 2), hash(2), "/dst/b.txt".to_owned());
        db.add_to_files_history(key("sub/a.txt", 11, 1), hash(1), "/dst/sub/a.txt".to_owned());
        let mut io = IoStats::default();
        db.write_file(&db_path, &mut io).await?;

        let reloaded = FileDatabase::new();
        reloaded.read_file(&db_path, &mut io).await?;
        let (order, files, hashes) = reloaded.snapshot();
        let (expected_order, expected_files, expected_hashes) = db.snapshot();
        assert_eq!(order, expected_order);
        assert_eq!(files, expected_files);
        assert_eq!(hashes, expected_hashes);
        let record = reloaded.get_record_by_hash(&hash(1));
        assert_eq!(record.name, "/dst/sub/a.txt");
        // key names survive as the suffix of the stored full name
        assert_eq!(reloaded.get_record(&key("b.txt", 22, 2)).name, "/dst/b.txt");
        Ok(())
    }

    #[tokio::test]
    async fn malformed_database_file_loads_empty() -> Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let db_path = tmp_dir.join("files.db");

        // valid header claiming one record, then garbage
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&DB_MAGIC);
        bytes.extend(DB_VERSION.to_le_bytes());
        bytes.extend(1u32.to_le_bytes());
        bytes.extend([0xffu8; 7]);
        tokio::fs::write(&db_path, &bytes).await?;

        let db = FileDatabase::new();
        let mut io = IoStats::default();
        db.read_file(&db_path, &mut io).await?;
        assert!(db.is_empty());

        // a missing file is not an error
        db.read_file(&tmp_dir.join("absent.db"), &mut io).await?;
        assert!(db.is_empty());

        // wrong magic
        tokio::fs::write(&db_path, b"nope").await?;
        db.add_to_files_history(key("x", 1, 1), hash(1), "/dst/x".to_owned());
        db.read_file(&db_path, &mut io).await?;
        assert!(db.is_empty(), "partial state is discarded on a bad load");
        Ok(())
    }

    #[tokio::test]
    async fn priming_indexes_a_tree_with_relative_keys() -> Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let root = tmp_dir.join("dest");
        tokio::fs::create_dir(&root).await?;
        tokio::fs::write(root.join("a.txt"), "alpha").await?;
        tokio::fs::create_dir(root.join("sub")).await?;
        tokio::fs::write(root.join("sub").join("b.txt"), "beta").await?;

        let db = FileDatabase::new();
        let mut io = IoStats::default();
        db.prime_directory(&root, &mut io, true, true).await;
        db.prime_wait(&mut io).await;
        assert_eq!(db.history_size(), 2);

        let info_a = {
            let metadata = std::fs::symlink_metadata(root.join("a.txt"))?;
            FileInfo::from_metadata(&metadata)
        };
        let record = db.get_record(&FileKey {
            name: "a.txt".to_owned(),
            last_write_time: info_a.last_write_time,
            file_size: info_a.file_size,
        });
        assert!(record.hash.is_valid());
        assert_eq!(PathBuf::from(&record.name), root.join("a.txt"));
        assert!(io.find_file_count >= 2);
        Ok(())
    }

    #[tokio::test]
    async fn background_priming_completes_via_wait() -> Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let root = tmp_dir.join("dest");
        tokio::fs::create_dir(&root).await?;
        for i in 0..4 {
            let sub = root.join(format!("sub{}", i));
            tokio::fs::create_dir(&sub).await?;
            tokio::fs::write(sub.join("f.bin"), format!("content {}", i)).await?;
        }
        let db = FileDatabase::new();
        let mut io = IoStats::default();
        db.prime_directory(&root, &mut io, false, false).await;
        db.prime_wait(&mut io).await;
        assert_eq!(db.history_size(), 4);
        // keys are absolute when not primed with relative paths
        let (order, _, _) = db.snapshot();
        assert!(order.iter().all(|k| k.name.starts_with('/')));
        Ok(())
    }
}
