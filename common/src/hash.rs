//! Streaming 128-bit content hashing.
//!
//! Content identity across the database is a BLAKE3 digest truncated to 128
//! bits and carried as two 64-bit words. The all-zero value is reserved to
//! mean "no hash" so records can exist before their content has been read.

use anyhow::{Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;

use crate::copy::{CopyContext, COPY_CONTEXT_BUFFER_SIZE};
use crate::fileio::{self, AccessType};
use crate::iostats::IoStats;

/// 128-bit content digest. Invalid iff both words are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileHash {
    pub hi: u64,
    pub lo: u64,
}

impl FileHash {
    pub const INVALID: FileHash = FileHash { hi: 0, lo: 0 };

    pub fn is_valid(&self) -> bool {
        self.hi != 0 || self.lo != 0
    }
}

impl std::fmt::Display for FileHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:016x}{:016x}", self.hi, self.lo)
    }
}

/// Per-worker hashing state.
///
/// Owns nothing heavy itself, just the cumulative time spent hashing and the
/// number of files hashed, so the run summary can say how much of the wall
/// clock went into digests. One context produces many [`HashBuilder`]s.
#[derive(Debug, Default)]
pub struct HashContext {
    pub time: Duration,
    pub count: u64,
}

impl HashContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a hashing session for a single file.
    pub fn builder(&mut self) -> HashBuilder<'_> {
        HashBuilder {
            context: self,
            hasher: blake3::Hasher::new(),
        }
    }
}

/// Scoped hashing session: feed bytes with [`add`](Self::add), then
/// [`finish`](Self::finish) to get the digest. One builder hashes exactly
/// one file.
pub struct HashBuilder<'a> {
    context: &'a mut HashContext,
    hasher: blake3::Hasher,
}

impl HashBuilder<'_> {
    pub fn add(&mut self, data: &[u8]) {
        let start = Instant::now();
        self.hasher.update(data);
        self.context.time += start.elapsed();
    }

    pub fn finish(self) -> FileHash {
        let start = Instant::now();
        let digest = self.hasher.finalize();
        let bytes = digest.as_bytes();
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..16]);
        self.context.time += start.elapsed();
        self.context.count += 1;
        FileHash {
            hi: u64::from_le_bytes(hi),
            lo: u64::from_le_bytes(lo),
        }
    }
}

/// Streams `path` through a hash builder using the copy context's buffer.
///
/// Used both when priming the database from an existing destination tree and
/// when verifying that a reuse candidate still matches its recorded hash.
pub async fn get_file_hash(
    path: &Path,
    ctx: &mut CopyContext,
    io: &mut IoStats,
    hash_ctx: &mut HashContext,
) -> Result<FileHash> {
    let mut file = fileio::open_file_read(path, io, true).await?;
    let mut builder = hash_ctx.builder();
    let buffer = ctx.scratch_buffer();
    loop {
        let start = Instant::now();
        let read = file
            .read(buffer)
            .await
            .with_context(|| format!("failed reading {:?}", path))?;
        io.read_count += 1;
        io.read_time += start.elapsed();
        if read == 0 {
            break;
        }
        builder.add(&buffer[..read]);
    }
    fileio::close_file(path, file, AccessType::Read, io).await?;
    Ok(builder.finish())
}

/// Like [`get_file_hash`], but when the whole file fits in one copy buffer
/// its bytes are left in the context's retained buffer, so a copy that
/// follows the hash can write them out without reading the source again.
/// Returns the retained length in that case.
pub async fn get_file_hash_retaining(
    path: &Path,
    ctx: &mut CopyContext,
    io: &mut IoStats,
    hash_ctx: &mut HashContext,
) -> Result<(FileHash, Option<usize>)> {
    let mut file = fileio::open_file_read(path, io, true).await?;
    let mut builder = hash_ctx.builder();
    let mut filled = 0;
    {
        let buffer = ctx.retained_buffer();
        while filled < buffer.len() {
            let start = Instant::now();
            let read = file
                .read(&mut buffer[filled..])
                .await
                .with_context(|| format!("failed reading {:?}", path))?;
            io.read_count += 1;
            io.read_time += start.elapsed();
            if read == 0 {
                break;
            }
            builder.add(&buffer[filled..filled + read]);
            filled += read;
        }
    }
    let mut retained = Some(filled);
    if filled == COPY_CONTEXT_BUFFER_SIZE {
        // spills past one buffer, keep hashing through the scratch buffer
        let buffer = ctx.scratch_buffer();
        loop {
            let start = Instant::now();
            let read = file
                .read(buffer)
                .await
                .with_context(|| format!("failed reading {:?}", path))?;
            io.read_count += 1;
            io.read_time += start.elapsed();
            if read == 0 {
                break;
            }
            retained = None;
            builder.add(&buffer[..read]);
        }
    }
    fileio::close_file(path, file, AccessType::Read, io).await?;
    Ok((builder.finish(), retained))
}
