//! The bulk copy engine.
//!
//! Every byte that moves between two paths flows through here. Large files
//! run a pipelined copy that rotates three buffers so the read stage, the
//! hash stage and the write stage can each be in flight at the same time:
//!
//! ```text
//! read ahead ──▶ hash in flight ──▶ write behind
//!    (B0)            (B1)              (B2)
//! ```
//!
//! Small files skip the pipeline and run a single-buffer sequential loop;
//! the task handoff overhead would cost more than it hides. When a digest is
//! wanted alongside the copy the hash stage updates a [`HashBuilder`] with
//! the bytes already in memory, so the file is never read twice.

use anyhow::{anyhow, Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::fileio::{self, AccessType, FileInfo, OpenWrite};
use crate::hash::HashBuilder;
use crate::iostats::IoStats;

/// Size of each of the three rotating copy buffers.
pub const COPY_CONTEXT_BUFFER_SIZE: usize = 8 * 1024 * 1024;

const COPY_BUFFER_COUNT: usize = 3;

/// Files at least this large default to the unbuffered pipeline.
pub const UNBUFFERED_IO_THRESHOLD: u64 = 4 * 1024 * 1024;

/// Buffered-vs-unbuffered policy for a copy.
///
/// `Auto` picks buffered below [`UNBUFFERED_IO_THRESHOLD`]: small files keep
/// syscall count down with a single buffered pass, large files avoid cache
/// pollution by streaming through the pipeline with a sequential-access
/// hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UseBufferedIo {
    #[default]
    Auto,
    Enabled,
    Disabled,
}

impl UseBufferedIo {
    pub fn resolve(self, file_size: u64) -> bool {
        match self {
            UseBufferedIo::Enabled => true,
            UseBufferedIo::Disabled => false,
            UseBufferedIo::Auto => file_size < UNBUFFERED_IO_THRESHOLD,
        }
    }
}

impl std::str::FromStr for UseBufferedIo {
    type Err = anyhow::Error;
    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "auto" => Ok(UseBufferedIo::Auto),
            "enabled" => Ok(UseBufferedIo::Enabled),
            "disabled" => Ok(UseBufferedIo::Disabled),
            _ => Err(anyhow!(
                "invalid buffered I/O mode {:?}, expected auto, enabled or disabled",
                value
            )),
        }
    }
}

/// Three copy buffers owned by one worker for its lifetime.
///
/// Allocation is lazy; a worker that only ever creates links never pays for
/// 24 MiB of buffers. If a failed copy strands buffers inside a dead
/// pipeline stage the context simply reallocates on next use.
#[derive(Debug, Default)]
pub struct CopyContext {
    buffers: Vec<Vec<u8>>,
}

impl CopyContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_buffers(&mut self) {
        while self.buffers.len() < COPY_BUFFER_COUNT {
            self.buffers.push(vec![0u8; COPY_CONTEXT_BUFFER_SIZE]);
        }
    }

    pub(crate) fn scratch_buffer(&mut self) -> &mut [u8] {
        self.ensure_buffers();
        &mut self.buffers[0]
    }

    /// Buffer the hash pass parks a small file's content in, distinct from
    /// the scratch buffer so a candidate verification in between cannot
    /// clobber it.
    pub(crate) fn retained_buffer(&mut self) -> &mut [u8] {
        self.ensure_buffers();
        &mut self.buffers[1]
    }

    fn take_buffers(&mut self) -> Vec<Vec<u8>> {
        self.ensure_buffers();
        std::mem::take(&mut self.buffers)
    }

    fn return_buffers(&mut self, buffers: impl IntoIterator<Item = Vec<u8>>) {
        for buffer in buffers {
            if self.buffers.len() < COPY_BUFFER_COUNT && buffer.len() == COPY_CONTEXT_BUFFER_SIZE {
                self.buffers.push(buffer);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CopySettings {
    /// Delegate to the OS copy primitive instead of the internal pipeline.
    pub use_system_copy: bool,
    /// Report an existing destination instead of overwriting it.
    pub fail_if_exists: bool,
    pub use_buffered_io: UseBufferedIo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The destination was written; carries the byte count.
    Copied(u64),
    /// `fail_if_exists` was set and the destination was already there.
    Existed,
}

/// Simple copy entry point: stats the source itself and runs with a
/// throwaway buffer set.
pub async fn copy_file(
    source: &Path,
    dest: &Path,
    settings: CopySettings,
    io: &mut IoStats,
) -> Result<CopyOutcome> {
    let start = Instant::now();
    let metadata = tokio::fs::symlink_metadata(source)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", source));
    io.file_info_count += 1;
    io.file_info_time += start.elapsed();
    let metadata = metadata?;
    if metadata.is_dir() {
        return Err(anyhow!("cannot copy {:?}: it is a directory", source));
    }
    let info = FileInfo::from_metadata(&metadata);
    let mut ctx = CopyContext::new();
    copy_file_with(source, &info, dest, settings, &mut ctx, None, io).await
}

/// Full copy entry point: the caller supplies the source [`FileInfo`] (no
/// redundant stat) and the worker's [`CopyContext`]. With `hasher` set the
/// digest is computed from the in-flight bytes.
///
/// Write failures are fatal to the copy and the partially written
/// destination is deleted before returning; a source that shrank or grew
/// since its `FileInfo` was captured is treated the same way.
pub async fn copy_file_with(
    source: &Path,
    source_info: &FileInfo,
    dest: &Path,
    settings: CopySettings,
    ctx: &mut CopyContext,
    hasher: Option<&mut HashBuilder<'_>>,
    io: &mut IoStats,
) -> Result<CopyOutcome> {
    if settings.use_system_copy && hasher.is_none() {
        return system_copy(source, source_info, dest, settings.fail_if_exists, io).await;
    }
    let buffered = settings.use_buffered_io.resolve(source_info.file_size);
    let source_file = fileio::open_file_read(source, io, !buffered).await?;
    let dest_file = match fileio::open_file_write(dest, io, settings.fail_if_exists).await? {
        OpenWrite::Opened(file) => file,
        OpenWrite::Existed => {
            fileio::close_file(source, source_file, AccessType::Read, io).await?;
            return Ok(CopyOutcome::Existed);
        }
    };
    // the destination exists from here on; an error on any of the
    // remaining steps must not leave a partial file behind
    let result = copy_file_inner(
        source,
        source_info,
        source_file,
        dest,
        dest_file,
        buffered,
        ctx,
        hasher,
        io,
    )
    .await;
    match result {
        Ok(bytes) => Ok(CopyOutcome::Copied(bytes)),
        Err(error) => {
            if let Err(cleanup) = fileio::delete_file(dest, io).await {
                tracing::debug!("cleanup of partial {:?} failed: {:#}", dest, cleanup);
            }
            Err(error)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn copy_file_inner(
    source: &Path,
    source_info: &FileInfo,
    source_file: tokio::fs::File,
    dest: &Path,
    dest_file: tokio::fs::File,
    buffered: bool,
    ctx: &mut CopyContext,
    hasher: Option<&mut HashBuilder<'_>>,
    io: &mut IoStats,
) -> Result<u64> {
    let bytes = if buffered {
        copy_sequential(source, source_file, dest, dest_file, ctx, hasher, io).await?
    } else {
        copy_pipelined(source, source_file, dest, dest_file, ctx, hasher, io).await?
    };
    if bytes != source_info.file_size {
        return Err(anyhow!(
            "copy of {:?} moved {} bytes but the source was {} bytes when examined, \
             did it change mid-copy?",
            source,
            bytes,
            source_info.file_size
        ));
    }
    fileio::set_file_mtime(dest, source_info.last_write_time, io).await?;
    Ok(bytes)
}

/// Writes a destination from content already sitting in memory, used when
/// the hash pass over a small file kept its bytes so the copy does not
/// read the source a second time. The destination is rolled back on any
/// failure, including a length that disagrees with the claimed size.
pub async fn copy_file_from_memory(
    dest: &Path,
    data: &[u8],
    info: &FileInfo,
    io: &mut IoStats,
) -> Result<u64> {
    let dest_file = match fileio::open_file_write(dest, io, false).await? {
        OpenWrite::Opened(file) => file,
        OpenWrite::Existed => unreachable!("open without fail_if_exists"),
    };
    match write_from_memory(dest, dest_file, data, info, io).await {
        Ok(()) => Ok(data.len() as u64),
        Err(error) => {
            if let Err(cleanup) = fileio::delete_file(dest, io).await {
                tracing::debug!("cleanup of partial {:?} failed: {:#}", dest, cleanup);
            }
            Err(error)
        }
    }
}

async fn write_from_memory(
    dest: &Path,
    mut dest_file: tokio::fs::File,
    data: &[u8],
    info: &FileInfo,
    io: &mut IoStats,
) -> Result<()> {
    if data.len() as u64 != info.file_size {
        return Err(anyhow!(
            "{:?} held {} bytes in memory but the source was {} bytes when examined, \
             did it change mid-copy?",
            dest,
            data.len(),
            info.file_size
        ));
    }
    let start = Instant::now();
    dest_file
        .write_all(data)
        .await
        .with_context(|| format!("failed writing {:?}", dest))?;
    io.write_count += 1;
    io.write_time += start.elapsed();
    fileio::close_file(dest, dest_file, AccessType::Write, io).await?;
    fileio::set_file_mtime(dest, info.last_write_time, io).await
}

async fn system_copy(
    source: &Path,
    source_info: &FileInfo,
    dest: &Path,
    fail_if_exists: bool,
    io: &mut IoStats,
) -> Result<CopyOutcome> {
    if fail_if_exists && tokio::fs::symlink_metadata(dest).await.is_ok() {
        return Ok(CopyOutcome::Existed);
    }
    let start = Instant::now();
    let result = tokio::fs::copy(source, dest)
        .await
        .with_context(|| format!("failed copying {:?} to {:?}", source, dest));
    io.copy_file_count += 1;
    io.copy_file_time += start.elapsed();
    let bytes = result?;
    fileio::set_file_mtime(dest, source_info.last_write_time, io).await?;
    Ok(CopyOutcome::Copied(bytes))
}

/// Single-buffer loop for small files.
async fn copy_sequential(
    source: &Path,
    mut source_file: tokio::fs::File,
    dest: &Path,
    mut dest_file: tokio::fs::File,
    ctx: &mut CopyContext,
    mut hasher: Option<&mut HashBuilder<'_>>,
    io: &mut IoStats,
) -> Result<u64> {
    let buffer = ctx.scratch_buffer();
    let mut total = 0u64;
    loop {
        let start = Instant::now();
        let read = source_file
            .read(buffer)
            .await
            .with_context(|| format!("failed reading {:?}", source))?;
        io.read_count += 1;
        io.read_time += start.elapsed();
        if read == 0 {
            break;
        }
        if let Some(hasher) = hasher.as_deref_mut() {
            hasher.add(&buffer[..read]);
        }
        let start = Instant::now();
        dest_file
            .write_all(&buffer[..read])
            .await
            .with_context(|| format!("failed writing {:?}", dest))?;
        io.write_count += 1;
        io.write_time += start.elapsed();
        total += read as u64;
    }
    fileio::close_file(source, source_file, AccessType::Read, io).await?;
    fileio::close_file(dest, dest_file, AccessType::Write, io).await?;
    Ok(total)
}

type ReadStage = tokio::task::JoinHandle<(
    tokio::fs::File,
    Vec<u8>,
    std::io::Result<(usize, Duration)>,
)>;

type WriteStage = tokio::task::JoinHandle<(tokio::fs::File, Vec<u8>, std::io::Result<Duration>)>;

fn spawn_read(mut file: tokio::fs::File, mut buffer: Vec<u8>) -> ReadStage {
    tokio::spawn(async move {
        let start = Instant::now();
        let mut filled = 0;
        let result = loop {
            match file.read(&mut buffer[filled..]).await {
                Ok(0) => break Ok((filled, start.elapsed())),
                Ok(read) => {
                    filled += read;
                    if filled == buffer.len() {
                        break Ok((filled, start.elapsed()));
                    }
                }
                Err(error) => break Err(error),
            }
        };
        (file, buffer, result)
    })
}

fn spawn_write(mut file: tokio::fs::File, buffer: Vec<u8>, len: usize) -> WriteStage {
    tokio::spawn(async move {
        let start = Instant::now();
        let result = file
            .write_all(&buffer[..len])
            .await
            .map(|()| start.elapsed());
        (file, buffer, result)
    })
}

/// Triple-buffered pipeline for large files.
///
/// One buffer is always being filled by the read stage, one is being hashed
/// in the current task, and one is being drained by the write stage. Byte
/// order is preserved because each buffer passes through the stages in
/// sequence; only *different* buffers overlap.
async fn copy_pipelined(
    source: &Path,
    source_file: tokio::fs::File,
    dest: &Path,
    dest_file: tokio::fs::File,
    ctx: &mut CopyContext,
    mut hasher: Option<&mut HashBuilder<'_>>,
    io: &mut IoStats,
) -> Result<u64> {
    let mut pool = ctx.take_buffers();
    let first = pool.pop().expect("copy context buffer set");
    let mut read_stage = Some(spawn_read(source_file, first));
    let mut write_stage: Option<WriteStage> = None;
    let mut dest_slot = Some(dest_file);
    let mut source_slot = None;
    let mut total = 0u64;
    loop {
        let (file, buffer, result) = read_stage
            .take()
            .expect("read stage in flight")
            .await
            .context("read stage panicked")?;
        let (filled, read_time) =
            result.with_context(|| format!("failed reading {:?}", source))?;
        io.read_count += 1;
        io.read_time += read_time;
        if filled == 0 {
            pool.push(buffer);
            source_slot = Some(file);
            break;
        }
        // a short fill means the read stage saw EOF
        let eof = filled < buffer.len();
        if eof {
            source_slot = Some(file);
        } else {
            let next = pool.pop().expect("copy context buffer set");
            read_stage = Some(spawn_read(file, next));
        }
        if let Some(hasher) = hasher.as_deref_mut() {
            hasher.add(&buffer[..filled]);
        }
        let dest_file = match write_stage.take() {
            Some(stage) => {
                let (dest_file, prev_buffer, result) =
                    stage.await.context("write stage panicked")?;
                io.write_count += 1;
                io.write_time +=
                    result.with_context(|| format!("failed writing {:?}", dest))?;
                pool.push(prev_buffer);
                dest_file
            }
            None => dest_slot.take().expect("destination handle"),
        };
        total += filled as u64;
        write_stage = Some(spawn_write(dest_file, buffer, filled));
        if eof {
            break;
        }
    }
    if let Some(stage) = write_stage {
        let (dest_file, buffer, result) = stage.await.context("write stage panicked")?;
        io.write_count += 1;
        io.write_time += result.with_context(|| format!("failed writing {:?}", dest))?;
        pool.push(buffer);
        dest_slot = Some(dest_file);
    }
    if let Some(file) = source_slot {
        fileio::close_file(source, file, AccessType::Read, io).await?;
    }
    if let Some(file) = dest_slot {
        fileio::close_file(dest, file, AccessType::Write, io).await?;
    }
    ctx.return_buffers(pool);
    Ok(total)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// A hard link to the existing content was created.
    Created,
    /// The destination already exists with identical attributes.
    Existed,
    /// The filesystem cannot link these paths; fall back to a copy.
    Unsupported,
}

/// Creates a hard link at `full_path` pointing at `source_path`'s content.
///
/// A collision with a destination whose attributes already match `info` is
/// reported as [`LinkOutcome::Existed`]. Any other collision is deleted and
/// the link retried once when `delete_and_retry` is set. Cross-device links
/// and filesystems without hard-link support report
/// [`LinkOutcome::Unsupported`] so the caller can fall back to a copy.
pub async fn create_file_link(
    full_path: &Path,
    info: &FileInfo,
    source_path: &Path,
    io: &mut IoStats,
    delete_and_retry: bool,
) -> Result<LinkOutcome> {
    let mut retried = false;
    loop {
        let start = Instant::now();
        let result = tokio::fs::hard_link(source_path, full_path).await;
        io.create_link_count += 1;
        io.create_link_time += start.elapsed();
        let error = match result {
            Ok(()) => return Ok(LinkOutcome::Created),
            Err(error) => error,
        };
        match error.kind() {
            std::io::ErrorKind::AlreadyExists => {
                let existing = fileio::get_file_info(full_path, io).await?;
                if existing == *info {
                    return Ok(LinkOutcome::Existed);
                }
                if retried || !delete_and_retry {
                    return Err(error).with_context(|| {
                        format!(
                            "failed creating hard link {:?} -> {:?}: destination occupied",
                            full_path, source_path
                        )
                    });
                }
                fileio::delete_file(full_path, io).await?;
                retried = true;
            }
            std::io::ErrorKind::CrossesDevices | std::io::ErrorKind::Unsupported => {
                tracing::debug!(
                    "hard link {:?} -> {:?} not supported here: {}",
                    full_path,
                    source_path,
                    error
                );
                return Ok(LinkOutcome::Unsupported);
            }
            _ => {
                return Err(error).with_context(|| {
                    format!(
                        "failed creating hard link {:?} -> {:?}",
                        full_path, source_path
                    )
                })
            }
        }
    }
}
