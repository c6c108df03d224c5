//! Platform file I/O primitives.
//!
//! Thin wrappers over `tokio::fs` (plus `nix` where the std surface falls
//! short) that give the rest of the crate one uniform set of operations:
//! open for read/write, stat, timestamps, links, deletes, moves and
//! directory enumeration. Every operation feeds the caller-owned
//! [`IoStats`] so runs can be profiled per operation kind.

use anyhow::{Context, Result};
use async_recursion::async_recursion;
use std::os::unix::fs::MetadataExt;
use std::os::unix::prelude::PermissionsExt;
use std::path::Path;
use std::time::Instant;

use crate::iostats::IoStats;

/// Longest path the database persistence format accepts.
pub const MAX_PATH: usize = 4096;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Opaque last-write timestamp with nanosecond resolution.
///
/// Stored as a single 64-bit count of nanoseconds since the epoch so it can
/// be ordered, hashed and serialized without caring about the platform's
/// native representation. Timestamps before the epoch clamp to zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FileTime(u64);

impl FileTime {
    pub fn from_raw(raw: u64) -> Self {
        FileTime(raw)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }

    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        let secs = metadata.mtime();
        if secs < 0 {
            return FileTime(0);
        }
        FileTime(secs as u64 * NANOS_PER_SEC + metadata.mtime_nsec() as u64)
    }

    fn to_secs_nsecs(self) -> (i64, i64) {
        (
            (self.0 / NANOS_PER_SEC) as i64,
            (self.0 % NANOS_PER_SEC) as i64,
        )
    }
}

/// The identity-relevant attributes of a file: size and last-write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub last_write_time: FileTime,
    pub file_size: u64,
}

impl FileInfo {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            last_write_time: FileTime::from_metadata(metadata),
            file_size: metadata.size(),
        }
    }
}

/// Which side of a transfer a handle belongs to, for stats attribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
}

/// Outcome of opening a destination for write with `fail_if_exists`.
pub enum OpenWrite {
    Opened(tokio::fs::File),
    Existed,
}

pub async fn get_file_info(path: &Path, io: &mut IoStats) -> Result<FileInfo> {
    let start = Instant::now();
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", path));
    io.file_info_count += 1;
    io.file_info_time += start.elapsed();
    Ok(FileInfo::from_metadata(&metadata?))
}

/// Opens a file for reading with shared-read semantics.
///
/// When `sequential` is set the kernel is advised that the file will be read
/// front to back, which lets it read ahead aggressively and recycle the
/// pages early instead of polluting the cache with a large one-shot stream.
pub async fn open_file_read(
    path: &Path,
    io: &mut IoStats,
    sequential: bool,
) -> Result<tokio::fs::File> {
    let start = Instant::now();
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open {:?} for reading", path));
    io.create_read_count += 1;
    io.create_read_time += start.elapsed();
    let file = file?;
    if sequential {
        advise_sequential(&file);
    }
    Ok(file)
}

#[cfg(target_os = "linux")]
fn advise_sequential(file: &tokio::fs::File) {
    use std::os::unix::io::AsRawFd;
    if let Err(error) = nix::fcntl::posix_fadvise(
        file.as_raw_fd(),
        0,
        0,
        nix::fcntl::PosixFadviseAdvice::POSIX_FADV_SEQUENTIAL,
    ) {
        tracing::debug!("posix_fadvise failed: {}", error);
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_sequential(_file: &tokio::fs::File) {}

/// Opens a destination for writing, truncating any existing file unless
/// `fail_if_exists` is set, in which case an existing destination is
/// reported instead of clobbered.
pub async fn open_file_write(
    path: &Path,
    io: &mut IoStats,
    fail_if_exists: bool,
) -> Result<OpenWrite> {
    let start = Instant::now();
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true);
    if fail_if_exists {
        options.create_new(true);
    } else {
        options.create(true).truncate(true);
    }
    let result = options.open(path).await;
    io.create_write_count += 1;
    io.create_write_time += start.elapsed();
    match result {
        Ok(file) => Ok(OpenWrite::Opened(file)),
        Err(error) if fail_if_exists && error.kind() == std::io::ErrorKind::AlreadyExists => {
            Ok(OpenWrite::Existed)
        }
        Err(error) => {
            let holders = processes_using_resource(path);
            if holders.is_empty() {
                Err(error).with_context(|| format!("cannot open {:?} for writing", path))
            } else {
                Err(error).with_context(|| {
                    format!(
                        "cannot open {:?} for writing (held open by: {})",
                        path,
                        holders.join(", ")
                    )
                })
            }
        }
    }
}

/// Closes a handle explicitly so the close syscall lands in the stats
/// instead of disappearing into a background drop.
pub async fn close_file(
    path: &Path,
    file: tokio::fs::File,
    access: AccessType,
    io: &mut IoStats,
) -> Result<()> {
    let start = Instant::now();
    let std_file = file.into_std().await;
    let result = tokio::task::spawn_blocking(move || drop(std_file)).await;
    match access {
        AccessType::Read => {
            io.close_read_count += 1;
            io.close_read_time += start.elapsed();
        }
        AccessType::Write => {
            io.close_write_count += 1;
            io.close_write_time += start.elapsed();
        }
    }
    result.with_context(|| format!("failed closing {:?}", path))
}

pub async fn set_file_mtime(path: &Path, mtime: FileTime, io: &mut IoStats) -> Result<()> {
    let start = Instant::now();
    let path_owned = path.to_owned();
    let result = tokio::task::spawn_blocking(move || -> Result<()> {
        let (secs, nsecs) = mtime.to_secs_nsecs();
        let timespec = nix::sys::time::TimeSpec::new(secs, nsecs);
        nix::sys::stat::utimensat(
            None,
            &path_owned,
            &timespec,
            &timespec,
            nix::sys::stat::UtimensatFlags::NoFollowSymlink,
        )
        .with_context(|| format!("failed setting timestamps for {:?}", &path_owned))?;
        Ok(())
    })
    .await;
    io.set_last_write_time_count += 1;
    io.set_last_write_time += start.elapsed();
    result.with_context(|| format!("failed setting timestamps for {:?}", path))?
}

pub async fn set_file_writable(path: &Path, writable: bool, io: &mut IoStats) -> Result<()> {
    let start = Instant::now();
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", path))?;
    let mut mode = metadata.permissions().mode();
    if writable {
        mode |= 0o200;
    } else {
        mode &= !0o222;
    }
    let result = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("cannot change write permission of {:?}", path));
    io.file_info_count += 1;
    io.file_info_time += start.elapsed();
    result
}

pub async fn create_dir(path: &Path, io: &mut IoStats) -> Result<()> {
    let start = Instant::now();
    let result = tokio::fs::create_dir(path)
        .await
        .with_context(|| format!("cannot create directory {:?}", path));
    io.create_dir_count += 1;
    io.create_dir_time += start.elapsed();
    result
}

pub async fn delete_file(path: &Path, io: &mut IoStats) -> Result<()> {
    let start = Instant::now();
    let result = tokio::fs::remove_file(path)
        .await
        .with_context(|| format!("failed removing {:?}", path));
    io.delete_file_count += 1;
    io.delete_file_time += start.elapsed();
    result
}

pub async fn move_file(source: &Path, dest: &Path, io: &mut IoStats) -> Result<()> {
    let start = Instant::now();
    let result = tokio::fs::rename(source, dest)
        .await
        .with_context(|| format!("failed moving {:?} to {:?}", source, dest));
    io.move_file_count += 1;
    io.move_file_time += start.elapsed();
    result
}

pub async fn remove_dir(path: &Path, io: &mut IoStats) -> Result<()> {
    let start = Instant::now();
    let result = tokio::fs::remove_dir(path)
        .await
        .with_context(|| format!("failed removing directory {:?}", path));
    io.remove_dir_count += 1;
    io.remove_dir_time += start.elapsed();
    result
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteSummary {
    pub files_removed: usize,
    pub symlinks_removed: usize,
    pub directories_removed: usize,
}

impl std::ops::Add for DeleteSummary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_removed: self.files_removed + other.files_removed,
            symlinks_removed: self.symlinks_removed + other.symlinks_removed,
            directories_removed: self.directories_removed + other.directories_removed,
        }
    }
}

impl std::fmt::Display for DeleteSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files removed: {}\nsymlinks removed: {}\ndirectories removed: {}",
            self.files_removed, self.symlinks_removed, self.directories_removed
        )
    }
}

/// Removes a path and everything below it.
///
/// Read-only directories get their permissions opened up first, otherwise
/// the recursion would fail half-way and leave a partially deleted tree.
#[async_recursion]
pub async fn delete_all_files(path: &Path, io: &mut IoStats) -> Result<DeleteSummary> {
    let metadata = tokio::fs::symlink_metadata(path)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", path))?;
    if metadata.is_symlink() {
        delete_file(path, io).await?;
        return Ok(DeleteSummary {
            symlinks_removed: 1,
            ..Default::default()
        });
    }
    if !metadata.is_dir() {
        delete_file(path, io).await?;
        return Ok(DeleteSummary {
            files_removed: 1,
            ..Default::default()
        });
    }
    if metadata.permissions().readonly() {
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
            .await
            .with_context(|| format!("cannot make directory {:?} writable", path))?;
    }
    let mut summary = DeleteSummary::default();
    let start = Instant::now();
    let mut entries = tokio::fs::read_dir(path)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", path))?;
    io.find_file_count += 1;
    io.find_file_time += start.elapsed();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", path))?
    {
        summary = summary + delete_all_files(&entry.path(), io).await?;
    }
    drop(entries);
    remove_dir(path, io).await?;
    summary.directories_removed += 1;
    Ok(summary)
}

/// Best-effort list of processes holding `path` open, used to annotate
/// access errors. May return an empty list.
#[cfg(target_os = "linux")]
pub fn processes_using_resource(path: &Path) -> Vec<String> {
    let target = match std::fs::canonicalize(path) {
        Ok(target) => target,
        Err(_) => return Vec::new(),
    };
    let proc_entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut holders = Vec::new();
    for proc_entry in proc_entries.flatten() {
        let pid = proc_entry.file_name();
        let pid = match pid.to_str() {
            Some(pid) if pid.bytes().all(|b| b.is_ascii_digit()) => pid.to_owned(),
            _ => continue,
        };
        let fd_dir = match std::fs::read_dir(proc_entry.path().join("fd")) {
            Ok(fd_dir) => fd_dir,
            Err(_) => continue,
        };
        for fd_entry in fd_dir.flatten() {
            if let Ok(link) = std::fs::read_link(fd_entry.path()) {
                if link == target {
                    let comm = std::fs::read_to_string(proc_entry.path().join("comm"))
                        .unwrap_or_default();
                    holders.push(format!("{} (pid {})", comm.trim(), pid));
                    break;
                }
            }
        }
    }
    holders
}

#[cfg(not(target_os = "linux"))]
pub fn processes_using_resource(_path: &Path) -> Vec<String> {
    Vec::new()
}
