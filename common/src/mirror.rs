//! Directory mirroring driven by the file database.
//!
//! Walks a source tree and makes the destination match it, choosing per
//! file the cheapest of three strategies:
//!
//! 1. nothing, when the destination already matches on metadata
//! 2. a hard link, when the database knows a destination file with the
//!    same content hash
//! 3. a full copy, optionally after probing the database for a same-name
//!    delta basis (the delta codec itself is an external layer; until one
//!    is plugged in the probe falls through to a copy)
//!
//! Every successful copy or link is inserted back into the database so the
//! rest of the run can reuse it.

use anyhow::{anyhow, Context};
use async_recursion::async_recursion;
use std::collections::HashSet;
use std::os::unix::prelude::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::copy::{
    self, CopyContext, CopyOutcome, CopySettings, LinkOutcome, UseBufferedIo,
    COPY_CONTEXT_BUFFER_SIZE,
};
use crate::filecmp::{self, MetadataCmpSettings};
use crate::filedb::{FileDatabase, FileKey};
use crate::fileio::{self, FileInfo, FileTime};
use crate::hash::{get_file_hash, get_file_hash_retaining, HashContext};
use crate::iostats::IoStats;
use crate::progress;

/// Error type for mirror operations that preserves the operation summary
/// even on failure.
///
/// # Logging Convention
/// When logging this error, use `{:#}` or `{:?}` format to preserve the
/// error chain.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// Exit on first error instead of mirroring what can be mirrored.
    pub fail_early: bool,
    /// Delegate plain copies to the OS copy primitive.
    pub use_system_copy: bool,
    pub use_buffered_io: UseBufferedIo,
    /// Fields that make an existing destination count as unchanged.
    pub unchanged_compare: MetadataCmpSettings,
    /// Re-hash reuse candidates before linking; evicts stale records.
    pub verify_links: bool,
    /// Remove destination entries the source no longer has.
    pub purge: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fail_early: false,
            use_system_copy: false,
            use_buffered_io: UseBufferedIo::Auto,
            unchanged_compare: MetadataCmpSettings {
                size: true,
                mtime: true,
                ..Default::default()
            },
            verify_links: false,
            purge: false,
        }
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub struct Summary {
    pub files_copied: usize,
    pub files_linked: usize,
    pub files_unchanged: usize,
    pub symlinks_created: usize,
    pub symlinks_unchanged: usize,
    pub directories_created: usize,
    pub directories_unchanged: usize,
    pub files_purged: usize,
    pub bytes_copied: u64,
    pub io: IoStats,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            files_copied: self.files_copied + other.files_copied,
            files_linked: self.files_linked + other.files_linked,
            files_unchanged: self.files_unchanged + other.files_unchanged,
            symlinks_created: self.symlinks_created + other.symlinks_created,
            symlinks_unchanged: self.symlinks_unchanged + other.symlinks_unchanged,
            directories_created: self.directories_created + other.directories_created,
            directories_unchanged: self.directories_unchanged + other.directories_unchanged,
            files_purged: self.files_purged + other.files_purged,
            bytes_copied: self.bytes_copied + other.bytes_copied,
            io: self.io + other.io,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "files copied: {}\n\
            hard-links created: {}\n\
            files unchanged: {}\n\
            symlinks created: {}\n\
            symlinks unchanged: {}\n\
            directories created: {}\n\
            directories unchanged: {}\n\
            entries purged: {}\n\
            bytes copied: {}\n\
            I/O breakdown:\n{}",
            self.files_copied,
            self.files_linked,
            self.files_unchanged,
            self.symlinks_created,
            self.symlinks_unchanged,
            self.directories_created,
            self.directories_unchanged,
            self.files_purged,
            bytesize::ByteSize(self.bytes_copied),
            self.io,
        )
    }
}

/// One worker's copy buffers and hashing state, checked out of the pool
/// for the duration of a single file.
struct WorkerContext {
    copy: CopyContext,
    hash: HashContext,
}

struct ContextPool {
    contexts: Mutex<Vec<WorkerContext>>,
}

impl ContextPool {
    fn new() -> Self {
        Self {
            contexts: Mutex::new(Vec::new()),
        }
    }

    fn acquire(&self) -> WorkerContext {
        self.contexts
            .lock()
            .expect("context pool mutex poisoned")
            .pop()
            .unwrap_or_else(|| WorkerContext {
                copy: CopyContext::new(),
                hash: HashContext::new(),
            })
    }

    fn release(&self, context: WorkerContext) {
        self.contexts
            .lock()
            .expect("context pool mutex poisoned")
            .push(context);
    }
}

/// Mirrors `src` to `dst`, consulting and updating `db`.
pub async fn mirror(
    prog_track: &'static progress::Progress,
    db: &Arc<FileDatabase>,
    src: &Path,
    dst: &Path,
    settings: &Settings,
) -> Result<Summary, Error> {
    let pool = Arc::new(ContextPool::new());
    mirror_path(prog_track, db, &pool, src, dst, dst, *settings).await
}

fn key_name(dst: &Path, dst_root: &Path) -> String {
    match dst.strip_prefix(dst_root) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel.to_string_lossy().into_owned(),
        _ => dst
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| dst.to_string_lossy().into_owned()),
    }
}

#[async_recursion]
async fn mirror_path(
    prog_track: &'static progress::Progress,
    db: &Arc<FileDatabase>,
    pool: &Arc<ContextPool>,
    src: &Path,
    dst: &Path,
    dst_root: &Path,
    settings: Settings,
) -> Result<Summary, Error> {
    let _prog_guard = prog_track.ops.guard();
    let mut summary = Summary::default();
    let src_md = tokio::fs::symlink_metadata(src)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", src))
        .map_err(|err| Error::new(err, Default::default()))?;
    summary.io.file_info_count += 1;
    if src_md.is_file() {
        let result = mirror_file(prog_track, db, pool, src, dst, dst_root, &settings, &mut summary)
            .await;
        return match result {
            Ok(()) => Ok(summary),
            Err(error) => Err(Error::new(error, summary)),
        };
    }
    if src_md.is_symlink() {
        let result = mirror_symlink(prog_track, src, dst, &mut summary).await;
        return match result {
            Ok(()) => Ok(summary),
            Err(error) => Err(Error::new(error, summary)),
        };
    }
    if !src_md.is_dir() {
        return Err(Error::new(
            anyhow!(
                "mirror: {:?} -> {:?} failed, unsupported src file type: {:?}",
                src,
                dst,
                src_md.file_type()
            ),
            summary,
        ));
    }
    // directory: make sure dst is a directory, then fan out over entries
    match tokio::fs::symlink_metadata(dst).await {
        Ok(dst_md) if dst_md.is_dir() => {
            prog_track.directories_unchanged.inc();
            summary.directories_unchanged += 1;
        }
        Ok(_) => {
            tracing::debug!("{:?} is not a directory, replacing", dst);
            fileio::delete_all_files(dst, &mut summary.io)
                .await
                .map_err(|err| Error::new(err, summary))?;
            fileio::create_dir(dst, &mut summary.io)
                .await
                .map_err(|err| Error::new(err, summary))?;
            prog_track.directories_created.inc();
            summary.directories_created += 1;
        }
        Err(_) => {
            fileio::create_dir(dst, &mut summary.io)
                .await
                .map_err(|err| Error::new(err, summary))?;
            prog_track.directories_created.inc();
            summary.directories_created += 1;
        }
    }
    let mut entries = tokio::fs::read_dir(src)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", src))
        .map_err(|err| Error::new(err, summary))?;
    summary.io.find_file_count += 1;
    let mut join_set = tokio::task::JoinSet::new();
    let mut processed = HashSet::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", src))
        .map_err(|err| Error::new(err, summary))?
    {
        let entry_path = entry.path();
        let Some(entry_name) = entry_path.file_name() else {
            continue;
        };
        processed.insert(entry_name.to_owned());
        let dst_path = dst.join(entry_name);
        let dst_root = dst_root.to_owned();
        let db = db.clone();
        let pool = pool.clone();
        let do_mirror = || async move {
            mirror_path(
                prog_track,
                &db,
                &pool,
                &entry_path,
                &dst_path,
                &dst_root,
                settings,
            )
            .await
        };
        join_set.spawn(do_mirror());
    }
    drop(entries);
    let mut success = true;
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok(Ok(child_summary)) => summary = summary + child_summary,
            Ok(Err(error)) => {
                tracing::error!("mirror: {:?} -> {:?} failed with: {:#}", src, dst, &error);
                summary = summary + error.summary;
                if settings.fail_early {
                    return Err(Error::new(error.source, summary));
                }
                success = false;
            }
            Err(error) => {
                if settings.fail_early {
                    return Err(Error::new(anyhow::Error::msg(error), summary));
                }
                success = false;
            }
        }
    }
    if settings.purge {
        let purged = purge_extraneous(dst, &processed, &mut summary.io)
            .await
            .map_err(|err| Error::new(err, summary))?;
        if purged > 0 {
            prog_track.files_purged.add(purged as u64);
            summary.files_purged += purged;
        }
    }
    if !success {
        return Err(Error::new(
            anyhow!("mirror: {:?} -> {:?} failed!", src, dst),
            summary,
        ));
    }
    // children touched the directory, restore its source write time
    fileio::set_file_mtime(dst, FileTime::from_metadata(&src_md), &mut summary.io)
        .await
        .map_err(|err| Error::new(err, summary))?;
    Ok(summary)
}

async fn purge_extraneous(
    dst: &Path,
    keep: &HashSet<std::ffi::OsString>,
    io: &mut IoStats,
) -> anyhow::Result<usize> {
    let mut entries = tokio::fs::read_dir(dst)
        .await
        .with_context(|| format!("cannot open directory {:?} for reading", dst))?;
    io.find_file_count += 1;
    let mut purged = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed traversing directory {:?}", dst))?
    {
        let name = entry.file_name();
        if keep.contains(&name) {
            continue;
        }
        tracing::debug!("purging {:?}, the source no longer has it", entry.path());
        let removed = fileio::delete_all_files(&entry.path(), io).await?;
        purged += removed.files_removed + removed.symlinks_removed + removed.directories_removed;
    }
    Ok(purged)
}

async fn mirror_symlink(
    prog_track: &'static progress::Progress,
    src: &Path,
    dst: &Path,
    summary: &mut Summary,
) -> anyhow::Result<()> {
    let target = tokio::fs::read_link(src)
        .await
        .with_context(|| format!("failed reading symlink {:?}", src))?;
    match tokio::fs::symlink_metadata(dst).await {
        Ok(dst_md) if dst_md.is_symlink() => {
            let existing = tokio::fs::read_link(dst)
                .await
                .with_context(|| format!("failed reading symlink {:?}", dst))?;
            if existing == target {
                prog_track.symlinks_unchanged.inc();
                summary.symlinks_unchanged += 1;
                return Ok(());
            }
            fileio::delete_file(dst, &mut summary.io).await?;
        }
        Ok(dst_md) if dst_md.is_dir() => {
            fileio::delete_all_files(dst, &mut summary.io).await?;
        }
        Ok(_) => {
            fileio::delete_file(dst, &mut summary.io).await?;
        }
        Err(_) => {}
    }
    tokio::fs::symlink(&target, dst)
        .await
        .with_context(|| format!("failed creating symlink {:?}", dst))?;
    prog_track.symlinks_created.inc();
    summary.symlinks_created += 1;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn mirror_file(
    prog_track: &'static progress::Progress,
    db: &Arc<FileDatabase>,
    pool: &Arc<ContextPool>,
    src: &Path,
    dst: &Path,
    dst_root: &Path,
    settings: &Settings,
    summary: &mut Summary,
) -> anyhow::Result<()> {
    let src_md = tokio::fs::symlink_metadata(src)
        .await
        .with_context(|| format!("failed reading metadata from {:?}", src))?;
    summary.io.file_info_count += 1;
    let info = FileInfo::from_metadata(&src_md);
    match tokio::fs::symlink_metadata(dst).await {
        Ok(dst_md)
            if dst_md.is_file()
                && filecmp::metadata_equal(&settings.unchanged_compare, &src_md, &dst_md) =>
        {
            tracing::debug!("{:?} is up to date", dst);
            prog_track.files_unchanged.inc();
            summary.files_unchanged += 1;
            return Ok(());
        }
        Ok(dst_md) => {
            tracing::debug!("{:?} is stale, replacing", dst);
            if dst_md.is_dir() {
                fileio::delete_all_files(dst, &mut summary.io).await?;
            } else {
                fileio::delete_file(dst, &mut summary.io).await?;
            }
        }
        Err(_) => {}
    }
    let key = FileKey {
        name: key_name(dst, dst_root),
        last_write_time: info.last_write_time,
        file_size: info.file_size,
    };
    let src_mode = src_md.permissions().mode();
    let mut worker = pool.acquire();
    let result = mirror_file_content(
        prog_track,
        db,
        src,
        dst,
        key,
        &info,
        src_mode,
        settings,
        &mut worker,
        summary,
    )
    .await;
    pool.release(worker);
    result
}

#[allow(clippy::too_many_arguments)]
async fn mirror_file_content(
    prog_track: &'static progress::Progress,
    db: &Arc<FileDatabase>,
    src: &Path,
    dst: &Path,
    key: FileKey,
    info: &FileInfo,
    src_mode: u32,
    settings: &Settings,
    worker: &mut WorkerContext,
    summary: &mut Summary,
) -> anyhow::Result<()> {
    let WorkerContext {
        copy: ctx,
        hash: hash_ctx,
    } = worker;
    // this exact (name, time, size) may have been seen before; if not and
    // the file fits in one buffer, hash it now and keep the bytes so a
    // fallback copy writes from memory instead of reading the source
    // again. Larger unseen files skip the probe and hash in flight during
    // the copy; later runs find them by key.
    let mut hash = db.get_record(&key).hash;
    let mut retained = None;
    if !hash.is_valid()
        && !db.is_empty()
        && info.file_size <= COPY_CONTEXT_BUFFER_SIZE as u64
    {
        let (computed, kept) =
            get_file_hash_retaining(src, ctx, &mut summary.io, hash_ctx).await?;
        hash = computed;
        retained = kept.filter(|len| *len as u64 == info.file_size);
    }
    if hash.is_valid() {
        let candidate = db.get_record_by_hash(&hash);
        if candidate.hash.is_valid() && PathBuf::from(&candidate.name) != dst {
            let candidate_path = PathBuf::from(&candidate.name);
            let mut usable = true;
            if settings.verify_links {
                match get_file_hash(&candidate_path, ctx, &mut summary.io, hash_ctx).await {
                    Ok(actual) if actual == hash => {}
                    Ok(actual) => {
                        tracing::warn!(
                            "{:?} hashes to {} but the database recorded {}, evicting",
                            candidate_path,
                            actual,
                            hash
                        );
                        db.remove_record_by_hash(&hash);
                        usable = false;
                    }
                    Err(error) => {
                        tracing::debug!(
                            "cannot verify reuse candidate {:?}: {:#}, evicting",
                            candidate_path,
                            error
                        );
                        db.remove_record_by_hash(&hash);
                        usable = false;
                    }
                }
            }
            if usable {
                match copy::create_file_link(dst, info, &candidate_path, &mut summary.io, true)
                    .await
                {
                    Ok(LinkOutcome::Created) => {
                        tracing::debug!("linked {:?} -> {:?}", dst, candidate_path);
                        prog_track.files_linked.inc();
                        summary.files_linked += 1;
                        db.add_to_files_history(key, hash, dst.to_string_lossy().into_owned());
                        return Ok(());
                    }
                    Ok(LinkOutcome::Existed) => {
                        prog_track.files_unchanged.inc();
                        summary.files_unchanged += 1;
                        db.add_to_files_history(key, hash, dst.to_string_lossy().into_owned());
                        return Ok(());
                    }
                    Ok(LinkOutcome::Unsupported) => {
                        tracing::debug!("cannot link {:?}, copying instead", dst);
                    }
                    Err(error) => {
                        tracing::debug!(
                            "link reuse failed for {:?}: {:#}, copying instead",
                            dst,
                            error
                        );
                    }
                }
            }
        }
    }
    // no reuse: a same-name earlier version on the destination side would
    // be the basis for a delta transfer here
    if let Some(basis) = db.find_file_for_delta_copy(&key) {
        tracing::debug!("delta basis for {:?} would be {:?}", dst, basis);
    }
    let copy_settings = CopySettings {
        use_system_copy: settings.use_system_copy,
        fail_if_exists: false,
        use_buffered_io: settings.use_buffered_io,
    };
    let outcome = if let Some(len) = retained {
        // the hash pass already holds the content
        let data_written =
            copy::copy_file_from_memory(dst, &ctx.retained_buffer()[..len], info, &mut summary.io)
                .await?;
        CopyOutcome::Copied(data_written)
    } else if hash.is_valid() {
        copy::copy_file_with(src, info, dst, copy_settings, ctx, None, &mut summary.io).await?
    } else {
        // content not hashed yet: hash it while it moves
        let mut builder = hash_ctx.builder();
        let outcome = copy::copy_file_with(
            src,
            info,
            dst,
            copy_settings,
            ctx,
            Some(&mut builder),
            &mut summary.io,
        )
        .await?;
        hash = builder.finish();
        outcome
    };
    let bytes = match outcome {
        CopyOutcome::Copied(bytes) => bytes,
        CopyOutcome::Existed => 0,
    };
    // remove sticky bit, setuid and setgid from permissions to mimic behavior of cp
    let permissions = std::fs::Permissions::from_mode(src_mode & 0o0777);
    tokio::fs::set_permissions(dst, permissions)
        .await
        .with_context(|| format!("cannot set permissions of {:?}", dst))?;
    prog_track.files_copied.inc();
    prog_track.bytes_copied.add(bytes);
    summary.files_copied += 1;
    summary.bytes_copied += bytes;
    db.add_to_files_history(key, hash, dst.to_string_lossy().into_owned());
    Ok(())
}

#[cfg(test)]
mod mirror_tests {
    use super::*;
    use crate::testutils;
    use std::os::unix::fs::MetadataExt;
    use tracing_test::traced_test;

    lazy_static! {
        static ref PROGRESS: progress::Progress = progress::Progress::new();
    }

    async fn check_trees_identical(src: &Path, dst: &Path) -> anyhow::Result<()> {
        let mut src_entries = tokio::fs::read_dir(src).await?;
        while let Some(src_entry) = src_entries.next_entry().await? {
            let src_entry_path = src_entry.path();
            let Some(name) = src_entry_path.file_name() else {
                continue;
            };
            let dst_entry_path = dst.join(name);
            let src_md = tokio::fs::symlink_metadata(&src_entry_path).await?;
            let dst_md = tokio::fs::symlink_metadata(&dst_entry_path)
                .await
                .with_context(|| format!("{:?} missing from destination", &dst_entry_path))?;
            assert_eq!(src_md.file_type(), dst_md.file_type());
            if src_md.is_file() {
                assert_eq!(
                    tokio::fs::read(&src_entry_path).await?,
                    tokio::fs::read(&dst_entry_path).await?
                );
                assert_eq!(src_md.mtime(), dst_md.mtime());
                assert_eq!(
                    src_md.permissions().mode() & 0o0777,
                    dst_md.permissions().mode() & 0o0777
                );
            } else if src_md.is_symlink() {
                assert_eq!(
                    tokio::fs::read_link(&src_entry_path).await?,
                    tokio::fs::read_link(&dst_entry_path).await?
                );
            } else {
                check_dirs(&src_entry_path, &dst_entry_path).await?;
            }
        }
        Ok(())
    }

    fn check_dirs<'a>(
        src: &'a Path,
        dst: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send + 'a>> {
        Box::pin(check_trees_identical(src, dst))
    }

    #[tokio::test]
    #[traced_test]
    async fn full_copy_mirror() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let src = testutils::setup_source_tree(&tmp_dir).await?;
        let dst = tmp_dir.join("dst");
        let db = FileDatabase::new();
        let summary = mirror(&PROGRESS, &db, &src, &dst, &Settings::default()).await?;
        assert_eq!(summary.files_copied, 4);
        assert_eq!(summary.files_linked, 0);
        assert_eq!(summary.symlinks_created, 1);
        assert_eq!(summary.directories_created, 3);
        assert_eq!(summary.bytes_copied, 3 + 256 * 1024);
        check_trees_identical(&src, &dst).await?;
        // everything copied is now known to the database
        assert_eq!(db.history_size(), 4);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn second_run_is_all_unchanged() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let src = testutils::setup_source_tree(&tmp_dir).await?;
        let dst = tmp_dir.join("dst");
        let db = FileDatabase::new();
        mirror(&PROGRESS, &db, &src, &dst, &Settings::default()).await?;
        let summary = mirror(&PROGRESS, &db, &src, &dst, &Settings::default()).await?;
        assert_eq!(summary.files_copied, 0);
        assert_eq!(summary.files_unchanged, 4);
        assert_eq!(summary.symlinks_unchanged, 1);
        assert_eq!(summary.directories_created, 0);
        assert_eq!(summary.bytes_copied, 0);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn identical_content_is_hard_linked() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let payload = testutils::patterned_bytes(64 * 1024);
        // seed lives inside the destination tree and gets primed
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&dst).await?;
        tokio::fs::create_dir(dst.join("pool")).await?;
        tokio::fs::write(dst.join("pool").join("seed.bin"), &payload).await?;
        let db = FileDatabase::new();
        let mut io = IoStats::default();
        db.prime_directory(&dst, &mut io, true, true).await;
        db.prime_wait(&mut io).await;
        assert_eq!(db.history_size(), 1);

        let src = tmp_dir.join("src");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::write(src.join("incoming.bin"), &payload).await?;
        let summary = mirror(&PROGRESS, &db, &src, &dst, &Settings::default()).await?;
        assert_eq!(summary.files_linked, 1);
        assert_eq!(summary.files_copied, 0);
        assert_eq!(summary.bytes_copied, 0);
        assert_eq!(summary.io.create_link_count, 1);
        assert_eq!(summary.io.copy_file_count, 0);
        let seed_md = tokio::fs::symlink_metadata(dst.join("pool").join("seed.bin")).await?;
        let new_md = tokio::fs::symlink_metadata(dst.join("incoming.bin")).await?;
        assert_eq!(seed_md.ino(), new_md.ino());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn new_version_finds_delta_basis_then_copies() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&dst).await?;
        tokio::fs::write(dst.join("foo.bin"), testutils::patterned_bytes(8192)).await?;
        let db = FileDatabase::new();
        let mut io = IoStats::default();
        db.prime_directory(&dst, &mut io, true, true).await;
        db.prime_wait(&mut io).await;

        // version 2 of foo.bin: same name, different content and size
        let src = tmp_dir.join("src");
        tokio::fs::create_dir(&src).await?;
        let v2 = testutils::patterned_bytes(9000);
        tokio::fs::write(src.join("foo.bin"), &v2).await?;
        let src_md = std::fs::symlink_metadata(src.join("foo.bin"))?;
        let v2_key = FileKey {
            name: "foo.bin".to_owned(),
            last_write_time: FileTime::from_metadata(&src_md),
            file_size: v2.len() as u64,
        };
        assert_eq!(
            db.find_file_for_delta_copy(&v2_key),
            Some(dst.join("foo.bin"))
        );
        let summary = mirror(&PROGRESS, &db, &src, &dst, &Settings::default()).await?;
        assert_eq!(summary.files_copied, 1);
        assert_eq!(summary.files_linked, 0);
        assert_eq!(tokio::fs::read(dst.join("foo.bin")).await?, v2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn unmatched_small_file_is_read_once() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&dst).await?;
        tokio::fs::write(dst.join("seed.bin"), testutils::patterned_bytes(2048)).await?;
        let db = FileDatabase::new();
        let mut io = IoStats::default();
        db.prime_directory(&dst, &mut io, true, true).await;
        db.prime_wait(&mut io).await;

        // content the primed database has never seen
        let src = tmp_dir.join("src");
        tokio::fs::create_dir(&src).await?;
        let payload = testutils::patterned_bytes(4096);
        tokio::fs::write(src.join("new.bin"), &payload).await?;
        let summary = mirror(&PROGRESS, &db, &src, &dst, &Settings::default()).await?;
        assert_eq!(summary.files_copied, 1);
        assert_eq!(summary.files_linked, 0);
        // the hash pass kept the bytes, so the source was opened exactly
        // once and the copy wrote from memory
        assert_eq!(summary.io.create_read_count, 1);
        assert_eq!(summary.io.create_write_count, 1);
        assert_eq!(tokio::fs::read(dst.join("new.bin")).await?, payload);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn stale_database_record_is_evicted_when_verifying() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let payload = testutils::patterned_bytes(4096);
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&dst).await?;
        let seed = dst.join("seed.bin");
        tokio::fs::write(&seed, &payload).await?;
        let db = FileDatabase::new();
        let mut io = IoStats::default();
        db.prime_directory(&dst, &mut io, true, true).await;
        db.prime_wait(&mut io).await;

        // corrupt the seed without changing its key (same size, same mtime)
        let recorded = fileio::get_file_info(&seed, &mut io).await?;
        let mut corrupted = payload.clone();
        corrupted[0] ^= 0xff;
        tokio::fs::write(&seed, &corrupted).await?;
        fileio::set_file_mtime(&seed, recorded.last_write_time, &mut io).await?;

        let src = tmp_dir.join("src");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::write(src.join("wanted.bin"), &payload).await?;
        let settings = Settings {
            verify_links: true,
            ..Default::default()
        };
        let summary = mirror(&PROGRESS, &db, &src, &dst, &settings).await?;
        // the stale record must not be trusted: no link, a real copy
        assert_eq!(summary.files_linked, 0);
        assert_eq!(summary.files_copied, 1);
        assert_eq!(tokio::fs::read(dst.join("wanted.bin")).await?, payload);
        let seed_md = tokio::fs::symlink_metadata(&seed).await?;
        let new_md = tokio::fs::symlink_metadata(dst.join("wanted.bin")).await?;
        assert_ne!(seed_md.ino(), new_md.ino());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn purge_removes_extraneous_destination_entries() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let src = testutils::setup_source_tree(&tmp_dir).await?;
        let dst = tmp_dir.join("dst");
        let db = FileDatabase::new();
        mirror(&PROGRESS, &db, &src, &dst, &Settings::default()).await?;
        tokio::fs::write(dst.join("stray.txt"), "gone soon").await?;
        tokio::fs::create_dir(dst.join("stray_dir")).await?;
        tokio::fs::write(dst.join("stray_dir").join("x"), "x").await?;
        let settings = Settings {
            purge: true,
            ..Default::default()
        };
        let summary = mirror(&PROGRESS, &db, &src, &dst, &settings).await?;
        assert_eq!(summary.files_purged, 3);
        assert!(tokio::fs::symlink_metadata(dst.join("stray.txt"))
            .await
            .is_err());
        assert!(tokio::fs::symlink_metadata(dst.join("stray_dir"))
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn priming_runs_concurrently_with_mirroring() -> anyhow::Result<()> {
        let tmp_dir = testutils::setup_temp_dir().await?;
        let src = testutils::setup_source_tree(&tmp_dir).await?;
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&dst).await?;
        // pre-existing destination content for the primer to find
        tokio::fs::create_dir(dst.join("existing")).await?;
        for i in 0..8 {
            tokio::fs::write(
                dst.join("existing").join(format!("old{}.bin", i)),
                testutils::patterned_bytes(1024 + i),
            )
            .await?;
        }
        let db = FileDatabase::new();
        let mut io = IoStats::default();
        db.prime_directory(&dst, &mut io, true, false).await;
        // mirroring starts while the prime scan is still running
        let summary = mirror(&PROGRESS, &db, &src, &dst, &Settings::default()).await?;
        db.prime_wait(&mut io).await;
        assert_eq!(summary.files_copied + summary.files_linked, 4);
        // the database saw both the primed files and every new copy
        assert!(db.history_size() >= 8 + 4);
        check_trees_identical(&src, &dst).await?;
        Ok(())
    }
}
