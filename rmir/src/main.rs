use anyhow::{anyhow, Result};
use structopt::StructOpt;

#[derive(StructOpt, Debug, Clone)]
#[structopt(
    name = "rmir",
    about = "`rmir` mirrors a directory tree into a destination while reusing content the \
    destination already has.

Identical content becomes a hard link instead of a byte copy, guided by a content-addressed \
file database that can be primed from the destination and persisted between runs."
)]
struct Args {
    /// Source path
    #[structopt()]
    src: String,

    /// Destination path; a trailing slash copies INTO the directory
    #[structopt()]
    dst: String,

    /// File database to load before the run and store back after it
    #[structopt(long)]
    database: Option<std::path::PathBuf>,

    /// Prime the database from the existing destination tree before
    /// copying, so link reuse works from the very first file
    #[structopt(long)]
    prime: bool,

    /// Bound the database to this many records after the run, evicting the
    /// oldest first (0 = unbounded)
    #[structopt(long, default_value = "0")]
    max_history: usize,

    /// Re-hash link-reuse candidates before linking; evicts records whose
    /// file no longer matches
    #[structopt(long)]
    verify: bool,

    /// Remove destination entries the source no longer has
    #[structopt(long)]
    purge: bool,

    /// Use the OS copy primitive instead of the internal pipeline
    #[structopt(long)]
    system_copy: bool,

    /// Buffered I/O selection: auto, enabled or disabled.
    ///
    /// With auto, files of 4MiB and above use the unbuffered pipeline.
    #[structopt(long, default_value = "auto")]
    buffered_io: common::UseBufferedIo,

    /// Comma separated list of file attributes to compare when deciding if
    /// files are "identical". Options are: uid, gid, size, mtime, ctime
    #[structopt(long, default_value = "size,mtime")]
    compare: String,

    /// Exit on first error
    #[structopt(short = "-e", long = "fail-early")]
    fail_early: bool,

    /// Show progress
    #[structopt(long)]
    progress: bool,

    /// Toggles the type of progress to show.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: ProgressBar (animated progress bar), TextUpdates (appropriate for logging)
    #[structopt(long)]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates, e.g. "200ms", "10s".
    ///
    /// If specified, --progress flag is implied.
    #[structopt(long)]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR))
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,

    /// Print summary at the end
    #[structopt(long)]
    summary: bool,

    /// Quiet mode, don't report errors
    #[structopt(short = "q", long = "quiet")]
    quiet: bool,

    /// Number of worker threads, 0 means number of cores
    #[structopt(long, default_value = "0")]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[structopt(long, default_value = "0")]
    max_blocking_threads: usize,
}

/// "rmir foo bar/" copies foo to bar/foo; without the trailing slash the
/// destination names the mirrored entry itself.
fn resolve_destination(src: &str, dst: &str) -> Result<std::path::PathBuf> {
    if dst.ends_with('/') {
        let src_file = std::path::Path::new(src)
            .file_name()
            .ok_or_else(|| anyhow!("source {:?} does not have a basename", src))?;
        Ok(std::path::Path::new(dst).join(src_file))
    } else {
        Ok(std::path::PathBuf::from(dst))
    }
}

async fn async_main(args: Args) -> Result<common::MirrorSummary> {
    for path in [&args.src, &args.dst] {
        if !common::path::is_local_path(path) {
            return Err(anyhow!(
                "{:?} looks like a remote path; rmir only mirrors local trees",
                path
            ));
        }
    }
    let src = std::path::PathBuf::from(&args.src);
    let dst = resolve_destination(&args.src, &args.dst)?;
    let settings = common::MirrorSettings {
        fail_early: args.fail_early,
        use_system_copy: args.system_copy,
        use_buffered_io: args.buffered_io,
        unchanged_compare: common::parse_metadata_cmp_settings(&args.compare)?,
        verify_links: args.verify,
        purge: args.purge,
    };
    tracing::debug!("mirror settings: {:?}", &settings);
    let db = common::FileDatabase::new();
    let mut io = common::IoStats::default();
    if let Some(database) = &args.database {
        db.read_file(database, &mut io).await?;
        tracing::info!(
            "database {:?} loaded with {} records",
            database,
            db.history_size()
        );
    }
    if args.prime {
        if tokio::fs::symlink_metadata(&dst).await.is_ok() {
            db.prime_directory(&dst, &mut io, true, true).await;
            tracing::info!("primed {} destination files", db.history_size());
        } else {
            tracing::debug!("nothing to prime, {:?} does not exist yet", &dst);
        }
    }
    let result = common::mirror(&common::PROGRESS, &db, &src, &dst, &settings).await;
    // let any in-flight priming settle before the database is persisted
    db.prime_wait(&mut io).await;
    let mut summary = match result {
        Ok(summary) => summary,
        Err(error) => {
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            return Err(error.into());
        }
    };
    if args.max_history > 0 {
        let removed = db.garbage_collect(args.max_history);
        if removed > 0 {
            tracing::info!("evicted {} oldest database records", removed);
        }
    }
    if let Some(database) = &args.database {
        db.write_file(database, &mut io).await?;
        tracing::info!(
            "database {:?} stored with {} records",
            database,
            db.history_size()
        );
    }
    summary.io = summary.io + io;
    Ok(summary)
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::from_args();
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary || args.verbose > 0,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let progress = (args.progress || args.progress_type.is_some() || args.progress_delay.is_some())
        .then(|| common::ProgressSettings {
            progress_type: args.progress_type.unwrap_or_default(),
            progress_delay: args.progress_delay.clone(),
        });
    let func = {
        let args = args.clone();
        move || async_main(args)
    };
    let res = common::run(progress, &output, &runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_targets_inside_directory() {
        assert_eq!(
            resolve_destination("/a/b/src", "/dest/").unwrap(),
            std::path::PathBuf::from("/dest/src")
        );
        assert_eq!(
            resolve_destination("/a/b/src", "/dest/renamed").unwrap(),
            std::path::PathBuf::from("/dest/renamed")
        );
    }
}
