#[macro_use]
extern crate lazy_static;

pub mod config;
pub mod copy;
pub mod filecmp;
pub mod filedb;
pub mod fileio;
pub mod hash;
pub mod iostats;
pub mod mirror;
pub mod path;
pub mod progress;
#[cfg(test)]
pub(crate) mod testutils;

pub use config::{OutputConfig, ProgressSettings, ProgressType, RuntimeConfig};
pub use copy::{CopySettings, UseBufferedIo, COPY_CONTEXT_BUFFER_SIZE};
pub use filecmp::{parse_metadata_cmp_settings, MetadataCmpSettings};
pub use filedb::{FileDatabase, FileKey};
pub use fileio::MAX_PATH;
pub use iostats::IoStats;
pub use mirror::{
    mirror, Error as MirrorError, Settings as MirrorSettings, Summary as MirrorSummary,
};

lazy_static! {
    /// Process-wide live counters, shared by the workers and the progress
    /// reporter thread.
    pub static ref PROGRESS: progress::Progress = progress::Progress::new();
}

fn parse_progress_delay(
    delay: &Option<String>,
    default: std::time::Duration,
) -> std::time::Duration {
    let Some(delay) = delay else {
        return default;
    };
    let delay = delay.trim();
    let parsed = if let Some(ms) = delay.strip_suffix("ms") {
        ms.trim().parse::<u64>().map(std::time::Duration::from_millis)
    } else if let Some(secs) = delay.strip_suffix('s') {
        secs.trim().parse::<u64>().map(std::time::Duration::from_secs)
    } else {
        delay.parse::<u64>().map(std::time::Duration::from_millis)
    };
    match parsed {
        Ok(duration) => duration,
        Err(_) => {
            tracing::warn!("cannot parse progress delay {:?}, using the default", delay);
            default
        }
    }
}

fn sleep_unless_done(done: &std::sync::atomic::AtomicBool, delay: std::time::Duration) {
    let step = std::time::Duration::from_millis(50);
    let mut waited = std::time::Duration::ZERO;
    while waited < delay && !done.load(std::sync::atomic::Ordering::SeqCst) {
        std::thread::sleep(step.min(delay - waited));
        waited += step;
    }
}

/// Sets up tracing and the tokio runtime, runs `func` to completion and
/// reports the outcome. Returns `None` on failure so the binary can exit
/// non-zero.
pub fn run<Fut, Summary>(
    progress: Option<ProgressSettings>,
    output: &OutputConfig,
    runtime: &RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
    Summary: std::fmt::Display,
{
    if !output.quiet {
        let level = match output.verbose {
            0 => tracing::Level::ERROR,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        };
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    }
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let tokio_runtime = match builder.build() {
        Ok(tokio_runtime) => tokio_runtime,
        Err(error) => {
            eprintln!("failed starting the runtime: {}", error);
            return None;
        }
    };
    let done = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let progress_thread = progress.map(|settings| {
        let done = done.clone();
        std::thread::spawn(move || match settings.progress_type {
            ProgressType::ProgressBar => {
                let delay = parse_progress_delay(
                    &settings.progress_delay,
                    std::time::Duration::from_millis(200),
                );
                let pbar = indicatif::ProgressBar::new(0);
                loop {
                    if done.load(std::sync::atomic::Ordering::SeqCst) {
                        break;
                    }
                    let status = PROGRESS.ops.get();
                    pbar.set_length(status.started);
                    pbar.set_position(status.finished);
                    sleep_unless_done(&done, delay);
                }
                pbar.finish_and_clear();
            }
            ProgressType::TextUpdates => {
                let delay = parse_progress_delay(
                    &settings.progress_delay,
                    std::time::Duration::from_secs(10),
                );
                let mut printer = progress::ProgressPrinter::new(&PROGRESS);
                loop {
                    if done.load(std::sync::atomic::Ordering::SeqCst) {
                        break;
                    }
                    eprintln!("{}", printer.print());
                    sleep_unless_done(&done, delay);
                }
            }
        })
    });
    let result = tokio_runtime.block_on(func());
    done.store(true, std::sync::atomic::Ordering::SeqCst);
    if let Some(handle) = progress_thread {
        if handle.join().is_err() {
            tracing::warn!("progress reporter thread panicked");
        }
    }
    match result {
        Ok(summary) => {
            if output.print_summary {
                println!("{}", &summary);
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                eprintln!("rmir: {:#}", error);
            }
            None
        }
    }
}
