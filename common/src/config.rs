//! Configuration types for runtime and execution settings

use anyhow::anyhow;

/// Thread caps for the runtime [`crate::run`] builds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Worker threads driving the mirror tasks; 0 picks one per core
    pub max_workers: usize,
    /// Threads backing blocking file operations; 0 keeps tokio's default
    pub max_blocking_threads: usize,
}

/// What a run reports, and how loudly.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Say nothing, not even errors
    pub quiet: bool,
    /// 0=ERROR, 1=INFO, 2=DEBUG, 3 and up=TRACE
    pub verbose: u8,
    /// Print the run summary once the mirror finishes
    pub print_summary: bool,
}

/// How live progress is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgressType {
    /// Animated progress bar for interactive terminals
    #[default]
    ProgressBar,
    /// Periodic text blocks, appropriate for logging
    TextUpdates,
}

impl std::str::FromStr for ProgressType {
    type Err = anyhow::Error;
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "progressbar" => Ok(ProgressType::ProgressBar),
            "textupdates" => Ok(ProgressType::TextUpdates),
            _ => Err(anyhow!(
                "invalid progress type {:?}, expected ProgressBar or TextUpdates",
                value
            )),
        }
    }
}

/// Live progress reporting configuration
#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Delay between progress updates, e.g. "200ms", "10s"
    pub progress_delay: Option<String>,
}
