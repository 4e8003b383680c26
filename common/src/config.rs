//! Configuration types for copy, runtime and output settings

/// Buffer size used by a copy task when none is requested.
pub const DEFAULT_BUFFER_SIZE: u64 = 4096;
/// Smallest buffer a copy task will ever allocate.
pub const MIN_BUFFER_SIZE: u64 = 1024;
/// Largest buffer a copy task will ever allocate.
pub const MAX_BUFFER_SIZE: u64 = 128 * 1024;
/// Number of copy tasks allowed in flight when no explicit bound is configured.
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// Clamps a requested buffer size to `[MIN_BUFFER_SIZE, MAX_BUFFER_SIZE]`.
#[must_use]
pub fn clamp_buffer_size(requested: u64) -> usize {
    let clamped = requested.clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE);
    // MAX_BUFFER_SIZE fits in usize on every supported target
    usize::try_from(clamped).unwrap_or(128 * 1024)
}

/// Copy options consumed by the core, produced by the command line layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Requested per-task buffer size in bytes (None = `DEFAULT_BUFFER_SIZE`)
    pub bytes: Option<u64>,
    /// Allow directory arguments and mirror their subtrees
    pub recursive: bool,
    /// Allow replacing existing destination files
    pub overwrite: bool,
    /// Create the destination root (mkdir -p) before resolving anything
    pub make_destination: bool,
    /// Maximum number of copy tasks in flight (None = `DEFAULT_MAX_CONCURRENCY`)
    pub max_concurrency: Option<usize>,
}

impl Options {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == Some(0) {
            return Err("max_concurrency must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Effective buffer size for every copy task, always within the allowed bounds.
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        clamp_buffer_size(self.bytes.unwrap_or(DEFAULT_BUFFER_SIZE))
    }

    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY)
    }
}

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress all diagnostics
    pub quiet: bool,
    /// Verbosity level: 0=WARN, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

/// Periodic progress display settings
#[derive(Debug, Clone)]
pub struct ProgressSettings {
    /// Human readable delay between updates, e.g. "200ms" or "1s" (None = 200ms)
    pub progress_delay: Option<String>,
}
