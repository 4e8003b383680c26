use anyhow::{anyhow, Context, Result};
use clap::Parser;
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "speed",
    version,
    about = "Copy files and directory trees concurrently",
    long_about = "`speed` copies files (and, with --recursive, whole directory trees) running many copies at once.

The last path is the destination. It is usually an existing directory; a single source may also be
copied onto a file path. Sources are deduplicated, a file is never copied onto itself and existing
files are only replaced with --overwrite.

EXAMPLE:
    # Copy a tree into a new directory, 32 files at a time
    speed -r -m --max-concurrency 32 /data/in /backup/out --summary"
)]
struct Args {
    // Copy options
    /// Copy directories recursively, mirroring their structure under the destination
    #[arg(short = 'r', long, help_heading = "Copy options")]
    recursive: bool,

    /// Overwrite existing destination files
    #[arg(short = 'o', long, help_heading = "Copy options")]
    overwrite: bool,

    /// Create the destination directory (and its parents) if it does not exist
    #[arg(short = 'm', long, help_heading = "Copy options")]
    make_destination: bool,

    // Performance
    /// Buffer size used by each copy, e.g. "4096" or "64KiB"
    ///
    /// The value is clamped to the 1KiB - 128KiB range. Default: 4KiB.
    #[arg(long, value_name = "SIZE", help_heading = "Performance")]
    bytes: Option<bytesize::ByteSize>,

    /// Maximum number of copies in flight at once (default: 16)
    #[arg(long, alias = "tasks", value_name = "N", help_heading = "Performance")]
    max_concurrency: Option<usize>,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Sets the delay between progress updates, default 200ms
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source path(s) followed by the destination path
    #[arg(required = true, value_name = "PATH")]
    paths: Vec<std::path::PathBuf>,
}

#[instrument]
async fn async_main(args: Args) -> Result<common::Summary> {
    let (destination, sources) = args
        .paths
        .split_last()
        .ok_or_else(|| anyhow!("no destination specified"))?;
    let options = common::Options {
        bytes: args.bytes.map(|size| size.as_u64()),
        recursive: args.recursive,
        overwrite: args.overwrite,
        make_destination: args.make_destination,
        max_concurrency: args.max_concurrency,
    };
    let outcome = common::copy(common::get_progress(), sources, destination, &options)
        .await
        .with_context(|| format!("speed: cannot copy into {destination:?}"))?;
    if !outcome.failures.is_empty() {
        tracing::error!(
            "{} of {} file copies failed",
            outcome.failures.len(),
            outcome.summary.files_copied + outcome.summary.files_failed
        );
    }
    Ok(outcome.summary)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.verbose,
        print_summary: args.summary,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(
        if args.progress || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        runtime,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
