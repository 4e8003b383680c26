//! Concurrent file copy engine shared by the `speed` tool.
//!
//! A copy run goes through three phases:
//!
//! 1. validation: the options, the destination and the set of readable sources are checked; any
//!    problem here aborts the run before a single byte is written (see [`Error`])
//! 2. resolution: every source is mapped to a destination path or rejected
//!    ([`destination::Rejection`]); rejections are reported and skipped
//! 3. execution: accepted files are copied by a [`scheduler::Scheduler`] that keeps at most
//!    `max_concurrency` copies in flight; a failing copy does not affect the others
//!
//! Copy failures and rejections are not errors of the run as a whole: [`copy()`] still returns
//! `Ok` and the caller gets the details in the [`Outcome`].
//!
//! # Examples
//!
//! ```no_run
//! # async fn example() -> Result<(), common::Error> {
//! let options = common::Options {
//!     recursive: true,
//!     ..Default::default()
//! };
//! let outcome = common::copy(
//!     common::get_progress(),
//!     &[std::path::PathBuf::from("/data/in")],
//!     std::path::Path::new("/data/out"),
//!     &options,
//! )
//! .await?;
//! println!("{}", outcome.summary);
//! # Ok(())
//! # }
//! ```

use tracing::instrument;

pub mod config;
pub mod copy;
pub mod destination;
pub mod progress;
pub mod scheduler;
pub mod source;

#[cfg(test)]
mod testutils;

pub use config::{Options, OutputConfig, ProgressSettings, RuntimeConfig};
pub use copy::Summary;

static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

const DEFAULT_PROGRESS_DELAY: std::time::Duration = std::time::Duration::from_millis(200);

#[must_use]
pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

/// Problems that make the whole run invalid. Nothing is copied when one of these is returned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("destination path is empty")]
    EmptyDestination,
    #[error(
        "destination {0:?} is not a writable directory or file (did you intend to specify --make-destination?)"
    )]
    DestinationNotWritable(std::path::PathBuf),
    #[error("destination {path:?} is not a directory, cannot copy {count} files into it")]
    DestinationNotDirectory {
        path: std::path::PathBuf,
        count: usize,
    },
    #[error("no readable source files to copy")]
    NoSources,
    #[error("failed creating destination directory {path:?}: {source}")]
    CreateDestination {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

/// Everything that happened during a run that passed validation.
#[derive(Debug, Default)]
pub struct Outcome {
    pub summary: Summary,
    /// Arguments and walked entries dropped while building the source set
    pub skipped: Vec<source::Skip>,
    pub rejections: Vec<destination::Rejection>,
    pub failures: Vec<(copy::CopyTask, copy::Failure)>,
}

impl Outcome {
    /// True when every accepted file was copied and nothing was skipped or rejected.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.rejections.is_empty() && self.failures.is_empty()
    }
}

/// Copies `sources` into `destination`.
///
/// All validation and destination resolution is finished before the first copy starts, and the
/// function returns only after every started copy has reached a terminal outcome.
#[instrument(skip(prog_track))]
pub async fn copy(
    prog_track: &'static progress::Progress,
    sources: &[std::path::PathBuf],
    destination: &std::path::Path,
    options: &Options,
) -> Result<Outcome, Error> {
    options.validate().map_err(Error::InvalidOptions)?;
    if destination.as_os_str().is_empty() {
        return Err(Error::EmptyDestination);
    }
    let mut created_destination = 0;
    if options.make_destination && tokio::fs::metadata(destination).await.is_err() {
        tokio::fs::create_dir_all(destination)
            .await
            .map_err(|source| Error::CreateDestination {
                path: destination.to_path_buf(),
                source,
            })?;
        tracing::info!("created destination directory {:?}", destination);
        prog_track.directories_created.inc();
        created_destination = 1;
    }
    let target = destination::Destination::probe(destination).await;
    if !target.is_writable {
        return Err(Error::DestinationNotWritable(destination.to_path_buf()));
    }
    let source_set = source::build(sources, options.recursive).await;
    if source_set.is_empty() {
        return Err(Error::NoSources);
    }
    // with --make-destination an existing file destination takes the first source only
    if !options.make_destination && !target.is_dir && source_set.files.len() > 1 {
        return Err(Error::DestinationNotDirectory {
            path: destination.to_path_buf(),
            count: source_set.files.len(),
        });
    }
    let mut outcome = Outcome {
        skipped: source_set.skipped,
        ..Default::default()
    };
    let mut resolver = destination::Resolver::new(prog_track, &target, options.overwrite);
    for dir in &source_set.directories {
        if let Err(rejection) = resolver.mirror_directory(dir).await {
            outcome.rejections.push(rejection);
        }
    }
    let mut accepted = Vec::with_capacity(source_set.files.len());
    for file in &source_set.files {
        match resolver.resolve(file).await {
            Ok(dst) => accepted.push(copy::CopyTask::new(
                file.path.clone(),
                dst,
                options.buffer_size(),
            )),
            Err(rejection) => outcome.rejections.push(rejection),
        }
    }
    tracing::info!(
        "accepted {} file(s), rejected {}, skipped {}",
        accepted.len(),
        outcome.rejections.len(),
        outcome.skipped.len()
    );
    let mut scheduler = scheduler::Scheduler::new(prog_track, options.concurrency());
    for task in accepted {
        scheduler.submit(task).await;
    }
    let report = scheduler.drain().await;
    outcome.summary = report.summary
        + Summary {
            files_rejected: outcome.rejections.len() + outcome.skipped.len(),
            directories_created: resolver.directories_created() + created_destination,
            ..Default::default()
        };
    outcome.failures = report.failures;
    Ok(outcome)
}

fn init_logging(output: &OutputConfig) {
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    // RUST_LOG takes precedence over -v/-q
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    // a subscriber installed earlier (e.g. by a test harness) wins
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

fn parse_progress_delay(settings: &ProgressSettings) -> std::time::Duration {
    match settings.progress_delay.as_deref().map(humantime::parse_duration) {
        None => DEFAULT_PROGRESS_DELAY,
        Some(Ok(delay)) if !delay.is_zero() => delay,
        Some(Ok(_)) => {
            tracing::warn!("progress delay must be non-zero, using {DEFAULT_PROGRESS_DELAY:?}");
            DEFAULT_PROGRESS_DELAY
        }
        Some(Err(error)) => {
            tracing::warn!("invalid progress delay ({error}), using {DEFAULT_PROGRESS_DELAY:?}");
            DEFAULT_PROGRESS_DELAY
        }
    }
}

async fn show_progress(delay: std::time::Duration, mut stop: tokio::sync::oneshot::Receiver<()>) {
    let bar = indicatif::ProgressBar::new_spinner();
    let mut printer = progress::ProgressPrinter::new(get_progress());
    let mut ticker = tokio::time::interval(delay);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                bar.set_message(printer.print());
                bar.tick();
            }
        }
    }
    bar.finish_and_clear();
}

/// Sets up logging and the tokio runtime, then drives `func` to completion.
///
/// Progress, when enabled, is drawn on stderr while `func` runs. Returns `None` when `func`
/// fails (the error is logged unless `quiet` is set) or the runtime cannot be built.
pub fn run<Fut, S>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<S>
where
    S: std::fmt::Display,
    Fut: std::future::Future<Output = anyhow::Result<S>>,
{
    init_logging(&output);
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to create the runtime: {:#}", &error);
            return None;
        }
    };
    let delay = progress.as_ref().map(parse_progress_delay);
    let res = runtime.block_on(async move {
        let progress_task = delay.map(|delay| {
            let (stop_tx, stop_rx) = tokio::sync::oneshot::channel();
            (stop_tx, tokio::spawn(show_progress(delay, stop_rx)))
        });
        let res = func().await;
        if let Some((stop_tx, handle)) = progress_task {
            let _ = stop_tx.send(());
            let _ = handle.await;
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
                println!("walltime: {:.2?}", get_progress().get_duration());
            }
            Some(summary)
        }
        Err(error) => {
            if !output.quiet {
                tracing::error!("{:#}", &error);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tracing_test::traced_test;

    static PROGRESS: std::sync::LazyLock<progress::Progress> =
        std::sync::LazyLock::new(progress::Progress::new);

    #[tokio::test]
    #[traced_test]
    async fn copies_plain_files_into_directory() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.join("foo");
        let out = tmp_dir.join("out");
        tokio::fs::create_dir(&out).await?;
        let outcome = copy(
            &PROGRESS,
            &[foo.join("0.txt"), foo.join("baz").join("4.txt")],
            &out,
            &Options::default(),
        )
        .await?;
        assert!(outcome.is_clean());
        assert_eq!(outcome.summary.files_copied, 2);
        assert_eq!(
            tokio::fs::read(out.join("4.txt")).await?,
            testutils::patterned_bytes(5000)
        );
        assert_eq!(
            tokio::fs::read(out.join("0.txt")).await?,
            tokio::fs::read(foo.join("0.txt")).await?
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn self_copy_copies_nothing() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let file = tmp_dir.join("foo").join("0.txt");
        let before = tokio::fs::read(&file).await?;
        let options = Options {
            overwrite: true,
            ..Default::default()
        };
        let outcome = copy(&PROGRESS, &[file.clone()], &file, &options).await?;
        assert_eq!(outcome.summary.files_copied, 0);
        assert!(matches!(
            outcome.rejections.as_slice(),
            [destination::Rejection::SelfCopy { .. }]
        ));
        assert_eq!(tokio::fs::read(&file).await?, before);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn recursive_copy_with_made_destination() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let out = tmp_dir.join("new").join("out");
        let options = Options {
            recursive: true,
            make_destination: true,
            bytes: Some(1024),
            ..Default::default()
        };
        let outcome = copy(&PROGRESS, &[tmp_dir.join("foo")], &out, &options).await?;
        assert!(outcome.is_clean(), "{outcome:?}");
        assert_eq!(outcome.summary.files_copied, 5);
        // destination plus foo, foo/bar, foo/baz and foo/empty
        assert_eq!(outcome.summary.directories_created, 5);
        testutils::check_dirs_identical(&tmp_dir.join("foo"), &out.join("foo")).await?;
        assert!(out.join("foo").join("empty").is_dir());
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rerun_without_overwrite_rejects_everything() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let out = tmp_dir.join("out");
        let options = Options {
            recursive: true,
            make_destination: true,
            ..Default::default()
        };
        let first = copy(&PROGRESS, &[tmp_dir.join("foo")], &out, &options).await?;
        assert_eq!(first.summary.files_copied, 5);
        let second = copy(&PROGRESS, &[tmp_dir.join("foo")], &out, &options).await?;
        assert_eq!(second.summary.files_copied, 0);
        assert_eq!(second.rejections.len(), 5);
        assert!(second
            .rejections
            .iter()
            .all(|r| matches!(r, destination::Rejection::AlreadyExists { .. })));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn rerun_with_overwrite_is_idempotent() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let out = tmp_dir.join("out");
        let options = Options {
            recursive: true,
            make_destination: true,
            overwrite: true,
            ..Default::default()
        };
        for _ in 0..2 {
            let outcome = copy(&PROGRESS, &[tmp_dir.join("foo")], &out, &options).await?;
            assert!(outcome.is_clean(), "{outcome:?}");
            assert_eq!(outcome.summary.files_copied, 5);
            testutils::check_dirs_identical(&tmp_dir.join("foo"), &out.join("foo")).await?;
        }
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn validation_errors() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.join("foo");
        let sources = [foo.join("0.txt"), foo.join("bar").join("1.txt")];
        assert!(matches!(
            copy(&PROGRESS, &sources, std::path::Path::new(""), &Options::default()).await,
            Err(Error::EmptyDestination)
        ));
        assert!(matches!(
            copy(&PROGRESS, &sources, &tmp_dir.join("missing"), &Options::default()).await,
            Err(Error::DestinationNotWritable(_))
        ));
        let target = tmp_dir.join("target.txt");
        tokio::fs::write(&target, "old").await?;
        assert!(matches!(
            copy(&PROGRESS, &sources, &target, &Options::default()).await,
            Err(Error::DestinationNotDirectory { count: 2, .. })
        ));
        assert!(matches!(
            copy(&PROGRESS, &[tmp_dir.join("nope")], &foo, &Options::default()).await,
            Err(Error::NoSources)
        ));
        // a directory without --recursive leaves nothing to copy
        assert!(matches!(
            copy(&PROGRESS, &[foo.join("bar")], &tmp_dir, &Options::default()).await,
            Err(Error::NoSources)
        ));
        let options = Options {
            max_concurrency: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            copy(&PROGRESS, &sources, &foo, &options).await,
            Err(Error::InvalidOptions(_))
        ));
        // nothing was touched
        assert_eq!(tokio::fs::read_to_string(&target).await?, "old");
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn make_destination_onto_existing_file_takes_first_source() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let foo = tmp_dir.join("foo");
        let target = tmp_dir.join("target.txt");
        tokio::fs::write(&target, "old").await?;
        let options = Options {
            make_destination: true,
            overwrite: true,
            ..Default::default()
        };
        let outcome = copy(
            &PROGRESS,
            &[foo.join("0.txt"), foo.join("bar").join("1.txt")],
            &target,
            &options,
        )
        .await?;
        assert_eq!(outcome.summary.files_copied, 1);
        assert!(matches!(
            outcome.rejections.as_slice(),
            [destination::Rejection::AmbiguousDestination { .. }]
        ));
        assert_eq!(
            tokio::fs::read(&target).await?,
            tokio::fs::read(foo.join("0.txt")).await?
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn single_file_to_new_file_path() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::setup_test_dir().await?;
        let target = tmp_dir.join("copy.txt");
        tokio::fs::write(&target, "").await?;
        let options = Options {
            overwrite: true,
            ..Default::default()
        };
        let outcome = copy(
            &PROGRESS,
            &[tmp_dir.join("foo").join("baz").join("4.txt")],
            &target,
            &options,
        )
        .await?;
        assert_eq!(outcome.summary.files_copied, 1);
        assert_eq!(outcome.summary.bytes_copied, 5000);
        assert_eq!(
            tokio::fs::read(&target).await?,
            testutils::patterned_bytes(5000)
        );
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn read_only_destination_is_not_writable() -> Result<(), anyhow::Error> {
        if nix::unistd::geteuid().is_root() {
            // permission bits do not restrict root
            return Ok(());
        }
        let tmp_dir = testutils::setup_test_dir().await?;
        let out = tmp_dir.join("out");
        tokio::fs::create_dir(&out).await?;
        tokio::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o555)).await?;
        let res = copy(
            &PROGRESS,
            &[tmp_dir.join("foo").join("0.txt")],
            &out,
            &Options::default(),
        )
        .await;
        tokio::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o755)).await?;
        assert!(matches!(res, Err(Error::DestinationNotWritable(_))));
        Ok(())
    }

    #[test]
    fn progress_delay_parsing() {
        let settings = |delay: Option<&str>| ProgressSettings {
            progress_delay: delay.map(str::to_string),
        };
        assert_eq!(parse_progress_delay(&settings(None)), DEFAULT_PROGRESS_DELAY);
        assert_eq!(
            parse_progress_delay(&settings(Some("1s"))),
            std::time::Duration::from_secs(1)
        );
        assert_eq!(
            parse_progress_delay(&settings(Some("bogus"))),
            DEFAULT_PROGRESS_DELAY
        );
        assert_eq!(parse_progress_delay(&settings(Some("0s"))), DEFAULT_PROGRESS_DELAY);
    }
}
