use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

use crate::config;
use crate::progress;

/// Immutable description of one file copy. The buffer size is clamped on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTask {
    src: std::path::PathBuf,
    dst: std::path::PathBuf,
    buffer_size: usize,
}

impl CopyTask {
    #[must_use]
    pub fn new(src: std::path::PathBuf, dst: std::path::PathBuf, buffer_size: usize) -> Self {
        Self {
            src,
            dst,
            buffer_size: config::clamp_buffer_size(
                u64::try_from(buffer_size).unwrap_or(config::MAX_BUFFER_SIZE),
            ),
        }
    }

    #[must_use]
    pub fn src(&self) -> &std::path::Path {
        &self.src
    }

    #[must_use]
    pub fn dst(&self) -> &std::path::Path {
        &self.dst
    }

    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

/// Terminal failure of a copy task.
///
/// Note that the destination is truncated when it is opened, so a destination reported here may
/// be left empty or partially written.
#[derive(Debug, thiserror::Error)]
pub enum Failure {
    #[error("cannot open {path:?} for reading: {source}")]
    OpenSourceFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot open {path:?} for writing: {source}")]
    OpenDestinationFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading {path:?}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed writing {path:?}: {source}")]
    WriteFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The task unwound before reporting. Only reachable in unwinding builds (e.g. tests); with
    /// `panic = "abort"` the process terminates instead.
    #[error("copy {src:?} -> {dst:?} terminated abnormally: {reason}")]
    Panicked {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
        reason: String,
    },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub files_failed: usize,
    pub files_rejected: usize,
    pub directories_created: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            files_failed: self.files_failed + other.files_failed,
            files_rejected: self.files_rejected + other.files_rejected,
            directories_created: self.directories_created + other.directories_created,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            files failed: {}\n\
            files skipped: {}\n\
            directories created: {}",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.files_failed,
            self.files_rejected,
            self.directories_created,
        )
    }
}

/// Streams `task.src()` into `task.dst()` through a single buffer of the task's size.
///
/// The buffer and both file handles are owned by this function and released on every return
/// path. No retries are attempted.
#[instrument(skip(prog_track))]
pub async fn copy_file(
    prog_track: &'static progress::Progress,
    task: &CopyTask,
) -> Result<u64, Failure> {
    let _ops_guard = prog_track.ops.guard();
    tracing::debug!("opening 'src' for reading");
    let mut reader =
        tokio::fs::File::open(&task.src)
            .await
            .map_err(|source| Failure::OpenSourceFailed {
                path: task.src.clone(),
                source,
            })?;
    tracing::debug!("opening 'dst' for writing");
    let mut writer = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&task.dst)
        .await
        .map_err(|source| Failure::OpenDestinationFailed {
            path: task.dst.clone(),
            source,
        })?;
    let mut buffer = vec![0u8; task.buffer_size];
    let mut bytes_copied = 0u64;
    loop {
        let count = match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(count) => count,
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(source) => {
                return Err(Failure::ReadFailed {
                    path: task.src.clone(),
                    source,
                });
            }
        };
        writer
            .write_all(&buffer[..count])
            .await
            .map_err(|source| Failure::WriteFailed {
                path: task.dst.clone(),
                source,
            })?;
        bytes_copied += count as u64;
        prog_track.bytes_copied.add(count as u64);
    }
    // tokio completes file writes in the background, wait for the last one
    writer.flush().await.map_err(|source| Failure::WriteFailed {
        path: task.dst.clone(),
        source,
    })?;
    tracing::trace!("copied {} bytes", bytes_copied);
    Ok(bytes_copied)
}
