//! Resolves raw path arguments into the deduplicated set of files to copy.
//!
//! Every argument is stat-ed and canonicalized; the canonical path is the identity used to drop
//! files named more than once (directly, through `.`/`..` segments, or via symlinks). Directory
//! arguments are only walked when recursion is enabled, and every entry found during a walk is
//! tagged with its path relative to the parent of the directory argument, so the mirrored tree
//! keeps the top directory's name.
//!
//! Nothing here is fatal: problems with individual entries are logged, recorded in
//! [`SourceSet::skipped`], and the walk carries on.

use async_recursion::async_recursion;
use tracing::instrument;

/// One candidate source, gathered once before any scheduling happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Absolute (but not symlink-resolved) path
    pub path: std::path::PathBuf,
    /// Fully resolved path, the deduplication and self-copy key
    pub canonical: std::path::PathBuf,
    pub is_dir: bool,
    pub is_readable: bool,
    /// Path to mirror under the destination, set only for entries found by a recursive walk
    pub relative: Option<std::path::PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum Skip {
    #[error("{path:?} is a directory, skipping (use --recursive to copy directories)")]
    IsDirectory { path: std::path::PathBuf },
    #[error("cannot read {path:?}, skipping")]
    Unreadable { path: std::path::PathBuf },
    #[error("cannot access {path:?}: {source}")]
    Inaccessible {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?} is a symlink to a directory, not following")]
    SymlinkedDirectory { path: std::path::PathBuf },
    #[error("{path:?} is not a regular file or directory, skipping")]
    Unsupported { path: std::path::PathBuf },
}

/// Deduplicated, order-stable output of [`build`].
#[derive(Debug, Default)]
pub struct SourceSet {
    /// Regular files to copy, in order of first encounter
    pub files: Vec<SourceFile>,
    /// Directories found by recursive walks (including the walked roots), to be mirrored
    pub directories: Vec<SourceFile>,
    pub skipped: Vec<Skip>,
}

impl SourceSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

pub(crate) fn is_readable(path: &std::path::Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::R_OK).is_ok()
}

pub(crate) fn is_writable(path: &std::path::Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::W_OK).is_ok()
}

struct Builder {
    recursive: bool,
    seen: std::collections::HashSet<std::path::PathBuf>,
    set: SourceSet,
}

impl Builder {
    fn skip(&mut self, skip: Skip) {
        tracing::warn!("{}", &skip);
        self.set.skipped.push(skip);
    }

    /// Returns false if `canonical` was already seen.
    fn first_visit(&mut self, canonical: &std::path::Path) -> bool {
        if self.seen.insert(canonical.to_path_buf()) {
            return true;
        }
        tracing::debug!("{:?} already included, dropping duplicate", canonical);
        false
    }

    #[instrument(skip(self))]
    async fn add_argument(&mut self, arg: &std::path::Path) {
        let metadata = match tokio::fs::metadata(arg).await {
            Ok(metadata) => metadata,
            Err(source) => {
                return self.skip(Skip::Inaccessible {
                    path: arg.to_path_buf(),
                    source,
                });
            }
        };
        let canonical = match tokio::fs::canonicalize(arg).await {
            Ok(canonical) => canonical,
            Err(source) => {
                return self.skip(Skip::Inaccessible {
                    path: arg.to_path_buf(),
                    source,
                });
            }
        };
        let path = std::path::absolute(arg).unwrap_or_else(|_| canonical.clone());
        if metadata.is_dir() {
            if !self.recursive {
                return self.skip(Skip::IsDirectory { path });
            }
            // name the mirrored tree after the argument as given (a symlink keeps its own name),
            // falling back to the resolved name for arguments like ".."
            let root_name = path
                .file_name()
                .or_else(|| canonical.file_name())
                .map(std::path::PathBuf::from)
                .unwrap_or_default();
            self.add_directory(path, canonical, root_name).await;
        } else if metadata.is_file() {
            self.add_file(path, canonical, None);
        } else {
            self.skip(Skip::Unsupported { path });
        }
    }

    fn add_file(
        &mut self,
        path: std::path::PathBuf,
        canonical: std::path::PathBuf,
        relative: Option<std::path::PathBuf>,
    ) {
        if !self.first_visit(&canonical) {
            return;
        }
        if !is_readable(&path) {
            return self.skip(Skip::Unreadable { path });
        }
        tracing::trace!("accepted {:?}", &path);
        self.set.files.push(SourceFile {
            path,
            canonical,
            is_dir: false,
            is_readable: true,
            relative,
        });
    }

    #[async_recursion]
    async fn add_directory(
        &mut self,
        path: std::path::PathBuf,
        canonical: std::path::PathBuf,
        relative: std::path::PathBuf,
    ) {
        if !self.first_visit(&canonical) {
            return;
        }
        let mut entries = match tokio::fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(error) => {
                tracing::debug!("cannot open directory {:?}: {}", &path, &error);
                return self.skip(Skip::Unreadable { path });
            }
        };
        self.set.directories.push(SourceFile {
            path: path.clone(),
            canonical,
            is_dir: true,
            is_readable: true,
            relative: Some(relative.clone()),
        });
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    self.skip(Skip::Inaccessible {
                        path: path.clone(),
                        source,
                    });
                    break;
                }
            };
            let entry_path = entry.path();
            let entry_relative = relative.join(entry.file_name());
            self.add_entry(entry_path, entry_relative).await;
        }
    }

    async fn add_entry(&mut self, path: std::path::PathBuf, relative: std::path::PathBuf) {
        let link_metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(source) => return self.skip(Skip::Inaccessible { path, source }),
        };
        // symlinks to files are followed, symlinks to directories are not (cycles)
        let metadata = if link_metadata.is_symlink() {
            match tokio::fs::metadata(&path).await {
                Ok(metadata) if metadata.is_dir() => {
                    return self.skip(Skip::SymlinkedDirectory { path });
                }
                Ok(metadata) => metadata,
                Err(source) => return self.skip(Skip::Inaccessible { path, source }),
            }
        } else {
            link_metadata
        };
        if !metadata.is_dir() && !metadata.is_file() {
            return self.skip(Skip::Unsupported { path });
        }
        let canonical = match tokio::fs::canonicalize(&path).await {
            Ok(canonical) => canonical,
            Err(source) => return self.skip(Skip::Inaccessible { path, source }),
        };
        if metadata.is_dir() {
            self.add_directory(path, canonical, relative).await;
        } else {
            self.add_file(path, canonical, Some(relative));
        }
    }
}

/// Builds the deduplicated source set for `args`, walking directories only when `recursive`.
#[instrument]
pub async fn build(args: &[std::path::PathBuf], recursive: bool) -> SourceSet {
    let mut builder = Builder {
        recursive,
        seen: std::collections::HashSet::new(),
        set: SourceSet::default(),
    };
    for arg in args {
        builder.add_argument(arg).await;
    }
    tracing::debug!(
        "accepted {} file(s) and {} directory entries, skipped {}",
        builder.set.files.len(),
        builder.set.directories.len(),
        builder.set.skipped.len()
    );
    builder.set
}
