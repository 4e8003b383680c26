//! Maps accepted sources onto concrete destination paths and applies the copy policy.
//!
//! The decision sequence for every source (first matching rule wins):
//!
//! 1. the destination itself is the source: reject as self-copy
//! 2. destination is a directory: the candidate is `destination/<mirrored path or file name>`,
//!    and the self-copy check is repeated against the candidate
//! 3. destination is not a directory: it is a target file path and only the first accepted
//!    source may claim it (later claims of any claimed candidate are rejected as ambiguous)
//! 4. the candidate exists and overwriting is disabled: reject
//! 5. the source is no longer readable: reject
//! 6. accept, creating the candidate's parent directory if needed
//!
//! Directory creation is the only filesystem mutation performed here.

use tracing::instrument;

use crate::source::{self, SourceFile};

/// Facts about the destination root, probed once before resolution starts.
#[derive(Debug, Clone)]
pub struct Destination {
    pub path: std::path::PathBuf,
    /// Resolved path, None when the destination does not exist yet
    pub canonical: Option<std::path::PathBuf>,
    pub exists: bool,
    pub is_dir: bool,
    pub is_writable: bool,
}

impl Destination {
    #[instrument]
    pub async fn probe(path: &std::path::Path) -> Self {
        let metadata = tokio::fs::metadata(path).await.ok();
        let canonical = tokio::fs::canonicalize(path).await.ok();
        Self {
            path: path.to_path_buf(),
            canonical,
            exists: metadata.is_some(),
            is_dir: metadata.as_ref().is_some_and(std::fs::Metadata::is_dir),
            is_writable: metadata.is_some() && source::is_writable(path),
        }
    }
}

/// Why a source was excluded from the copy. None of these are fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("cannot copy {src:?} onto itself ({dst:?}), skipping")]
    SelfCopy {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
    },
    #[error("destination {dst:?} already exists, skipping {src:?} (did you intend to specify --overwrite?)")]
    AlreadyExists {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
    },
    #[error("destination {dst:?} is already the target of another source, skipping {src:?}")]
    AmbiguousDestination {
        src: std::path::PathBuf,
        dst: std::path::PathBuf,
    },
    #[error("cannot read {src:?}, skipping")]
    Unreadable { src: std::path::PathBuf },
}

/// Canonical form of a path that may not exist yet: resolve the longest existing prefix.
async fn canonical_candidate(path: &std::path::Path) -> Option<std::path::PathBuf> {
    if let Ok(canonical) = tokio::fs::canonicalize(path).await {
        return Some(canonical);
    }
    let mut suffix = std::path::PathBuf::new();
    let mut current = path;
    while let (Some(parent), Some(name)) = (current.parent(), current.file_name()) {
        suffix = std::path::Path::new(name).join(&suffix);
        if let Ok(canonical) = tokio::fs::canonicalize(parent).await {
            return Some(canonical.join(suffix));
        }
        current = parent;
    }
    None
}

pub struct Resolver<'a> {
    destination: &'a Destination,
    overwrite: bool,
    claimed: std::collections::HashSet<std::path::PathBuf>,
    directories_created: usize,
    prog_track: &'static crate::progress::Progress,
}

impl<'a> Resolver<'a> {
    pub fn new(
        prog_track: &'static crate::progress::Progress,
        destination: &'a Destination,
        overwrite: bool,
    ) -> Self {
        Self {
            destination,
            overwrite,
            claimed: std::collections::HashSet::new(),
            directories_created: 0,
            prog_track,
        }
    }

    /// Number of directories (parents and mirrored ones) this resolver had to create.
    #[must_use]
    pub fn directories_created(&self) -> usize {
        self.directories_created
    }

    fn candidate(&self, source: &SourceFile) -> std::path::PathBuf {
        if !self.destination.is_dir {
            return self.destination.path.clone();
        }
        match (&source.relative, source.canonical.file_name()) {
            (Some(relative), _) => self.destination.path.join(relative),
            (None, Some(name)) => self.destination.path.join(name),
            (None, None) => self.destination.path.clone(),
        }
    }

    /// Decides where `source` goes. Returns the destination file path on acceptance.
    #[instrument(skip(self, source), fields(src = ?source.path))]
    pub async fn resolve(&mut self, source: &SourceFile) -> Result<std::path::PathBuf, Rejection> {
        let rejection = match self.decide(source).await {
            Ok(dst) => return Ok(dst),
            Err(rejection) => rejection,
        };
        tracing::warn!("{}", &rejection);
        self.prog_track.files_rejected.inc();
        Err(rejection)
    }

    async fn decide(&mut self, source: &SourceFile) -> Result<std::path::PathBuf, Rejection> {
        if self.destination.canonical.as_ref() == Some(&source.canonical) {
            return Err(Rejection::SelfCopy {
                src: source.path.clone(),
                dst: self.destination.path.clone(),
            });
        }
        let candidate = self.candidate(source);
        let candidate_canonical = canonical_candidate(&candidate).await;
        if self.destination.is_dir && candidate_canonical.as_ref() == Some(&source.canonical) {
            return Err(Rejection::SelfCopy {
                src: source.path.clone(),
                dst: candidate,
            });
        }
        let claim = candidate_canonical.unwrap_or_else(|| candidate.clone());
        if self.claimed.contains(&claim) {
            return Err(Rejection::AmbiguousDestination {
                src: source.path.clone(),
                dst: candidate,
            });
        }
        if !self.overwrite && tokio::fs::symlink_metadata(&candidate).await.is_ok() {
            return Err(Rejection::AlreadyExists {
                src: source.path.clone(),
                dst: candidate,
            });
        }
        if !source.is_readable || !source::is_readable(&source.path) {
            return Err(Rejection::Unreadable {
                src: source.path.clone(),
            });
        }
        // only accepted sources claim a candidate
        self.claimed.insert(claim);
        if let Some(parent) = candidate.parent() {
            self.create_dir_all(parent).await;
        }
        tracing::debug!("accepted: {:?} -> {:?}", &source.path, &candidate);
        Ok(candidate)
    }

    async fn create_dir_all(&mut self, dir: &std::path::Path) {
        if dir.as_os_str().is_empty() || tokio::fs::metadata(dir).await.is_ok() {
            return;
        }
        match tokio::fs::create_dir_all(dir).await {
            Ok(()) => {
                tracing::debug!("created directory {:?}", dir);
                self.directories_created += 1;
                self.prog_track.directories_created.inc();
            }
            // the copy task opening a file inside it will report the failure
            Err(error) => tracing::warn!("failed creating directory {:?}: {}", dir, &error),
        }
    }

    /// Reproduces a directory found by a recursive walk under the destination.
    ///
    /// Only meaningful when the destination is a directory; otherwise nothing is mirrored and
    /// `Ok(None)` is returned.
    #[instrument(skip(self, dir), fields(src = ?dir.path))]
    pub async fn mirror_directory(
        &mut self,
        dir: &SourceFile,
    ) -> Result<Option<std::path::PathBuf>, Rejection> {
        let Some(relative) = dir.relative.as_ref().filter(|_| self.destination.is_dir) else {
            return Ok(None);
        };
        let candidate = self.destination.path.join(relative);
        if canonical_candidate(&candidate).await.as_ref() == Some(&dir.canonical) {
            let rejection = Rejection::SelfCopy {
                src: dir.path.clone(),
                dst: candidate,
            };
            tracing::warn!("{}", &rejection);
            return Err(rejection);
        }
        match tokio::fs::metadata(&candidate).await {
            Ok(metadata) if metadata.is_dir() => return Ok(Some(candidate)),
            Ok(_) => {
                let rejection = Rejection::AlreadyExists {
                    src: dir.path.clone(),
                    dst: candidate,
                };
                tracing::warn!("{}", &rejection);
                return Err(rejection);
            }
            Err(_) => {}
        }
        self.create_dir_all(&candidate).await;
        Ok(Some(candidate))
    }
}
