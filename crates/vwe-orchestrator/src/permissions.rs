//! Best-effort ownership normalization of collaborator output.
//!
//! The generator often runs as another principal (a container user, a
//! service account), so files it writes may not be owned by whoever
//! invoked the pipeline. After it stops, every path under the seed root is
//! re-owned to the invoking principal. Failures are collected, never raised.

use std::path::{Path, PathBuf};

use vwe_core::ArtifactConfig;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ownership {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizeReport {
    pub visited: usize,
    pub changed: usize,
    pub failures: Vec<(PathBuf, String)>,
}

impl NormalizeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// `path: error` of the first failure, for warnings.
    pub fn first_failure(&self) -> Option<String> {
        self.failures
            .first()
            .map(|(path, err)| format!("{}: {err}", path.display()))
    }
}

/// Owner the artifacts should end up with: the configured override, else
/// the real uid/gid of this process.
#[cfg(unix)]
pub fn target_ownership(config: &ArtifactConfig) -> Ownership {
    use nix::unistd::{getgid, getuid};

    Ownership {
        uid: config.uid.unwrap_or_else(|| getuid().as_raw()),
        gid: config.gid.unwrap_or_else(|| getgid().as_raw()),
    }
}

#[cfg(not(unix))]
pub fn target_ownership(config: &ArtifactConfig) -> Ownership {
    Ownership {
        uid: config.uid.unwrap_or(0),
        gid: config.gid.unwrap_or(0),
    }
}

/// Re-own everything under `root` (root included). Symlinks are re-owned
/// themselves, never followed.
#[cfg(unix)]
pub fn normalize_ownership(root: &Path, owner: Ownership) -> NormalizeReport {
    use std::os::unix::fs::{lchown, MetadataExt};

    let mut report = NormalizeReport::default();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                report.failures.push((path, e.to_string()));
                continue;
            }
        };
        report.visited += 1;
        let meta = match entry.path().symlink_metadata() {
            Ok(meta) => meta,
            Err(e) => {
                report.failures.push((entry.path().to_path_buf(), e.to_string()));
                continue;
            }
        };
        if meta.uid() == owner.uid && meta.gid() == owner.gid {
            continue;
        }
        match lchown(entry.path(), Some(owner.uid), Some(owner.gid)) {
            Ok(()) => report.changed += 1,
            Err(e) => report.failures.push((entry.path().to_path_buf(), e.to_string())),
        }
    }
    report
}

#[cfg(not(unix))]
pub fn normalize_ownership(root: &Path, _owner: Ownership) -> NormalizeReport {
    NormalizeReport {
        visited: WalkDir::new(root).into_iter().filter_map(|e| e.ok()).count(),
        ..NormalizeReport::default()
    }
}
