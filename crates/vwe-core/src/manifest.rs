//! Artifact manifest: append-only record of the four pipeline stages.
//!
//! Stages seal in strict order `raw -> extracted -> processed -> renders`.
//! Sealing records every regular file under the stage directory with its
//! size, production time and SHA-256. A sealed stage accepts no further
//! writes, and a terminal outcome freezes the whole manifest.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::{PipelineError, Result};
use crate::layout::{file_sha256, SeedLayout};
use crate::obs;

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Raw,
    Extracted,
    Processed,
    Renders,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Raw, Stage::Extracted, Stage::Processed, Stage::Renders];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Raw => "raw",
            Stage::Extracted => "extracted",
            Stage::Processed => "processed",
            Stage::Renders => "renders",
        }
    }

    /// Stage that must be sealed first.
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::Raw => None,
            Stage::Extracted => Some(Stage::Raw),
            Stage::Processed => Some(Stage::Extracted),
            Stage::Renders => Some(Stage::Processed),
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One produced file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the seed root, `/`-separated.
    pub path: String,
    pub size_bytes: u64,
    pub produced_at: DateTime<Utc>,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub files: Vec<FileRecord>,
    pub sealed: bool,
    pub sealed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    fn empty(stage: Stage) -> Self {
        Self {
            stage,
            files: Vec::new(),
            sealed: false,
            sealed_at: None,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.size_bytes).sum()
    }
}

/// Terminal outcome of the job that owns the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Complete,
    Failed { kind: String, detail: String },
}

/// Drift found by [`ArtifactManifest::revalidate`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revalidation {
    /// Size differs from the recorded size.
    pub truncated: Vec<String>,
    /// Modified after recording, or content digest differs.
    pub stale: Vec<String>,
    pub missing: Vec<String>,
}

impl Revalidation {
    pub fn is_clean(&self) -> bool {
        self.truncated.is_empty() && self.stale.is_empty() && self.missing.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub job_id: Uuid,
    pub seed: String,
    pub seed_hash: String,
    pub root: PathBuf,
    pub created_at: DateTime<Utc>,
    stages: Vec<StageRecord>,
    outcome: Option<Outcome>,
}

impl ArtifactManifest {
    pub fn new(job_id: Uuid, seed: &str, layout: &SeedLayout) -> Self {
        Self {
            job_id,
            seed: seed.to_string(),
            seed_hash: layout.seed_hash().to_string(),
            root: layout.root().to_path_buf(),
            created_at: Utc::now(),
            stages: Stage::ALL.iter().map(|s| StageRecord::empty(*s)).collect(),
            outcome: None,
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageRecord {
        &self.stages[stage.index()]
    }

    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    pub fn is_sealed(&self, stage: Stage) -> bool {
        self.stage(stage).sealed
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Directory for writing `stage` files. Errors once the stage is sealed
    /// or the manifest is closed.
    pub fn writable_dir(&self, stage: Stage) -> Result<PathBuf> {
        if self.is_closed() {
            return Err(PipelineError::ManifestClosed);
        }
        if self.is_sealed(stage) {
            return Err(PipelineError::StageSealed(stage));
        }
        Ok(self.root.join(stage.as_str()))
    }

    /// Seal `stage` after checking that its predecessor is sealed and every
    /// `required` file is present and non-empty.
    pub fn seal(&mut self, stage: Stage, required: &[String]) -> Result<&StageRecord> {
        let dir = self.writable_dir(stage)?;
        if let Some(requires) = stage.previous() {
            if !self.is_sealed(requires) {
                return Err(PipelineError::StageOutOfOrder { stage, requires });
            }
        }

        let missing: Vec<String> = required
            .iter()
            .filter(|name| {
                fs::metadata(dir.join(name.as_str()))
                    .map(|m| !m.is_file() || m.len() == 0)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::ArtifactMissing { stage, missing });
        }

        let files = self.scan(&dir)?;
        let record = &mut self.stages[stage.index()];
        record.files = files;
        record.sealed = true;
        record.sealed_at = Some(Utc::now());
        obs::emit_stage_sealed(stage.as_str(), record.files.len(), record.total_bytes());
        Ok(&self.stages[stage.index()])
    }

    fn scan(&self, dir: &Path) -> Result<Vec<FileRecord>> {
        let mut files = Vec::new();
        if !dir.is_dir() {
            return Ok(files);
        }
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(std::io::Error::from)?;
            files.push(FileRecord {
                path: self.relative(entry.path()),
                size_bytes: meta.len(),
                produced_at: DateTime::<Utc>::from(meta.modified()?),
                sha256: file_sha256(entry.path())?,
            });
        }
        Ok(files)
    }

    fn relative(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Compare recorded files against the filesystem.
    pub fn revalidate(&self) -> Result<Revalidation> {
        let mut report = Revalidation::default();
        for record in self.stages.iter().filter(|r| r.sealed) {
            for file in &record.files {
                let path = self.root.join(&file.path);
                let meta = match fs::metadata(&path) {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        report.missing.push(file.path.clone());
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                };
                if meta.len() != file.size_bytes {
                    report.truncated.push(file.path.clone());
                } else if DateTime::<Utc>::from(meta.modified()?) > file.produced_at
                    || file_sha256(&path)? != file.sha256
                {
                    report.stale.push(file.path.clone());
                }
            }
        }
        Ok(report)
    }

    pub fn mark_complete(&mut self) -> Result<()> {
        if self.is_closed() {
            return Err(PipelineError::ManifestClosed);
        }
        self.outcome = Some(Outcome::Complete);
        Ok(())
    }

    /// Close the manifest with a failure. Unsealed stages stay unsealed.
    pub fn mark_failed(&mut self, kind: &str, detail: &str) -> Result<()> {
        if self.is_closed() {
            return Err(PipelineError::ManifestClosed);
        }
        self.outcome = Some(Outcome::Failed {
            kind: kind.to_string(),
            detail: detail.to_string(),
        });
        Ok(())
    }

    /// Persist as pretty JSON via temp file + rename in the same directory.
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;
        let json = serde_json::to_vec_pretty(self)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&json)?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
