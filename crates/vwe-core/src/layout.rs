//! On-disk layout for one seed.
//!
//! ```text
//! <base>/seeds/<sha256(seed)>/
//!     raw/          collaborator save state
//!     extracted/    collaborator exports + sampling_plan.json
//!     processed/    canonical layers, validation report, metadata
//!     renders/      PNG encodings of the processed layers
//!     logs/         filtered collaborator log
//!     manifest.json
//! ```

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::manifest::Stage;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const SAMPLING_PLAN_FILE: &str = "sampling_plan.json";
pub const COLLABORATOR_LOG_FILE: &str = "collaborator.log";

/// SHA-256 hex digest of a seed string; names the seed directory.
pub fn seed_hash(seed: &str) -> String {
    hex::encode(Sha256::digest(seed.as_bytes()))
}

/// Streaming SHA-256 hex digest of a file.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Directory set for one seed under a base output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedLayout {
    root: PathBuf,
    seed_hash: String,
}

impl SeedLayout {
    pub fn new(base: &Path, seed: &str) -> Self {
        let seed_hash = seed_hash(seed);
        Self {
            root: base.join("seeds").join(&seed_hash),
            seed_hash,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn seed_hash(&self) -> &str {
        &self.seed_hash
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.as_str())
    }

    pub fn raw(&self) -> PathBuf {
        self.stage_dir(Stage::Raw)
    }

    pub fn extracted(&self) -> PathBuf {
        self.stage_dir(Stage::Extracted)
    }

    pub fn processed(&self) -> PathBuf {
        self.stage_dir(Stage::Processed)
    }

    pub fn renders(&self) -> PathBuf {
        self.stage_dir(Stage::Renders)
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn log_path(&self) -> PathBuf {
        self.logs().join(COLLABORATOR_LOG_FILE)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn plan_path(&self) -> PathBuf {
        self.extracted().join(SAMPLING_PLAN_FILE)
    }

    /// Create every directory of the layout (idempotent).
    pub fn create_dirs(&self) -> Result<()> {
        for stage in Stage::ALL {
            fs::create_dir_all(self.stage_dir(stage))?;
        }
        fs::create_dir_all(self.logs())?;
        Ok(())
    }

    /// Remove anything a previous attempt left behind, then recreate the
    /// empty layout.
    pub fn prepare_clean(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        self.create_dirs()
    }
}
