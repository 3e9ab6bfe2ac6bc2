use crate::{now_unix, CowFsError, CowFsResult, DigestAlgo};
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const MARKER_FILE_NAME: &str = ".cowfs";
pub const LOCK_FILE_NAME: &str = ".cowfs.lock";
pub const METADATA_DB_NAME: &str = "metadata.db";
pub const OBJECTS_DIR_NAME: &str = "objects";

/// Highest backend format version this build understands.
pub const FORMAT_VERSION: u32 = 1;

/// Small structured document at the backend root that identifies a directory
/// as a COWFS backend and fixes the digest algorithm for its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMarker {
    pub format_version: u32,
    pub digest_algo: DigestAlgo,
    pub created_at: i64,
}

impl BackendMarker {
    pub fn new(digest_algo: DigestAlgo) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            digest_algo,
            created_at: now_unix(),
        }
    }

    pub fn exists(root: &Path) -> bool {
        root.join(MARKER_FILE_NAME).exists()
    }

    pub fn load(root: &Path) -> CowFsResult<Self> {
        let marker_path = root.join(MARKER_FILE_NAME);
        let content = std::fs::read_to_string(&marker_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CowFsError::NotFound(format!(
                    "{} is not a COWFS backend (missing {})",
                    root.display(),
                    MARKER_FILE_NAME
                ))
            } else {
                CowFsError::IoError(format!("read {} failed: {}", marker_path.display(), e))
            }
        })?;
        let marker: BackendMarker = serde_json::from_str(&content).map_err(|e| {
            CowFsError::Corruption(format!("parse {} failed: {}", marker_path.display(), e))
        })?;
        marker.ensure_supported()?;
        Ok(marker)
    }

    pub fn save(&self, root: &Path) -> CowFsResult<()> {
        let marker_path = root.join(MARKER_FILE_NAME);
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| CowFsError::InvalidState(e.to_string()))?;
        std::fs::write(&marker_path, content)
            .map_err(|e| CowFsError::IoError(format!("write {} failed: {}", marker_path.display(), e)))
    }

    pub fn ensure_supported(&self) -> CowFsResult<()> {
        if self.format_version > FORMAT_VERSION {
            return Err(CowFsError::InvalidState(format!(
                "unsupported backend format version {}",
                self.format_version
            )));
        }
        Ok(())
    }
}
