use cowfs_lib::{
    normalize_path, BackendMarker, CowFsError, CowFsResult, DigestAlgo, METADATA_DB_NAME,
    OBJECTS_DIR_NAME,
};
use fs_meta::{FileRecord, MetaDb};
use log::info;
use object_store::ObjectStore;
use std::path::{Path, PathBuf};

/// One opened storage backend: the format marker, the metadata index and the
/// object store rooted at a single directory. Both the mounted handler and
/// the offline engine commands go through this.
#[derive(Debug)]
pub struct Backend {
    pub root: PathBuf,
    pub marker: BackendMarker,
    pub meta: MetaDb,
    pub store: ObjectStore,
}

impl Backend {
    /// Initialize a fresh backend directory: marker, objects dir, metadata
    /// database, and the well-known empty object.
    pub async fn init(root: &Path, algo: DigestAlgo) -> CowFsResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| CowFsError::IoError(format!("create backend dir failed: {}", e)))?;
        let marker = BackendMarker::new(algo);
        marker.save(root)?;
        info!("initialized COWFS backend at {} ({})", root.display(), algo.name());
        Self::open_parts(root, marker).await
    }

    /// Open an existing backend. Refuses a directory without a format marker
    /// or with an unsupported format version.
    pub async fn open(root: &Path) -> CowFsResult<Self> {
        let marker = BackendMarker::load(root)?;
        Self::open_parts(root, marker).await
    }

    /// Open when the marker is present, initialize when the directory is
    /// absent or empty, refuse anything else. `algo` must match an existing
    /// backend's recorded algorithm; it defaults to sha256 for a new one.
    pub async fn open_or_init(root: &Path, algo: Option<DigestAlgo>) -> CowFsResult<Self> {
        if BackendMarker::exists(root) {
            let backend = Self::open(root).await?;
            if let Some(requested) = algo {
                if requested != backend.marker.digest_algo {
                    return Err(CowFsError::InvalidParam(format!(
                        "backend uses {}, cannot switch to {}",
                        backend.marker.digest_algo.name(),
                        requested.name()
                    )));
                }
            }
            return Ok(backend);
        }

        let is_empty = match std::fs::read_dir(root) {
            Ok(mut entries) => entries.next().is_none(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => return Err(CowFsError::IoError(err.to_string())),
        };
        if !is_empty {
            return Err(CowFsError::InvalidState(format!(
                "{} is not a COWFS backend",
                root.display()
            )));
        }
        Self::init(root, algo.unwrap_or_default()).await
    }

    async fn open_parts(root: &Path, marker: BackendMarker) -> CowFsResult<Self> {
        let store = ObjectStore::new(root.join(OBJECTS_DIR_NAME), marker.digest_algo);
        store.init().await?;
        // The empty object must always exist so a freshly created file's
        // version is readable.
        store.put(&[]).await?;
        let meta = MetaDb::open(&root.join(METADATA_DB_NAME))?;
        Ok(Self {
            root: root.to_path_buf(),
            marker,
            meta,
            store,
        })
    }

    /// Resolve a user-supplied path to its file record.
    pub fn resolve_file(&self, path: &str, include_deleted: bool) -> CowFsResult<FileRecord> {
        let normalized = normalize_path(path);
        self.meta
            .get_file_by_path(&normalized, include_deleted)?
            .ok_or_else(|| CowFsError::NotFound(format!("file not found: {}", normalized)))
    }
}
