use cowfs_lib::{is_valid_digest, CowFsError, CowFsResult, DigestAlgo};
use log::{debug, warn};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

const BLOB_TMP_EXT: &str = "tmp";

/// Flat repository of immutable blobs addressed by the hex digest of their
/// content. Blobs are sharded by the first two hex chars of the digest, which
/// bounds any single directory's fan-out to 256.
#[derive(Debug)]
pub struct ObjectStore {
    objects_dir: PathBuf,
    algo: DigestAlgo,
}

impl ObjectStore {
    pub fn new(objects_dir: impl Into<PathBuf>, algo: DigestAlgo) -> Self {
        Self {
            objects_dir: objects_dir.into(),
            algo,
        }
    }

    pub fn algo(&self) -> DigestAlgo {
        self.algo
    }

    pub fn objects_dir(&self) -> &Path {
        &self.objects_dir
    }

    pub async fn init(&self) -> CowFsResult<()> {
        fs::create_dir_all(&self.objects_dir)
            .await
            .map_err(|e| CowFsError::IoError(format!("create objects dir failed: {}", e)))?;
        Ok(())
    }

    pub fn compute_digest(&self, data: &[u8]) -> String {
        self.algo.hex_digest(data)
    }

    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let prefix = &digest[0..2.min(digest.len())];
        self.objects_dir.join(prefix).join(&digest[2..])
    }

    fn tmp_path(&self, digest: &str) -> PathBuf {
        let final_path = self.blob_path(digest);
        final_path.with_extension(BLOB_TMP_EXT)
    }

    pub async fn exists(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    /// Store `data` as an immutable blob and return its digest. A blob that
    /// already exists for the digest is left untouched; the digest is
    /// cryptographic, so equal paths imply equal content. The blob's bytes
    /// reach stable storage before this returns.
    pub async fn put(&self, data: &[u8]) -> CowFsResult<String> {
        let digest = self.compute_digest(data);
        let blob_path = self.blob_path(&digest);
        if blob_path.exists() {
            return Ok(digest);
        }

        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!("put: create shard dir failed! {}", e);
                CowFsError::IoError(e.to_string())
            })?;
        }

        // Write to a sibling tmp file, fsync, then rename into place so a
        // crash never leaves a truncated blob at the final path.
        let tmp_path = self.tmp_path(&digest);
        let write_result: std::io::Result<()> = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            warn!("put: write blob failed! {}", err);
            return Err(CowFsError::IoError(err.to_string()));
        }
        if let Err(err) = fs::rename(&tmp_path, &blob_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            warn!("put: rename blob failed! {}", err);
            return Err(CowFsError::IoError(err.to_string()));
        }

        debug!("put: stored blob {} ({} bytes)", digest, data.len());
        Ok(digest)
    }

    pub async fn get(&self, digest: &str) -> CowFsResult<Vec<u8>> {
        let blob_path = self.blob_path(digest);
        fs::read(&blob_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CowFsError::NotFound(format!("object not found: {}", digest))
            } else {
                CowFsError::IoError(format!("read object {} failed: {}", digest, e))
            }
        })
    }

    /// Read up to `length` bytes starting at `offset`. Returns fewer bytes
    /// only when the read crosses the end of the blob.
    pub async fn get_slice(&self, digest: &str, offset: u64, length: usize) -> CowFsResult<Vec<u8>> {
        let blob_path = self.blob_path(digest);
        let mut file = OpenOptions::new()
            .read(true)
            .open(&blob_path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CowFsError::NotFound(format!("object not found: {}", digest))
                } else {
                    CowFsError::IoError(e.to_string())
                }
            })?;

        let blob_len = file
            .metadata()
            .await
            .map_err(|e| CowFsError::IoError(e.to_string()))?
            .len();
        if offset >= blob_len {
            return Ok(Vec::new());
        }
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await.map_err(|e| {
                warn!("get_slice: seek failed! {}", e);
                CowFsError::IoError(e.to_string())
            })?;
        }

        let want = length.min((blob_len - offset) as usize);
        let mut buffer = vec![0u8; want];
        file.read_exact(&mut buffer)
            .await
            .map_err(|e| CowFsError::IoError(e.to_string()))?;
        Ok(buffer)
    }

    /// Unlink the blob. Idempotent; returns bytes freed (0 when the blob was
    /// already gone). An emptied shard directory is removed opportunistically.
    pub async fn delete(&self, digest: &str) -> CowFsResult<u64> {
        if !is_valid_digest(digest) {
            return Err(CowFsError::InvalidParam(format!(
                "malformed digest: {}",
                digest
            )));
        }
        let blob_path = self.blob_path(digest);
        let size = match fs::metadata(&blob_path).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(CowFsError::IoError(err.to_string())),
        };
        if let Err(err) = fs::remove_file(&blob_path).await {
            if err.kind() == std::io::ErrorKind::NotFound {
                return Ok(0);
            }
            return Err(CowFsError::IoError(err.to_string()));
        }
        if let Some(parent) = blob_path.parent() {
            // Only succeeds while empty.
            let _ = fs::remove_dir(parent).await;
        }
        Ok(size)
    }
}
