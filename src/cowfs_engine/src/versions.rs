use crate::Backend;
use cowfs_lib::{normalize_path, CowFsError, CowFsResult};
use serde::Serialize;

/// One entry of a file's version history. Version numbers are 1-based and
/// follow the chain's chronological order.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub version: usize,
    pub id: i64,
    pub created_at: i64,
    pub size_bytes: u64,
    pub digest: String,
    pub current: bool,
}

pub fn history(backend: &Backend, path: &str) -> CowFsResult<Vec<HistoryEntry>> {
    let file = backend.resolve_file(path, false)?;
    let versions = backend.meta.list_versions(file.id)?;
    Ok(versions
        .into_iter()
        .enumerate()
        .map(|(idx, v)| HistoryEntry {
            version: idx + 1,
            id: v.id,
            created_at: v.created_at,
            size_bytes: v.size_bytes,
            digest: v.object_digest,
            current: file.current_version_id == Some(v.id),
        })
        .collect())
}

#[derive(Debug, Clone, Copy)]
pub enum RestoreTarget {
    /// 1-based index into the file's live version chain.
    Version(usize),
    /// Newest version created strictly before this unix timestamp.
    Before(i64),
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub path: String,
    pub restored_from_version: usize,
    pub target_digest: String,
    pub target_size: u64,
    pub dry_run: bool,
}

/// Restore a file (soft-deleted or live) to an earlier version. Appends a
/// new version citing the target's object; history is never rewritten.
pub fn restore(
    backend: &Backend,
    path: &str,
    target: RestoreTarget,
    dry_run: bool,
) -> CowFsResult<RestoreReport> {
    let normalized = normalize_path(path);
    let file = backend.resolve_file(&normalized, true)?;
    let versions = backend.meta.list_versions(file.id)?;
    if versions.is_empty() {
        return Err(CowFsError::NotFound(format!(
            "no versions available for {}",
            normalized
        )));
    }

    let (target_version, version_number) = match target {
        RestoreTarget::Version(n) => {
            if n < 1 || n > versions.len() {
                return Err(CowFsError::InvalidParam(format!(
                    "version {} out of range (1..{})",
                    n,
                    versions.len()
                )));
            }
            (versions[n - 1].clone(), n)
        }
        RestoreTarget::Before(ts) => {
            let hit = backend
                .meta
                .version_before(file.id, ts)?
                .ok_or_else(|| {
                    CowFsError::NotFound(format!("no version of {} before {}", normalized, ts))
                })?;
            let number = versions
                .iter()
                .position(|v| v.id == hit.id)
                .map(|idx| idx + 1)
                .ok_or_else(|| {
                    CowFsError::Corruption(format!(
                        "version {} missing from chain of {}",
                        hit.id, normalized
                    ))
                })?;
            (hit, number)
        }
    };

    if !dry_run {
        backend.meta.restore_version(file.id, target_version.id)?;
    }

    Ok(RestoreReport {
        path: normalized,
        restored_from_version: version_number,
        target_digest: target_version.object_digest,
        target_size: target_version.size_bytes,
        dry_run,
    })
}
