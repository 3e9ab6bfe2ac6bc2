use crate::Backend;
use cowfs_lib::{CowFsError, CowFsResult};
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub file_count: i64,
}

pub fn snapshot_create(
    backend: &Backend,
    name: &str,
    description: Option<&str>,
) -> CowFsResult<SnapshotInfo> {
    let (snapshot, file_count) = backend.meta.snapshot_create(name, description)?;
    Ok(SnapshotInfo {
        id: snapshot.id,
        name: snapshot.name,
        description: snapshot.description,
        created_at: snapshot.created_at,
        file_count,
    })
}

pub fn snapshot_list(backend: &Backend) -> CowFsResult<Vec<SnapshotInfo>> {
    Ok(backend
        .meta
        .list_snapshots()?
        .into_iter()
        .map(|entry| SnapshotInfo {
            id: entry.snapshot.id,
            name: entry.snapshot.name,
            description: entry.snapshot.description,
            created_at: entry.snapshot.created_at,
            file_count: entry.file_count,
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotFileEntry {
    pub path: String,
    pub version_id: i64,
    pub digest: String,
    pub size_bytes: u64,
    pub created_at: i64,
}

pub fn snapshot_show(backend: &Backend, name: &str) -> CowFsResult<Vec<SnapshotFileEntry>> {
    let snapshot = require_snapshot(backend, name)?;
    Ok(backend
        .meta
        .snapshot_entries_detailed(snapshot.id)?
        .into_iter()
        .map(|e| SnapshotFileEntry {
            path: e.path,
            version_id: e.version_id,
            digest: e.object_digest,
            size_bytes: e.size_bytes,
            created_at: e.created_at,
        })
        .collect())
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotRestoreReport {
    pub snapshot: String,
    pub dry_run: bool,
    pub keep_new: bool,
    pub files_in_snapshot: usize,
    pub files_restored: usize,
    pub files_soft_deleted: usize,
    pub skipped_missing_versions: usize,
}

/// Return the tree to its snapshot-time state. Files created after the
/// snapshot are soft-deleted unless `keep_new`; snapshot-time files get a
/// fresh version citing the recorded object, resurrecting them if needed.
pub fn snapshot_restore(
    backend: &Backend,
    name: &str,
    keep_new: bool,
    dry_run: bool,
) -> CowFsResult<SnapshotRestoreReport> {
    let snapshot = require_snapshot(backend, name)?;

    if dry_run {
        let entries = backend.meta.snapshot_entries(snapshot.id)?;
        let snapshot_file_ids: HashSet<i64> = entries.iter().map(|e| e.file_id).collect();
        let files_soft_deleted = if keep_new {
            0
        } else {
            backend
                .meta
                .list_active_file_ids()?
                .into_iter()
                .filter(|id| !snapshot_file_ids.contains(id))
                .count()
        };
        return Ok(SnapshotRestoreReport {
            snapshot: snapshot.name,
            dry_run,
            keep_new,
            files_in_snapshot: entries.len(),
            files_restored: entries.len(),
            files_soft_deleted,
            skipped_missing_versions: 0,
        });
    }

    let stats = backend.meta.snapshot_restore(snapshot.id, keep_new)?;
    Ok(SnapshotRestoreReport {
        snapshot: snapshot.name,
        dry_run,
        keep_new,
        files_in_snapshot: stats.files_in_snapshot,
        files_restored: stats.files_restored,
        files_soft_deleted: stats.files_soft_deleted,
        skipped_missing_versions: stats.skipped_missing_versions,
    })
}

pub fn snapshot_delete(backend: &Backend, name: &str) -> CowFsResult<()> {
    let snapshot = require_snapshot(backend, name)?;
    backend.meta.snapshot_delete(snapshot.id)
}

fn require_snapshot(backend: &Backend, name: &str) -> CowFsResult<fs_meta::SnapshotRecord> {
    backend
        .meta
        .get_snapshot_by_name(name)?
        .ok_or_else(|| CowFsError::NotFound(format!("snapshot not found: {}", name)))
}
