use crate::Backend;
use cowfs_lib::CowFsResult;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct StatsReport {
    pub format_version: u32,
    pub digest_algo: String,
    pub logical_size_bytes: u64,
    pub actual_size_bytes: u64,
    pub dedup_savings_bytes: i64,
    pub dedup_percentage: f64,
    pub total_files: i64,
    pub total_versions: i64,
    pub total_objects: i64,
    pub orphaned_objects: i64,
}

pub fn stats(backend: &Backend) -> CowFsResult<StatsReport> {
    let fs = backend.meta.stats()?;
    let dedup_savings_bytes = fs.logical_size_bytes as i64 - fs.actual_size_bytes as i64;
    let dedup_percentage = if fs.logical_size_bytes > 0 {
        dedup_savings_bytes as f64 / fs.logical_size_bytes as f64 * 100.0
    } else {
        0.0
    };
    Ok(StatsReport {
        format_version: backend.marker.format_version,
        digest_algo: backend.marker.digest_algo.name().to_string(),
        logical_size_bytes: fs.logical_size_bytes,
        actual_size_bytes: fs.actual_size_bytes,
        dedup_savings_bytes,
        dedup_percentage,
        total_files: fs.total_files,
        total_versions: fs.total_versions,
        total_objects: fs.total_objects,
        orphaned_objects: fs.orphaned_objects,
    })
}
