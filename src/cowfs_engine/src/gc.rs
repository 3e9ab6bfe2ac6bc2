use crate::Backend;
use cowfs_lib::{now_unix, CowFsError, CowFsResult};
use fs_meta::VersionRecord;
use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;

/// Minimum age an unreferenced object must reach before GC may delete it.
/// Guards the window between a blob reaching disk and its version row
/// committing.
pub const DEFAULT_SAFETY_WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct GcOptions {
    /// Soft-delete all but the newest N versions of every file first.
    pub keep_last: Option<u32>,
    /// Soft-delete non-current versions older than this unix timestamp first.
    pub before: Option<i64>,
    pub dry_run: bool,
    pub safety_window_secs: u64,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            keep_last: None,
            before: None,
            dry_run: false,
            safety_window_secs: DEFAULT_SAFETY_WINDOW_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcReport {
    pub dry_run: bool,
    pub versions_pruned: usize,
    pub versions_pruned_bytes: u64,
    pub orphaned_objects: usize,
    pub processed_objects: usize,
    pub reclaimed_bytes: u64,
    pub missing_on_disk: usize,
    pub skipped_referenced: usize,
}

/// Collect unreferenced objects, optionally pruning old versions first. The
/// prune pass is one transaction; each orphaned digest is then reclaimed in
/// its own bounded transaction so one failure cannot abort the sweep.
pub async fn collect(backend: &Backend, options: &GcOptions) -> CowFsResult<GcReport> {
    if options.keep_last.is_some() && options.before.is_some() {
        return Err(CowFsError::InvalidParam(
            "use either keep_last or before, not both".to_string(),
        ));
    }

    let mut report = GcReport {
        dry_run: options.dry_run,
        ..Default::default()
    };

    let pruned: Vec<VersionRecord> = if let Some(keep_last) = options.keep_last {
        if options.dry_run {
            backend.meta.list_prunable_keep_last(keep_last)?
        } else {
            backend.meta.prune_keep_last(keep_last)?
        }
    } else if let Some(before) = options.before {
        if options.dry_run {
            backend.meta.list_prunable_before(before)?
        } else {
            backend.meta.prune_before(before)?
        }
    } else {
        Vec::new()
    };
    report.versions_pruned = pruned.len();
    report.versions_pruned_bytes = pruned.iter().map(|v| v.size_bytes).sum();

    let cutoff = now_unix() - options.safety_window_secs as i64;
    let orphans = backend.meta.orphaned_objects(cutoff)?;
    report.orphaned_objects = orphans.len();

    if options.dry_run {
        // Project the post-prune orphan set without touching anything: the
        // listed-but-not-applied decrements may push more objects to zero.
        let mut projected: HashMap<String, u64> = orphans
            .iter()
            .map(|o| (o.digest.clone(), o.size_bytes))
            .collect();
        let mut decrements: HashMap<&str, i64> = HashMap::new();
        for row in &pruned {
            *decrements.entry(row.object_digest.as_str()).or_insert(0) += 1;
        }
        for (digest, dec) in decrements {
            if projected.contains_key(digest) {
                continue;
            }
            if let Some(obj) = backend.meta.get_object(digest)? {
                if obj.ref_count - dec <= 0 && obj.created_at <= cutoff {
                    projected.insert(obj.digest, obj.size_bytes);
                }
            }
        }
        report.processed_objects = projected.len();
        report.reclaimed_bytes = projected.values().sum();
        return Ok(report);
    }

    for obj in orphans {
        // Re-checked inside the delete: a reference added since the scan
        // leaves the row alone.
        match backend.meta.delete_object_record(&obj.digest) {
            Ok(true) => {
                let freed = match backend.store.delete(&obj.digest).await {
                    Ok(freed) => freed,
                    Err(err) => {
                        warn!("gc: unlink blob {} failed: {}", obj.digest, err);
                        continue;
                    }
                };
                if freed == 0 {
                    report.missing_on_disk += 1;
                }
                report.reclaimed_bytes += freed;
                report.processed_objects += 1;
                debug!("gc: reclaimed {} ({} bytes)", obj.digest, freed);
            }
            Ok(false) => {
                report.skipped_referenced += 1;
            }
            Err(err) => {
                warn!("gc: delete object row {} failed: {}", obj.digest, err);
            }
        }
    }

    Ok(report)
}
