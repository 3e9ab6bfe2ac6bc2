mod fs_daemon;
mod write_buffer;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Args, Parser, Subcommand};
use cowfs_engine::{Backend, GcOptions, RestoreTarget, DEFAULT_SAFETY_WINDOW_SECS};
use cowfs_lib::{CowFsError, CowFsResult, DigestAlgo};
use log::error;
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;

use crate::fs_daemon::{run_mount, MountRunOptions};

#[cfg(test)]
mod fs_daemon_tests;

/// COWFS, a copy-on-write versioning filesystem.
#[derive(Parser, Debug)]
#[command(name = "cowfs", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Storage backend directory (falls back to COWFS_STORAGE).
    #[arg(long, short = 's')]
    storage: Option<PathBuf>,

    /// Machine-readable JSON output.
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mount the filesystem.
    Mount {
        /// Storage backend directory (initialized when empty or absent).
        storage_dir: PathBuf,
        /// Directory to mount at.
        mount_point: PathBuf,
        /// Digest algorithm for a new backend; must match an existing one.
        #[arg(long)]
        digest_algo: Option<String>,
        /// Enable debug logging.
        #[arg(long)]
        debug: bool,
    },
    /// Unmount the filesystem.
    Umount { mount_point: PathBuf },
    /// Show the version history of a file.
    History {
        path: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Restore a file to a previous version.
    Restore {
        path: String,
        /// 1-based version number.
        #[arg(long, short = 'v')]
        version: Option<usize>,
        /// Restore the newest version before this timestamp
        /// (e.g. "2026-02-23 10:02:00").
        #[arg(long)]
        before: Option<String>,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Manage filesystem snapshots.
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    /// Collect unreferenced objects from storage.
    Gc {
        /// Soft-delete all but the newest N versions of each file first.
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
        keep_last: Option<u32>,
        /// Soft-delete non-current versions older than this timestamp first.
        #[arg(long)]
        before: Option<String>,
        /// Minimum age in seconds before an orphan may be reclaimed.
        #[arg(long, default_value_t = DEFAULT_SAFETY_WINDOW_SECS)]
        safety_window: u64,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Show storage statistics.
    Stats {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Show the differences between two versions of a file.
    Diff {
        path: String,
        /// First version number (1-based).
        #[arg(long)]
        v1: Option<usize>,
        /// Second version number (1-based).
        #[arg(long)]
        v2: Option<usize>,
        /// Diff the current version against this version number.
        #[arg(long)]
        version: Option<usize>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Show the chronological activity feed.
    Log {
        #[arg(long, short = 'n', default_value_t = 50)]
        limit: u32,
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Create a named snapshot of every live file's current version.
    Create {
        name: String,
        #[arg(long)]
        description: Option<String>,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// List snapshots.
    List {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Show the files captured in a snapshot.
    Show {
        name: String,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Restore the filesystem to a snapshot's state.
    Restore {
        name: String,
        /// Keep files created after the snapshot instead of soft-deleting them.
        #[arg(long)]
        keep_new: bool,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Delete a snapshot (objects are reclaimed later by gc).
    Delete {
        name: String,
        #[command(flatten)]
        common: CommonArgs,
    },
}

fn main() {
    let cli = Cli::parse();

    let mut builder = env_logger::Builder::from_default_env();
    if matches!(&cli.command, Command::Mount { debug: true, .. }) {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();

    if let Err(err) = run(cli.command) {
        error!("command failed: {}", err);
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn run(command: Command) -> CowFsResult<()> {
    match command {
        Command::Mount {
            storage_dir,
            mount_point,
            digest_algo,
            debug: _,
        } => {
            let digest_algo = digest_algo
                .as_deref()
                .map(DigestAlgo::from_name)
                .transpose()?;
            run_mount(MountRunOptions {
                storage_dir,
                mountpoint: mount_point,
                digest_algo,
            })
        }
        Command::Umount { mount_point } => cmd_umount(&mount_point),
        Command::History { path, common } => cmd_history(&path, &common),
        Command::Restore {
            path,
            version,
            before,
            dry_run,
            common,
        } => cmd_restore(&path, version, before.as_deref(), dry_run, &common),
        Command::Snapshot(sub) => match sub {
            SnapshotCommand::Create {
                name,
                description,
                common,
            } => cmd_snapshot_create(&name, description.as_deref(), &common),
            SnapshotCommand::List { common } => cmd_snapshot_list(&common),
            SnapshotCommand::Show { name, common } => cmd_snapshot_show(&name, &common),
            SnapshotCommand::Restore {
                name,
                keep_new,
                dry_run,
                common,
            } => cmd_snapshot_restore(&name, keep_new, dry_run, &common),
            SnapshotCommand::Delete { name, common } => cmd_snapshot_delete(&name, &common),
        },
        Command::Gc {
            keep_last,
            before,
            safety_window,
            dry_run,
            common,
        } => cmd_gc(keep_last, before.as_deref(), safety_window, dry_run, &common),
        Command::Stats { common } => cmd_stats(&common),
        Command::Diff {
            path,
            v1,
            v2,
            version,
            common,
        } => cmd_diff(&path, v1, v2, version, &common),
        Command::Log { limit, common } => cmd_log(limit, &common),
    }
}

// ──────────────────────────── commands ────────────────────────────

fn cmd_umount(mount_point: &Path) -> CowFsResult<()> {
    for tool in ["fusermount3", "fusermount"] {
        match std::process::Command::new(tool)
            .arg("-u")
            .arg(mount_point)
            .output()
        {
            Ok(output) if output.status.success() => {
                println!("unmounted: {}", mount_point.display());
                return Ok(());
            }
            Ok(output) => {
                return Err(CowFsError::IoError(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(CowFsError::InvalidState(
        "fusermount not found; is FUSE installed?".to_string(),
    ))
}

fn cmd_history(path: &str, common: &CommonArgs) -> CowFsResult<()> {
    let (_runtime, backend) = open_backend(common)?;
    let entries = cowfs_engine::history(&backend, path)?;

    if common.json {
        let data: Vec<_> = entries
            .iter()
            .map(|e| {
                json!({
                    "version": e.version,
                    "id": e.id,
                    "date": format_timestamp(e.created_at),
                    "size": e.size_bytes,
                    "digest": e.digest,
                    "current": e.current,
                })
            })
            .collect();
        return print_json(&data);
    }

    println!("Version history: {}", cowfs_lib::normalize_path(path));
    for e in &entries {
        let marker = if e.current { " *" } else { "" };
        println!(
            "  {:>3}{:<2} {}  {:>10}  {}...",
            e.version,
            marker,
            format_timestamp(e.created_at),
            human_size(e.size_bytes),
            &e.digest[..12]
        );
    }
    Ok(())
}

fn cmd_restore(
    path: &str,
    version: Option<usize>,
    before: Option<&str>,
    dry_run: bool,
    common: &CommonArgs,
) -> CowFsResult<()> {
    let target = match (version, before) {
        (Some(n), None) => RestoreTarget::Version(n),
        (None, Some(ts)) => RestoreTarget::Before(parse_timestamp(ts)?),
        _ => {
            return Err(CowFsError::InvalidParam(
                "provide exactly one of --version or --before".to_string(),
            ))
        }
    };

    let (_runtime, backend) = open_backend(common)?;
    let report = cowfs_engine::restore(&backend, path, target, dry_run)?;

    if common.json {
        return print_json(&report);
    }
    let action = if dry_run { "Would restore" } else { "Restored" };
    println!(
        "{} {} to version {} (digest={}..., size={})",
        action,
        report.path,
        report.restored_from_version,
        &report.target_digest[..12],
        human_size(report.target_size)
    );
    Ok(())
}

fn cmd_snapshot_create(name: &str, description: Option<&str>, common: &CommonArgs) -> CowFsResult<()> {
    let (_runtime, backend) = open_backend(common)?;
    let info = cowfs_engine::snapshot_create(&backend, name, description)?;
    if common.json {
        return print_json(&info);
    }
    println!("Created snapshot {} with {} file(s)", info.name, info.file_count);
    Ok(())
}

fn cmd_snapshot_list(common: &CommonArgs) -> CowFsResult<()> {
    let (_runtime, backend) = open_backend(common)?;
    let snapshots = cowfs_engine::snapshot_list(&backend)?;
    if common.json {
        return print_json(&snapshots);
    }
    println!("{:<20} {:<20} {:>6}  {}", "NAME", "CREATED", "FILES", "DESCRIPTION");
    for s in &snapshots {
        println!(
            "{:<20} {:<20} {:>6}  {}",
            s.name,
            format_timestamp(s.created_at),
            s.file_count,
            s.description.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn cmd_snapshot_show(name: &str, common: &CommonArgs) -> CowFsResult<()> {
    let (_runtime, backend) = open_backend(common)?;
    let entries = cowfs_engine::snapshot_show(&backend, name)?;
    if common.json {
        return print_json(&entries);
    }
    println!("Snapshot: {}", name);
    for e in &entries {
        println!(
            "  {:<40} v{:<5} {:>10}  {}...",
            e.path,
            e.version_id,
            human_size(e.size_bytes),
            &e.digest[..12]
        );
    }
    Ok(())
}

fn cmd_snapshot_restore(
    name: &str,
    keep_new: bool,
    dry_run: bool,
    common: &CommonArgs,
) -> CowFsResult<()> {
    let (_runtime, backend) = open_backend(common)?;
    let report = cowfs_engine::snapshot_restore(&backend, name, keep_new, dry_run)?;
    if common.json {
        return print_json(&report);
    }
    let action = if dry_run { "Would restore" } else { "Restored" };
    println!(
        "{} snapshot {}: restored {}, soft-deleted {}",
        action, report.snapshot, report.files_restored, report.files_soft_deleted
    );
    Ok(())
}

fn cmd_snapshot_delete(name: &str, common: &CommonArgs) -> CowFsResult<()> {
    let (_runtime, backend) = open_backend(common)?;
    cowfs_engine::snapshot_delete(&backend, name)?;
    if common.json {
        return print_json(&json!({ "deleted": true, "name": name }));
    }
    println!("Deleted snapshot {}", name);
    Ok(())
}

fn cmd_gc(
    keep_last: Option<u32>,
    before: Option<&str>,
    safety_window: u64,
    dry_run: bool,
    common: &CommonArgs,
) -> CowFsResult<()> {
    let options = GcOptions {
        keep_last,
        before: before.map(parse_timestamp).transpose()?,
        dry_run,
        safety_window_secs: safety_window,
    };
    let (runtime, backend) = open_backend(common)?;
    let report = runtime.block_on(cowfs_engine::collect(&backend, &options))?;

    if common.json {
        return print_json(&report);
    }
    let action = if dry_run { "Would collect" } else { "Collected" };
    println!(
        "{} {} orphaned object(s), reclaimed {}",
        action,
        report.processed_objects,
        human_size(report.reclaimed_bytes)
    );
    if report.versions_pruned > 0 {
        println!(
            "Pruned {} old version(s) (logical {})",
            report.versions_pruned,
            human_size(report.versions_pruned_bytes)
        );
    }
    if report.missing_on_disk > 0 {
        println!("Warning: {} object(s) missing on disk", report.missing_on_disk);
    }
    if report.skipped_referenced > 0 {
        println!(
            "Warning: skipped {} object(s) that regained references",
            report.skipped_referenced
        );
    }
    Ok(())
}

fn cmd_stats(common: &CommonArgs) -> CowFsResult<()> {
    let (_runtime, backend) = open_backend(common)?;
    let report = cowfs_engine::stats(&backend)?;
    if common.json {
        return print_json(&report);
    }
    println!("COWFS storage statistics");
    println!("  Format version:   {}", report.format_version);
    println!("  Digest algorithm: {}", report.digest_algo);
    println!("  Logical size:     {}", human_size(report.logical_size_bytes));
    println!("  Actual size:      {}", human_size(report.actual_size_bytes));
    println!(
        "  Dedup savings:    {} ({:.1}%)",
        human_size(report.dedup_savings_bytes.max(0) as u64),
        report.dedup_percentage
    );
    println!("  Total files:      {}", report.total_files);
    println!("  Total versions:   {}", report.total_versions);
    println!("  Total objects:    {}", report.total_objects);
    println!("  Orphaned objects: {}", report.orphaned_objects);
    Ok(())
}

#[derive(Serialize)]
struct BinaryDiffReport {
    path: String,
    mode: &'static str,
    left_version: usize,
    right_version: usize,
    left_size: usize,
    right_size: usize,
    size_delta: i64,
    same_content: bool,
}

fn cmd_diff(
    path: &str,
    v1: Option<usize>,
    v2: Option<usize>,
    version: Option<usize>,
    common: &CommonArgs,
) -> CowFsResult<()> {
    let by_pair = v1.is_some() || v2.is_some();
    let by_current = version.is_some();
    if by_pair == by_current {
        return Err(CowFsError::InvalidParam(
            "use either (--v1 and --v2) or --version".to_string(),
        ));
    }
    if by_pair && (v1.is_none() || v2.is_none()) {
        return Err(CowFsError::InvalidParam(
            "both --v1 and --v2 are required together".to_string(),
        ));
    }

    let (runtime, backend) = open_backend(common)?;
    let normalized = cowfs_lib::normalize_path(path);
    let file = backend.resolve_file(&normalized, true)?;
    let versions = backend.meta.list_versions(file.id)?;
    if versions.is_empty() {
        return Err(CowFsError::NotFound(format!(
            "no versions available for {}",
            normalized
        )));
    }

    let (left_num, right_num) = if by_current {
        (versions.len(), version.unwrap_or(1))
    } else {
        (v1.unwrap_or(1), v2.unwrap_or(1))
    };
    for n in [left_num, right_num] {
        if n < 1 || n > versions.len() {
            return Err(CowFsError::InvalidParam(format!(
                "version {} out of range (1..{})",
                n,
                versions.len()
            )));
        }
    }

    let left = &versions[left_num - 1];
    let right = &versions[right_num - 1];
    let left_data = runtime.block_on(backend.store.get(&left.object_digest))?;
    let right_data = runtime.block_on(backend.store.get(&right.object_digest))?;

    let (left_text, right_text) = match (as_text(&left_data), as_text(&right_data)) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            let report = BinaryDiffReport {
                path: normalized,
                mode: "binary",
                left_version: left_num,
                right_version: right_num,
                left_size: left_data.len(),
                right_size: right_data.len(),
                size_delta: right_data.len() as i64 - left_data.len() as i64,
                same_content: left.object_digest == right.object_digest,
            };
            if common.json {
                return print_json(&report);
            }
            println!(
                "Binary diff {} (v{} -> v{}): {} -> {} (delta {} B)",
                report.path,
                left_num,
                right_num,
                human_size(report.left_size as u64),
                human_size(report.right_size as u64),
                report.size_delta
            );
            return Ok(());
        }
    };

    let diff = similar::TextDiff::from_lines(left_text, right_text);
    let unified = diff
        .unified_diff()
        .header(
            &format!("{}@v{}", normalized, left_num),
            &format!("{}@v{}", normalized, right_num),
        )
        .to_string();

    if common.json {
        let lines: Vec<&str> = unified.lines().collect();
        return print_json(&json!({
            "path": normalized,
            "mode": "text",
            "left_version": left_num,
            "right_version": right_num,
            "diff": lines,
        }));
    }
    if unified.is_empty() {
        println!("No differences for {} (v{} vs v{})", normalized, left_num, right_num);
    } else {
        print!("{}", unified);
    }
    Ok(())
}

fn cmd_log(limit: u32, common: &CommonArgs) -> CowFsResult<()> {
    let (_runtime, backend) = open_backend(common)?;
    let events = backend.meta.list_events(limit)?;
    if common.json {
        let data: Vec<_> = events
            .iter()
            .map(|e| {
                json!({
                    "time": format_timestamp(e.created_at),
                    "action": e.action,
                    "path": e.path,
                    "version_id": e.version_id,
                    "digest": e.object_digest,
                })
            })
            .collect();
        return print_json(&data);
    }

    println!("Activity log (last {})", events.len());
    for e in &events {
        let digest = e
            .object_digest
            .as_deref()
            .map(|d| format!("{}...", &d[..12.min(d.len())]))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {:<17} {:<32} {:<6} {}",
            format_timestamp(e.created_at),
            e.action,
            e.path.as_deref().unwrap_or("-"),
            e.version_id.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string()),
            digest
        );
    }
    Ok(())
}

// ──────────────────────────── helpers ────────────────────────────

fn resolve_storage(storage: &Option<PathBuf>) -> CowFsResult<PathBuf> {
    if let Some(dir) = storage {
        return Ok(dir.clone());
    }
    if let Ok(env) = std::env::var("COWFS_STORAGE") {
        if !env.is_empty() {
            return Ok(PathBuf::from(env));
        }
    }
    Err(CowFsError::InvalidParam(
        "no storage directory given; use --storage or set COWFS_STORAGE".to_string(),
    ))
}

fn open_backend(common: &CommonArgs) -> CowFsResult<(Runtime, Backend)> {
    let root = resolve_storage(&common.storage)?;
    let runtime = Runtime::new()
        .map_err(|e| CowFsError::InvalidState(format!("create runtime failed: {}", e)))?;
    let backend = runtime.block_on(Backend::open(&root))?;
    Ok((runtime, backend))
}

fn print_json<T: Serialize>(value: &T) -> CowFsResult<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|e| CowFsError::InvalidState(e.to_string()))?;
    println!("{}", rendered);
    Ok(())
}

fn parse_timestamp(value: &str) -> CowFsResult<i64> {
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp());
        }
    }
    Err(CowFsError::InvalidParam(format!(
        "invalid timestamp '{}'; use e.g. 2026-02-23T10:02:00",
        value
    )))
}

fn format_timestamp(ts: i64) -> String {
    DateTime::<Utc>::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn as_text(data: &[u8]) -> Option<&str> {
    if data.contains(&0) {
        return None;
    }
    std::str::from_utf8(data).ok()
}

fn human_size(size_bytes: u64) -> String {
    if size_bytes == 0 {
        return "0 B".to_string();
    }
    let mut size = size_bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return if unit == "B" {
                format!("{} B", size_bytes)
            } else {
                format!("{:.1} {}", size, unit)
            };
        }
        size /= 1024.0;
    }
    format!("{:.1} PB", size)
}
