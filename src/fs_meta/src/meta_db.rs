use cowfs_lib::{now_unix, CowFsError, CowFsResult};
use log::{debug, warn};
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, Row};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

/// The root directory's inode id. Doubles as the kernel-visible root inode.
pub const ROOT_INODE: i64 = 1;

pub const EVENT_WRITE: &str = "WRITE";
pub const EVENT_DELETE: &str = "DELETE";
pub const EVENT_RESTORE: &str = "RESTORE";
pub const EVENT_SNAPSHOT_CREATE: &str = "SNAPSHOT_CREATE";
pub const EVENT_SNAPSHOT_RESTORE: &str = "SNAPSHOT_RESTORE";
pub const EVENT_SNAPSHOT_DELETE: &str = "SNAPSHOT_DELETE";

const DEFAULT_DIR_MODE: u32 = 0o040755;

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub parent_id: i64,
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub current_version_id: Option<i64>,
    pub is_deleted: bool,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone)]
pub struct VersionRecord {
    pub id: i64,
    pub file_id: i64,
    pub object_digest: String,
    pub size_bytes: u64,
    pub created_at: i64,
    pub is_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct ObjectRecord {
    pub digest: String,
    pub size_bytes: u64,
    pub ref_count: i64,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotRecord {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotListEntry {
    pub snapshot: SnapshotRecord,
    pub file_count: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub file_id: i64,
    pub version_id: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotEntryDetail {
    pub file_id: i64,
    pub version_id: i64,
    pub path: String,
    pub object_digest: String,
    pub size_bytes: u64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotRestoreStats {
    pub files_in_snapshot: usize,
    pub files_restored: usize,
    pub files_soft_deleted: usize,
    pub skipped_missing_versions: usize,
}

#[derive(Debug, Clone)]
pub struct EventRecord {
    pub action: String,
    pub path: Option<String>,
    pub version_id: Option<i64>,
    pub object_digest: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FsStats {
    pub total_files: i64,
    pub total_versions: i64,
    pub total_objects: i64,
    pub logical_size_bytes: u64,
    pub actual_size_bytes: u64,
    pub orphaned_objects: i64,
}

/// Transactional metadata index for one backend: the inode tree, version
/// chains, object reference counts, snapshots and the activity feed live in
/// one SQLite database with WAL journaling, so engine reads and GC can run
/// concurrently with a mounted handler.
#[derive(Debug)]
pub struct MetaDb {
    conn: Mutex<Connection>,
}

fn map_db_err(err: rusqlite::Error) -> CowFsError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            CowFsError::AlreadyExists(err.to_string())
        }
        _ => CowFsError::DbError(err.to_string()),
    }
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        name: row.get("name")?,
        path: row.get("path")?,
        is_dir: row.get("is_dir")?,
        current_version_id: row.get("current_version_id")?,
        is_deleted: row.get("is_deleted")?,
        mode: row.get("mode")?,
        uid: row.get("uid")?,
        gid: row.get("gid")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRecord> {
    Ok(VersionRecord {
        id: row.get("id")?,
        file_id: row.get("file_id")?,
        object_digest: row.get("object_digest")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        created_at: row.get("created_at")?,
        is_deleted: row.get("is_deleted")?,
    })
}

fn object_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    Ok(ObjectRecord {
        digest: row.get("digest")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        ref_count: row.get("ref_count")?,
        created_at: row.get("created_at")?,
    })
}

fn snapshot_from_row(row: &Row<'_>) -> rusqlite::Result<SnapshotRecord> {
    Ok(SnapshotRecord {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        created_at: row.get("created_at")?,
    })
}

impl MetaDb {
    pub fn open(db_path: &Path) -> CowFsResult<Self> {
        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )
        .map_err(|e| CowFsError::DbError(format!("open db failed: {}", e)))?;
        Self::init_connection(&conn)?;
        Self::create_schema(&conn)?;
        Self::ensure_root(&conn)?;
        debug!("MetaDb: opened {}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_connection(conn: &Connection) -> CowFsResult<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|e| CowFsError::DbError(format!("pragma failed: {}", e)))?;
        Ok(())
    }

    fn create_schema(conn: &Connection) -> CowFsResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent_id INTEGER NOT NULL DEFAULT 1,
                name TEXT NOT NULL,
                path TEXT NOT NULL,
                is_dir INTEGER NOT NULL DEFAULT 0,
                current_version_id INTEGER,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                mode INTEGER NOT NULL,
                uid INTEGER NOT NULL DEFAULT 0,
                gid INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- (parent, name) must be unique among live siblings only; a
            -- soft-deleted row may share its slot with a live successor.
            CREATE UNIQUE INDEX IF NOT EXISTS idx_files_live_siblings
                ON files(parent_id, name) WHERE is_deleted = 0;
            CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);

            CREATE TABLE IF NOT EXISTS versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_id INTEGER NOT NULL REFERENCES files(id),
                object_digest TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_versions_file_id ON versions(file_id);
            CREATE INDEX IF NOT EXISTS idx_versions_object_digest ON versions(object_digest);

            CREATE TABLE IF NOT EXISTS objects (
                digest TEXT PRIMARY KEY,
                size_bytes INTEGER NOT NULL,
                ref_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT UNIQUE NOT NULL,
                description TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS snapshot_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_id INTEGER NOT NULL REFERENCES snapshots(id),
                file_id INTEGER NOT NULL REFERENCES files(id),
                version_id INTEGER NOT NULL REFERENCES versions(id)
            );
            CREATE INDEX IF NOT EXISTS idx_snapshot_entries_snapshot_id
                ON snapshot_entries(snapshot_id);

            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                path TEXT,
                version_id INTEGER,
                object_digest TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at, id);",
        )
        .map_err(|e| CowFsError::DbError(format!("create schema failed: {}", e)))?;
        Ok(())
    }

    fn ensure_root(conn: &Connection) -> CowFsResult<()> {
        let now = now_unix();
        conn.execute(
            "INSERT OR IGNORE INTO files
                (id, parent_id, name, path, is_dir, mode, created_at, updated_at)
             VALUES (?1, ?1, '', '/', 1, ?2, ?3, ?3)",
            params![ROOT_INODE, DEFAULT_DIR_MODE, now],
        )
        .map_err(map_db_err)?;
        Ok(())
    }

    // ──────────────────────────── files ────────────────────────────

    pub fn lookup(&self, parent_id: i64, name: &str) -> CowFsResult<Option<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM files WHERE parent_id = ?1 AND name = ?2 AND is_deleted = 0",
            params![parent_id, name],
            file_from_row,
        )
        .optional()
        .map_err(map_db_err)
    }

    /// Fetch a non-deleted file row by inode id.
    pub fn get_file(&self, id: i64) -> CowFsResult<Option<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM files WHERE id = ?1 AND is_deleted = 0",
            params![id],
            file_from_row,
        )
        .optional()
        .map_err(map_db_err)
    }

    /// Fetch a file row by inode id, soft-deleted rows included.
    pub fn get_file_any(&self, id: i64) -> CowFsResult<Option<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM files WHERE id = ?1", params![id], file_from_row)
            .optional()
            .map_err(map_db_err)
    }

    /// Resolve a denormalized path. With `include_deleted`, a live row wins
    /// over soft-deleted predecessors sharing the same path; among dead rows
    /// the newest wins.
    pub fn get_file_by_path(&self, path: &str, include_deleted: bool) -> CowFsResult<Option<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        let sql = if include_deleted {
            "SELECT * FROM files WHERE path = ?1 ORDER BY is_deleted ASC, id DESC LIMIT 1"
        } else {
            "SELECT * FROM files WHERE path = ?1 AND is_deleted = 0 LIMIT 1"
        };
        conn.query_row(sql, params![path], file_from_row)
            .optional()
            .map_err(map_db_err)
    }

    pub fn list_children(&self, parent_id: i64) -> CowFsResult<Vec<FileRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM files
                 WHERE parent_id = ?1 AND is_deleted = 0 AND id != ?1
                 ORDER BY name",
            )
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![parent_id], file_from_row)
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_file(
        &self,
        parent_id: i64,
        name: &str,
        path: &str,
        is_dir: bool,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> CowFsResult<FileRecord> {
        let conn = self.conn.lock().unwrap();
        let now = now_unix();
        conn.execute(
            "INSERT INTO files (parent_id, name, path, is_dir, mode, uid, gid, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![parent_id, name, path, is_dir, mode, uid, gid, now],
        )
        .map_err(|e| match map_db_err(e) {
            CowFsError::AlreadyExists(_) => {
                CowFsError::AlreadyExists(format!("{} already exists", path))
            }
            other => other,
        })?;
        let id = conn.last_insert_rowid();
        conn.query_row("SELECT * FROM files WHERE id = ?1", params![id], file_from_row)
            .map_err(map_db_err)
    }

    pub fn soft_delete_file(&self, id: i64) -> CowFsResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let path: Option<String> = tx
            .query_row("SELECT path FROM files WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()
            .map_err(map_db_err)?;
        set_file_deleted_conn(&tx, id, true)?;
        record_event_conn(&tx, EVENT_DELETE, path.as_deref(), None, None)?;
        tx.commit().map_err(map_db_err)
    }

    pub fn set_file_deleted(&self, id: i64, deleted: bool) -> CowFsResult<()> {
        let conn = self.conn.lock().unwrap();
        set_file_deleted_conn(&conn, id, deleted)
    }

    /// Move an inode under a new parent/name and rewrite the denormalized
    /// paths of the whole subtree beneath it.
    pub fn rename_file(
        &self,
        id: i64,
        new_parent_id: i64,
        new_name: &str,
        new_path: &str,
    ) -> CowFsResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let row = tx
            .query_row("SELECT * FROM files WHERE id = ?1", params![id], file_from_row)
            .optional()
            .map_err(map_db_err)?
            .ok_or_else(|| CowFsError::NotFound(format!("inode {} not found", id)))?;
        let now = now_unix();
        tx.execute(
            "UPDATE files SET parent_id = ?1, name = ?2, path = ?3, updated_at = ?4 WHERE id = ?5",
            params![new_parent_id, new_name, new_path, now, id],
        )
        .map_err(map_db_err)?;
        if row.is_dir {
            // substr() is character-based, as is the LIKE prefix match.
            let old_char_len = row.path.chars().count() as i64;
            tx.execute(
                "UPDATE files SET path = ?1 || substr(path, ?2), updated_at = ?3
                 WHERE path LIKE ?4 || '/%'",
                params![new_path, old_char_len + 1, now, row.path],
            )
            .map_err(map_db_err)?;
        }
        tx.commit().map_err(map_db_err)
    }

    pub fn update_attrs(
        &self,
        id: i64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> CowFsResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let now = now_unix();
        if let Some(mode) = mode {
            tx.execute(
                "UPDATE files SET mode = ?1, updated_at = ?2 WHERE id = ?3",
                params![mode, now, id],
            )
            .map_err(map_db_err)?;
        }
        if let Some(uid) = uid {
            tx.execute(
                "UPDATE files SET uid = ?1, updated_at = ?2 WHERE id = ?3",
                params![uid, now, id],
            )
            .map_err(map_db_err)?;
        }
        if let Some(gid) = gid {
            tx.execute(
                "UPDATE files SET gid = ?1, updated_at = ?2 WHERE id = ?3",
                params![gid, now, id],
            )
            .map_err(map_db_err)?;
        }
        tx.commit().map_err(map_db_err)
    }

    // ──────────────────────────── versions ────────────────────────────

    /// Append a saved state for a file in one transaction: upsert the object
    /// row (ref count +1), insert the version, move the current pointer and
    /// record the event. The blob must already be durable in the object store.
    pub fn append_version(
        &self,
        file_id: i64,
        object_digest: &str,
        size_bytes: u64,
        action: &str,
    ) -> CowFsResult<VersionRecord> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let version = insert_version_conn(&tx, file_id, object_digest, size_bytes, action)?;
        tx.commit().map_err(map_db_err)?;
        Ok(version)
    }

    pub fn current_version(&self, file_id: i64) -> CowFsResult<Option<VersionRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT v.* FROM versions v
             JOIN files f ON f.current_version_id = v.id
             WHERE f.id = ?1",
            params![file_id],
            version_from_row,
        )
        .optional()
        .map_err(map_db_err)
    }

    pub fn get_version(&self, version_id: i64) -> CowFsResult<Option<VersionRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM versions WHERE id = ?1",
            params![version_id],
            version_from_row,
        )
        .optional()
        .map_err(map_db_err)
    }

    /// The live version chain of one file, oldest first.
    pub fn list_versions(&self, file_id: i64) -> CowFsResult<Vec<VersionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT * FROM versions WHERE file_id = ?1 AND is_deleted = 0
                 ORDER BY created_at ASC, id ASC",
            )
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![file_id], version_from_row)
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    /// Newest live version created strictly before `before_ts`.
    pub fn version_before(&self, file_id: i64, before_ts: i64) -> CowFsResult<Option<VersionRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM versions
             WHERE file_id = ?1 AND is_deleted = 0 AND created_at < ?2
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![file_id, before_ts],
            version_from_row,
        )
        .optional()
        .map_err(map_db_err)
    }

    /// Restore: append a new version citing the same object as `version_id`
    /// and clear the file's deleted flag. Restore never rewrites history.
    pub fn restore_version(&self, file_id: i64, version_id: i64) -> CowFsResult<VersionRecord> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let target = tx
            .query_row(
                "SELECT * FROM versions WHERE id = ?1",
                params![version_id],
                version_from_row,
            )
            .optional()
            .map_err(map_db_err)?
            .ok_or_else(|| CowFsError::NotFound(format!("version {} not found", version_id)))?;
        if target.file_id != file_id {
            return Err(CowFsError::InvalidParam(format!(
                "version {} does not belong to file {}",
                version_id, file_id
            )));
        }
        let restored = insert_version_conn(
            &tx,
            file_id,
            &target.object_digest,
            target.size_bytes,
            EVENT_RESTORE,
        )?;
        set_file_deleted_conn(&tx, file_id, false)?;
        tx.commit().map_err(map_db_err)?;
        Ok(restored)
    }

    // ──────────────────────────── objects / GC ────────────────────────────

    pub fn get_object(&self, digest: &str) -> CowFsResult<Option<ObjectRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM objects WHERE digest = ?1",
            params![digest],
            object_from_row,
        )
        .optional()
        .map_err(map_db_err)
    }

    pub fn decrement_ref(&self, digest: &str) -> CowFsResult<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE objects SET ref_count = ref_count - 1 WHERE digest = ?1",
            params![digest],
        )
        .map_err(map_db_err)?;
        let count = conn
            .query_row(
                "SELECT ref_count FROM objects WHERE digest = ?1",
                params![digest],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_db_err)?
            .unwrap_or(0);
        Ok(count)
    }

    /// Objects with no remaining references whose row is older than
    /// `cutoff_ts` (the GC safety window boundary).
    pub fn orphaned_objects(&self, cutoff_ts: i64) -> CowFsResult<Vec<ObjectRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT * FROM objects WHERE ref_count <= 0 AND created_at <= ?1")
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![cutoff_ts], object_from_row)
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    /// Remove an object row, guarded against a reference added since the
    /// orphan scan. Returns false when the row was skipped or already gone.
    pub fn delete_object_record(&self, digest: &str) -> CowFsResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "DELETE FROM objects WHERE digest = ?1 AND ref_count <= 0",
                params![digest],
            )
            .map_err(map_db_err)?;
        Ok(changed > 0)
    }

    fn prunable_keep_last_sql() -> &'static str {
        "WITH ranked AS (
             SELECT v.*, ROW_NUMBER() OVER (
                 PARTITION BY v.file_id
                 ORDER BY v.created_at DESC, v.id DESC
             ) AS rn
             FROM versions v
             WHERE v.is_deleted = 0
         )
         SELECT id, file_id, object_digest, size_bytes, created_at, is_deleted
         FROM ranked WHERE rn > ?1
         ORDER BY file_id ASC, created_at ASC, id ASC"
    }

    // A file's current version is never prunable by --before; removing it
    // would leave the current pointer dangling.
    fn prunable_before_sql() -> &'static str {
        "SELECT v.id, v.file_id, v.object_digest, v.size_bytes, v.created_at, v.is_deleted
         FROM versions v
         LEFT JOIN files f ON f.current_version_id = v.id
         WHERE v.is_deleted = 0 AND v.created_at < ?1 AND f.id IS NULL
         ORDER BY v.file_id ASC, v.created_at ASC, v.id ASC"
    }

    pub fn list_prunable_keep_last(&self, keep_last: u32) -> CowFsResult<Vec<VersionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(Self::prunable_keep_last_sql()).map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![keep_last], version_from_row)
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    pub fn list_prunable_before(&self, before_ts: i64) -> CowFsResult<Vec<VersionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(Self::prunable_before_sql()).map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![before_ts], version_from_row)
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    /// Soft-delete all but the newest `keep_last` versions of every file,
    /// decrementing object reference counts, in one transaction.
    pub fn prune_keep_last(&self, keep_last: u32) -> CowFsResult<Vec<VersionRecord>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let rows = {
            let mut stmt = tx.prepare(Self::prunable_keep_last_sql()).map_err(map_db_err)?;
            let result = stmt
                .query_map(params![keep_last], version_from_row)
                .map_err(map_db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_db_err)?;
            result
        };
        prune_versions_conn(&tx, &rows)?;
        tx.commit().map_err(map_db_err)?;
        Ok(rows)
    }

    /// Soft-delete non-current versions older than `before_ts`.
    pub fn prune_before(&self, before_ts: i64) -> CowFsResult<Vec<VersionRecord>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let rows = {
            let mut stmt = tx.prepare(Self::prunable_before_sql()).map_err(map_db_err)?;
            let result = stmt
                .query_map(params![before_ts], version_from_row)
                .map_err(map_db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_db_err)?;
            result
        };
        prune_versions_conn(&tx, &rows)?;
        tx.commit().map_err(map_db_err)?;
        Ok(rows)
    }

    // ──────────────────────────── snapshots ────────────────────────────

    /// One transaction: snapshot row, one entry per live regular file citing
    /// its current version, and a reference-count bump per entry.
    pub fn snapshot_create(
        &self,
        name: &str,
        description: Option<&str>,
    ) -> CowFsResult<(SnapshotRecord, i64)> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let now = now_unix();
        tx.execute(
            "INSERT INTO snapshots (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, now],
        )
        .map_err(|e| match map_db_err(e) {
            CowFsError::AlreadyExists(_) => {
                CowFsError::AlreadyExists(format!("snapshot already exists: {}", name))
            }
            other => other,
        })?;
        let snapshot_id = tx.last_insert_rowid();
        let file_count = tx
            .execute(
                "INSERT INTO snapshot_entries (snapshot_id, file_id, version_id)
                 SELECT ?1, id, current_version_id FROM files
                 WHERE is_deleted = 0 AND is_dir = 0 AND current_version_id IS NOT NULL",
                params![snapshot_id],
            )
            .map_err(map_db_err)? as i64;
        bump_snapshot_refs_conn(&tx, snapshot_id, 1)?;
        record_event_conn(
            &tx,
            EVENT_SNAPSHOT_CREATE,
            Some(&format!("snapshot:{}", name)),
            None,
            None,
        )?;
        let snapshot = tx
            .query_row(
                "SELECT * FROM snapshots WHERE id = ?1",
                params![snapshot_id],
                snapshot_from_row,
            )
            .map_err(map_db_err)?;
        tx.commit().map_err(map_db_err)?;
        Ok((snapshot, file_count))
    }

    pub fn list_snapshots(&self) -> CowFsResult<Vec<SnapshotListEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT s.id, s.name, s.description, s.created_at, COUNT(se.id) AS file_count
                 FROM snapshots s
                 LEFT JOIN snapshot_entries se ON se.snapshot_id = s.id
                 GROUP BY s.id
                 ORDER BY s.created_at ASC, s.id ASC",
            )
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(SnapshotListEntry {
                    snapshot: snapshot_from_row(row)?,
                    file_count: row.get("file_count")?,
                })
            })
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    pub fn get_snapshot_by_name(&self, name: &str) -> CowFsResult<Option<SnapshotRecord>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM snapshots WHERE name = ?1",
            params![name],
            snapshot_from_row,
        )
        .optional()
        .map_err(map_db_err)
    }

    pub fn snapshot_entries(&self, snapshot_id: i64) -> CowFsResult<Vec<SnapshotEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT file_id, version_id FROM snapshot_entries WHERE snapshot_id = ?1")
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![snapshot_id], |row| {
                Ok(SnapshotEntry {
                    file_id: row.get(0)?,
                    version_id: row.get(1)?,
                })
            })
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    pub fn snapshot_entries_detailed(&self, snapshot_id: i64) -> CowFsResult<Vec<SnapshotEntryDetail>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT se.file_id, se.version_id, f.path, v.object_digest, v.size_bytes, v.created_at
                 FROM snapshot_entries se
                 JOIN files f ON f.id = se.file_id
                 JOIN versions v ON v.id = se.version_id
                 WHERE se.snapshot_id = ?1
                 ORDER BY f.path ASC",
            )
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map(params![snapshot_id], |row| {
                Ok(SnapshotEntryDetail {
                    file_id: row.get(0)?,
                    version_id: row.get(1)?,
                    path: row.get(2)?,
                    object_digest: row.get(3)?,
                    size_bytes: row.get::<_, i64>(4)? as u64,
                    created_at: row.get(5)?,
                })
            })
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    /// One transaction: drop the snapshot's reference-count shares, its
    /// entries and the snapshot row. Objects are left for GC.
    pub fn snapshot_delete(&self, snapshot_id: i64) -> CowFsResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let name: String = tx
            .query_row(
                "SELECT name FROM snapshots WHERE id = ?1",
                params![snapshot_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_db_err)?
            .ok_or_else(|| CowFsError::NotFound(format!("snapshot {} not found", snapshot_id)))?;
        bump_snapshot_refs_conn(&tx, snapshot_id, -1)?;
        tx.execute(
            "DELETE FROM snapshot_entries WHERE snapshot_id = ?1",
            params![snapshot_id],
        )
        .map_err(map_db_err)?;
        tx.execute("DELETE FROM snapshots WHERE id = ?1", params![snapshot_id])
            .map_err(map_db_err)?;
        record_event_conn(
            &tx,
            EVENT_SNAPSHOT_DELETE,
            Some(&format!("snapshot:{}", name)),
            None,
            None,
        )?;
        tx.commit().map_err(map_db_err)
    }

    /// One transaction: soft-delete every live file created after the
    /// snapshot (unless `keep_new`), then re-apply each entry by appending a
    /// version citing the recorded object and clearing the deleted flag.
    pub fn snapshot_restore(&self, snapshot_id: i64, keep_new: bool) -> CowFsResult<SnapshotRestoreStats> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(map_db_err)?;
        let name: String = tx
            .query_row(
                "SELECT name FROM snapshots WHERE id = ?1",
                params![snapshot_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_db_err)?
            .ok_or_else(|| CowFsError::NotFound(format!("snapshot {} not found", snapshot_id)))?;

        let entries: Vec<(i64, i64)> = {
            let mut stmt = tx
                .prepare("SELECT file_id, version_id FROM snapshot_entries WHERE snapshot_id = ?1")
                .map_err(map_db_err)?;
            let result = stmt
                .query_map(params![snapshot_id], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(map_db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(map_db_err)?;
            result
        };
        let snapshot_file_ids: HashSet<i64> = entries.iter().map(|(fid, _)| *fid).collect();

        let mut stats = SnapshotRestoreStats {
            files_in_snapshot: entries.len(),
            ..Default::default()
        };

        if !keep_new {
            let active: Vec<(i64, String)> = {
                let mut stmt = tx
                    .prepare("SELECT id, path FROM files WHERE is_deleted = 0 AND is_dir = 0")
                    .map_err(map_db_err)?;
                let result = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                    .map_err(map_db_err)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(map_db_err)?;
                result
            };
            for (file_id, path) in active {
                if snapshot_file_ids.contains(&file_id) {
                    continue;
                }
                set_file_deleted_conn(&tx, file_id, true)?;
                record_event_conn(&tx, EVENT_DELETE, Some(&path), None, None)?;
                stats.files_soft_deleted += 1;
            }
        }

        for (file_id, version_id) in entries {
            let version = tx
                .query_row(
                    "SELECT * FROM versions WHERE id = ?1",
                    params![version_id],
                    version_from_row,
                )
                .optional()
                .map_err(map_db_err)?;
            let version = match version {
                Some(v) => v,
                None => {
                    warn!(
                        "snapshot_restore: version {} for file {} is missing",
                        version_id, file_id
                    );
                    stats.skipped_missing_versions += 1;
                    continue;
                }
            };
            insert_version_conn(
                &tx,
                file_id,
                &version.object_digest,
                version.size_bytes,
                EVENT_SNAPSHOT_RESTORE,
            )?;
            set_file_deleted_conn(&tx, file_id, false)?;
            stats.files_restored += 1;
        }

        record_event_conn(
            &tx,
            EVENT_SNAPSHOT_RESTORE,
            Some(&format!("snapshot:{}", name)),
            None,
            None,
        )?;
        tx.commit().map_err(map_db_err)?;
        Ok(stats)
    }

    /// Ids of all live regular files.
    pub fn list_active_file_ids(&self) -> CowFsResult<Vec<i64>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT id FROM files WHERE is_deleted = 0 AND is_dir = 0")
            .map_err(map_db_err)?;
        let rows = stmt
            .query_map([], |row| row.get(0))
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        Ok(rows)
    }

    // ──────────────────────────── events / stats ────────────────────────────

    pub fn record_event(
        &self,
        action: &str,
        path: Option<&str>,
        version_id: Option<i64>,
        object_digest: Option<&str>,
    ) -> CowFsResult<()> {
        let conn = self.conn.lock().unwrap();
        record_event_conn(&conn, action, path, version_id, object_digest)
    }

    /// Last `limit` events, oldest first.
    pub fn list_events(&self, limit: u32) -> CowFsResult<Vec<EventRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT action, path, version_id, object_digest, created_at FROM events
                 ORDER BY created_at DESC, id DESC LIMIT ?1",
            )
            .map_err(map_db_err)?;
        let mut rows = stmt
            .query_map(params![limit], |row| {
                Ok(EventRecord {
                    action: row.get(0)?,
                    path: row.get(1)?,
                    version_id: row.get(2)?,
                    object_digest: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })
            .map_err(map_db_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_db_err)?;
        rows.reverse();
        Ok(rows)
    }

    pub fn stats(&self) -> CowFsResult<FsStats> {
        let conn = self.conn.lock().unwrap();
        let single = |sql: &str| -> CowFsResult<i64> {
            conn.query_row(sql, [], |row| row.get(0)).map_err(map_db_err)
        };
        Ok(FsStats {
            total_files: single("SELECT COUNT(*) FROM files WHERE is_deleted = 0 AND is_dir = 0")?,
            total_versions: single("SELECT COUNT(*) FROM versions WHERE is_deleted = 0")?,
            total_objects: single("SELECT COUNT(*) FROM objects")?,
            logical_size_bytes: single(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM versions WHERE is_deleted = 0",
            )? as u64,
            actual_size_bytes: single("SELECT COALESCE(SUM(size_bytes), 0) FROM objects")? as u64,
            orphaned_objects: single("SELECT COUNT(*) FROM objects WHERE ref_count <= 0")?,
        })
    }
}

// ──────────────────── shared statement helpers ────────────────────
// These take a &Connection so composite operations can reuse them inside
// their own transaction (a Transaction derefs to Connection).

fn set_file_deleted_conn(conn: &Connection, id: i64, deleted: bool) -> CowFsResult<()> {
    conn.execute(
        "UPDATE files SET is_deleted = ?1, updated_at = ?2 WHERE id = ?3",
        params![deleted, now_unix(), id],
    )
    .map_err(map_db_err)?;
    Ok(())
}

fn record_event_conn(
    conn: &Connection,
    action: &str,
    path: Option<&str>,
    version_id: Option<i64>,
    object_digest: Option<&str>,
) -> CowFsResult<()> {
    conn.execute(
        "INSERT INTO events (action, path, version_id, object_digest, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![action, path, version_id, object_digest, now_unix()],
    )
    .map_err(map_db_err)?;
    Ok(())
}

fn insert_version_conn(
    conn: &Connection,
    file_id: i64,
    object_digest: &str,
    size_bytes: u64,
    action: &str,
) -> CowFsResult<VersionRecord> {
    let now = now_unix();
    conn.execute(
        "INSERT INTO objects (digest, size_bytes, ref_count, created_at)
         VALUES (?1, ?2, 1, ?3)
         ON CONFLICT(digest) DO UPDATE SET ref_count = ref_count + 1",
        params![object_digest, size_bytes as i64, now],
    )
    .map_err(map_db_err)?;
    conn.execute(
        "INSERT INTO versions (file_id, object_digest, size_bytes, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![file_id, object_digest, size_bytes as i64, now],
    )
    .map_err(map_db_err)?;
    let version_id = conn.last_insert_rowid();
    conn.execute(
        "UPDATE files SET current_version_id = ?1, updated_at = ?2 WHERE id = ?3",
        params![version_id, now, file_id],
    )
    .map_err(map_db_err)?;
    let path: Option<String> = conn
        .query_row(
            "SELECT path FROM files WHERE id = ?1",
            params![file_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_db_err)?;
    record_event_conn(conn, action, path.as_deref(), Some(version_id), Some(object_digest))?;
    conn.query_row(
        "SELECT * FROM versions WHERE id = ?1",
        params![version_id],
        version_from_row,
    )
    .map_err(map_db_err)
}

fn prune_versions_conn(conn: &Connection, rows: &[VersionRecord]) -> CowFsResult<()> {
    for row in rows {
        conn.execute(
            "UPDATE versions SET is_deleted = 1 WHERE id = ?1",
            params![row.id],
        )
        .map_err(map_db_err)?;
        conn.execute(
            "UPDATE objects SET ref_count = ref_count - 1 WHERE digest = ?1",
            params![row.object_digest],
        )
        .map_err(map_db_err)?;
    }
    Ok(())
}

/// Add `delta` to the reference count of every object cited (possibly more
/// than once) by a snapshot's entries.
fn bump_snapshot_refs_conn(conn: &Connection, snapshot_id: i64, delta: i64) -> CowFsResult<()> {
    conn.execute(
        "UPDATE objects SET ref_count = ref_count + ?1 * (
             SELECT COUNT(*) FROM snapshot_entries se
             JOIN versions v ON v.id = se.version_id
             WHERE se.snapshot_id = ?2 AND v.object_digest = objects.digest
         )
         WHERE digest IN (
             SELECT v.object_digest FROM snapshot_entries se
             JOIN versions v ON v.id = se.version_id
             WHERE se.snapshot_id = ?2
         )",
        params![delta, snapshot_id],
    )
    .map_err(map_db_err)?;
    Ok(())
}
