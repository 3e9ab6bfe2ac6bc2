use cowfs_engine::Backend;
use cowfs_lib::{join_child_path, CowFsError, CowFsResult, DigestAlgo, LOCK_FILE_NAME};
use fs2::FileExt;
use fs_meta::{FileRecord, FsStats, MetaDb, EVENT_WRITE};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use libc::{EBADF, EEXIST, EINVAL, EIO, EISDIR, ENOENT, ENOSYS, ENOTDIR, ENOTEMPTY, ESTALE};
use log::{debug, info, warn};
use object_store::ObjectStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;

use crate::write_buffer::WriteBufferTable;

const TTL: Duration = Duration::from_secs(1);
const BLOCK_SIZE: u32 = 4096;

const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

struct OpenHandle {
    inode: u64,
}

struct HandleTable {
    next_fh: AtomicU64,
    handles: Mutex<HashMap<u64, OpenHandle>>,
}

impl HandleTable {
    fn new() -> Self {
        Self {
            next_fh: AtomicU64::new(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn alloc_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::SeqCst)
    }

    fn insert(&self, handle: OpenHandle) -> u64 {
        let fh = self.alloc_fh();
        self.handles.lock().unwrap().insert(fh, handle);
        fh
    }

    fn inode_of(&self, fh: u64) -> Result<u64, i32> {
        self.handles
            .lock()
            .unwrap()
            .get(&fh)
            .map(|handle| handle.inode)
            .ok_or(EBADF)
    }

    fn remove(&self, fh: u64) -> Option<OpenHandle> {
        self.handles.lock().unwrap().remove(&fh)
    }

    fn any_open_for(&self, ino: u64) -> bool {
        self.handles
            .lock()
            .unwrap()
            .values()
            .any(|handle| handle.inode == ino)
    }
}

/// The kernel-facing operation handler. Inode numbers reported to the kernel
/// are the metadata index's file ids; the root inode is 1. Reads consult the
/// write buffer first, writes touch only the buffer, and a flush drains one
/// buffer into one new version: blob first, metadata transaction second.
pub struct CowFilesystem {
    pub(crate) runtime: Runtime,
    pub(crate) meta: MetaDb,
    pub(crate) store: ObjectStore,
    buffers: WriteBufferTable,
    handles: HandleTable,
    dir_handles: Mutex<HashMap<u64, u64>>,
}

impl CowFilesystem {
    pub fn new(runtime: Runtime, backend: Backend) -> Self {
        Self {
            runtime,
            meta: backend.meta,
            store: backend.store,
            buffers: WriteBufferTable::new(),
            handles: HandleTable::new(),
            dir_handles: Mutex::new(HashMap::new()),
        }
    }

    fn require_file(&self, ino: u64) -> Result<FileRecord, i32> {
        self.meta
            .get_file(ino as i64)
            .map_err(map_fs_err)?
            .ok_or(ENOENT)
    }

    fn attr_for(&self, row: &FileRecord) -> Result<FileAttr, i32> {
        let ino = row.id as u64;
        let size = if row.is_dir {
            BLOCK_SIZE as u64
        } else if let Some(len) = self.buffers.buffer_len(ino) {
            // A dirty inode reports the in-flight buffer length.
            len as u64
        } else {
            match self.meta.current_version(row.id).map_err(map_fs_err)? {
                Some(version) => version.size_bytes,
                None => 0,
            }
        };
        let (kind, nlink) = if row.is_dir {
            (FileType::Directory, 2)
        } else {
            (FileType::RegularFile, 1)
        };
        let mtime = unix_to_system_time(row.updated_at);
        let crtime = unix_to_system_time(row.created_at);
        Ok(FileAttr {
            ino,
            size,
            blocks: (size + 511) / 512,
            atime: mtime,
            mtime,
            ctime: mtime,
            crtime,
            kind,
            perm: (row.mode & 0o7777) as u16,
            nlink,
            uid: row.uid,
            gid: row.gid,
            rdev: 0,
            flags: 0,
            blksize: BLOCK_SIZE,
        })
    }

    pub(crate) fn lookup_entry(&self, parent: u64, name: &str) -> Result<FileAttr, i32> {
        let row = self
            .meta
            .lookup(parent as i64, name)
            .map_err(map_fs_err)?
            .ok_or(ENOENT)?;
        self.attr_for(&row)
    }

    pub(crate) fn getattr_entry(&self, ino: u64) -> Result<FileAttr, i32> {
        let row = self.require_file(ino)?;
        self.attr_for(&row)
    }

    pub(crate) fn setattr_entry(
        &self,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
    ) -> Result<FileAttr, i32> {
        let row = self.require_file(ino)?;
        if mode.is_some() || uid.is_some() || gid.is_some() {
            let mode = mode.map(|m| (row.mode & !0o7777) | (m & 0o7777));
            self.meta
                .update_attrs(ino as i64, mode, uid, gid)
                .map_err(map_fs_err)?;
        }
        if let Some(new_size) = size {
            if row.is_dir {
                return Err(EISDIR);
            }
            let lock = self.buffers.lock_for(ino);
            let _guard = lock.lock().unwrap();
            self.seed_buffer_locked(ino)?;
            self.buffers.truncate(ino, new_size);
        }
        self.getattr_entry(ino)
    }

    pub(crate) fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let row = self.require_file(ino)?;
        if !row.is_dir {
            return Err(ENOTDIR);
        }
        let children = self.meta.list_children(ino as i64).map_err(map_fs_err)?;

        let mut out = Vec::new();
        let mut idx: i64 = offset;
        if offset == 0 {
            out.push((ino, FileType::Directory, ".".to_string(), 1));
            out.push((ino, FileType::Directory, "..".to_string(), 2));
            idx = 2;
        }
        for child in children.into_iter().skip((idx - 2).max(0) as usize) {
            let file_type = if child.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            idx += 1;
            out.push((child.id as u64, file_type, child.name, idx));
        }
        Ok(out)
    }

    pub(crate) fn opendir_handle(&self, ino: u64) -> Result<u64, i32> {
        let row = self.require_file(ino)?;
        if !row.is_dir {
            return Err(ENOTDIR);
        }
        let fh = self.handles.alloc_fh();
        self.dir_handles.lock().unwrap().insert(fh, ino);
        Ok(fh)
    }

    pub(crate) fn open_file(&self, ino: u64) -> Result<u64, i32> {
        let row = self.require_file(ino)?;
        if row.is_dir {
            return Err(EISDIR);
        }
        Ok(self.handles.insert(OpenHandle { inode: ino }))
    }

    pub(crate) fn create_file(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(FileAttr, u64), i32> {
        let parent_row = self.require_file(parent)?;
        if !parent_row.is_dir {
            return Err(ENOTDIR);
        }
        let path = join_child_path(&parent_row.path, name);
        let mode = S_IFREG | (mode & 0o7777);
        let row = self
            .meta
            .create_file(parent as i64, name, &path, false, mode, uid, gid)
            .map_err(map_fs_err)?;

        // A fresh file's single version points at the empty-bytes object;
        // the blob must be durable before the version row commits.
        let empty_digest = self
            .runtime
            .block_on(self.store.put(&[]))
            .map_err(map_fs_err)?;
        self.meta
            .append_version(row.id, &empty_digest, 0, EVENT_WRITE)
            .map_err(map_fs_err)?;

        let fh = self.handles.insert(OpenHandle {
            inode: row.id as u64,
        });
        let row = self.require_file(row.id as u64)?;
        Ok((self.attr_for(&row)?, fh))
    }

    pub(crate) fn mkdir_path(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<FileAttr, i32> {
        let parent_row = self.require_file(parent)?;
        if !parent_row.is_dir {
            return Err(ENOTDIR);
        }
        let path = join_child_path(&parent_row.path, name);
        let mode = S_IFDIR | (mode & 0o7777);
        let row = self
            .meta
            .create_file(parent as i64, name, &path, true, mode, uid, gid)
            .map_err(map_fs_err)?;
        self.attr_for(&row)
    }

    pub(crate) fn read_fh(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        let ino = self.handles.inode_of(fh)?;
        // A reader on a dirty inode observes its own in-flight writes.
        if let Some(data) = self.buffers.read(ino, offset as u64, size as usize) {
            return Ok(data);
        }
        let version = match self.meta.current_version(ino as i64).map_err(map_fs_err)? {
            Some(version) => version,
            None => return Ok(Vec::new()),
        };
        self.runtime
            .block_on(
                self.store
                    .get_slice(&version.object_digest, offset as u64, size as usize),
            )
            .map_err(map_fs_err)
    }

    pub(crate) fn write_fh(&self, fh: u64, offset: i64, data: &[u8]) -> Result<u32, i32> {
        let ino = self.handles.inode_of(fh)?;
        let lock = self.buffers.lock_for(ino);
        let _guard = lock.lock().unwrap();
        self.seed_buffer_locked(ino)?;
        let written = self.buffers.write(ino, offset as u64, data);
        Ok(written as u32)
    }

    // Caller holds the inode lock.
    fn seed_buffer_locked(&self, ino: u64) -> Result<(), i32> {
        if self.buffers.contains(ino) {
            return Ok(());
        }
        let data = match self.meta.current_version(ino as i64).map_err(map_fs_err)? {
            Some(version) => self
                .runtime
                .block_on(self.store.get(&version.object_digest))
                .map_err(map_fs_err)?,
            None => Vec::new(),
        };
        self.buffers.seed(ino, data);
        Ok(())
    }

    /// Drain the inode's dirty buffer into one new version. No-op when
    /// clean; safe to call repeatedly.
    fn flush_inode(&self, ino: u64) -> Result<(), i32> {
        let lock = self.buffers.lock_for(ino);
        let _guard = lock.lock().unwrap();
        let data = match self.buffers.take(ino) {
            Some(data) => data,
            None => return Ok(()),
        };

        let digest = self
            .runtime
            .block_on(self.store.put(&data))
            .map_err(|err| {
                warn!("flush: blob write failed for inode {}: {}", ino, err);
                EIO
            })?;
        if let Err(err) = self
            .meta
            .append_version(ino as i64, &digest, data.len() as u64, EVENT_WRITE)
        {
            // The blob stays behind as a GC-collectable orphan; the previous
            // version remains current.
            warn!("flush: metadata commit failed for inode {}: {}", ino, err);
            return Err(EIO);
        }
        debug!("flush: inode={} digest={} size={}", ino, &digest[..12], data.len());
        Ok(())
    }

    pub(crate) fn flush_fh(&self, fh: u64) -> Result<(), i32> {
        let ino = self.handles.inode_of(fh)?;
        self.flush_inode(ino)
    }

    pub(crate) fn release_fh(&self, fh: u64) -> Result<(), i32> {
        if let Some(handle) = self.handles.remove(fh) {
            let flushed = self.flush_inode(handle.inode);
            if !self.handles.any_open_for(handle.inode) {
                self.buffers.drop_buffer(handle.inode);
                self.buffers.prune_lock(handle.inode);
            }
            flushed?;
        }
        Ok(())
    }

    pub(crate) fn unlink_path(&self, parent: u64, name: &str) -> Result<(), i32> {
        let row = self
            .meta
            .lookup(parent as i64, name)
            .map_err(map_fs_err)?
            .ok_or(ENOENT)?;
        if row.is_dir {
            return Err(EISDIR);
        }
        self.meta.soft_delete_file(row.id).map_err(map_fs_err)
    }

    pub(crate) fn rmdir_path(&self, parent: u64, name: &str) -> Result<(), i32> {
        let row = self
            .meta
            .lookup(parent as i64, name)
            .map_err(map_fs_err)?
            .ok_or(ENOENT)?;
        if !row.is_dir {
            return Err(ENOTDIR);
        }
        let children = self.meta.list_children(row.id).map_err(map_fs_err)?;
        if !children.is_empty() {
            return Err(ENOTEMPTY);
        }
        self.meta.soft_delete_file(row.id).map_err(map_fs_err)
    }

    pub(crate) fn rename_path(
        &self,
        parent: u64,
        name: &str,
        newparent: u64,
        newname: &str,
    ) -> Result<(), i32> {
        let src = self
            .meta
            .lookup(parent as i64, name)
            .map_err(map_fs_err)?
            .ok_or(ENOENT)?;
        let new_parent_row = self.require_file(newparent)?;
        if !new_parent_row.is_dir {
            return Err(ENOTDIR);
        }

        if let Some(dst) = self
            .meta
            .lookup(newparent as i64, newname)
            .map_err(map_fs_err)?
        {
            if dst.id == src.id {
                return Ok(());
            }
            if dst.is_dir {
                let children = self.meta.list_children(dst.id).map_err(map_fs_err)?;
                if !children.is_empty() {
                    return Err(ENOTEMPTY);
                }
            }
            // Replaced atomically from the kernel's point of view: the
            // destination chain is soft-deleted, not rewritten.
            self.meta.soft_delete_file(dst.id).map_err(map_fs_err)?;
        }

        let new_path = join_child_path(&new_parent_row.path, newname);
        self.meta
            .rename_file(src.id, newparent as i64, newname, &new_path)
            .map_err(map_fs_err)
    }

    pub(crate) fn statfs_info(&self) -> Result<FsStats, i32> {
        self.meta.stats().map_err(map_fs_err)
    }
}

impl Filesystem for CowFilesystem {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.lookup_entry(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.getattr_entry(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!(
            "setattr ino={} mode={:?} uid={:?} gid={:?} size={:?}",
            ino, mode, uid, gid, size
        );
        match self.setattr_entry(ino, mode, uid, gid, size) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (inode, file_type, name, next_offset) in entries {
                    if reply.add(inode, next_offset, file_type, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.opendir_handle(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles.lock().unwrap().remove(&fh);
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.open_file(ino) {
            Ok(fh) => reply.opened(fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.create_file(parent, name, mode, req.uid(), req.gid()) {
            Ok((attr, fh)) => reply.created(&TTL, &attr, 0, fh, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_fh(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_fh(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(code) => reply.error(code),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.flush_fh(fh) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.flush_fh(fh) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.release_fh(fh) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.mkdir_path(parent, name, mode, req.uid(), req.gid()) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.unlink_path(parent, name) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.rmdir_path(parent, name) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name = match name.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        let newname = match newname.to_str() {
            Some(v) => v,
            None => {
                reply.error(EINVAL);
                return;
            }
        };
        match self.rename_path(parent, name, newparent, newname) {
            Ok(_) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        match self.statfs_info() {
            Ok(stats) => {
                let blocks = (stats.actual_size_bytes + BLOCK_SIZE as u64 - 1) / BLOCK_SIZE as u64;
                reply.statfs(
                    blocks,
                    0,
                    0,
                    stats.total_files as u64,
                    0,
                    BLOCK_SIZE,
                    255,
                    BLOCK_SIZE,
                );
            }
            Err(code) => reply.error(code),
        }
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &std::ffi::OsStr,
        reply: ReplyEntry,
    ) {
        reply.error(ENOSYS);
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &std::ffi::OsStr,
        _target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        reply.error(ENOSYS);
    }
}

fn map_fs_err(err: CowFsError) -> i32 {
    match err {
        CowFsError::NotFound(_) => ENOENT,
        CowFsError::AlreadyExists(_) => EEXIST,
        CowFsError::NotEmpty(_) => ENOTEMPTY,
        CowFsError::IsDirectory(_) => EISDIR,
        CowFsError::NotDirectory(_) => ENOTDIR,
        CowFsError::StaleInode(_) => ESTALE,
        CowFsError::Unsupported(_) => ENOSYS,
        CowFsError::InvalidParam(_) => EINVAL,
        CowFsError::InvalidState(_) => EIO,
        CowFsError::IoError(_) => EIO,
        CowFsError::DbError(_) => EIO,
        CowFsError::Corruption(_) => EIO,
    }
}

fn unix_to_system_time(ts: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64)
}

#[derive(Debug, Clone)]
pub struct MountRunOptions {
    pub storage_dir: PathBuf,
    pub mountpoint: PathBuf,
    pub digest_algo: Option<DigestAlgo>,
}

/// Validate the mountpoint, open (or initialize) the backend, take the
/// backend's exclusive lock and serve the filesystem until unmounted.
pub fn run_mount(options: MountRunOptions) -> CowFsResult<()> {
    if !options.mountpoint.exists() {
        std::fs::create_dir_all(&options.mountpoint).map_err(|e| {
            CowFsError::IoError(format!(
                "create mountpoint {} failed: {}",
                options.mountpoint.display(),
                e
            ))
        })?;
    }
    if !options.mountpoint.is_dir() {
        return Err(CowFsError::NotDirectory(format!(
            "{} is not a directory",
            options.mountpoint.display()
        )));
    }
    let occupied = std::fs::read_dir(&options.mountpoint)
        .map_err(|e| CowFsError::IoError(e.to_string()))?
        .next()
        .is_some();
    if occupied {
        return Err(CowFsError::InvalidState(format!(
            "mountpoint {} is not empty",
            options.mountpoint.display()
        )));
    }

    let runtime =
        Runtime::new().map_err(|e| CowFsError::InvalidState(format!("create runtime failed: {}", e)))?;
    let backend = runtime.block_on(Backend::open_or_init(
        &options.storage_dir,
        options.digest_algo,
    ))?;

    // One writer per backend: hold an advisory lock for the mount's lifetime.
    let lock_path = backend.root.join(LOCK_FILE_NAME);
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|e| CowFsError::IoError(format!("open lock file failed: {}", e)))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        CowFsError::InvalidState(format!(
            "another COWFS instance is already mounted on {}",
            backend.root.display()
        ))
    })?;

    let filesystem = CowFilesystem::new(runtime, backend);
    let mount_options = vec![
        MountOption::FSName("cowfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    #[cfg(not(target_os = "macos"))]
    let mut mount_options = mount_options;
    #[cfg(not(target_os = "macos"))]
    mount_options.push(MountOption::AutoUnmount);

    info!(
        "mounting cowfs: storage={} mountpoint={}",
        options.storage_dir.display(),
        options.mountpoint.display()
    );
    match fuser::spawn_mount2(filesystem, &options.mountpoint, &mount_options) {
        Ok(session) => {
            println!(
                "cowfs mounted: {} -> {}",
                options.storage_dir.display(),
                options.mountpoint.display()
            );
            session.join();
            let _ = lock_file.unlock();
            Ok(())
        }
        Err(err) => Err(CowFsError::IoError(format!("mount failed: {}", err))),
    }
}
