use crate::fs_daemon::CowFilesystem;
use cowfs_engine::Backend;
use cowfs_lib::DigestAlgo;
use fs_meta::ROOT_INODE;
use libc::{EBADF, EEXIST, EISDIR, ENOENT, ENOTDIR, ENOTEMPTY};
use tempfile::TempDir;
use tokio::runtime::Runtime;

const ROOT: u64 = ROOT_INODE as u64;

fn create_test_fs() -> (CowFilesystem, TempDir) {
    let tmp = TempDir::new().unwrap();
    let runtime = Runtime::new().unwrap();
    let backend = runtime
        .block_on(Backend::init(&tmp.path().join("storage"), DigestAlgo::Sha256))
        .unwrap();
    (CowFilesystem::new(runtime, backend), tmp)
}

/// Create, write and close a file in one open/release cycle.
fn write_file(fs: &CowFilesystem, parent: u64, name: &str, data: &[u8]) -> u64 {
    let (attr, fh) = fs.create_file(parent, name, 0o644, 0, 0).unwrap();
    if !data.is_empty() {
        fs.write_fh(fh, 0, data).unwrap();
    }
    fs.release_fh(fh).unwrap();
    attr.ino
}

fn read_file(fs: &CowFilesystem, ino: u64) -> Vec<u8> {
    let fh = fs.open_file(ino).unwrap();
    let size = fs.getattr_entry(ino).unwrap().size;
    let data = fs.read_fh(fh, 0, size.max(1) as u32).unwrap();
    fs.release_fh(fh).unwrap();
    data
}

#[test]
fn test_write_then_read_round_trip() {
    let (fs, _tmp) = create_test_fs();
    let ino = write_file(&fs, ROOT, "hello.txt", b"hello cowfs");
    assert_eq!(read_file(&fs, ino), b"hello cowfs");
}

#[test]
fn test_create_makes_exactly_one_empty_version() {
    let (fs, _tmp) = create_test_fs();
    let (attr, fh) = fs.create_file(ROOT, "empty.txt", 0o644, 0, 0).unwrap();
    assert_eq!(attr.size, 0);
    // A clean release never creates a redundant version.
    fs.release_fh(fh).unwrap();

    let versions = fs.meta.list_versions(attr.ino as i64).unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].size_bytes, 0);
    assert_eq!(read_file(&fs, attr.ino), b"");
}

#[test]
fn test_one_version_per_save_not_per_write() {
    let (fs, _tmp) = create_test_fs();
    let (attr, fh) = fs.create_file(ROOT, "doc.txt", 0o644, 0, 0).unwrap();
    fs.write_fh(fh, 0, b"part one ").unwrap();
    fs.write_fh(fh, 9, b"part two").unwrap();
    fs.release_fh(fh).unwrap();

    // Create's empty version plus one for the coalesced writes.
    assert_eq!(fs.meta.list_versions(attr.ino as i64).unwrap().len(), 2);
    assert_eq!(read_file(&fs, attr.ino), b"part one part two");
}

#[test]
fn test_three_writes_two_blobs() {
    let (fs, _tmp) = create_test_fs();
    let ino = write_file(&fs, ROOT, "a.txt", b"v1");
    for data in [b"v2", b"v1"] {
        let fh = fs.open_file(ino).unwrap();
        fs.write_fh(fh, 0, data).unwrap();
        // Shrink to the new content before closing.
        fs.setattr_entry(ino, None, None, None, Some(2)).unwrap();
        fs.release_fh(fh).unwrap();
    }

    // Four versions (create + three saves), but "v1" is stored once.
    let versions = fs.meta.list_versions(ino as i64).unwrap();
    assert_eq!(versions.len(), 4);
    assert_eq!(versions[1].object_digest, versions[3].object_digest);
    let digest_v1 = fs.store.compute_digest(b"v1");
    assert_eq!(fs.meta.get_object(&digest_v1).unwrap().unwrap().ref_count, 2);
    assert_eq!(read_file(&fs, ino), b"v1");
}

#[test]
fn test_identical_content_two_paths_single_object() {
    let (fs, _tmp) = create_test_fs();
    write_file(&fs, ROOT, "a", b"X");
    write_file(&fs, ROOT, "b", b"X");

    let digest = fs.store.compute_digest(b"X");
    let object = fs.meta.get_object(&digest).unwrap().unwrap();
    assert_eq!(object.ref_count, 2);
    assert!(fs.store.blob_path(&digest).exists());
}

#[test]
fn test_read_sees_own_inflight_writes() {
    let (fs, _tmp) = create_test_fs();
    let (attr, fh) = fs.create_file(ROOT, "wip.txt", 0o644, 0, 0).unwrap();
    fs.write_fh(fh, 0, b"not yet flushed").unwrap();

    // Dirty buffer is visible through the same handle before any flush,
    // and getattr reports the buffer length.
    assert_eq!(fs.read_fh(fh, 0, 64).unwrap(), b"not yet flushed");
    assert_eq!(fs.getattr_entry(attr.ino).unwrap().size, 15);
    assert_eq!(fs.meta.list_versions(attr.ino as i64).unwrap().len(), 1);
    fs.release_fh(fh).unwrap();
}

#[test]
fn test_write_past_eof_zero_fills() {
    let (fs, _tmp) = create_test_fs();
    let (attr, fh) = fs.create_file(ROOT, "gap.bin", 0o644, 0, 0).unwrap();
    fs.write_fh(fh, 4, b"tail").unwrap();
    fs.release_fh(fh).unwrap();

    assert_eq!(read_file(&fs, attr.ino), b"\0\0\0\0tail");
}

#[test]
fn test_truncate_creates_new_version() {
    let (fs, _tmp) = create_test_fs();
    let ino = write_file(&fs, ROOT, "t.txt", b"0123456789");

    let attr = fs.setattr_entry(ino, None, None, None, Some(4)).unwrap();
    assert_eq!(attr.size, 4);
    let fh = fs.open_file(ino).unwrap();
    fs.release_fh(fh).unwrap();

    let versions = fs.meta.list_versions(ino as i64).unwrap();
    assert_eq!(versions.last().unwrap().size_bytes, 4);
    assert_eq!(read_file(&fs, ino), b"0123");

    // Truncate up zero-extends.
    fs.setattr_entry(ino, None, None, None, Some(6)).unwrap();
    let fh = fs.open_file(ino).unwrap();
    fs.release_fh(fh).unwrap();
    assert_eq!(read_file(&fs, ino), b"0123\0\0");
}

#[test]
fn test_setattr_chmod_chown() {
    let (fs, _tmp) = create_test_fs();
    let ino = write_file(&fs, ROOT, "m.txt", b"x");
    let attr = fs
        .setattr_entry(ino, Some(0o600), Some(42), Some(43), None)
        .unwrap();
    assert_eq!(attr.perm, 0o600);
    assert_eq!(attr.uid, 42);
    assert_eq!(attr.gid, 43);
}

#[test]
fn test_lookup_and_getattr() {
    let (fs, _tmp) = create_test_fs();
    let ino = write_file(&fs, ROOT, "f.txt", b"abc");

    let attr = fs.lookup_entry(ROOT, "f.txt").unwrap();
    assert_eq!(attr.ino, ino);
    assert_eq!(attr.size, 3);
    assert_eq!(fs.lookup_entry(ROOT, "missing").unwrap_err(), ENOENT);
    assert_eq!(fs.getattr_entry(999).unwrap_err(), ENOENT);
}

#[test]
fn test_create_existing_name_fails() {
    let (fs, _tmp) = create_test_fs();
    write_file(&fs, ROOT, "dup.txt", b"one");
    assert_eq!(
        fs.create_file(ROOT, "dup.txt", 0o644, 0, 0).unwrap_err(),
        EEXIST
    );
}

#[test]
fn test_create_after_unlink_starts_fresh_chain() {
    let (fs, _tmp) = create_test_fs();
    let old_ino = write_file(&fs, ROOT, "re.txt", b"old content");
    fs.unlink_path(ROOT, "re.txt").unwrap();

    let new_ino = write_file(&fs, ROOT, "re.txt", b"new");
    assert_ne!(new_ino, old_ino);
    assert_eq!(read_file(&fs, new_ino), b"new");
    // The old chain stays queryable by file id.
    assert_eq!(fs.meta.list_versions(old_ino as i64).unwrap().len(), 2);
}

#[test]
fn test_unicode_names_round_trip() {
    let (fs, _tmp) = create_test_fs();
    let name = "héllo wörld — 日本語 🦀.txt";
    let ino = write_file(&fs, ROOT, name, "ünïcodé".as_bytes());

    let attr = fs.lookup_entry(ROOT, name).unwrap();
    assert_eq!(attr.ino, ino);
    assert_eq!(read_file(&fs, ino), "ünïcodé".as_bytes());

    let entries = fs.readdir_entries(ROOT, 0).unwrap();
    assert!(entries.iter().any(|(_, _, n, _)| n == name));
}

#[test]
fn test_unlink_and_errors() {
    let (fs, _tmp) = create_test_fs();
    write_file(&fs, ROOT, "gone.txt", b"x");
    fs.mkdir_path(ROOT, "dir", 0o755, 0, 0).unwrap();

    assert_eq!(fs.unlink_path(ROOT, "dir").unwrap_err(), EISDIR);
    fs.unlink_path(ROOT, "gone.txt").unwrap();
    assert_eq!(fs.lookup_entry(ROOT, "gone.txt").unwrap_err(), ENOENT);
    assert_eq!(fs.unlink_path(ROOT, "gone.txt").unwrap_err(), ENOENT);
}

#[test]
fn test_mkdir_rmdir() {
    let (fs, _tmp) = create_test_fs();
    let dir_attr = fs.mkdir_path(ROOT, "work", 0o755, 0, 0).unwrap();
    assert_eq!(dir_attr.kind, fuser::FileType::Directory);

    write_file(&fs, dir_attr.ino, "inner.txt", b"x");
    assert_eq!(fs.rmdir_path(ROOT, "work").unwrap_err(), ENOTEMPTY);

    fs.unlink_path(dir_attr.ino, "inner.txt").unwrap();
    fs.rmdir_path(ROOT, "work").unwrap();
    assert_eq!(fs.lookup_entry(ROOT, "work").unwrap_err(), ENOENT);

    write_file(&fs, ROOT, "plain.txt", b"x");
    assert_eq!(fs.rmdir_path(ROOT, "plain.txt").unwrap_err(), ENOTDIR);
}

#[test]
fn test_rename_moves_subtree_and_replaces_target() {
    let (fs, _tmp) = create_test_fs();
    let dir_attr = fs.mkdir_path(ROOT, "src", 0o755, 0, 0).unwrap();
    let inner = write_file(&fs, dir_attr.ino, "inner.txt", b"payload");
    let target = write_file(&fs, ROOT, "taken.txt", b"to be replaced");

    // Plain file rename over an existing destination soft-deletes it.
    let moved = write_file(&fs, ROOT, "mover.txt", b"mover");
    fs.rename_path(ROOT, "mover.txt", ROOT, "taken.txt").unwrap();
    assert_eq!(fs.lookup_entry(ROOT, "mover.txt").unwrap_err(), ENOENT);
    assert_eq!(fs.lookup_entry(ROOT, "taken.txt").unwrap().ino, moved);
    assert!(fs.meta.get_file_any(target as i64).unwrap().unwrap().is_deleted);

    // Directory rename rewrites descendant paths.
    fs.rename_path(ROOT, "src", ROOT, "dst").unwrap();
    let inner_row = fs.meta.get_file(inner as i64).unwrap().unwrap();
    assert_eq!(inner_row.path, "/dst/inner.txt");
    assert_eq!(read_file(&fs, inner), b"payload");
}

#[test]
fn test_readdir_offsets() {
    let (fs, _tmp) = create_test_fs();
    write_file(&fs, ROOT, "a", b"1");
    write_file(&fs, ROOT, "b", b"2");

    let all = fs.readdir_entries(ROOT, 0).unwrap();
    let names: Vec<&str> = all.iter().map(|(_, _, n, _)| n.as_str()).collect();
    assert_eq!(names, vec![".", "..", "a", "b"]);

    // Resuming from the last returned offset yields the remainder.
    let rest = fs.readdir_entries(ROOT, 3).unwrap();
    let names: Vec<&str> = rest.iter().map(|(_, _, n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["b"]);

    let ino = fs.lookup_entry(ROOT, "a").unwrap().ino;
    assert_eq!(fs.readdir_entries(ino, 0).unwrap_err(), ENOTDIR);
}

#[test]
fn test_flush_is_idempotent() {
    let (fs, _tmp) = create_test_fs();
    let (attr, fh) = fs.create_file(ROOT, "f.txt", 0o644, 0, 0).unwrap();
    fs.write_fh(fh, 0, b"data").unwrap();
    fs.flush_fh(fh).unwrap();
    // Second flush with a clean buffer is a no-op.
    fs.flush_fh(fh).unwrap();
    fs.release_fh(fh).unwrap();

    assert_eq!(fs.meta.list_versions(attr.ino as i64).unwrap().len(), 2);
}

#[test]
fn test_bad_handle() {
    let (fs, _tmp) = create_test_fs();
    assert_eq!(fs.read_fh(12345, 0, 16).unwrap_err(), EBADF);
    assert_eq!(fs.write_fh(12345, 0, b"x").unwrap_err(), EBADF);
    assert_eq!(fs.flush_fh(12345).unwrap_err(), EBADF);
    // Releasing an unknown handle is tolerated.
    fs.release_fh(12345).unwrap();
}

#[test]
fn test_open_deleted_file_fails() {
    let (fs, _tmp) = create_test_fs();
    let ino = write_file(&fs, ROOT, "d.txt", b"x");
    fs.unlink_path(ROOT, "d.txt").unwrap();
    assert_eq!(fs.open_file(ino).unwrap_err(), ENOENT);
}

#[test]
fn test_statfs_counts() {
    let (fs, _tmp) = create_test_fs();
    write_file(&fs, ROOT, "a", b"abc");
    write_file(&fs, ROOT, "b", b"defg");

    let stats = fs.statfs_info().unwrap();
    assert_eq!(stats.total_files, 2);
    assert_eq!(stats.logical_size_bytes, 7);
}

#[test]
fn test_multi_megabyte_flush() {
    let (fs, _tmp) = create_test_fs();
    let data_size = 4 * 1024 * 1024 + 17;
    let mut data = vec![0u8; data_size];
    for (idx, byte) in data.iter_mut().enumerate() {
        *byte = (idx % 251) as u8;
    }

    let (attr, fh) = fs.create_file(ROOT, "big.bin", 0o644, 0, 0).unwrap();
    // The kernel hands large writes over in chunks.
    let mut offset = 0u64;
    for chunk in data.chunks(128 * 1024) {
        fs.write_fh(fh, offset as i64, chunk).unwrap();
        offset += chunk.len() as u64;
    }
    fs.release_fh(fh).unwrap();

    assert_eq!(fs.getattr_entry(attr.ino).unwrap().size, data_size as u64);
    let fh = fs.open_file(attr.ino).unwrap();
    let tail = fs.read_fh(fh, (data_size - 100) as i64, 200).unwrap();
    assert_eq!(tail, &data[data_size - 100..]);
    fs.release_fh(fh).unwrap();
}

#[test]
fn test_restore_visible_through_handler() {
    let (fs, _tmp) = create_test_fs();
    let ino = write_file(&fs, ROOT, "data.bin", &[7u8; 4096]);
    let fh = fs.open_file(ino).unwrap();
    fs.write_fh(fh, 0, &[9u8; 4096]).unwrap();
    fs.release_fh(fh).unwrap();

    // Offline restore by version id (version 2 is the first payload).
    let versions = fs.meta.list_versions(ino as i64).unwrap();
    fs.meta.restore_version(ino as i64, versions[1].id).unwrap();

    assert_eq!(read_file(&fs, ino), vec![7u8; 4096]);
}
