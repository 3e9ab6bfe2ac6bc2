use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Per-inode dirty buffers coalescing many syscall writes into one version
/// per flush. A buffer exists only after a write or truncate touched the
/// inode (its presence is the dirty flag) and is seeded from the current
/// object's bytes before the first mutation applies.
///
/// The companion lock table hands out one mutual-exclusion primitive per
/// inode; the handler holds it across every buffer mutation and across the
/// whole flush drain. Entries are pruned once no handle holds the inode,
/// bounding the table.
pub struct WriteBufferTable {
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl WriteBufferTable {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn lock_for(&self, ino: u64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(ino)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop an inode's lock entry if nothing holds it anymore.
    pub fn prune_lock(&self, ino: u64) {
        let mut locks = self.locks.lock().unwrap();
        if let Some(lock) = locks.get(&ino) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&ino);
            }
        }
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.buffers.lock().unwrap().contains_key(&ino)
    }

    pub fn buffer_len(&self, ino: u64) -> Option<usize> {
        self.buffers.lock().unwrap().get(&ino).map(|buf| buf.len())
    }

    /// Install the seed bytes unless a buffer already exists.
    pub fn seed(&self, ino: u64, data: Vec<u8>) {
        self.buffers.lock().unwrap().entry(ino).or_insert(data);
    }

    /// Merge `data` at `offset`, zero-filling any gap past the current end.
    pub fn write(&self, ino: u64, offset: u64, data: &[u8]) -> usize {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = buffers.entry(ino).or_default();
        let offset = offset as usize;
        let end = offset + data.len();
        if end > buf.len() {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
        data.len()
    }

    /// Shorten or zero-extend the buffer to `new_size`.
    pub fn truncate(&self, ino: u64, new_size: u64) {
        let mut buffers = self.buffers.lock().unwrap();
        let buf = buffers.entry(ino).or_default();
        buf.resize(new_size as usize, 0);
    }

    /// Read a window from the dirty buffer, clamped at its end. None when
    /// the inode is clean.
    pub fn read(&self, ino: u64, offset: u64, length: usize) -> Option<Vec<u8>> {
        let buffers = self.buffers.lock().unwrap();
        let buf = buffers.get(&ino)?;
        let offset = offset as usize;
        if offset >= buf.len() {
            return Some(Vec::new());
        }
        let end = (offset + length).min(buf.len());
        Some(buf[offset..end].to_vec())
    }

    /// Remove and return the dirty buffer for a flush drain.
    pub fn take(&self, ino: u64) -> Option<Vec<u8>> {
        self.buffers.lock().unwrap().remove(&ino)
    }

    pub fn drop_buffer(&self, ino: u64) {
        self.buffers.lock().unwrap().remove(&ino);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_zero_fills_gap() {
        let table = WriteBufferTable::new();
        table.seed(7, b"ab".to_vec());
        table.write(7, 5, b"xy");
        assert_eq!(table.take(7).unwrap(), b"ab\0\0\0xy");
    }

    #[test]
    fn test_write_overlays_existing_bytes() {
        let table = WriteBufferTable::new();
        table.seed(1, b"hello world".to_vec());
        table.write(1, 6, b"там");
        let buf = table.take(1).unwrap();
        assert_eq!(&buf[..6], b"hello ");
        assert_eq!(&buf[6..12], "там".as_bytes());
    }

    #[test]
    fn test_seed_does_not_clobber_dirty_buffer() {
        let table = WriteBufferTable::new();
        table.write(3, 0, b"dirty");
        table.seed(3, b"stale seed".to_vec());
        assert_eq!(table.take(3).unwrap(), b"dirty");
    }

    #[test]
    fn test_truncate_shrinks_and_extends() {
        let table = WriteBufferTable::new();
        table.seed(2, b"0123456789".to_vec());
        table.truncate(2, 4);
        assert_eq!(table.buffer_len(2), Some(4));
        table.truncate(2, 8);
        assert_eq!(table.take(2).unwrap(), b"0123\0\0\0\0");
    }

    #[test]
    fn test_read_window_clamps_at_end() {
        let table = WriteBufferTable::new();
        assert!(table.read(9, 0, 4).is_none());
        table.seed(9, b"abcdef".to_vec());
        assert_eq!(table.read(9, 2, 3).unwrap(), b"cde");
        assert_eq!(table.read(9, 4, 100).unwrap(), b"ef");
        assert!(table.read(9, 100, 4).unwrap().is_empty());
    }

    #[test]
    fn test_take_clears_dirty_state() {
        let table = WriteBufferTable::new();
        table.write(5, 0, b"x");
        assert!(table.contains(5));
        assert!(table.take(5).is_some());
        assert!(!table.contains(5));
        assert!(table.take(5).is_none());
    }

    #[test]
    fn test_lock_table_prunes_unheld_entries() {
        let table = WriteBufferTable::new();
        let lock = table.lock_for(4);
        table.prune_lock(4);
        // Still held here, so the entry survives and resolves to the same lock.
        assert!(Arc::ptr_eq(&lock, &table.lock_for(4)));
        drop(lock);
        table.prune_lock(4);
        assert!(table.locks.lock().unwrap().is_empty());
    }
}
