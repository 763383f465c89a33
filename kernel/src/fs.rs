// File interface consumed by the VM core
//
// Mapped files reach the core as `File` handles: cheap-clone references to a
// shared inode. Reopening yields an independent handle over the same inode,
// which is what munmap closes without disturbing unrelated descriptors. All
// reads and writes the VM core issues are serialized by `FILE_LOCK`, the
// filesystem's global lock.
use alloc::sync::Arc;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

lazy_static! {
    pub static ref FILE_LOCK: Mutex<()> = Mutex::new(());
}

pub trait Inode: Send + Sync {
    fn len(&self) -> usize;
    /// Read up to `buf.len()` bytes at `ofs`; returns the bytes read.
    /// Short reads happen only at end of file.
    fn read_at(&self, buf: &mut [u8], ofs: u64) -> usize;
    /// Write up to `buf.len()` bytes at `ofs`; returns the bytes written.
    /// Writes never grow the file.
    fn write_at(&self, buf: &[u8], ofs: u64) -> usize;
}

pub struct File {
    inode: Arc<dyn Inode>,
}

impl File {
    pub fn new(inode: Arc<dyn Inode>) -> Self {
        Self { inode }
    }

    /// Independent handle over the same inode.
    pub fn reopen(&self) -> File {
        File {
            inode: self.inode.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.inode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&self, buf: &mut [u8], ofs: u64) -> usize {
        self.inode.read_at(buf, ofs)
    }

    pub fn write_at(&self, buf: &[u8], ofs: u64) -> usize {
        self.inode.write_at(buf, ofs)
    }
}

impl Clone for File {
    fn clone(&self) -> Self {
        self.reopen()
    }
}

struct RamFileState {
    bytes: Vec<u8>,
    writes: usize,
}

// Memory-backed inode. Write calls are counted so callers can tell a clean
// unmap from one that wrote back.
pub struct RamFile {
    state: Mutex<RamFileState>,
}

impl RamFile {
    /// Create a memory-backed file. The typed handle next to the `File`
    /// lets callers inspect contents and write counts.
    pub fn create(data: Vec<u8>) -> (File, Arc<RamFile>) {
        let inode = Arc::new(RamFile {
            state: Mutex::new(RamFileState {
                bytes: data,
                writes: 0,
            }),
        });
        (File::new(inode.clone()), inode)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.state.lock().bytes.clone()
    }

    pub fn byte(&self, ofs: usize) -> u8 {
        self.state.lock().bytes[ofs]
    }

    pub fn write_count(&self) -> usize {
        self.state.lock().writes
    }

    pub fn truncate(&self, len: usize) {
        self.state.lock().bytes.truncate(len);
    }
}

impl Inode for RamFile {
    fn len(&self) -> usize {
        self.state.lock().bytes.len()
    }

    fn read_at(&self, buf: &mut [u8], ofs: u64) -> usize {
        let state = self.state.lock();
        let ofs = ofs as usize;
        if ofs >= state.bytes.len() {
            return 0;
        }
        let n = buf.len().min(state.bytes.len() - ofs);
        buf[..n].copy_from_slice(&state.bytes[ofs..ofs + n]);
        n
    }

    fn write_at(&self, buf: &[u8], ofs: u64) -> usize {
        let mut state = self.state.lock();
        let ofs = ofs as usize;
        if ofs >= state.bytes.len() {
            return 0;
        }
        let n = buf.len().min(state.bytes.len() - ofs);
        state.bytes[ofs..ofs + n].copy_from_slice(&buf[..n]);
        state.writes += 1;
        n
    }
}

/// Shorthand for `RamFile::create`.
pub fn ram_file(data: Vec<u8>) -> (File, Arc<RamFile>) {
    RamFile::create(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn read_write_at() {
        let (file, inode) = ram_file(vec![1, 2, 3, 4, 5]);

        let mut buf = [0u8; 3];
        assert_eq!(file.read_at(&mut buf, 1), 3);
        assert_eq!(buf, [2, 3, 4]);

        // Reads past end of file are short, then empty.
        assert_eq!(file.read_at(&mut buf, 3), 2);
        assert_eq!(file.read_at(&mut buf, 5), 0);

        assert_eq!(file.write_at(&[9, 9], 3), 2);
        assert_eq!(inode.contents(), vec![1, 2, 3, 9, 9]);

        // Writes never grow the file.
        assert_eq!(file.write_at(&[7, 7], 4), 1);
        assert_eq!(inode.contents().len(), 5);
        assert_eq!(inode.write_count(), 2);
    }

    #[test]
    fn reopen_shares_content() {
        let (file, _inode) = ram_file(vec![0; 4]);
        let dup = file.reopen();

        assert_eq!(file.write_at(&[0xEE], 0), 1);
        let mut b = [0u8; 1];
        assert_eq!(dup.read_at(&mut b, 0), 1);
        assert_eq!(b[0], 0xEE);
    }
}
