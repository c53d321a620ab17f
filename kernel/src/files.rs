//! Files at the kernel boundary.
//!
//! The filesystem reader itself lives outside the core; the kernel only
//! defines the descriptor capability it consumes, the per-task mapping
//! record used by demand paging, and a registry where the external
//! provider plugs in.

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::sync::InterruptSafeLock;

/// Capability over one open file.
///
/// `read`/`write` move an internal cursor; `load` reads at an absolute
/// offset without disturbing it (the page-fault handler uses `load` to
/// populate file-mapped pages).
pub trait FileDescriptor: Send {
    fn read(&mut self, buf: &mut [u8]) -> usize;
    fn write(&mut self, buf: &[u8]) -> usize;
    fn size(&self) -> usize;
    fn load(&mut self, buf: &mut [u8], offset: usize) -> usize;
}

/// A lazily populated mapping of an open file into a task's address space.
///
/// Registration only reserves the range; frames are committed one page at
/// a time by the fault handler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileMapping {
    pub fd: usize,
    pub vaddr_begin: u64,
    pub vaddr_end: u64,
}

/// Resolver from path to descriptor, implemented by the external
/// filesystem reader.
pub trait FileProvider: Send {
    fn open(&mut self, path: &str) -> Option<Box<dyn FileDescriptor>>;
}

static FILE_PROVIDER: InterruptSafeLock<Option<Box<dyn FileProvider>>> =
    InterruptSafeLock::new(None);

/// Install the filesystem reader. Called once at boot by the driver side.
pub fn set_file_provider(provider: Box<dyn FileProvider>) {
    *FILE_PROVIDER.lock() = Some(provider);
}

/// Open `path` through the registered provider.
pub fn open(path: &str) -> Option<Box<dyn FileDescriptor>> {
    FILE_PROVIDER.lock().as_mut()?.open(path)
}

/// An in-memory file, used for `@stdin` plumbing and as the stand-in
/// behind tests.
pub struct MemFile {
    data: Vec<u8>,
    pos: usize,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    pub const fn empty() -> Self {
        Self {
            data: Vec::new(),
            pos: 0,
        }
    }
}

impl FileDescriptor for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.load(&mut buf[..], self.pos);
        self.pos += n;
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        self.data.extend_from_slice(buf);
        buf.len()
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn load(&mut self, buf: &mut [u8], offset: usize) -> usize {
        if offset >= self.data.len() {
            return 0;
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_memfile_sequential_read() {
        let mut f = MemFile::new(vec![1, 2, 3, 4, 5]);
        let mut buf = [0u8; 2];
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(buf, [1, 2]);
        assert_eq!(f.read(&mut buf), 2);
        assert_eq!(buf, [3, 4]);
        assert_eq!(f.read(&mut buf), 1);
        assert_eq!(buf[0], 5);
        assert_eq!(f.read(&mut buf), 0);
    }

    #[test]
    fn test_memfile_load_does_not_move_cursor() {
        let mut f = MemFile::new(vec![9, 8, 7]);
        let mut buf = [0u8; 3];
        assert_eq!(f.load(&mut buf, 1), 2);
        assert_eq!(&buf[..2], &[8, 7]);
        // Cursor still at the start
        assert_eq!(f.read(&mut buf), 3);
        assert_eq!(buf, [9, 8, 7]);
    }

    #[test]
    fn test_memfile_load_past_end() {
        let mut f = MemFile::new(vec![1]);
        let mut buf = [0u8; 4];
        assert_eq!(f.load(&mut buf, 1), 0);
        assert_eq!(f.load(&mut buf, 100), 0);
    }
}
