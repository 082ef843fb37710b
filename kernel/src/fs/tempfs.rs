use super::File;
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::cmp::min;
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

struct TempINode {
    data: Mutex<Vec<u8>>,
    open_handles: AtomicUsize,
    writes: AtomicUsize,
}

/// An open handle to a fixed-length in-memory file.
///
/// Handles opened from one another (by `reopen` or `clone`) share the same
/// contents but keep their own position.
pub struct TempFile {
    inode: Arc<TempINode>,
    position: u64,
    closed: bool,
}

impl TempFile {
    pub fn new(contents: &[u8]) -> Self {
        Self {
            inode: Arc::new(TempINode {
                data: Mutex::new(contents.to_vec()),
                open_handles: AtomicUsize::new(1),
                writes: AtomicUsize::new(0),
            }),
            position: 0,
            closed: false,
        }
    }

    fn open_again(&self) -> Self {
        self.inode.open_handles.fetch_add(1, Ordering::Relaxed);
        Self {
            inode: Arc::clone(&self.inode),
            position: 0,
            closed: false,
        }
    }

    /// Snapshot of the file contents.
    pub fn contents(&self) -> Vec<u8> {
        self.inode.data.lock().clone()
    }

    /// Handles to this file that have not been closed.
    pub fn open_handles(&self) -> usize {
        self.inode.open_handles.load(Ordering::Relaxed)
    }

    /// Number of writes that changed at least one byte.
    pub fn write_count(&self) -> usize {
        self.inode.writes.load(Ordering::Relaxed)
    }
}

impl Clone for TempFile {
    fn clone(&self) -> Self {
        self.open_again()
    }
}

impl File for TempFile {
    fn seek(&mut self, position: u64) {
        self.position = position;
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let data = self.inode.data.lock();
        let Ok(start) = usize::try_from(self.position) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let n = min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        self.position += n as u64;
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        let mut data = self.inode.data.lock();
        let Ok(start) = usize::try_from(self.position) else {
            return 0;
        };
        if start >= data.len() {
            return 0;
        }
        let n = min(buf.len(), data.len() - start);
        data[start..start + n].copy_from_slice(&buf[..n]);
        self.position += n as u64;
        if n > 0 {
            self.inode.writes.fetch_add(1, Ordering::Relaxed);
        }
        n
    }

    fn length(&self) -> u64 {
        self.inode.data.lock().len() as u64
    }

    fn reopen(&self) -> Box<dyn File> {
        Box::new(self.open_again())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.inode.open_handles.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
