//! The slice of the file system the memory manager depends on: open files
//! with a seek position, and a per-process descriptor table.

pub mod tempfs;

use alloc::{boxed::Box, collections::BTreeMap, sync::Arc};
use core::fmt;
use spin::Mutex;

pub type FileDescriptor = i16;

pub const STDIN_FILENO: FileDescriptor = 0;
pub const STDOUT_FILENO: FileDescriptor = 1;

/// An open file.
///
/// Reads and writes happen at the current position and advance it. Writes
/// never extend the file past its length.
pub trait File: Send {
    /// Move the position to `position` bytes from the start of the file.
    fn seek(&mut self, position: u64);
    /// Read up to `buf.len()` bytes, returning how many were read.
    fn read(&mut self, buf: &mut [u8]) -> usize;
    /// Write up to `buf.len()` bytes, returning how many were written.
    fn write(&mut self, buf: &[u8]) -> usize;
    /// Length of the file in bytes.
    fn length(&self) -> u64;
    /// Open the same file again with its own position.
    fn reopen(&self) -> Box<dyn File>;
    /// Release the handle. The handle must not be used afterwards.
    fn close(&mut self) {}
}

/// A shared handle to an open file.
///
/// Every page entry backed by the same mapping holds a clone, so the handle
/// lives until the last of them is dropped.
#[derive(Clone)]
pub struct FileRef(Arc<Mutex<Box<dyn File>>>);

impl FileRef {
    pub fn new(file: impl File + 'static) -> Self {
        Self::from_box(Box::new(file))
    }

    pub fn from_box(file: Box<dyn File>) -> Self {
        Self(Arc::new(Mutex::new(file)))
    }

    pub fn length(&self) -> u64 {
        self.0.lock().length()
    }

    /// Open an independent handle to the same file.
    pub fn reopen(&self) -> Self {
        Self::from_box(self.0.lock().reopen())
    }

    /// Seek to `offset` and read into `buf`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> usize {
        let mut file = self.0.lock();
        file.seek(offset);
        file.read(buf)
    }

    /// Seek to `offset` and write `buf`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> usize {
        let mut file = self.0.lock();
        file.seek(offset);
        file.write(buf)
    }

    pub fn close(&self) {
        self.0.lock().close();
    }

    /// Whether both handles refer to the same open file (not just the same inode).
    pub fn same_handle(&self, other: &FileRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileRef({:p})", Arc::as_ptr(&self.0))
    }
}

/// Open files of one process, by descriptor.
///
/// Descriptors 0 and 1 belong to the console and are never handed out.
#[derive(Debug)]
pub struct FileTable {
    files: BTreeMap<FileDescriptor, FileRef>,
    next_fd: FileDescriptor,
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            next_fd: STDOUT_FILENO + 1,
        }
    }

    /// Install `file` under the next unused descriptor, or `None` if the
    /// descriptor space is exhausted.
    pub fn insert(&mut self, file: FileRef) -> Option<FileDescriptor> {
        let fd = self.next_fd;
        self.next_fd = fd.checked_add(1)?;
        self.files.insert(fd, file);
        Some(fd)
    }

    pub fn get(&self, fd: FileDescriptor) -> Option<&FileRef> {
        self.files.get(&fd)
    }

    pub fn remove(&mut self, fd: FileDescriptor) -> Option<FileRef> {
        self.files.remove(&fd)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Close every open descriptor.
    pub fn close_all(&mut self) {
        for (_, file) in core::mem::take(&mut self.files) {
            file.close();
        }
    }
}
