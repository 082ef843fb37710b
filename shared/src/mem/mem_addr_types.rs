//! Address newtypes shared by the paging structures and the memory manager.

use super::{PAGE_FRAME_SIZE, PAGE_SHIFT};
use core::fmt;

/// A user or kernel virtual address.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Byte offset within the containing page.
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_FRAME_SIZE - 1)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// The page this address falls in.
    pub const fn page(self) -> VirtPage {
        VirtPage(self.0 >> PAGE_SHIFT)
    }

    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// A virtual page, identified by its page number (address >> PAGE_SHIFT).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtPage(usize);

impl VirtPage {
    pub const fn from_number(number: usize) -> Self {
        Self(number)
    }

    pub const fn number(self) -> usize {
        self.0
    }

    /// First address of the page.
    pub const fn start(self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_SHIFT)
    }

    /// The page `count` pages above this one.
    pub const fn add(self, count: usize) -> Self {
        Self(self.0 + count)
    }

    /// `count` consecutive pages starting at this one.
    pub fn range(self, count: usize) -> impl Iterator<Item = VirtPage> {
        (self.0..self.0 + count).map(VirtPage)
    }
}

impl fmt::Debug for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtPage({:#010x})", self.start().as_usize())
    }
}

impl fmt::Display for VirtPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {:#010x}", self.start().as_usize())
    }
}

/// A physical frame of the user pool, identified by its frame number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct PhysFrame(usize);

impl PhysFrame {
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    pub const fn number(self) -> usize {
        self.0
    }

    /// Physical address of the frame relative to the start of its pool.
    pub const fn start_address(self) -> usize {
        self.0 << PAGE_SHIFT
    }
}
