//! The supplemental page table: what the kernel knows about each user page
//! beyond what the hardware page table records.

use super::{Result, VmError};
use crate::fs::FileRef;
use crate::swapping::SwapSlot;
use hashbrown::{hash_map::Entry, HashMap};
use vmkern_shared::mem::{
    mem_addr_types::{PhysFrame, VirtPage},
    PAGE_FRAME_SIZE,
};

/// Where the contents of a page currently live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    /// Never touched. Reads as zeros.
    Zeroed,
    /// Loaded into a frame.
    Resident(PhysFrame),
    /// Evicted to the swap device.
    Swapped(SwapSlot),
    /// Not yet read from the backing file.
    InFile,
    /// In the mapped file, up to date.
    InMmap,
}

/// Where a page goes when it is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrigin {
    Swap,
    /// Loaded from an executable. Evictions go to swap.
    FileSystem,
    /// Part of a memory-mapped file. Evictions write back to the file.
    Mmap,
}

/// The slice of a file behind a page.
#[derive(Debug, Clone)]
pub struct FileBacking {
    pub file: FileRef,
    pub offset: u64,
    /// Bytes read from `offset`. The rest of the page is zeros.
    pub read_bytes: usize,
    pub zero_bytes: usize,
    pub writable: bool,
}

#[derive(Debug, Clone)]
pub struct PageEntry {
    vpage: VirtPage,
    status: PageStatus,
    origin: PageOrigin,
    backing: Option<FileBacking>,
}

impl PageEntry {
    pub fn vpage(&self) -> VirtPage {
        self.vpage
    }

    pub fn status(&self) -> PageStatus {
        self.status
    }

    pub fn origin(&self) -> PageOrigin {
        self.origin
    }

    pub fn backing(&self) -> Option<&FileBacking> {
        self.backing.as_ref()
    }

    /// Anonymous pages are always writable.
    pub fn writable(&self) -> bool {
        self.backing.as_ref().map_or(true, |backing| backing.writable)
    }

    pub fn set_status(&mut self, status: PageStatus) {
        self.status = status;
    }

    pub fn set_origin(&mut self, origin: PageOrigin) {
        self.origin = origin;
    }

    /// The frame holding the page, if resident.
    pub fn frame(&self) -> Option<PhysFrame> {
        match self.status {
            PageStatus::Resident(frame) => Some(frame),
            _ => None,
        }
    }
}

/// Page entries of one address space, keyed by virtual page.
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: HashMap<VirtPage, PageEntry>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, vpage: VirtPage) -> Option<&PageEntry> {
        self.pages.get(&vpage)
    }

    pub fn lookup_mut(&mut self, vpage: VirtPage) -> Option<&mut PageEntry> {
        self.pages.get_mut(&vpage)
    }

    pub fn contains(&self, vpage: VirtPage) -> bool {
        self.pages.contains_key(&vpage)
    }

    fn declare(
        &mut self,
        vpage: VirtPage,
        status: PageStatus,
        origin: PageOrigin,
        backing: Option<FileBacking>,
    ) -> Result<&mut PageEntry> {
        if let Some(backing) = &backing {
            assert_eq!(
                backing.read_bytes + backing.zero_bytes,
                PAGE_FRAME_SIZE,
                "file-backed {vpage} does not cover a whole page"
            );
        }
        match self.pages.entry(vpage) {
            Entry::Occupied(_) => Err(VmError::DuplicatePage),
            Entry::Vacant(slot) => Ok(slot.insert(PageEntry {
                vpage,
                status,
                origin,
                backing,
            })),
        }
    }

    /// Declare a page with no backing store. It reads as zeros until written.
    pub fn declare_anonymous(&mut self, vpage: VirtPage) -> Result<&mut PageEntry> {
        self.declare(vpage, PageStatus::Zeroed, PageOrigin::Swap, None)
    }

    pub fn declare_file_backed(
        &mut self,
        vpage: VirtPage,
        file: FileRef,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<&mut PageEntry> {
        let backing = FileBacking {
            file,
            offset,
            read_bytes,
            zero_bytes,
            writable,
        };
        self.declare(
            vpage,
            PageStatus::InFile,
            PageOrigin::FileSystem,
            Some(backing),
        )
    }

    pub fn declare_mmap_backed(
        &mut self,
        vpage: VirtPage,
        file: FileRef,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
    ) -> Result<&mut PageEntry> {
        let backing = FileBacking {
            file,
            offset,
            read_bytes,
            zero_bytes,
            writable: true,
        };
        self.declare(vpage, PageStatus::InMmap, PageOrigin::Mmap, Some(backing))
    }

    /// Forget `vpage`. The caller owns whatever frame or slot it held.
    pub fn remove(&mut self, vpage: VirtPage) -> Option<PageEntry> {
        self.pages.remove(&vpage)
    }

    pub fn drain(&mut self) -> impl Iterator<Item = PageEntry> + '_ {
        self.pages.drain().map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageEntry> {
        self.pages.values()
    }
}
