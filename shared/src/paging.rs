// https://wiki.osdev.org/Paging

// Frame numbers and page-table indices are all well under 32 bits; the casts
// below cannot truncate for addresses below OFFSET.
#![allow(clippy::cast_possible_truncation)]

use crate::mem::mem_addr_types::{PhysFrame, VirtPage};
use crate::mem::PAGE_FRAME_SIZE;
use alloc::{boxed::Box, vec::Vec};
use arbitrary_int::{u10, u12, u20};
use bitbybit::bitfield;
use core::{
    mem::size_of,
    ops::{Deref, DerefMut},
};

const PAGE_DIRECTORY_LEN: usize = 1024;
const PAGE_TABLE_LEN: usize = PAGE_FRAME_SIZE / size_of::<PageTableEntry>();

// Two ten-bit indices cover the whole 32-bit address space.
const MAX_PAGES: usize = PAGE_DIRECTORY_LEN * PAGE_TABLE_LEN;

#[repr(align(4096))]
pub struct PageTable(pub [PageTableEntry; PAGE_TABLE_LEN]);

impl Default for PageTable {
    fn default() -> Self {
        Self([PageTableEntry::DEFAULT; PAGE_TABLE_LEN])
    }
}

impl Deref for PageTable {
    type Target = [PageTableEntry; PAGE_TABLE_LEN];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PageTable {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    #[bit(5, rw)]
    accessed: bool,
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

impl PageTableEntry {
    pub fn frame(&self) -> PhysFrame {
        PhysFrame::new(self.page_frame_address().value() as usize)
    }
}

#[bitfield(u32)]
pub struct VirtualAddress {
    #[bits(22..=31, r)]
    page_directory_index: u10,
    #[bits(12..=21, r)]
    page_table_index: u10,
    #[bits(0..=11, r)]
    offset: u12,
}

impl VirtualAddress {
    fn of(page: VirtPage) -> Self {
        Self::new_with_raw_value(page.start().as_usize() as u32)
    }
}

/// A software two-level x86 page directory for one address space.
///
/// Page tables are created on the first mapping that needs them. Only the
/// entry bits the memory manager consumes are modelled: present, writable,
/// user, accessed and dirty.
pub struct PageManager {
    directory: Vec<Option<Box<PageTable>>>,
    mapped: usize,
}

impl Default for PageManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PageManager {
    pub fn new() -> Self {
        let mut directory = Vec::with_capacity(PAGE_DIRECTORY_LEN);
        directory.resize_with(PAGE_DIRECTORY_LEN, || None);
        Self {
            directory,
            mapped: 0,
        }
    }

    fn indices(page: VirtPage) -> Option<(usize, usize)> {
        if page.number() >= MAX_PAGES {
            return None;
        }
        let va = VirtualAddress::of(page);
        Some((
            usize::from(va.page_directory_index().value()),
            usize::from(va.page_table_index().value()),
        ))
    }

    fn entry(&self, page: VirtPage) -> Option<&PageTableEntry> {
        let (dir, idx) = Self::indices(page)?;
        let entry = &self.directory[dir].as_ref()?[idx];
        entry.present().then_some(entry)
    }

    fn entry_mut(&mut self, page: VirtPage) -> Option<&mut PageTableEntry> {
        let (dir, idx) = Self::indices(page)?;
        let entry = &mut self.directory[dir].as_mut()?[idx];
        entry.present().then_some(entry)
    }

    /// Maps `page` to `frame`. Returns `false` if `page` is already mapped or
    /// lies outside the 32-bit address space.
    #[must_use]
    pub fn map(&mut self, frame: PhysFrame, page: VirtPage, writable: bool, user: bool) -> bool {
        let Some((dir, idx)) = Self::indices(page) else {
            return false;
        };
        let table = self.directory[dir].get_or_insert_with(Box::default);
        if table[idx].present() {
            return false;
        }
        table[idx] = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(user)
            .with_page_frame_address(u20::new(frame.number() as u32));
        self.mapped += 1;
        true
    }

    /// Removes the mapping for `page`, returning the frame it pointed to.
    pub fn unmap(&mut self, page: VirtPage) -> Option<PhysFrame> {
        let entry = self.entry_mut(page)?;
        let frame = entry.frame();
        *entry = PageTableEntry::DEFAULT;
        self.mapped -= 1;
        Some(frame)
    }

    pub fn translate(&self, page: VirtPage) -> Option<PhysFrame> {
        self.entry(page).map(PageTableEntry::frame)
    }

    pub fn is_writable(&self, page: VirtPage) -> bool {
        self.entry(page).is_some_and(|entry| entry.read_write())
    }

    pub fn is_dirty(&self, page: VirtPage) -> bool {
        self.entry(page).is_some_and(|entry| entry.dirty())
    }

    pub fn is_accessed(&self, page: VirtPage) -> bool {
        self.entry(page).is_some_and(|entry| entry.accessed())
    }

    pub fn set_dirty(&mut self, page: VirtPage, dirty: bool) {
        if let Some(entry) = self.entry_mut(page) {
            *entry = entry.with_dirty(dirty);
        }
    }

    pub fn set_accessed(&mut self, page: VirtPage, accessed: bool) {
        if let Some(entry) = self.entry_mut(page) {
            *entry = entry.with_accessed(accessed);
        }
    }

    /// Number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        self.mapped
    }
}
