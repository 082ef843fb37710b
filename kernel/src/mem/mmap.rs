//! Memory-mapped files.
//!
//! Mapping only declares page entries. The pages are read in by the fault
//! path and written back on eviction or unmap when dirty.

use super::{
    address_space::{AddressSpace, Pid},
    frame_table::FrameTable,
    page::PageStatus,
    MemoryManager, Result, VmError,
};
use crate::fs::{FileDescriptor, FileRef, STDIN_FILENO, STDOUT_FILENO};
use crate::paging::PageMapper;
use alloc::{collections::BTreeMap, vec::Vec};
use core::fmt;
use log::debug;
use vmkern_shared::mem::{
    mem_addr_types::{VirtAddr, VirtPage},
    PAGE_FRAME_SIZE,
};

/// Identifies one mapping within its process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MapId(u32);

impl MapId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct MmapRecord {
    start: VirtPage,
    page_count: usize,
    /// Reopened when mapped, so closing the descriptor leaves it open.
    file: FileRef,
}

impl MmapRecord {
    pub fn start(&self) -> VirtPage {
        self.start
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn pages(&self) -> impl Iterator<Item = VirtPage> {
        self.start.range(self.page_count)
    }
}

#[derive(Debug)]
pub struct MmapTable {
    records: BTreeMap<MapId, MmapRecord>,
    next_id: u32,
}

impl Default for MmapTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MmapTable {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_id: 1,
        }
    }

    fn insert(&mut self, record: MmapRecord) -> MapId {
        let id = MapId(self.next_id);
        self.next_id += 1;
        self.records.insert(id, record);
        id
    }

    fn remove(&mut self, id: MapId) -> Option<MmapRecord> {
        self.records.remove(&id)
    }

    pub fn get(&self, id: MapId) -> Option<&MmapRecord> {
        self.records.get(&id)
    }

    pub fn ids(&self) -> Vec<MapId> {
        self.records.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<P: PageMapper> MemoryManager<P> {
    /// Map the file open as `fd` at `addr`.
    ///
    /// The whole range is checked before any page is declared, so a failed
    /// map leaves the address space untouched.
    pub fn map(&self, pid: Pid, fd: FileDescriptor, addr: VirtAddr) -> Result<MapId> {
        let handle = self.space(pid)?;
        let mut guard = handle.lock();
        let space = &mut *guard;

        if addr.is_null() {
            return Err(VmError::BadAddress);
        }
        if !addr.is_page_aligned() {
            return Err(VmError::Misaligned);
        }
        if fd == STDIN_FILENO || fd == STDOUT_FILENO {
            return Err(VmError::ReservedDescriptor);
        }
        let file = space.files.get(fd).ok_or(VmError::BadFileDescriptor)?;
        let length = usize::try_from(file.length()).map_err(|_| VmError::BadAddress)?;
        if length == 0 {
            return Err(VmError::EmptyFile);
        }

        let page_count = length.div_ceil(PAGE_FRAME_SIZE);
        let end = page_count
            .checked_mul(PAGE_FRAME_SIZE)
            .and_then(|bytes| addr.checked_add(bytes))
            .ok_or(VmError::BadAddress)?;
        if !self.config.is_user_address(addr.as_usize()) || end.as_usize() > self.config.user_top
        {
            return Err(VmError::BadAddress);
        }
        let start = addr.page();
        for vpage in start.range(page_count) {
            if space.pages.contains(vpage) {
                return Err(VmError::Overlap);
            }
            if space.page_table.translate(vpage).is_some() {
                return Err(VmError::AlreadyMapped);
            }
        }

        let file = file.reopen();
        for (i, vpage) in start.range(page_count).enumerate() {
            let offset = i * PAGE_FRAME_SIZE;
            let read_bytes = (length - offset).min(PAGE_FRAME_SIZE);
            space.pages.declare_mmap_backed(
                vpage,
                file.clone(),
                offset as u64,
                read_bytes,
                PAGE_FRAME_SIZE - read_bytes,
            )?;
        }

        let id = space.mmaps.insert(MmapRecord {
            start,
            page_count,
            file,
        });
        debug!("process {pid}: mapping {id} of fd {fd} at {addr}, {page_count} pages");
        Ok(id)
    }

    /// Remove mapping `id`, writing dirty pages back to the file.
    pub fn unmap(&self, pid: Pid, id: MapId) -> Result<()> {
        let mut frames = self.frames.lock();
        let handle = self.space(pid)?;
        let mut guard = handle.lock();
        self.unmap_locked(&mut frames, &mut guard, id)
    }

    pub(super) fn unmap_locked(
        &self,
        frames: &mut FrameTable,
        space: &mut AddressSpace<P>,
        id: MapId,
    ) -> Result<()> {
        let record = space.mmaps.remove(id).ok_or(VmError::UnknownMapping)?;

        let mut written = 0;
        for vpage in record.pages() {
            let Some(entry) = space.pages.remove(vpage) else {
                panic!("mapping {id} lost the page entry for {vpage}");
            };
            match entry.status() {
                PageStatus::Resident(frame) => {
                    if space.page_table.is_dirty(vpage) {
                        let Some(backing) = entry.backing() else {
                            panic!("mmap {vpage} has no file");
                        };
                        let bytes = &frames.frame_bytes(frame)[..backing.read_bytes];
                        backing.file.write_at(backing.offset, bytes);
                        written += 1;
                    }
                    space.page_table.clear(vpage);
                    frames.release(frame);
                }
                PageStatus::Swapped(slot) => self.swap.lock().free_slot(slot),
                PageStatus::Zeroed | PageStatus::InFile | PageStatus::InMmap => {}
            }
        }
        record.file.close();

        debug!(
            "process {}: unmapped {id}, wrote back {written} of {} pages",
            space.pid(),
            record.page_count
        );
        Ok(())
    }
}
