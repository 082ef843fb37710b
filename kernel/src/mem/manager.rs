use super::{
    address_space::{AddressSpace, Pid},
    frame_table::{FrameOwner, FrameTable},
    page::{PageOrigin, PageStatus},
    Result, VmConfig, VmError,
};
use crate::block::{Block, BlockType};
use crate::drivers::memory_disk::MemoryDisk;
use crate::fs::{FileDescriptor, FileRef};
use crate::paging::{PageManager, PageMapper};
use crate::swapping::SwapSpace;
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use log::{debug, info};
use spin::Mutex;
use vmkern_shared::mem::{
    mem_addr_types::{PhysFrame, VirtAddr, VirtPage},
    PAGE_FRAME_SIZE,
};

/// Demand-paged virtual memory for every user process.
///
/// Locks are taken in the order frame table, address space, swap. The
/// process table lock is only held long enough to clone an `Arc` out of
/// it. Anything that may need a frame takes the frame table first, so
/// evicting from another process never waits on a thread that is itself
/// waiting for frames.
pub struct MemoryManager<P: PageMapper = PageManager> {
    pub(super) config: VmConfig,
    pub(super) frames: Mutex<FrameTable>,
    processes: Mutex<BTreeMap<Pid, Arc<Mutex<AddressSpace<P>>>>>,
    pub(super) swap: Mutex<SwapSpace>,
}

impl<P: PageMapper> MemoryManager<P> {
    pub fn new(config: VmConfig, swap: Block) -> Self {
        info!(
            "memory manager: {} user frames, swap on {}",
            config.user_frames, swap
        );
        Self {
            config,
            frames: Mutex::new(FrameTable::new(config.user_frames)),
            processes: Mutex::new(BTreeMap::new()),
            swap: Mutex::new(SwapSpace::new(swap)),
        }
    }

    /// A manager whose swap device lives in memory.
    pub fn with_memory_swap(config: VmConfig) -> Self {
        let sectors = config.swap_sectors;
        let disk = Block::new(
            BlockType::Swap,
            "swap",
            sectors,
            Box::new(MemoryDisk::new(sectors)),
        );
        Self::new(config, disk)
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub(super) fn space(&self, pid: Pid) -> Result<Arc<Mutex<AddressSpace<P>>>> {
        self.processes
            .lock()
            .get(&pid)
            .cloned()
            .ok_or(VmError::NoSuchProcess)
    }

    /// Register an empty address space for `pid`.
    pub fn create_process(&self, pid: Pid) -> Result<()> {
        let mut processes = self.processes.lock();
        if processes.contains_key(&pid) {
            return Err(VmError::ProcessExists);
        }
        processes.insert(pid, Arc::new(Mutex::new(AddressSpace::new(pid))));
        debug!("created address space for process {pid}");
        Ok(())
    }

    /// Install an open file in the descriptor table of `pid`.
    pub fn open_file(&self, pid: Pid, file: FileRef) -> Result<FileDescriptor> {
        let space = self.space(pid)?;
        let fd = space.lock().files.insert(file);
        fd.ok_or(VmError::BadFileDescriptor)
    }

    pub fn close_file(&self, pid: Pid, fd: FileDescriptor) -> Result<()> {
        let space = self.space(pid)?;
        let file = space.lock().files.remove(fd);
        file.ok_or(VmError::BadFileDescriptor)?.close();
        Ok(())
    }

    /// Run `f` on the address space of `pid`.
    pub fn with_address_space<R>(
        &self,
        pid: Pid,
        f: impl FnOnce(&mut AddressSpace<P>) -> R,
    ) -> Result<R> {
        let space = self.space(pid)?;
        let mut space = space.lock();
        Ok(f(&mut *space))
    }

    /// Make the page containing `addr` resident for `pid`.
    ///
    /// `esp` is the user stack pointer at the time of the fault. A fault on
    /// an undeclared page close enough below it grows the stack.
    pub fn resolve_fault(&self, pid: Pid, addr: VirtAddr, esp: usize) -> Result<()> {
        self.resolve_access(pid, addr, esp, false)
    }

    /// Like [`resolve_fault`](Self::resolve_fault), but a `write` to a page
    /// that is not writable fails with [`VmError::ReadOnly`].
    pub fn resolve_access(&self, pid: Pid, addr: VirtAddr, esp: usize, write: bool) -> Result<()> {
        let mut frames = self.frames.lock();
        let space = self.space(pid)?;
        let mut space = space.lock();
        self.resolve_locked(&mut frames, &mut space, addr, esp, write)
            .map(|_| ())
    }

    pub(super) fn resolve_locked(
        &self,
        frames: &mut FrameTable,
        space: &mut AddressSpace<P>,
        addr: VirtAddr,
        esp: usize,
        write: bool,
    ) -> Result<PhysFrame> {
        self.check_user_address(addr)?;

        let vpage = addr.page();
        let frame = match space.page_table.translate(vpage) {
            Some(frame) => frame,
            None => {
                if !space.pages.contains(vpage) {
                    if !self.is_stack_access(addr, esp) {
                        return Err(VmError::NotMapped);
                    }
                    debug!("process {}: growing stack to {vpage}", space.pid());
                    space.pages.declare_anonymous(vpage)?;
                }
                self.load_page(frames, space, vpage)?
            }
        };

        if write && !space.page_table.is_writable(vpage) {
            return Err(VmError::ReadOnly);
        }
        Ok(frame)
    }

    fn check_user_address(&self, addr: VirtAddr) -> Result<()> {
        if addr.is_null() || !self.config.is_user_address(addr.as_usize()) {
            return Err(VmError::BadAddress);
        }
        Ok(())
    }

    fn is_stack_access(&self, addr: VirtAddr, esp: usize) -> bool {
        addr.as_usize() >= esp.saturating_sub(self.config.push_margin)
            && addr.as_usize() >= self.config.stack_floor()
    }

    /// Bring a declared page into a frame and map it.
    fn load_page(
        &self,
        frames: &mut FrameTable,
        space: &mut AddressSpace<P>,
        vpage: VirtPage,
    ) -> Result<PhysFrame> {
        let Some(entry) = space.pages.lookup(vpage) else {
            panic!("no page entry for {vpage} after declaring it");
        };
        let status = entry.status();
        let writable = entry.writable();

        if let PageStatus::Resident(frame) = status {
            // Mapping was lost but the frame is still ours.
            if !space.page_table.install(vpage, frame, writable) {
                return Err(VmError::AlreadyMapped);
            }
            return Ok(frame);
        }

        debug_assert!(space.page_table.translate(vpage).is_none());
        let frame = self.acquire_locked(frames, space, vpage);
        let Some(entry) = space.pages.lookup(vpage) else {
            panic!("page entry for {vpage} vanished while acquiring a frame");
        };
        let bytes = frames.frame_bytes_mut(frame);
        match status {
            PageStatus::Zeroed | PageStatus::Resident(_) => {}
            PageStatus::Swapped(slot) => self.swap.lock().read_page(slot, bytes),
            PageStatus::InFile | PageStatus::InMmap => {
                let Some(backing) = entry.backing() else {
                    panic!("{vpage} is file-backed but has no file");
                };
                let read = backing
                    .file
                    .read_at(backing.offset, &mut bytes[..backing.read_bytes]);
                assert_eq!(
                    read, backing.read_bytes,
                    "short read loading {vpage} from file offset {}",
                    backing.offset
                );
            }
        }

        if !space.page_table.install(vpage, frame, writable) {
            // The slot was freed by the read, so the contents go back out.
            if let PageStatus::Swapped(_) = status {
                let slot = self.swap.lock().swap_out(frames.frame_bytes(frame));
                if let Some(entry) = space.pages.lookup_mut(vpage) {
                    entry.set_status(PageStatus::Swapped(slot));
                }
            }
            frames.release(frame);
            return Err(VmError::AlreadyMapped);
        }
        if let Some(entry) = space.pages.lookup_mut(vpage) {
            entry.set_status(PageStatus::Resident(frame));
        }
        debug!("process {}: loaded {vpage} into frame {}", space.pid(), frame.number());
        Ok(frame)
    }

    /// Declare `vpage` as an anonymous page of `pid` and install a zeroed
    /// writable frame for it immediately.
    pub fn acquire_frame(&self, pid: Pid, vpage: VirtPage) -> Result<PhysFrame> {
        self.check_user_address(vpage.start())?;

        let mut frames = self.frames.lock();
        let space = self.space(pid)?;
        let mut guard = space.lock();
        let space = &mut *guard;

        space.pages.declare_anonymous(vpage)?;
        let frame = self.acquire_locked(&mut frames, space, vpage);
        if !space.page_table.install(vpage, frame, true) {
            frames.release(frame);
            space.pages.remove(vpage);
            return Err(VmError::AlreadyMapped);
        }
        if let Some(entry) = space.pages.lookup_mut(vpage) {
            entry.set_status(PageStatus::Resident(frame));
        }
        Ok(frame)
    }

    /// A zeroed frame registered to `vpage` of `space`, evicting if the pool
    /// is exhausted.
    fn acquire_locked(
        &self,
        frames: &mut FrameTable,
        space: &mut AddressSpace<P>,
        vpage: VirtPage,
    ) -> PhysFrame {
        let owner = FrameOwner {
            pid: space.pid(),
            vpage,
        };
        if let Some(frame) = frames.try_alloc(owner) {
            return frame;
        }

        self.evict_one(frames, space);
        let Some(frame) = frames.try_alloc(owner) else {
            panic!("user pool exhausted after eviction");
        };
        frame
    }

    /// Pick a victim with the replacement policy, save its contents and
    /// free its frame.
    fn evict_one(&self, frames: &mut FrameTable, current: &mut AddressSpace<P>) {
        let current_pid = current.pid();

        let victim = frames.select_victim(&mut |_, owner: &FrameOwner| {
            if owner.pid == current_pid {
                return current.page_table.test_and_clear_accessed(owner.vpage);
            }
            match self.space(owner.pid) {
                Ok(space) => {
                    let mut space = space.lock();
                    space.page_table.test_and_clear_accessed(owner.vpage)
                }
                Err(_) => false,
            }
        });
        let Some((frame, owner)) = victim else {
            panic!("user pool exhausted with no frame to evict");
        };

        debug!(
            "evicting {} of process {} from frame {}",
            owner.vpage,
            owner.pid,
            frame.number()
        );
        if owner.pid == current_pid {
            self.write_out(frames, current, frame, owner.vpage);
        } else {
            let Ok(space) = self.space(owner.pid) else {
                panic!("frame {} owned by unknown process {}", frame.number(), owner.pid);
            };
            self.write_out(frames, &mut space.lock(), frame, owner.vpage);
        }
        frames.release(frame);
    }

    /// Save the contents of `frame` where the page's origin says and unmap it.
    fn write_out(
        &self,
        frames: &FrameTable,
        space: &mut AddressSpace<P>,
        frame: PhysFrame,
        vpage: VirtPage,
    ) {
        let dirty = space.page_table.is_dirty(vpage);
        let Some(entry) = space.pages.lookup_mut(vpage) else {
            panic!("frame {} holds {vpage} which has no page entry", frame.number());
        };
        let bytes = frames.frame_bytes(frame);

        let status = match entry.origin() {
            PageOrigin::Swap | PageOrigin::FileSystem => {
                let slot = self.swap.lock().swap_out(bytes);
                entry.set_origin(PageOrigin::Swap);
                PageStatus::Swapped(slot)
            }
            PageOrigin::Mmap => {
                if dirty {
                    let Some(backing) = entry.backing() else {
                        panic!("mmap {vpage} has no file");
                    };
                    backing
                        .file
                        .write_at(backing.offset, &bytes[..backing.read_bytes]);
                }
                PageStatus::InMmap
            }
        };
        entry.set_status(status);
        space.page_table.clear(vpage);
    }

    /// Declare the pages of a loadable segment of `file`.
    ///
    /// `read_bytes` bytes starting at `offset` are read on demand into pages
    /// starting at `upage`, followed by `zero_bytes` zeros.
    #[allow(clippy::too_many_arguments)]
    pub fn load_segment(
        &self,
        pid: Pid,
        file: &FileRef,
        offset: u64,
        upage: VirtAddr,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<()> {
        let total = read_bytes + zero_bytes;
        if !upage.is_page_aligned() || total % PAGE_FRAME_SIZE != 0 {
            return Err(VmError::Misaligned);
        }
        let end = upage.checked_add(total).ok_or(VmError::BadAddress)?;
        self.check_user_address(upage)?;
        if end.as_usize() > self.config.user_top {
            return Err(VmError::BadAddress);
        }

        let space = self.space(pid)?;
        let mut space = space.lock();
        let start = upage.page();
        let page_count = total / PAGE_FRAME_SIZE;
        if start.range(page_count).any(|vpage| space.pages.contains(vpage)) {
            return Err(VmError::DuplicatePage);
        }

        let mut remaining = read_bytes;
        let mut file_offset = offset;
        for vpage in start.range(page_count) {
            let page_read = remaining.min(PAGE_FRAME_SIZE);
            space.pages.declare_file_backed(
                vpage,
                file.clone(),
                file_offset,
                page_read,
                PAGE_FRAME_SIZE - page_read,
                writable,
            )?;
            remaining -= page_read;
            file_offset += PAGE_FRAME_SIZE as u64;
        }
        debug!("process {pid}: segment of {page_count} pages at {upage}");
        Ok(())
    }

    /// Install the top page of the user stack and return the initial stack
    /// pointer.
    pub fn setup_stack(&self, pid: Pid) -> Result<VirtAddr> {
        let top = self.config.user_top;
        self.acquire_frame(pid, VirtAddr::new(top - PAGE_FRAME_SIZE).page())?;
        Ok(VirtAddr::new(top))
    }

    /// Tear down the address space of `pid`.
    ///
    /// Mappings are unmapped with write-back, frames and swap slots are
    /// freed, and open files are closed.
    pub fn release_all(&self, pid: Pid) -> Result<()> {
        let mut frames = self.frames.lock();
        let space = self
            .processes
            .lock()
            .remove(&pid)
            .ok_or(VmError::NoSuchProcess)?;
        let mut guard = space.lock();
        let space = &mut *guard;

        for id in space.mmaps.ids() {
            self.unmap_locked(&mut frames, space, id)?;
        }

        let mut freed_frames = 0;
        let mut freed_slots = 0;
        for entry in space.pages.drain() {
            match entry.status() {
                PageStatus::Resident(frame) => {
                    space.page_table.clear(entry.vpage());
                    frames.release(frame);
                    freed_frames += 1;
                }
                PageStatus::Swapped(slot) => {
                    self.swap.lock().free_slot(slot);
                    freed_slots += 1;
                }
                PageStatus::Zeroed | PageStatus::InFile | PageStatus::InMmap => {}
            }
        }
        space.files.close_all();

        info!("process {pid} exited: freed {freed_frames} frames and {freed_slots} swap slots");
        Ok(())
    }

    // Statistics --------------------------------------------------------------

    /// Frames in use and pool capacity.
    pub fn frame_usage(&self) -> (usize, usize) {
        let frames = self.frames.lock();
        (frames.frames_in_use(), frames.capacity())
    }

    pub fn evictions(&self) -> usize {
        self.frames.lock().evictions()
    }

    pub fn swap_free_slots(&self) -> usize {
        self.swap.lock().free_slots()
    }

    pub fn resident_frames(&self) -> Vec<(PhysFrame, FrameOwner)> {
        self.frames.lock().resident_frames().collect()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.processes.lock().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tempfs::TempFile;
    use std::thread;
    use vmkern_shared::mem::{USER_BASE, USER_TOP};

    const SWAP_SLOTS: u32 = 32;

    fn config(frames: usize) -> VmConfig {
        VmConfig {
            swap_sectors: SWAP_SLOTS * 8,
            ..VmConfig::with_frames(frames)
        }
    }

    fn manager(frames: usize) -> MemoryManager {
        MemoryManager::with_memory_swap(config(frames))
    }

    /// Page table that can be told to refuse new mappings.
    #[derive(Default)]
    struct RefusingMapper {
        inner: PageManager,
        refuse: bool,
    }

    impl PageMapper for RefusingMapper {
        fn install(&mut self, page: VirtPage, frame: PhysFrame, writable: bool) -> bool {
            !self.refuse && self.inner.install(page, frame, writable)
        }

        fn clear(&mut self, page: VirtPage) -> Option<PhysFrame> {
            self.inner.clear(page)
        }

        fn translate(&self, page: VirtPage) -> Option<PhysFrame> {
            self.inner.translate(page)
        }

        fn is_writable(&self, page: VirtPage) -> bool {
            self.inner.is_writable(page)
        }

        fn is_dirty(&self, page: VirtPage) -> bool {
            self.inner.is_dirty(page)
        }

        fn set_dirty(&mut self, page: VirtPage, dirty: bool) {
            self.inner.set_dirty(page, dirty);
        }

        fn is_accessed(&self, page: VirtPage) -> bool {
            self.inner.is_accessed(page)
        }

        fn set_accessed(&mut self, page: VirtPage, accessed: bool) {
            self.inner.set_accessed(page, accessed);
        }
    }

    fn addr(page: usize) -> VirtAddr {
        VirtAddr::new(USER_BASE + page * PAGE_FRAME_SIZE)
    }

    fn status(mm: &MemoryManager, pid: Pid, addr: VirtAddr) -> Option<PageStatus> {
        mm.with_address_space(pid, |space| {
            space.pages().lookup(addr.page()).map(|entry| entry.status())
        })
        .unwrap()
    }

    /// Anonymous page at `addr`, filled through its frame.
    fn touch(mm: &MemoryManager, pid: Pid, addr: VirtAddr, fill: u8) {
        mm.acquire_frame(pid, addr.page()).unwrap();
        mm.copy_to_user(pid, addr, &[fill; PAGE_FRAME_SIZE], 0)
            .unwrap();
    }

    /// Resident entries and frame table entries agree, and every resident
    /// page is mapped to its frame.
    fn assert_consistent(mm: &MemoryManager) {
        let resident = mm.resident_frames();
        for &(frame, owner) in &resident {
            mm.with_address_space(owner.pid, |space| {
                let entry = space.pages().lookup(owner.vpage).unwrap();
                assert_eq!(entry.status(), PageStatus::Resident(frame));
                assert_eq!(space.page_table().translate(owner.vpage), Some(frame));
            })
            .unwrap();
        }
        for pid in mm.pids() {
            mm.with_address_space(pid, |space| {
                for entry in space.pages().iter() {
                    if let PageStatus::Resident(frame) = entry.status() {
                        let owners = resident
                            .iter()
                            .filter(|(_, owner)| owner.pid == pid && owner.vpage == entry.vpage())
                            .count();
                        assert_eq!(owners, 1);
                        assert!(resident.contains(&(
                            frame,
                            FrameOwner {
                                pid,
                                vpage: entry.vpage()
                            }
                        )));
                    }
                }
            })
            .unwrap();
        }
    }

    #[test]
    fn anonymous_page_is_zero_filled() {
        let mm = manager(4);
        mm.create_process(1).unwrap();
        let esp = mm.setup_stack(1).unwrap();
        assert_eq!(esp, VirtAddr::new(USER_TOP));

        // One page below the initial stack page.
        let below = VirtAddr::new(USER_TOP - PAGE_FRAME_SIZE - 4);
        mm.resolve_fault(1, below, below.as_usize()).unwrap();
        assert!(matches!(status(&mm, 1, below), Some(PageStatus::Resident(_))));
        let data = mm.copy_from_user(1, below, 4, below.as_usize()).unwrap();
        assert_eq!(data, [0; 4]);
        assert_eq!(mm.evictions(), 0);
        assert_eq!(mm.frame_usage(), (2, 4));
        assert_consistent(&mm);
    }

    #[test]
    fn stack_growth_boundary() {
        let mm = manager(4);
        mm.create_process(1).unwrap();
        let esp = USER_TOP - 2 * PAGE_FRAME_SIZE + 32;

        // 32 bytes below esp is a PUSHA and grows the stack.
        let pusha = VirtAddr::new(esp - 32);
        mm.resolve_fault(1, pusha, esp).unwrap();
        assert!(matches!(status(&mm, 1, pusha), Some(PageStatus::Resident(_))));

        // One byte further is a bad access.
        let beyond = VirtAddr::new(esp - 33);
        assert_ne!(beyond.page(), pusha.page());
        assert_eq!(mm.resolve_fault(1, beyond, esp), Err(VmError::NotMapped));
        assert_eq!(status(&mm, 1, beyond), None);
    }

    #[test]
    fn stack_growth_stops_at_limit() {
        let mm = manager(4);
        mm.create_process(1).unwrap();
        let floor = mm.config().stack_floor();
        mm.resolve_fault(1, VirtAddr::new(floor), floor).unwrap();
        assert_eq!(
            mm.resolve_fault(1, VirtAddr::new(floor - 1), floor - 1),
            Err(VmError::NotMapped)
        );
    }

    #[test]
    fn rejects_non_user_addresses() {
        let mm = manager(4);
        mm.create_process(1).unwrap();
        for bad in [0, USER_BASE - 1, USER_TOP, usize::MAX] {
            assert_eq!(
                mm.resolve_fault(1, VirtAddr::new(bad), bad),
                Err(VmError::BadAddress)
            );
        }
        assert_eq!(
            mm.resolve_fault(2, addr(0), 0),
            Err(VmError::NoSuchProcess)
        );
        assert_eq!(mm.frame_usage().0, 0);
    }

    #[test]
    fn resolving_twice_is_idempotent() {
        let mm = manager(4);
        mm.create_process(1).unwrap();
        let esp = mm.setup_stack(1).unwrap().as_usize();
        let top = VirtAddr::new(esp - 8);

        mm.resolve_fault(1, top, esp).unwrap();
        let before = status(&mm, 1, top);
        mm.resolve_fault(1, top, esp).unwrap();
        assert_eq!(status(&mm, 1, top), before);
        assert_eq!(mm.frame_usage().0, 1);
    }

    #[test]
    fn resident_page_without_mapping_keeps_its_frame() {
        let mm = manager(4);
        mm.create_process(1).unwrap();
        let frame = mm.acquire_frame(1, addr(0).page()).unwrap();
        mm.copy_to_user(1, addr(0), b"kept", 0).unwrap();
        mm.with_address_space(1, |space| space.page_table_mut().clear(addr(0).page()))
            .unwrap();

        mm.resolve_fault(1, addr(0), 0).unwrap();
        assert_eq!(status(&mm, 1, addr(0)), Some(PageStatus::Resident(frame)));
        assert_eq!(mm.frame_usage().0, 1);
        assert_eq!(mm.copy_from_user(1, addr(0), 4, 0).unwrap(), b"kept");
    }

    #[test]
    fn two_processes_over_capacity() {
        let mm = manager(4);
        mm.create_process(1).unwrap();
        mm.create_process(2).unwrap();

        for (n, (pid, page)) in [(1, 0), (2, 0), (1, 1), (2, 1), (1, 2), (2, 2)]
            .into_iter()
            .enumerate()
        {
            touch(&mm, pid, addr(page), (pid as u8) << 4 | page as u8);
            assert_eq!(mm.evictions(), n.saturating_sub(3));
            assert_consistent(&mm);
        }
        assert_eq!(mm.frame_usage(), (4, 4));
        assert_eq!(mm.swap_free_slots(), SWAP_SLOTS as usize - 2);

        // Every page still reads back, evicted or not.
        for pid in [1, 2] {
            for page in 0..3 {
                let data = mm.copy_from_user(pid, addr(page), PAGE_FRAME_SIZE, 0).unwrap();
                assert!(data.iter().all(|&b| b == (pid as u8) << 4 | page as u8));
            }
        }
        assert_consistent(&mm);
    }

    #[test]
    fn swap_round_trip() {
        let mm = manager(1);
        mm.create_process(1).unwrap();
        let pattern: Vec<u8> = (0..PAGE_FRAME_SIZE).map(|i| (i % 251) as u8).collect();
        mm.acquire_frame(1, addr(0).page()).unwrap();
        mm.copy_to_user(1, addr(0), &pattern, 0).unwrap();

        touch(&mm, 1, addr(1), 0xEE);
        assert!(matches!(status(&mm, 1, addr(0)), Some(PageStatus::Swapped(_))));
        assert_eq!(mm.swap_free_slots(), SWAP_SLOTS as usize - 1);

        assert_eq!(mm.copy_from_user(1, addr(0), PAGE_FRAME_SIZE, 0).unwrap(), pattern);
        assert!(matches!(status(&mm, 1, addr(0)), Some(PageStatus::Resident(_))));
        // Page 1 went out to make room and page 0's slot was freed on the way in.
        assert_eq!(mm.swap_free_slots(), SWAP_SLOTS as usize - 1);
        assert_eq!(mm.evictions(), 2);
    }

    #[test]
    fn clock_spares_recently_used_page() {
        let mm = manager(2);
        mm.create_process(1).unwrap();
        touch(&mm, 1, addr(0), 1);
        touch(&mm, 1, addr(1), 2);
        mm.with_address_space(1, |space| {
            space.page_table_mut().set_accessed(addr(0).page(), false);
            space.page_table_mut().set_accessed(addr(1).page(), false);
        })
        .unwrap();

        // Page 0 is used again, so page 1 is the victim.
        mm.copy_from_user(1, addr(0), 1, 0).unwrap();
        touch(&mm, 1, addr(2), 3);
        assert!(matches!(status(&mm, 1, addr(0)), Some(PageStatus::Resident(_))));
        assert!(matches!(status(&mm, 1, addr(1)), Some(PageStatus::Swapped(_))));
    }

    #[test]
    fn segments_load_lazily() {
        let mm = manager(4);
        mm.create_process(1).unwrap();
        let contents: Vec<u8> = (0..PAGE_FRAME_SIZE + 100).map(|i| (i % 7) as u8).collect();
        let file = FileRef::new(TempFile::new(&contents));

        mm.load_segment(1, &file, 0, addr(0), contents.len(), PAGE_FRAME_SIZE - 100, false)
            .unwrap();
        assert_eq!(status(&mm, 1, addr(1)), Some(PageStatus::InFile));
        assert_eq!(mm.frame_usage().0, 0);

        let second = mm.copy_from_user(1, addr(1), PAGE_FRAME_SIZE, 0).unwrap();
        assert_eq!(&second[..100], &contents[PAGE_FRAME_SIZE..]);
        assert!(second[100..].iter().all(|&b| b == 0));
        assert_eq!(mm.frame_usage().0, 1);

        assert_eq!(mm.copy_to_user(1, addr(0), b"x", 0), Err(VmError::ReadOnly));
        assert_eq!(
            mm.load_segment(1, &file, 0, addr(1), 10, PAGE_FRAME_SIZE - 10, true),
            Err(VmError::DuplicatePage)
        );
        assert_eq!(
            mm.load_segment(1, &file, 0, VirtAddr::new(USER_BASE + 1), 10, 10, true),
            Err(VmError::Misaligned)
        );
    }

    #[test]
    fn evicted_segment_page_moves_to_swap() {
        let mm = manager(1);
        mm.create_process(1).unwrap();
        let file = FileRef::new(TempFile::new(&[9; 64]));
        mm.load_segment(1, &file, 0, addr(0), 64, PAGE_FRAME_SIZE - 64, true)
            .unwrap();
        mm.copy_to_user(1, addr(0), b"dirty", 0).unwrap();

        touch(&mm, 1, addr(1), 0);
        let origin = mm
            .with_address_space(1, |space| space.pages().lookup(addr(0).page()).unwrap().origin())
            .unwrap();
        assert_eq!(origin, PageOrigin::Swap);
        assert!(matches!(status(&mm, 1, addr(0)), Some(PageStatus::Swapped(_))));

        let data = mm.copy_from_user(1, addr(0), 8, 0).unwrap();
        assert_eq!(data, b"dirty\x09\x09\x09");
        // The executable itself is never written.
        let mut on_disk = [0; 5];
        file.read_at(0, &mut on_disk);
        assert_eq!(on_disk, [9; 5]);
    }

    #[test]
    fn release_all_frees_everything() {
        let mm = manager(2);
        mm.create_process(1).unwrap();
        mm.create_process(2).unwrap();
        let tmp = TempFile::new(&[1; 10]);
        let fd = mm.open_file(1, FileRef::new(tmp.clone())).unwrap();
        mm.map(1, fd, addr(10)).unwrap();
        mm.copy_from_user(1, addr(10), 1, 0).unwrap();
        for page in 0..3 {
            touch(&mm, 1, addr(page), 5);
        }
        touch(&mm, 2, addr(0), 6);
        assert!(mm.swap_free_slots() < SWAP_SLOTS as usize);

        mm.release_all(1).unwrap();
        assert_eq!(mm.pids(), [2]);
        assert_eq!(mm.frame_usage().0, 1);
        assert_eq!(tmp.open_handles(), 1);
        assert_eq!(mm.release_all(1), Err(VmError::NoSuchProcess));
        assert_consistent(&mm);

        mm.release_all(2).unwrap();
        assert_eq!(mm.frame_usage().0, 0);
        assert_eq!(mm.swap_free_slots(), SWAP_SLOTS as usize);
    }

    #[test]
    fn install_conflict_releases_the_frame() {
        let mm = manager(4);
        mm.create_process(1).unwrap();
        let taken = addr(3).page();
        mm.with_address_space(1, |space| {
            assert!(space.page_table_mut().install(taken, PhysFrame::new(5), true));
        })
        .unwrap();

        assert_eq!(mm.acquire_frame(1, taken), Err(VmError::AlreadyMapped));
        assert_eq!(mm.frame_usage().0, 0);
        assert_eq!(status(&mm, 1, taken.start()), None);

        // A mapping over the page is refused before anything is declared.
        let fd = mm
            .open_file(1, FileRef::new(TempFile::new(&[1; 2 * PAGE_FRAME_SIZE])))
            .unwrap();
        assert_eq!(mm.map(1, fd, taken.start()), Err(VmError::AlreadyMapped));
        assert_eq!(mm.map(1, fd, addr(2)), Err(VmError::AlreadyMapped));
        let declared = mm.with_address_space(1, |space| space.pages().len()).unwrap();
        assert_eq!(declared, 0);
    }

    #[test]
    fn refused_install_keeps_swapped_contents() {
        let mm = MemoryManager::<RefusingMapper>::with_memory_swap(config(1));
        mm.create_process(1).unwrap();
        let pattern: Vec<u8> = (0..PAGE_FRAME_SIZE).map(|i| (i % 241) as u8).collect();
        mm.acquire_frame(1, addr(0).page()).unwrap();
        mm.copy_to_user(1, addr(0), &pattern, 0).unwrap();
        mm.acquire_frame(1, addr(1).page()).unwrap();

        let swapped = |mm: &MemoryManager<RefusingMapper>, page| {
            mm.with_address_space(1, |space| {
                matches!(
                    space.pages().lookup(addr(page).page()).map(|entry| entry.status()),
                    Some(PageStatus::Swapped(_))
                )
            })
            .unwrap()
        };
        assert!(swapped(&mm, 0));

        mm.with_address_space(1, |space| space.page_table_mut().refuse = true)
            .unwrap();
        assert_eq!(mm.resolve_fault(1, addr(0), 0), Err(VmError::AlreadyMapped));
        assert!(swapped(&mm, 0));
        assert!(swapped(&mm, 1));
        assert_eq!(mm.frame_usage().0, 0);
        assert_eq!(mm.swap_free_slots(), SWAP_SLOTS as usize - 2);

        // A grown stack page is released the same way.
        let esp = USER_TOP - 16;
        assert_eq!(
            mm.resolve_fault(1, VirtAddr::new(esp), esp),
            Err(VmError::AlreadyMapped)
        );
        assert_eq!(mm.frame_usage().0, 0);

        mm.with_address_space(1, |space| space.page_table_mut().refuse = false)
            .unwrap();
        assert_eq!(mm.copy_from_user(1, addr(0), PAGE_FRAME_SIZE, 0).unwrap(), pattern);
        mm.release_all(1).unwrap();
        assert_eq!(mm.swap_free_slots(), SWAP_SLOTS as usize);
    }

    #[test]
    fn concurrent_processes_share_a_small_pool() {
        const PROCESSES: Pid = 4;
        const ANONYMOUS: usize = 5;
        const MAPPED: usize = 3;
        const ROUNDS: u8 = 50;

        fn fill(pid: Pid, page: usize, round: u8) -> [u8; 16] {
            [round.wrapping_add((pid as u8) << 4).wrapping_add(page as u8); 16]
        }

        let mm = manager(3);
        let files: Vec<TempFile> = (0..PROCESSES)
            .map(|_| TempFile::new(&[0; MAPPED * PAGE_FRAME_SIZE]))
            .collect();
        for (pid, file) in (1..=PROCESSES).zip(&files) {
            mm.create_process(pid).unwrap();
            let fd = mm.open_file(pid, FileRef::new(file.clone())).unwrap();
            mm.map(pid, fd, addr(ANONYMOUS)).unwrap();
            for page in 0..ANONYMOUS {
                mm.acquire_frame(pid, addr(page).page()).unwrap();
            }
        }

        thread::scope(|scope| {
            for pid in 1..=PROCESSES {
                let mm = &mm;
                scope.spawn(move || {
                    for round in 0..ROUNDS {
                        for page in 0..ANONYMOUS + MAPPED {
                            mm.copy_to_user(pid, addr(page), &fill(pid, page, round), 0)
                                .unwrap();
                        }
                        for page in 0..ANONYMOUS + MAPPED {
                            let data = mm.copy_from_user(pid, addr(page), 16, 0).unwrap();
                            assert_eq!(data, fill(pid, page, round));
                        }
                    }
                });
            }
        });
        assert_consistent(&mm);
        assert!(mm.evictions() > 0);

        for pid in 1..=PROCESSES {
            mm.release_all(pid).unwrap();
        }
        let last = ROUNDS - 1;
        for (pid, file) in (1..=PROCESSES).zip(&files) {
            let contents = file.contents();
            for page in 0..MAPPED {
                let at = page * PAGE_FRAME_SIZE;
                assert_eq!(contents[at..at + 16], fill(pid, ANONYMOUS + page, last));
            }
        }
        assert!(mm.pids().is_empty());
        assert_eq!(mm.frame_usage().0, 0);
        assert_eq!(mm.swap_free_slots(), SWAP_SLOTS as usize);
    }

    #[test]
    fn process_and_descriptor_bookkeeping() {
        let mm = manager(1);
        mm.create_process(3).unwrap();
        assert_eq!(mm.create_process(3), Err(VmError::ProcessExists));

        let fd = mm.open_file(3, FileRef::new(TempFile::new(b"abc"))).unwrap();
        assert_eq!(fd, 2);
        mm.close_file(3, fd).unwrap();
        assert_eq!(mm.close_file(3, fd), Err(VmError::BadFileDescriptor));
        assert_eq!(
            mm.acquire_frame(3, VirtAddr::new(0).page()),
            Err(VmError::BadAddress)
        );
        mm.acquire_frame(3, addr(0).page()).unwrap();
        assert_eq!(
            mm.acquire_frame(3, addr(0).page()),
            Err(VmError::DuplicatePage)
        );
    }
}
