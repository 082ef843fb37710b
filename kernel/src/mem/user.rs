use super::{address_space::Pid, MemoryManager, Result, VmError};
use crate::paging::PageMapper;
use alloc::vec::Vec;
use core::cmp::min;
use vmkern_shared::mem::{mem_addr_types::VirtAddr, PAGE_FRAME_SIZE};

impl<P: PageMapper> MemoryManager<P> {
    /// Walk `len` bytes of user memory from `addr`, faulting pages in as
    /// needed, and hand each page-sized piece to `f` in order.
    ///
    /// Faults are resolved as if taken at `esp`, so a system call may write
    /// just below the stack pointer.
    fn access_user(
        &self,
        pid: Pid,
        addr: VirtAddr,
        len: usize,
        esp: usize,
        write: bool,
        mut f: impl FnMut(&mut [u8]),
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let end = addr.checked_add(len).ok_or(VmError::BadAddress)?;
        if end.as_usize() > self.config.user_top {
            return Err(VmError::BadAddress);
        }

        let mut frames = self.frames.lock();
        let handle = self.space(pid)?;
        let mut guard = handle.lock();
        let space = &mut *guard;

        let mut cursor = addr;
        while cursor < end {
            let frame = self.resolve_locked(&mut frames, space, cursor, esp, write)?;
            let vpage = cursor.page();
            space.page_table.set_accessed(vpage, true);
            if write {
                space.page_table.set_dirty(vpage, true);
            }

            let offset = cursor.page_offset();
            let n = min(PAGE_FRAME_SIZE - offset, end.as_usize() - cursor.as_usize());
            f(&mut frames.frame_bytes_mut(frame)[offset..offset + n]);
            cursor = VirtAddr::new(cursor.as_usize() + n);
        }
        Ok(())
    }

    /// Copy `len` bytes out of user memory.
    pub fn copy_from_user(&self, pid: Pid, addr: VirtAddr, len: usize, esp: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        self.access_user(pid, addr, len, esp, false, |bytes| {
            out.extend_from_slice(bytes);
        })?;
        Ok(out)
    }

    /// Copy `bytes` into user memory, failing on a read-only page.
    pub fn copy_to_user(&self, pid: Pid, addr: VirtAddr, bytes: &[u8], esp: usize) -> Result<()> {
        let mut rest = bytes;
        self.access_user(pid, addr, bytes.len(), esp, true, |page| {
            let (head, tail) = rest.split_at(page.len());
            page.copy_from_slice(head);
            rest = tail;
        })
    }
}
