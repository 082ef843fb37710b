//! Entry points from the trap handlers into the memory manager.
//!
//! Failures here never reach the kernel: a bad access terminates the
//! offending process and everything else keeps running.

use crate::fs::FileDescriptor;
use crate::mem::{mmap::MapId, MemoryManager, Pid, VmError};
use crate::paging::PageMapper;
use log::{info, warn};
use vmkern_shared::mem::mem_addr_types::VirtAddr;

/// Exit status of a process killed by the kernel.
pub const KILLED_STATUS: i32 = -1;

/// Returned by mmap when no mapping was made.
pub const MAP_FAILED: isize = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Return to the faulting instruction.
    Resume,
    /// The process has been torn down and exits with this status.
    Terminate(i32),
}

fn kill<P: PageMapper>(mm: &MemoryManager<P>, pid: Pid, err: VmError) -> FaultDisposition {
    warn!("killing process {pid}: {err}");
    if let Err(err) = mm.release_all(pid) {
        warn!("process {pid} had no address space to release: {err}");
    }
    FaultDisposition::Terminate(KILLED_STATUS)
}

/// Service a page fault taken by `pid` at `addr`. `write` is the write bit
/// of the fault error code.
pub fn handle_page_fault<P: PageMapper>(
    mm: &MemoryManager<P>,
    pid: Pid,
    addr: usize,
    esp: usize,
    write: bool,
) -> FaultDisposition {
    match mm.resolve_access(pid, VirtAddr::new(addr), esp, write) {
        Ok(()) => FaultDisposition::Resume,
        Err(err) => kill(mm, pid, err),
    }
}

/// mmap(fd, addr). Returns the mapping id, or `MAP_FAILED`.
pub fn sys_mmap<P: PageMapper>(
    mm: &MemoryManager<P>,
    pid: Pid,
    fd: FileDescriptor,
    addr: usize,
) -> isize {
    match mm.map(pid, fd, VirtAddr::new(addr)) {
        Ok(id) => isize::try_from(id.as_raw()).unwrap_or(MAP_FAILED),
        Err(err) => {
            info!("process {pid}: mmap of fd {fd} at {addr:#x} failed: {err}");
            MAP_FAILED
        }
    }
}

/// munmap(id). An id that was never mapped kills the caller.
pub fn sys_munmap<P: PageMapper>(mm: &MemoryManager<P>, pid: Pid, id: isize) -> FaultDisposition {
    let result = u32::try_from(id)
        .map_err(|_| VmError::UnknownMapping)
        .and_then(|id| mm.unmap(pid, MapId::new(id)));
    match result {
        Ok(()) => FaultDisposition::Resume,
        Err(err) => kill(mm, pid, err),
    }
}

/// exit(status). Releases the address space and hands `status` back for the
/// parent to collect.
pub fn sys_exit<P: PageMapper>(mm: &MemoryManager<P>, pid: Pid, status: i32) -> i32 {
    if let Err(err) = mm.release_all(pid) {
        warn!("process {pid} exited without an address space: {err}");
    }
    status
}
