mod address_space;
mod error;
pub mod frame_allocator;
pub mod frame_table;
mod manager;
pub mod mmap;
pub mod page;
pub mod user;

pub use address_space::{AddressSpace, Pid};
pub use error::{Result, VmError};
pub use manager::MemoryManager;

use vmkern_shared::{
    mem::{STACK_LIMIT, STACK_PUSH_MARGIN, USER_BASE, USER_TOP},
    sizes::SWAP_SECTORS,
};

/// Frames in the user pool when no size is given.
pub const DEFAULT_USER_FRAMES: usize = 64;

/// Runtime parameters of a [`MemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Frames in the user pool.
    pub user_frames: usize,
    /// Sectors of the swap device created by [`MemoryManager::with_memory_swap`].
    pub swap_sectors: u32,
    /// Bytes below `user_top` the stack may grow to.
    pub stack_limit: usize,
    /// How far below the stack pointer a fault still counts as stack growth.
    pub push_margin: usize,
    /// Lowest user address.
    pub user_base: usize,
    /// One past the highest user address.
    pub user_top: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: DEFAULT_USER_FRAMES,
            swap_sectors: SWAP_SECTORS,
            stack_limit: STACK_LIMIT,
            push_margin: STACK_PUSH_MARGIN,
            user_base: USER_BASE,
            user_top: USER_TOP,
        }
    }
}

impl VmConfig {
    pub fn with_frames(user_frames: usize) -> Self {
        Self {
            user_frames,
            ..Self::default()
        }
    }

    /// Whether `addr` lies in the user range.
    pub fn is_user_address(&self, addr: usize) -> bool {
        (self.user_base..self.user_top).contains(&addr)
    }

    /// Lowest address the stack may grow down to.
    pub fn stack_floor(&self) -> usize {
        self.user_top.saturating_sub(self.stack_limit)
    }
}
