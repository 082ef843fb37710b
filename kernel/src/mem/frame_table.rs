use super::{address_space::Pid, frame_allocator::UserPool};
use crate::swapping::page_replacement::{ClockEviction, PageReplacementPolicy};
use alloc::{boxed::Box, vec};
use vmkern_shared::mem::mem_addr_types::{PhysFrame, VirtPage};

/// Which user page occupies a frame.
///
/// This is a back-reference only. The page entry in the owner's address
/// space is the authority on where the page lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    pub pid: Pid,
    pub vpage: VirtPage,
}

/// Every frame of the user pool, indexed by frame number, with its owner.
pub struct FrameTable {
    pool: UserPool,
    entries: Box<[Option<FrameOwner>]>,
    policy: Box<dyn PageReplacementPolicy>,
    evictions: usize,
}

impl FrameTable {
    pub fn new(frames: usize) -> Self {
        Self::with_policy(frames, Box::new(ClockEviction::default()))
    }

    pub fn with_policy(frames: usize, policy: Box<dyn PageReplacementPolicy>) -> Self {
        Self {
            pool: UserPool::new(frames),
            entries: vec![None; frames].into_boxed_slice(),
            policy,
            evictions: 0,
        }
    }

    /// Take a free frame for `owner`, or `None` if the pool is exhausted.
    pub fn try_alloc(&mut self, owner: FrameOwner) -> Option<PhysFrame> {
        let frame = self.pool.alloc()?;
        self.entries[frame.number()] = Some(owner);
        Some(frame)
    }

    /// Unregister `frame` and hand it back to the pool.
    pub fn release(&mut self, frame: PhysFrame) {
        if self.entries[frame.number()].take().is_none() {
            panic!("released frame {} has no owner", frame.number());
        }
        self.pool.dealloc(frame);
    }

    /// Ask the replacement policy for a victim and count the eviction.
    pub fn select_victim(
        &mut self,
        referenced: &mut dyn FnMut(PhysFrame, &FrameOwner) -> bool,
    ) -> Option<(PhysFrame, FrameOwner)> {
        let frame = self.policy.select_victim(&self.entries, referenced)?;
        let owner = self.entries[frame.number()]?;
        self.evictions += 1;
        Some((frame, owner))
    }

    pub fn owner(&self, frame: PhysFrame) -> Option<FrameOwner> {
        self.entries.get(frame.number()).copied().flatten()
    }

    /// Occupied frames with their owners.
    pub fn resident_frames(&self) -> impl Iterator<Item = (PhysFrame, FrameOwner)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, owner)| owner.map(|owner| (PhysFrame::new(i), owner)))
    }

    pub fn frame_bytes(&self, frame: PhysFrame) -> &[u8] {
        self.pool.frame(frame)
    }

    pub fn frame_bytes_mut(&mut self, frame: PhysFrame) -> &mut [u8] {
        self.pool.frame_mut(frame)
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn frames_in_use(&self) -> usize {
        self.pool.frames_allocated()
    }

    /// Victims chosen since creation.
    pub fn evictions(&self) -> usize {
        self.evictions
    }
}
