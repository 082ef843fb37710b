use alloc::{boxed::Box, vec};
use bitbybit::bitfield;
use vmkern_shared::mem::{mem_addr_types::PhysFrame, PAGE_FRAME_SIZE};

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

/// The pool of physical frames handed to user pages.
///
/// Frames are single pages placed next-fit: the search for a free frame
/// starts where the previous one ended. Every frame comes out zero-filled.
pub struct UserPool {
    memory: Box<[u8]>,
    core_map: Box<[CoreMapEntry]>,
    frames_allocated: usize,
    position: usize,
}

impl UserPool {
    pub fn new(frames: usize) -> Self {
        Self {
            memory: vec![0; frames * PAGE_FRAME_SIZE].into_boxed_slice(),
            core_map: vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
            frames_allocated: 0,
            position: 0,
        }
    }

    /// Allocate one zeroed frame, or `None` if every frame is in use.
    pub fn alloc(&mut self) -> Option<PhysFrame> {
        let total_frames = self.core_map.len();
        if self.frames_allocated == total_frames {
            return None;
        }

        let index = (0..total_frames)
            .map(|i| (self.position + i) % total_frames)
            .find(|&i| !self.core_map[i].allocated())?;

        self.core_map[index] = self.core_map[index].with_allocated(true);
        self.position = (index + 1) % total_frames;
        self.frames_allocated += 1;

        let frame = PhysFrame::new(index);
        self.frame_mut(frame).fill(0);
        Some(frame)
    }

    pub fn dealloc(&mut self, frame: PhysFrame) {
        let index = frame.number();
        if !self.core_map[index].allocated() {
            panic!("double free of frame {index}");
        }
        self.core_map[index] = self.core_map[index].with_allocated(false);
        self.frames_allocated -= 1;
    }

    /// The page of memory behind `frame`.
    pub fn frame(&self, frame: PhysFrame) -> &[u8] {
        let start = frame.start_address();
        &self.memory[start..start + PAGE_FRAME_SIZE]
    }

    pub fn frame_mut(&mut self, frame: PhysFrame) -> &mut [u8] {
        let start = frame.start_address();
        &mut self.memory[start..start + PAGE_FRAME_SIZE]
    }

    pub fn is_allocated(&self, frame: PhysFrame) -> bool {
        self.core_map[frame.number()].allocated()
    }

    pub fn capacity(&self) -> usize {
        self.core_map.len()
    }

    pub fn frames_allocated(&self) -> usize {
        self.frames_allocated
    }
}
