use crate::mem::frame_table::FrameOwner;
use vmkern_shared::mem::mem_addr_types::PhysFrame;

pub trait PageReplacementPolicy: Send {
    /// Picks an occupied frame to evict, or `None` if no frame is occupied.
    ///
    /// `frames` is indexed by frame number. `referenced` reports whether the
    /// owner touched the frame since it was last asked, clearing the
    /// accessed bit as a side effect.
    fn select_victim(
        &mut self,
        frames: &[Option<FrameOwner>],
        referenced: &mut dyn FnMut(PhysFrame, &FrameOwner) -> bool,
    ) -> Option<PhysFrame>;
}

/// Second-chance (clock) replacement.
///
/// The hand sweeps the frame table, clearing accessed bits, and stops at the
/// first occupied frame that was not referenced. Two full sweeps always find
/// a victim because the first one clears every bit.
#[derive(Default)]
pub struct ClockEviction {
    hand: usize,
}

impl PageReplacementPolicy for ClockEviction {
    fn select_victim(
        &mut self,
        frames: &[Option<FrameOwner>],
        referenced: &mut dyn FnMut(PhysFrame, &FrameOwner) -> bool,
    ) -> Option<PhysFrame> {
        let len = frames.len();
        if len == 0 {
            return None;
        }

        let mut fallback = None;
        for _ in 0..2 * len {
            let index = self.hand % len;
            self.hand = (index + 1) % len;
            let Some(owner) = &frames[index] else {
                continue;
            };
            let frame = PhysFrame::new(index);
            fallback.get_or_insert(frame);
            if !referenced(frame, owner) {
                return Some(frame);
            }
        }

        // Only reachable if the accessed bits are set again while sweeping.
        fallback
    }
}
