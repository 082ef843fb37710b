pub mod page_replacement;

use crate::block::{Block, BlockSector, BLOCK_SECTOR_SIZE};
use alloc::{vec, vec::Vec};
use log::debug;
use vmkern_shared::mem::PAGE_FRAME_SIZE;

const SECTORS_IN_PAGE: usize = PAGE_FRAME_SIZE / BLOCK_SECTOR_SIZE;
const BITS_PER_WORD: usize = u64::BITS as usize;

/// A page-sized region of the swap device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn index(self) -> usize {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn sector(self, i: usize) -> BlockSector {
        (self.0 * SECTORS_IN_PAGE + i) as BlockSector
    }
}

/// Slot allocator and page-granular I/O over the swap block device.
///
/// The bitmap has one bit per slot, set while the slot holds a page.
/// Running out of slots, or touching a slot in the wrong state, means the
/// kernel lost track of a page and is fatal.
pub struct SwapSpace {
    device: Block,
    bitmap: Vec<u64>,
    slots: usize,
    used: usize,
}

impl SwapSpace {
    /// Sizes the bitmap to the device, with every slot free.
    pub fn new(device: Block) -> Self {
        let slots = device.get_size() as usize / SECTORS_IN_PAGE;
        Self {
            device,
            bitmap: vec![0; slots.div_ceil(BITS_PER_WORD)],
            slots,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots
    }

    pub fn free_slots(&self) -> usize {
        self.slots - self.used
    }

    pub fn is_used(&self, slot: SwapSlot) -> bool {
        self.bitmap[slot.0 / BITS_PER_WORD] >> (slot.0 % BITS_PER_WORD) & 1 != 0
    }

    fn set_used(&mut self, slot: SwapSlot, used: bool) {
        let word = &mut self.bitmap[slot.0 / BITS_PER_WORD];
        let bit = 1 << (slot.0 % BITS_PER_WORD);
        if used {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    fn check_slot(&self, slot: SwapSlot) {
        if slot.0 >= self.slots {
            panic!("swap slot {} out of bounds ({} slots)", slot.0, self.slots);
        }
    }

    /// Reserve a free slot.
    pub fn allocate_slot(&mut self) -> SwapSlot {
        let found = self.bitmap.iter().enumerate().find_map(|(i, word)| {
            let index = i * BITS_PER_WORD + (!word).trailing_zeros() as usize;
            (*word != u64::MAX && index < self.slots).then_some(index)
        });
        let Some(index) = found else {
            panic!("swap space exhausted ({} slots in use)", self.used);
        };
        let slot = SwapSlot(index);
        self.set_used(slot, true);
        self.used += 1;
        slot
    }

    /// Write one page into `slot`, which becomes used.
    pub fn write_page(&mut self, slot: SwapSlot, page: &[u8]) {
        self.check_slot(slot);
        assert_eq!(page.len(), PAGE_FRAME_SIZE, "swap writes whole pages");

        for (i, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            if let Err(err) = self.device.write(slot.sector(i), sector) {
                panic!("swap write to slot {} failed: {}", slot.0, err);
            }
        }

        if !self.is_used(slot) {
            self.set_used(slot, true);
            self.used += 1;
        }
    }

    /// Read the page in `slot` into `buf` and free the slot.
    pub fn read_page(&mut self, slot: SwapSlot, buf: &mut [u8]) {
        self.check_slot(slot);
        assert_eq!(buf.len(), PAGE_FRAME_SIZE, "swap reads whole pages");
        if !self.is_used(slot) {
            panic!("nothing stored in swap slot {}", slot.0);
        }

        for (i, sector) in buf.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
            if let Err(err) = self.device.read(slot.sector(i), sector) {
                panic!("swap read from slot {} failed: {}", slot.0, err);
            }
        }

        self.set_used(slot, false);
        self.used -= 1;
    }

    /// Discard the page in `slot` without reading it.
    pub fn free_slot(&mut self, slot: SwapSlot) {
        self.check_slot(slot);
        if !self.is_used(slot) {
            panic!("double free of swap slot {}", slot.0);
        }
        self.set_used(slot, false);
        self.used -= 1;
    }

    /// Allocate a slot and write `page` into it.
    pub fn swap_out(&mut self, page: &[u8]) -> SwapSlot {
        let slot = self.allocate_slot();
        self.write_page(slot, page);
        debug!("swapped out page to slot {}", slot.0);
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockType;
    use crate::drivers::memory_disk::MemoryDisk;
    use alloc::boxed::Box;
    use proptest::prelude::*;

    fn swap_space(slots: usize) -> SwapSpace {
        let sectors = (slots * SECTORS_IN_PAGE) as BlockSector;
        SwapSpace::new(Block::new(
            BlockType::Swap,
            "swap",
            sectors,
            Box::new(MemoryDisk::new(sectors)),
        ))
    }

    fn pattern(seed: u8) -> Vec<u8> {
        (0..PAGE_FRAME_SIZE)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn capacity_follows_device_size() {
        let swap = swap_space(5);
        assert_eq!(swap.capacity(), 5);
        assert_eq!(swap.free_slots(), 5);

        // A partial page worth of sectors at the end is unusable.
        let sectors = (2 * SECTORS_IN_PAGE + 3) as BlockSector;
        let swap = SwapSpace::new(Block::new(
            BlockType::Swap,
            "swap",
            sectors,
            Box::new(MemoryDisk::new(sectors)),
        ));
        assert_eq!(swap.capacity(), 2);
    }

    #[test]
    fn round_trip_frees_slot() {
        let mut swap = swap_space(4);
        let first = swap.swap_out(&pattern(1));
        let second = swap.swap_out(&pattern(2));
        assert_ne!(first, second);
        assert_eq!(swap.free_slots(), 2);

        let mut buf = vec![0; PAGE_FRAME_SIZE];
        swap.read_page(second, &mut buf);
        assert_eq!(buf, pattern(2));
        assert!(!swap.is_used(second));
        assert_eq!(swap.free_slots(), 3);

        // The freed slot is handed out again.
        assert_eq!(swap.allocate_slot(), second);
    }

    #[test]
    fn free_slot_discards() {
        let mut swap = swap_space(1);
        let slot = swap.swap_out(&pattern(0));
        swap.free_slot(slot);
        assert_eq!(swap.free_slots(), 1);
        assert_eq!(swap.swap_out(&pattern(9)), slot);
    }

    #[test]
    fn bitmap_spans_words() {
        let mut swap = swap_space(70);
        let slots: Vec<_> = (0..70).map(|_| swap.allocate_slot()).collect();
        assert_eq!(slots.last().map(|slot| slot.index()), Some(69));
        assert_eq!(swap.free_slots(), 0);
        swap.free_slot(SwapSlot(65));
        assert_eq!(swap.allocate_slot(), SwapSlot(65));
    }

    #[test]
    #[should_panic(expected = "swap space exhausted")]
    fn exhaustion_is_fatal() {
        let mut swap = swap_space(2);
        swap.allocate_slot();
        swap.allocate_slot();
        swap.allocate_slot();
    }

    #[test]
    #[should_panic(expected = "nothing stored")]
    fn reading_free_slot_is_fatal() {
        let mut swap = swap_space(2);
        let mut buf = vec![0; PAGE_FRAME_SIZE];
        swap.read_page(SwapSlot(1), &mut buf);
    }

    proptest! {
        #[test]
        fn pages_survive_interleaved_swapping(seeds in proptest::collection::vec(any::<u8>(), 1..16)) {
            let mut swap = swap_space(16);
            let stored: Vec<_> = seeds.iter().map(|&seed| (seed, swap.swap_out(&pattern(seed)))).collect();
            prop_assert_eq!(swap.free_slots(), 16 - seeds.len());

            // Read back in reverse so slots are freed out of allocation order.
            let mut buf = vec![0; PAGE_FRAME_SIZE];
            for (seed, slot) in stored.into_iter().rev() {
                swap.read_page(slot, &mut buf);
                prop_assert_eq!(&buf, &pattern(seed));
            }
            prop_assert_eq!(swap.free_slots(), 16);
        }
    }
}
