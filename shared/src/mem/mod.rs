pub mod mem_addr_types;

use crate::sizes::{KB, MB};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;
pub const PAGE_SHIFT: usize = 12;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x8000_0000;

// One past the highest user address.
pub const USER_TOP: usize = OFFSET;

// Lowest address a user program may touch. Everything below it stays unmapped
// so that small offsets from a null pointer always fault.
pub const USER_BASE: usize = 0x0804_8000;

// The user stack grows down from OFFSET and may not exceed this many bytes.
pub const STACK_LIMIT: usize = 8 * MB;

// PUSHA writes 32 bytes below the stack pointer before adjusting it.
pub const STACK_PUSH_MARGIN: usize = 32;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_FRAME_SIZE);
const _: () = assert!(USER_BASE % PAGE_FRAME_SIZE == 0);
