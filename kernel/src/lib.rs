#![cfg_attr(target_os = "none", no_std)]

//! Demand-paged virtual memory for user processes: a frame table with clock
//! eviction, per-process supplemental page tables, swap, and memory-mapped
//! files.

extern crate alloc;

pub mod block;
pub mod drivers;
pub mod fs;
pub mod mem;
pub mod paging;
pub mod swapping;
pub mod user_program;

pub use mem::{MemoryManager, Pid, Result, VmConfig, VmError};
