#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod mem;
pub mod paging;
pub mod sizes;
