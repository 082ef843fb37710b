pub mod memory_disk;
