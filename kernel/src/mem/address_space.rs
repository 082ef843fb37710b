use super::{mmap::MmapTable, page::SupplementalPageTable};
use crate::fs::FileTable;
use crate::paging::{PageManager, PageMapper};

pub type Pid = u16;

/// Everything the memory manager tracks for one user process.
pub struct AddressSpace<P: PageMapper = PageManager> {
    pid: Pid,
    pub(super) pages: SupplementalPageTable,
    pub(super) page_table: P,
    pub(super) files: FileTable,
    pub(super) mmaps: MmapTable,
}

impl<P: PageMapper> AddressSpace<P> {
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            pages: SupplementalPageTable::new(),
            page_table: P::default(),
            files: FileTable::new(),
            mmaps: MmapTable::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pages(&self) -> &SupplementalPageTable {
        &self.pages
    }

    pub fn page_table(&self) -> &P {
        &self.page_table
    }

    /// The hardware sets accessed and dirty bits behind the kernel's back;
    /// this is how tests and drivers do the same.
    pub fn page_table_mut(&mut self) -> &mut P {
        &mut self.page_table
    }

    pub fn files(&self) -> &FileTable {
        &self.files
    }

    pub fn mmaps(&self) -> &MmapTable {
        &self.mmaps
    }
}
