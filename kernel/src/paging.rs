use vmkern_shared::mem::mem_addr_types::{PhysFrame, VirtPage};

pub use vmkern_shared::paging::PageManager;

/// Installation and inspection of user mappings in one address space.
pub trait PageMapper: Default + Send {
    /// Maps `page` to `frame` as a user page. Returns `false` if the page
    /// already has a mapping or cannot be mapped.
    #[must_use]
    fn install(&mut self, page: VirtPage, frame: PhysFrame, writable: bool) -> bool;

    /// Removes the mapping for `page`, returning the frame it pointed to.
    fn clear(&mut self, page: VirtPage) -> Option<PhysFrame>;

    fn translate(&self, page: VirtPage) -> Option<PhysFrame>;

    fn is_writable(&self, page: VirtPage) -> bool;

    fn is_dirty(&self, page: VirtPage) -> bool;

    fn set_dirty(&mut self, page: VirtPage, dirty: bool);

    fn is_accessed(&self, page: VirtPage) -> bool;

    fn set_accessed(&mut self, page: VirtPage, accessed: bool);

    /// Whether `page` was accessed since the last call, clearing the bit.
    fn test_and_clear_accessed(&mut self, page: VirtPage) -> bool {
        let accessed = self.is_accessed(page);
        if accessed {
            self.set_accessed(page, false);
        }
        accessed
    }
}

impl PageMapper for PageManager {
    fn install(&mut self, page: VirtPage, frame: PhysFrame, writable: bool) -> bool {
        self.map(frame, page, writable, true)
    }

    fn clear(&mut self, page: VirtPage) -> Option<PhysFrame> {
        self.unmap(page)
    }

    fn translate(&self, page: VirtPage) -> Option<PhysFrame> {
        PageManager::translate(self, page)
    }

    fn is_writable(&self, page: VirtPage) -> bool {
        PageManager::is_writable(self, page)
    }

    fn is_dirty(&self, page: VirtPage) -> bool {
        PageManager::is_dirty(self, page)
    }

    fn set_dirty(&mut self, page: VirtPage, dirty: bool) {
        PageManager::set_dirty(self, page, dirty);
    }

    fn is_accessed(&self, page: VirtPage) -> bool {
        PageManager::is_accessed(self, page)
    }

    fn set_accessed(&mut self, page: VirtPage, accessed: bool) {
        PageManager::set_accessed(self, page, accessed);
    }
}
