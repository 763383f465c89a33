// User-pool page allocator
//
// The VM core draws its physical frames from a fixed pool of 4 KiB pages.
// The pool itself belongs to the platform layer; this module defines the
// interface the core consumes and a heap-backed pool used on the host and
// during bring-up. Pages handed out are always zeroed.
use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

use crate::memory::PGSIZE;

pub trait UserPool: Send {
    /// Allocate one zeroed page, or None when the pool is exhausted.
    fn get_page(&mut self) -> Option<VirtAddr>;
    fn free_page(&mut self, kva: VirtAddr);
}

// Capacity-bounded pool carved out of the kernel heap. The bound is what
// makes eviction observable at all; an unbounded pool never evicts.
pub struct HeapPool {
    capacity: usize,
    allocated: usize,
}

impl HeapPool {
    pub fn with_capacity(pages: usize) -> Self {
        Self {
            capacity: pages,
            allocated: 0,
        }
    }

    fn layout() -> Layout {
        Layout::from_size_align(PGSIZE, PGSIZE).unwrap()
    }
}

impl UserPool for HeapPool {
    fn get_page(&mut self) -> Option<VirtAddr> {
        if self.allocated >= self.capacity {
            return None;
        }

        let ptr = unsafe { alloc_zeroed(Self::layout()) };
        if ptr.is_null() {
            return None;
        }

        self.allocated += 1;
        Some(VirtAddr::from_ptr(ptr))
    }

    fn free_page(&mut self, kva: VirtAddr) {
        unsafe { dealloc(kva.as_mut_ptr(), Self::layout()) };
        self.allocated = self.allocated.saturating_sub(1);
    }
}

lazy_static! {
    static ref USER_POOL: Mutex<Option<Box<dyn UserPool>>> = Mutex::new(None);
}

pub fn init_user_pool(pool: Box<dyn UserPool>) {
    let mut slot = USER_POOL.lock();
    *slot = Some(pool);
}

// Allocate one zeroed page from the user pool.
pub fn get_page() -> Option<VirtAddr> {
    let mut pool = USER_POOL.lock();
    pool.as_mut()
        .expect("palloc: user pool not initialized")
        .get_page()
}

// Return a page to the user pool.
pub fn free_page(kva: VirtAddr) {
    let mut pool = USER_POOL.lock();
    pool.as_mut()
        .expect("palloc: user pool not initialized")
        .free_page(kva);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_bounded_and_zeroed() {
        let mut pool = HeapPool::with_capacity(2);

        let a = pool.get_page().unwrap();
        let b = pool.get_page().unwrap();
        assert!(pool.get_page().is_none());

        let bytes = unsafe { core::slice::from_raw_parts(a.as_ptr::<u8>(), PGSIZE) };
        assert!(bytes.iter().all(|&x| x == 0));

        // Dirty a page, free it, and check a fresh allocation is zeroed again.
        unsafe { core::ptr::write_bytes(b.as_mut_ptr::<u8>(), 0xAB, PGSIZE) };
        pool.free_page(b);
        let c = pool.get_page().unwrap();
        let bytes = unsafe { core::slice::from_raw_parts(c.as_ptr::<u8>(), PGSIZE) };
        assert!(bytes.iter().all(|&x| x == 0));

        pool.free_page(a);
        pool.free_page(c);
    }
}
