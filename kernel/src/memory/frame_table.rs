// Frame table and second-chance eviction
//
// Every physical page lent to the VM core is tracked here. A frame holds a
// weak link back to the page occupying it; the page stores the frame's id.
// The two links change together under the table lock: a frame's page link
// is cleared before the frame is reused, and the page's frame id is cleared
// immediately after.
//
// Lock order, outermost first: frame table, page, then file/swap, then the
// user pool. The per-address-space MMU lock is a leaf.
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

use super::page::{Page, PageRef};
use super::PGSIZE;
use crate::palloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(usize);

struct FrameSlot {
    kva: VirtAddr,
    page: Weak<Mutex<Page>>,
}

pub struct FrameTable {
    slots: Vec<Option<FrameSlot>>,
    free: Vec<usize>,
    clock_hand: usize,
}

impl FrameTable {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            clock_hand: 0,
        }
    }

    pub(super) fn kva(&self, id: FrameId) -> VirtAddr {
        self.slots[id.0].as_ref().expect("frame table: stale frame id").kva
    }

    // Drop the frame's link to its page. The frame itself stays allocated.
    pub(super) fn unlink(&mut self, id: FrameId) {
        if let Some(slot) = self.slots[id.0].as_mut() {
            slot.page = Weak::new();
        }
    }

    // Give the frame's physical page back to the user pool and retire the
    // slot for reuse.
    pub(super) fn release(&mut self, id: FrameId) {
        if let Some(slot) = self.slots[id.0].take() {
            palloc::free_page(slot.kva);
            self.free.push(id.0);
        }
    }

    fn insert(&mut self, kva: VirtAddr) -> FrameId {
        let slot = FrameSlot {
            kva,
            page: Weak::new(),
        };
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                FrameId(idx)
            }
            None => {
                self.slots.push(Some(slot));
                FrameId(self.slots.len() - 1)
            }
        }
    }

    fn page_at(&self, idx: usize) -> Option<(PageRef, Arc<crate::mmu::AddressSpace>, VirtAddr)> {
        let slot = self.slots[idx].as_ref()?;
        // Unowned frames are a transient state between eviction and reuse;
        // skip them.
        let page = slot.page.upgrade()?;
        let guard = page.lock();
        let owner = guard.owner.clone()?;
        let va = guard.va;
        drop(guard);
        Some((page, owner, va))
    }

    // Second-chance clock. The first pass clears accessed bits as it walks
    // and stops at the first cold frame; the second pass, with every bit
    // now clear, takes the first owned frame it meets. The list head is the
    // last resort.
    fn pick_victim(&mut self) -> Option<(FrameId, PageRef)> {
        let len = self.slots.len();
        if len == 0 {
            return None;
        }
        if self.clock_hand >= len {
            self.clock_hand = 0;
        }

        for _ in 0..len {
            let idx = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % len;

            let (page, owner, va) = match self.page_at(idx) {
                Some(hit) => hit,
                None => continue,
            };
            if owner.is_accessed(va) {
                owner.set_accessed(va, false);
            } else {
                return Some((FrameId(idx), page));
            }
        }

        for _ in 0..len {
            let idx = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % len;

            let (page, owner, va) = match self.page_at(idx) {
                Some(hit) => hit,
                None => continue,
            };
            if !owner.is_accessed(va) {
                return Some((FrameId(idx), page));
            }
        }

        for idx in 0..len {
            if let Some((page, _, _)) = self.page_at(idx) {
                return Some((FrameId(idx), page));
            }
        }
        None
    }
}

lazy_static! {
    static ref FRAME_TABLE: Mutex<FrameTable> = Mutex::new(FrameTable::new());
}

pub(super) fn with<R>(f: impl FnOnce(&mut FrameTable) -> R) -> R {
    f(&mut FRAME_TABLE.lock())
}

// Obtain a zeroed frame, evicting a victim when the user pool is dry.
// Never fails: an unevictable table is a kernel bug and panics.
pub(super) fn obtain() -> (FrameId, VirtAddr) {
    let mut ft = FRAME_TABLE.lock();

    if let Some(kva) = palloc::get_page() {
        return (ft.insert(kva), kva);
    }

    let (id, page) = ft
        .pick_victim()
        .expect("frame table: out of memory and nothing to evict");
    {
        let mut victim = page.lock();
        if victim.swap_out(&mut ft).is_err() {
            panic!("frame table: eviction failed");
        }
    }

    ft.unlink(id);
    let kva = ft.kva(id);
    // Recycled frames must look like fresh allocations.
    unsafe { core::ptr::write_bytes(kva.as_mut_ptr::<u8>(), 0, PGSIZE) };
    (id, kva)
}

// Tie a freshly obtained frame to its page.
pub(super) fn wire(id: FrameId, page: &PageRef) {
    let mut ft = FRAME_TABLE.lock();
    if let Some(slot) = ft.slots[id.0].as_mut() {
        slot.page = Arc::downgrade(page);
    }
    page.lock().frame = Some(id);
}

// Undo a claim that failed partway: sever the links and return the frame.
pub(super) fn discard(id: FrameId, page: &PageRef) {
    let mut ft = FRAME_TABLE.lock();
    page.lock().frame = None;
    ft.release(id);
}

/// (tracked, resident, retired) frame counts.
pub fn stats() -> (usize, usize, usize) {
    let ft = FRAME_TABLE.lock();
    let tracked = ft.slots.iter().filter(|s| s.is_some()).count();
    let resident = ft
        .slots
        .iter()
        .filter_map(|s| s.as_ref())
        .filter(|s| s.page.upgrade().is_some())
        .count();
    (tracked, resident, ft.free.len())
}

#[cfg(test)]
pub(super) fn reset() {
    let mut ft = FRAME_TABLE.lock();
    *ft = FrameTable::new();
}

#[cfg(test)]
pub(super) fn page_of(id: FrameId) -> Option<PageRef> {
    let ft = FRAME_TABLE.lock();
    ft.slots[id.0].as_ref()?.page.upgrade()
}
