// Supplemental page table
//
// Per-address-space map from page-aligned VA to page descriptor. The owning
// thread is the only one that touches it, except during fork where the
// parent walks its own table to populate the child's.
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;
use spin::Mutex;
use x86_64::VirtAddr;

use super::file_map::{self, FileMapAux};
use super::page::{Initializer, LoadAux, Page, PageKind, PagePayload, PageRef};
use super::{frame_table, pg_round_down, VmError, PGSIZE};
use crate::thread::Thread;

pub struct SupplementalPageTable {
    pages: HashMap<u64, PageRef>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }

    /// Descriptor covering `va`, if any. `va` need not be aligned.
    pub fn find(&self, va: VirtAddr) -> Option<PageRef> {
        self.pages.get(&pg_round_down(va).as_u64()).cloned()
    }

    /// Register a descriptor. Fails if its VA is already covered.
    pub fn insert(&mut self, page: Page) -> Result<PageRef, VmError> {
        let key = page.va().as_u64();
        if self.pages.contains_key(&key) {
            return Err(VmError::AddressInUse);
        }

        let page = Arc::new(Mutex::new(page));
        self.pages.insert(key, page.clone());
        Ok(page)
    }

    /// Drop the descriptor covering `va`, releasing whatever it holds.
    pub fn remove(&mut self, va: VirtAddr) -> bool {
        match self.pages.remove(&pg_round_down(va).as_u64()) {
            Some(page) => {
                super::vm_dealloc_page(page);
                true
            }
            None => false,
        }
    }

    /// Destroy every descriptor. Dirty file pages write back, swap slots
    /// and frames are released.
    pub fn kill(&mut self) {
        for (_, page) in self.pages.drain() {
            super::vm_dealloc_page(page);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(super) fn iter(&self) -> impl Iterator<Item = &PageRef> {
        self.pages.values()
    }
}

impl Default for SupplementalPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SupplementalPageTable {
    fn drop(&mut self) {
        self.kill();
    }
}

enum CopyPlan {
    Uninit {
        target: PageKind,
        init: Option<Initializer>,
        aux: Option<Box<dyn LoadAux>>,
    },
    File {
        aux: FileMapAux,
    },
    Anon,
}

/// Populate `dst` with private copies of everything mapped in `src`.
///
/// Pages that were never touched stay lazy in the child: the descriptor and
/// a deep copy of its loader aux are enough. Materialized file pages are
/// reinstalled lazily too, over the same (shared) file handle. Anonymous
/// pages are claimed in the child right away and the parent's resident
/// bytes copied over; a parent page sitting in swap is not brought back, so
/// the child sees zeros for it.
pub fn spt_copy(dst: &mut Thread, src: &Thread) -> Result<(), VmError> {
    dst.spt.kill();

    let src_pages: Vec<PageRef> = src.spt.iter().cloned().collect();
    for src_page in src_pages {
        let (va, writable, next_page, plan) = {
            let page = src_page.lock();
            let plan = match &page.payload {
                PagePayload::Uninit(uninit) => CopyPlan::Uninit {
                    target: uninit.target,
                    init: uninit.init,
                    aux: uninit.aux.as_ref().map(|aux| aux.duplicate()),
                },
                PagePayload::File(fp) => CopyPlan::File {
                    aux: FileMapAux {
                        file: fp.file.reopen(),
                        offset: fp.offset,
                        read_bytes: fp.read_bytes,
                    },
                },
                PagePayload::Anon(_) => CopyPlan::Anon,
            };
            (page.va(), page.writable(), page.next_page, plan)
        };

        match plan {
            CopyPlan::Uninit { target, init, aux } => {
                super::vm_alloc_page_with_initializer(dst, target, va, writable, init, aux)?;
            }
            CopyPlan::File { aux } => {
                super::vm_alloc_page_with_initializer(
                    dst,
                    PageKind::File,
                    va,
                    writable,
                    Some(file_map::lazy_load_file),
                    Some(Box::new(aux)),
                )?;
            }
            CopyPlan::Anon => {
                super::vm_alloc_page(dst, PageKind::Anon, va, writable)?;
                let child = dst.spt.find(va).ok_or(VmError::NotFound)?;
                super::vm_do_claim_page(&child, dst)?;

                let src_frame = src_page.lock().frame;
                let dst_frame = child.lock().frame;
                if let (Some(src_frame), Some(dst_frame)) = (src_frame, dst_frame) {
                    frame_table::with(|ft| {
                        let src_kva = ft.kva(src_frame);
                        let dst_kva = ft.kva(dst_frame);
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                src_kva.as_ptr::<u8>(),
                                dst_kva.as_mut_ptr::<u8>(),
                                PGSIZE,
                            );
                        }
                    });
                }
            }
        }

        // Preserve mmap run links so the child can unmap inherited regions.
        if next_page.is_some() {
            if let Some(child) = dst.spt.find(va) {
                child.lock().next_page = next_page;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{vm_alloc_page, PageKind, USER_STACK};

    #[test]
    fn find_rounds_down_and_insert_rejects_collisions() {
        let mut thread = Thread::new();
        let va = VirtAddr::new(0x4000_0000);

        vm_alloc_page(&mut thread, PageKind::Anon, va, true).unwrap();

        let head = thread.spt.find(va).unwrap();
        let inner = thread.spt.find(va + 0x123u64).unwrap();
        assert!(Arc::ptr_eq(&head, &inner));
        assert_eq!(head.lock().va(), va);

        // Same page, same descriptor slot: refused.
        assert_eq!(
            vm_alloc_page(&mut thread, PageKind::Anon, va + 0x123u64, true),
            Err(VmError::AddressInUse)
        );

        assert!(thread.spt.find(VirtAddr::new(USER_STACK)).is_none());
    }

    #[test]
    fn remove_unclaimed_page() {
        let mut thread = Thread::new();
        let va = VirtAddr::new(0x4000_0000);

        vm_alloc_page(&mut thread, PageKind::Anon, va, true).unwrap();
        assert_eq!(thread.spt.len(), 1);

        assert!(thread.spt.remove(va));
        assert!(thread.spt.is_empty());
        assert!(!thread.spt.remove(va));
    }
}
