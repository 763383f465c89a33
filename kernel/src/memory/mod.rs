// Virtual memory core
//
// Per-process page tables are supplemented with descriptors that know how
// to materialize a page on first touch, push it out under memory pressure,
// and bring it back on the next fault. One fault entry point drives lazy
// loading, swap-in, stack growth and permission enforcement; one pool of
// frames backs every address space.
mod anon;
pub mod file_map;
pub mod frame_table;
pub mod page;
pub mod spt;
pub mod swap;


use alloc::boxed::Box;
use x86_64::VirtAddr;

use crate::disk;
use crate::thread::{Thread, TrapFrame};

pub use file_map::{do_mmap, do_munmap, lazy_load_file, FileMapAux};
pub use page::{Initializer, LoadAux, Page, PageKind, PageRef};
pub use spt::{spt_copy, SupplementalPageTable};

pub const PGSIZE: usize = 4096;

// User address space layout. The stack tops out at USER_STACK and may grow
// down at most MAX_STACK_BYTES; nothing is ever mapped below VM_FLOOR.
pub const USER_SPACE_END: u64 = 0x0000_7FFF_FFFF_F000;
pub const USER_STACK: u64 = 0x4748_0000;
pub const MAX_STACK_BYTES: u64 = 1 << 20;
pub const STACK_SLACK: u64 = 8;
pub const VM_FLOOR: u64 = 0x10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    OutOfMemory,
    AddressInUse,
    NotFound,
    MappingFailed,
    LoadFailed,
    SwapMissing,
    NotResident,
}

pub fn pg_round_down(va: VirtAddr) -> VirtAddr {
    va.align_down(PGSIZE as u64)
}

/// Bring up the VM subsystems. The swap device must have been registered at
/// disk slot (1, 1) beforehand. Safe to call more than once during boot.
pub fn vm_init() {
    match disk::take(1, 1) {
        Some(swap_disk) => swap::init(swap_disk),
        None => assert!(swap::is_initialized(), "vm: swap disk not registered"),
    }
    crate::serial_println!("VM core initialized");
}

/// Register a lazy page at `va`. `kind` is what the page will become on
/// first touch; `init` runs against the fresh frame with `aux` at that
/// moment. Nothing is allocated here beyond the descriptor.
pub fn vm_alloc_page_with_initializer(
    thread: &mut Thread,
    kind: PageKind,
    va: VirtAddr,
    writable: bool,
    init: Option<Initializer>,
    aux: Option<Box<dyn LoadAux>>,
) -> Result<(), VmError> {
    let page_initializer = match kind {
        PageKind::Anon => anon::initializer as page::KindInitializer,
        PageKind::File => file_map::initializer as page::KindInitializer,
        PageKind::Uninit => return Err(VmError::LoadFailed),
    };

    let va = pg_round_down(va);
    let page = Page::new_uninit(va, writable, kind, init, aux, page_initializer);
    thread.spt.insert(page)?;
    Ok(())
}

/// `vm_alloc_page_with_initializer` without a loader: the page comes up
/// zero-filled (anon) or window-filled (file, via its payload) on claim.
pub fn vm_alloc_page(
    thread: &mut Thread,
    kind: PageKind,
    va: VirtAddr,
    writable: bool,
) -> Result<(), VmError> {
    vm_alloc_page_with_initializer(thread, kind, va, writable, None, None)
}

/// Materialize the page registered at `va`.
pub fn vm_claim_page(thread: &mut Thread, va: VirtAddr) -> Result<(), VmError> {
    let page = thread.spt.find(va).ok_or(VmError::NotFound)?;
    vm_do_claim_page(&page, thread)
}

// Obtain a frame, wire it to the page, install the translation, then let
// the page pull its contents in. A failure past the PTE install unwinds:
// the translation is removed and the frame goes back to the pool.
pub(crate) fn vm_do_claim_page(page: &PageRef, thread: &Thread) -> Result<(), VmError> {
    let (id, kva) = frame_table::obtain();

    page.lock().owner = Some(thread.addr_space.clone());
    frame_table::wire(id, page);

    let (va, writable) = {
        let page = page.lock();
        (page.va(), page.writable())
    };
    if !thread.addr_space.set_page(va, kva, writable) {
        frame_table::discard(id, page);
        return Err(VmError::MappingFailed);
    }

    if let Err(err) = page.lock().swap_in(kva) {
        thread.addr_space.clear_page(va);
        frame_table::discard(id, page);
        return Err(err);
    }
    Ok(())
}

/// Page-fault entry point. Returns true when the fault was resolved and
/// the faulting instruction can be retried; false means the access was
/// invalid and the caller must terminate the process.
pub fn vm_try_handle_fault(
    thread: &mut Thread,
    tf: &TrapFrame,
    addr: VirtAddr,
    user: bool,
    write: bool,
    not_present: bool,
) -> bool {
    let raw = addr.as_u64();
    if raw == 0 || raw < VM_FLOOR || raw >= USER_SPACE_END {
        return false;
    }

    if let Some(page) = thread.spt.find(addr) {
        let writable = page.lock().writable();
        if write && !writable {
            return false;
        }
        if not_present {
            // Both the lazy first touch and a swap-in after eviction.
            return vm_do_claim_page(&page, thread).is_ok();
        }
        if write {
            return vm_handle_wp(&page);
        }
        return false;
    }

    if not_present {
        // No descriptor: only a stack access just below the mapped stack
        // may fault a fresh page into existence.
        let rsp = if user { tf.rsp } else { thread.user_rsp };
        if !stack_growth_eligible(addr, rsp) {
            return false;
        }
        return vm_stack_growth(thread, addr).is_ok();
    }

    false
}

// A push writes 8 bytes below rsp before rsp moves, hence the slack.
fn stack_growth_eligible(addr: VirtAddr, rsp: VirtAddr) -> bool {
    let addr = addr.as_u64();
    addr >= USER_STACK - MAX_STACK_BYTES
        && addr < USER_STACK
        && addr >= rsp.as_u64().saturating_sub(STACK_SLACK)
}

fn vm_stack_growth(thread: &mut Thread, addr: VirtAddr) -> Result<(), VmError> {
    let va = pg_round_down(addr);
    vm_alloc_page(thread, PageKind::Anon, va, true)?;
    vm_claim_page(thread, va)
}

// Write fault on a present, writable mapping. Copy-on-write would resolve
// it here; without COW no such fault is ever legitimate.
fn vm_handle_wp(_page: &PageRef) -> bool {
    false
}

// Run the page's teardown hook and drop the descriptor.
pub(crate) fn vm_dealloc_page(page: PageRef) {
    frame_table::with(|ft| {
        page.lock().destroy(ft);
    });
}

#[cfg(test)]
pub(crate) fn vm_reset_for_tests(pool_pages: usize, swap_sectors: u64) {
    use crate::palloc;

    frame_table::reset();
    swap::reset();
    palloc::init_user_pool(Box::new(palloc::HeapPool::with_capacity(pool_pages)));
    disk::register(1, 1, Box::new(disk::RamDisk::new(swap_sectors)));
    vm_init();
}
