// Anonymous pages
//
// Zero-initialized private memory. The first claim goes through the uninit
// path and lands on a zeroed frame; after that the page shuttles between a
// frame and a swap slot. A page holds a slot only while its data is on the
// swap device.
use x86_64::VirtAddr;

use super::frame_table::FrameTable;
use super::page::{AnonPage, LoadAux, Page, PageKind, PagePayload};
use super::{swap, VmError};

// Transmutation target: replace the uninit payload with a slotless
// anonymous one. The frame contents are already zeroed by the allocator.
pub(super) fn initializer(
    page: &mut Page,
    target: PageKind,
    _kva: VirtAddr,
    _aux: Option<&dyn LoadAux>,
) -> Result<(), VmError> {
    debug_assert_eq!(target, PageKind::Anon);
    page.payload = PagePayload::Anon(AnonPage { swap_slot: None });
    Ok(())
}

// Read the page back from its swap slot and give the slot up.
pub(super) fn swap_in(page: &mut Page, kva: VirtAddr) -> Result<(), VmError> {
    let anon = match &mut page.payload {
        PagePayload::Anon(anon) => anon,
        _ => return Err(VmError::SwapMissing),
    };

    let slot = anon.swap_slot.take().ok_or(VmError::SwapMissing)?;
    swap::read_slot(slot, kva);
    Ok(())
}

// Write the frame out to a fresh slot and drop the translation. Swap
// exhaustion here is fatal: the system has no way left to make room.
pub(super) fn swap_out(page: &mut Page, ft: &mut FrameTable) -> Result<(), VmError> {
    if !matches!(page.payload, PagePayload::Anon(_)) {
        return Err(VmError::SwapMissing);
    }
    let frame = page.frame.ok_or(VmError::NotResident)?;
    let kva = ft.kva(frame);

    let slot = match swap::slot_acquire() {
        Some(slot) => slot,
        None => panic!("anon: swap space exhausted"),
    };
    swap::write_slot(slot, kva);

    if let PagePayload::Anon(anon) = &mut page.payload {
        anon.swap_slot = Some(slot);
    }

    if let Some(owner) = &page.owner {
        owner.clear_page(page.va);
    }
    ft.unlink(frame);
    page.frame = None;
    Ok(())
}

pub(super) fn destroy(page: &mut Page, ft: &mut FrameTable) {
    if let PagePayload::Anon(anon) = &mut page.payload {
        if let Some(slot) = anon.swap_slot.take() {
            swap::slot_release(slot);
        }
    }

    if let Some(frame) = page.frame.take() {
        if let Some(owner) = &page.owner {
            owner.clear_page(page.va);
        }
        ft.release(frame);
    }
}
