// File-backed pages and the mmap engine
//
// A file-backed page is a window of up to PGSIZE bytes onto a file region;
// whatever the window does not cover is zero-filled. Clean pages are cheap
// to drop and re-read; dirty pages are written back to the file both on
// eviction and on teardown, so munmap is correct no matter which happens
// first. File-backed pages never touch swap.
use alloc::boxed::Box;
use core::any::Any;

use x86_64::VirtAddr;

use super::frame_table::FrameTable;
use super::page::{FilePage, LoadAux, Page, PageKind, PagePayload, PageRef};
use super::{VmError, PGSIZE};
use crate::fs::{self, File};
use crate::thread::Thread;

/// Loader payload for one page of a mapped file region.
pub struct FileMapAux {
    pub file: File,
    pub offset: u64,
    pub read_bytes: usize,
}

impl LoadAux for FileMapAux {
    fn duplicate(&self) -> Box<dyn LoadAux> {
        Box::new(FileMapAux {
            file: self.file.reopen(),
            offset: self.offset,
            read_bytes: self.read_bytes,
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// Transmutation target: adopt the file window described by the aux.
pub(super) fn initializer(
    page: &mut Page,
    target: PageKind,
    _kva: VirtAddr,
    aux: Option<&dyn LoadAux>,
) -> Result<(), VmError> {
    debug_assert_eq!(target, PageKind::File);

    let aux = aux.ok_or(VmError::LoadFailed)?;
    let aux = aux
        .as_any()
        .downcast_ref::<FileMapAux>()
        .ok_or(VmError::LoadFailed)?;

    page.payload = PagePayload::File(FilePage {
        file: aux.file.clone(),
        offset: aux.offset,
        read_bytes: aux.read_bytes,
    });
    Ok(())
}

/// Standard lazy loader for file-backed pages: fill the frame from the file
/// window and zero the tail. Runs once, on first claim.
pub fn lazy_load_file(
    page: &mut Page,
    kva: VirtAddr,
    _aux: Option<&dyn LoadAux>,
) -> Result<(), VmError> {
    let (file, offset, wanted) = match &page.payload {
        PagePayload::File(fp) => (fp.file.clone(), fp.offset, fp.read_bytes),
        _ => return Err(VmError::LoadFailed),
    };

    let buf = unsafe { core::slice::from_raw_parts_mut(kva.as_mut_ptr::<u8>(), wanted) };
    let got = {
        let _fs = fs::FILE_LOCK.lock();
        file.read_at(buf, offset)
    };

    // A mapping may run past end of file. Remember how much was really
    // backed so write-back stays inside it.
    if let PagePayload::File(fp) = &mut page.payload {
        fp.read_bytes = got;
    }

    unsafe { core::ptr::write_bytes(kva.as_mut_ptr::<u8>().add(got), 0, PGSIZE - got) };
    Ok(())
}

// Re-read the window after an eviction. The file length was captured on the
// first load, so a short read here means the file shrank underneath us.
pub(super) fn swap_in(page: &mut Page, kva: VirtAddr) -> Result<(), VmError> {
    let (file, offset, wanted) = match &page.payload {
        PagePayload::File(fp) => (fp.file.clone(), fp.offset, fp.read_bytes),
        _ => return Err(VmError::LoadFailed),
    };

    let buf = unsafe { core::slice::from_raw_parts_mut(kva.as_mut_ptr::<u8>(), wanted) };
    let got = {
        let _fs = fs::FILE_LOCK.lock();
        file.read_at(buf, offset)
    };
    if got != wanted {
        panic!("file mapping: backing file shrank beneath a mapped page");
    }

    unsafe { core::ptr::write_bytes(kva.as_mut_ptr::<u8>().add(got), 0, PGSIZE - got) };
    Ok(())
}

fn write_back_if_dirty(page: &Page, kva: VirtAddr) {
    let owner = match &page.owner {
        Some(owner) => owner,
        None => return,
    };
    if !owner.is_dirty(page.va) {
        return;
    }

    let fp = match &page.payload {
        PagePayload::File(fp) => fp,
        _ => return,
    };

    let buf = unsafe { core::slice::from_raw_parts(kva.as_ptr::<u8>(), fp.read_bytes) };
    let wrote = {
        let _fs = fs::FILE_LOCK.lock();
        fp.file.write_at(buf, fp.offset)
    };
    if wrote != fp.read_bytes {
        panic!("file mapping: short write during write-back");
    }
}

// Evict: write back if the mapping was dirtied, then drop the translation.
// The dirty bit goes away with the PTE, which is fine, the data is in the
// file now.
pub(super) fn swap_out(page: &mut Page, ft: &mut FrameTable) -> Result<(), VmError> {
    let frame = page.frame.ok_or(VmError::NotResident)?;
    let kva = ft.kva(frame);

    write_back_if_dirty(page, kva);

    if let Some(owner) = &page.owner {
        owner.clear_page(page.va);
    }
    ft.unlink(frame);
    page.frame = None;
    Ok(())
}

// Teardown keeps the write-back guarantee on its own, so munmap and process
// exit are correct whether or not the page was evicted first.
pub(super) fn destroy(page: &mut Page, ft: &mut FrameTable) {
    if let Some(frame) = page.frame.take() {
        let kva = ft.kva(frame);
        write_back_if_dirty(page, kva);

        if let Some(owner) = &page.owner {
            owner.clear_page(page.va);
            owner.activate();
        }
        ft.release(frame);
    }
}

/// Map `length` bytes of `file` starting at `offset` to consecutive pages
/// at `addr`. Pages are installed lazily; nothing is read here. The syscall
/// layer has already validated alignment, length and range.
pub fn do_mmap(
    thread: &mut Thread,
    addr: VirtAddr,
    length: usize,
    writable: bool,
    file: &File,
    offset: u64,
) -> Result<VirtAddr, VmError> {
    debug_assert!(addr.is_aligned(PGSIZE as u64));
    debug_assert!(length > 0);

    // An independent handle: closing or seeking the caller's descriptor
    // must not disturb the mapping, and vice versa.
    let file = file.reopen();

    // Refuse the whole range before installing anything.
    let page_count = (length + PGSIZE - 1) / PGSIZE;
    for i in 0..page_count {
        let va = addr + (i * PGSIZE) as u64;
        if thread.spt.find(va).is_some() {
            return Err(VmError::AddressInUse);
        }
    }

    let mut va = addr;
    let mut offset = offset;
    let mut remaining = length;
    let mut prev: Option<PageRef> = None;

    while remaining > 0 {
        let read_bytes = remaining.min(PGSIZE);
        let aux = FileMapAux {
            file: file.reopen(),
            offset,
            read_bytes,
        };

        super::vm_alloc_page_with_initializer(
            thread,
            PageKind::File,
            va,
            writable,
            Some(lazy_load_file),
            Some(Box::new(aux)),
        )?;

        let page = thread.spt.find(va).ok_or(VmError::NotFound)?;
        if let Some(prev) = &prev {
            prev.lock().next_page = Some(va);
        }
        prev = Some(page);

        va += PGSIZE as u64;
        offset += read_bytes as u64;
        remaining -= read_bytes;
    }

    Ok(addr)
}

/// Unmap the run starting at `addr`, writing dirty pages back as each
/// descriptor is destroyed.
pub fn do_munmap(thread: &mut Thread, addr: VirtAddr) {
    let mut next = Some(addr);
    while let Some(va) = next {
        let page = match thread.spt.find(va) {
            Some(page) => page,
            None => break,
        };
        next = page.lock().next_page;
        thread.spt.remove(va);
    }
}
