// Page descriptors
//
// One descriptor per mapped virtual page. Every page starts uninitialized;
// the first claim transmutes it into its target kind (anonymous or
// file-backed) and runs the lazy loader that was registered at allocation
// time. The kind-specific behavior behind swap_in/swap_out/destroy lives in
// `anon` and `file_map`; dispatch is a match on the payload tag.
use alloc::boxed::Box;
use alloc::sync::Arc;
use core::any::Any;
use spin::Mutex;
use x86_64::VirtAddr;

use super::frame_table::{FrameId, FrameTable};
use super::{anon, file_map, VmError};
use crate::fs::File;
use crate::mmu::AddressSpace;

pub type PageRef = Arc<Mutex<Page>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Uninit,
    Anon,
    File,
}

/// Opaque payload handed to a lazy loader. Fork deep-copies it via
/// `duplicate`; file handles inside implementations are shared on purpose,
/// the filesystem owns their lifetime.
pub trait LoadAux: Send {
    fn duplicate(&self) -> Box<dyn LoadAux>;
    fn as_any(&self) -> &dyn Any;
}

/// Lazy loader run once, on the first claim, against the fresh frame.
pub type Initializer =
    fn(page: &mut Page, kva: VirtAddr, aux: Option<&dyn LoadAux>) -> Result<(), VmError>;

/// Installs the target kind's payload during transmutation.
pub type KindInitializer = fn(
    page: &mut Page,
    target: PageKind,
    kva: VirtAddr,
    aux: Option<&dyn LoadAux>,
) -> Result<(), VmError>;

pub struct UninitPage {
    pub(super) target: PageKind,
    pub(super) init: Option<Initializer>,
    pub(super) aux: Option<Box<dyn LoadAux>>,
    pub(super) page_initializer: KindInitializer,
}

pub struct AnonPage {
    // None until the page has been written to swap.
    pub(super) swap_slot: Option<usize>,
}

pub struct FilePage {
    pub(super) file: File,
    pub(super) offset: u64,
    pub(super) read_bytes: usize,
}

pub enum PagePayload {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

pub struct Page {
    pub(super) va: VirtAddr,
    pub(super) writable: bool,
    pub(super) owner: Option<Arc<AddressSpace>>,
    pub(super) frame: Option<FrameId>,
    // Forward link inside an mmap run; munmap walks it from the head.
    pub(super) next_page: Option<VirtAddr>,
    pub(super) payload: PagePayload,
}

impl Page {
    pub(super) fn new_uninit(
        va: VirtAddr,
        writable: bool,
        target: PageKind,
        init: Option<Initializer>,
        aux: Option<Box<dyn LoadAux>>,
        page_initializer: KindInitializer,
    ) -> Self {
        Self {
            va,
            writable,
            owner: None,
            frame: None,
            next_page: None,
            payload: PagePayload::Uninit(UninitPage {
                target,
                init,
                aux,
                page_initializer,
            }),
        }
    }

    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn kind(&self) -> PageKind {
        match self.payload {
            PagePayload::Uninit(_) => PageKind::Uninit,
            PagePayload::Anon(_) => PageKind::Anon,
            PagePayload::File(_) => PageKind::File,
        }
    }

    /// The kind this page has, or will have once it is first claimed.
    pub fn target_kind(&self) -> PageKind {
        match &self.payload {
            PagePayload::Uninit(uninit) => uninit.target,
            _ => self.kind(),
        }
    }

    // Bring the page's contents into the frame at `kva`. For an
    // uninitialized page this is the transmutation site.
    pub(super) fn swap_in(&mut self, kva: VirtAddr) -> Result<(), VmError> {
        match self.kind() {
            PageKind::Uninit => self.uninit_initialize(kva),
            PageKind::Anon => anon::swap_in(self, kva),
            PageKind::File => file_map::swap_in(self, kva),
        }
    }

    // Push the page's contents out to its backing store and take away its
    // frame. Called with the frame table locked.
    pub(super) fn swap_out(&mut self, ft: &mut FrameTable) -> Result<(), VmError> {
        match self.kind() {
            // An uninitialized page holds no data worth saving; it also
            // never owns a frame outside the claim window.
            PageKind::Uninit => Err(VmError::NotResident),
            PageKind::Anon => anon::swap_out(self, ft),
            PageKind::File => file_map::swap_out(self, ft),
        }
    }

    // Release everything the page holds. Called with the frame table locked.
    pub(super) fn destroy(&mut self, ft: &mut FrameTable) {
        match self.kind() {
            // The loader never ran; its aux is dropped with the payload.
            PageKind::Uninit => {}
            PageKind::Anon => anon::destroy(self, ft),
            PageKind::File => file_map::destroy(self, ft),
        }
    }

    fn uninit_initialize(&mut self, kva: VirtAddr) -> Result<(), VmError> {
        let placeholder = PagePayload::Anon(AnonPage { swap_slot: None });
        let uninit = match core::mem::replace(&mut self.payload, placeholder) {
            PagePayload::Uninit(uninit) => uninit,
            other => {
                self.payload = other;
                return Err(VmError::LoadFailed);
            }
        };

        let UninitPage {
            target,
            init,
            aux,
            page_initializer,
        } = uninit;

        page_initializer(self, target, kva, aux.as_deref())?;
        if let Some(init) = init {
            init(self, kva, aux.as_deref())?;
        }
        Ok(())
    }
}
