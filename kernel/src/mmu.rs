// Page-table interface consumed by the VM core
//
// The real MMU lives outside this crate. The core only needs the handful of
// operations below: install/remove a translation and query the accessed and
// dirty bits the hardware keeps per PTE. Bare-metal integrations implement
// `Pml4` over the actual page tables; `SoftPml4` is the in-memory model used
// on the host and by early boot.
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;
use x86_64::structures::paging::PageTableFlags;
use x86_64::VirtAddr;

pub trait Pml4: Send {
    /// Install a translation from `va` to the physical page behind `kva`.
    /// Fails if `va` is already mapped or a paging structure cannot be built.
    fn set_page(&mut self, va: VirtAddr, kva: VirtAddr, writable: bool) -> bool;
    fn clear_page(&mut self, va: VirtAddr);
    /// Kernel virtual address of the frame mapped at `va`, if present.
    fn get_page(&self, va: VirtAddr) -> Option<VirtAddr>;
    fn is_accessed(&self, va: VirtAddr) -> bool;
    fn set_accessed(&mut self, va: VirtAddr, accessed: bool);
    fn is_dirty(&self, va: VirtAddr) -> bool;
    fn set_dirty(&mut self, va: VirtAddr, dirty: bool);
    /// Reload the translation base, flushing stale TLB entries.
    fn activate(&mut self) {}
}

#[derive(Debug, Clone, Copy)]
struct SoftPte {
    kva: VirtAddr,
    flags: PageTableFlags,
}

// Software page table: one entry per mapped page, same bit semantics as the
// hardware walker (PRESENT/WRITABLE plus sticky ACCESSED/DIRTY).
pub struct SoftPml4 {
    entries: BTreeMap<u64, SoftPte>,
}

impl SoftPml4 {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Number of live translations.
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }
}

impl Default for SoftPml4 {
    fn default() -> Self {
        Self::new()
    }
}

impl Pml4 for SoftPml4 {
    fn set_page(&mut self, va: VirtAddr, kva: VirtAddr, writable: bool) -> bool {
        if self.entries.contains_key(&va.as_u64()) {
            return false;
        }

        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }

        self.entries.insert(va.as_u64(), SoftPte { kva, flags });
        true
    }

    fn clear_page(&mut self, va: VirtAddr) {
        self.entries.remove(&va.as_u64());
    }

    fn get_page(&self, va: VirtAddr) -> Option<VirtAddr> {
        self.entries.get(&va.as_u64()).map(|pte| pte.kva)
    }

    fn is_accessed(&self, va: VirtAddr) -> bool {
        self.entries
            .get(&va.as_u64())
            .map(|pte| pte.flags.contains(PageTableFlags::ACCESSED))
            .unwrap_or(false)
    }

    fn set_accessed(&mut self, va: VirtAddr, accessed: bool) {
        if let Some(pte) = self.entries.get_mut(&va.as_u64()) {
            pte.flags.set(PageTableFlags::ACCESSED, accessed);
        }
    }

    fn is_dirty(&self, va: VirtAddr) -> bool {
        self.entries
            .get(&va.as_u64())
            .map(|pte| pte.flags.contains(PageTableFlags::DIRTY))
            .unwrap_or(false)
    }

    fn set_dirty(&mut self, va: VirtAddr, dirty: bool) {
        if let Some(pte) = self.entries.get_mut(&va.as_u64()) {
            pte.flags.set(PageTableFlags::DIRTY, dirty);
        }
    }
}

// One per process. Pages store this as their owner so eviction can reach the
// owning translations from any thread. The inner lock is a leaf in the lock
// order; nothing else is acquired while it is held.
pub struct AddressSpace {
    pml4: Mutex<Box<dyn Pml4>>,
}

impl AddressSpace {
    pub fn new() -> Arc<Self> {
        Self::with_pml4(Box::new(SoftPml4::new()))
    }

    pub fn with_pml4(pml4: Box<dyn Pml4>) -> Arc<Self> {
        Arc::new(Self {
            pml4: Mutex::new(pml4),
        })
    }

    pub fn set_page(&self, va: VirtAddr, kva: VirtAddr, writable: bool) -> bool {
        self.pml4.lock().set_page(va, kva, writable)
    }

    pub fn clear_page(&self, va: VirtAddr) {
        self.pml4.lock().clear_page(va);
    }

    pub fn get_page(&self, va: VirtAddr) -> Option<VirtAddr> {
        self.pml4.lock().get_page(va)
    }

    pub fn is_accessed(&self, va: VirtAddr) -> bool {
        self.pml4.lock().is_accessed(va)
    }

    pub fn set_accessed(&self, va: VirtAddr, accessed: bool) {
        self.pml4.lock().set_accessed(va, accessed);
    }

    pub fn is_dirty(&self, va: VirtAddr) -> bool {
        self.pml4.lock().is_dirty(va)
    }

    pub fn set_dirty(&self, va: VirtAddr, dirty: bool) {
        self.pml4.lock().set_dirty(va, dirty);
    }

    pub fn activate(&self) {
        self.pml4.lock().activate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_clear() {
        let mut pml4 = SoftPml4::new();
        let va = VirtAddr::new(0x4000_0000);
        let kva = VirtAddr::new(0x1000);

        assert!(pml4.set_page(va, kva, true));
        assert_eq!(pml4.get_page(va), Some(kva));

        // Double-mapping the same page is refused.
        assert!(!pml4.set_page(va, kva, true));

        pml4.clear_page(va);
        assert_eq!(pml4.get_page(va), None);
    }

    #[test]
    fn accessed_and_dirty_bits() {
        let mut pml4 = SoftPml4::new();
        let va = VirtAddr::new(0x4000_0000);

        assert!(pml4.set_page(va, VirtAddr::new(0x1000), true));
        assert!(!pml4.is_accessed(va));
        assert!(!pml4.is_dirty(va));

        pml4.set_accessed(va, true);
        pml4.set_dirty(va, true);
        assert!(pml4.is_accessed(va));
        assert!(pml4.is_dirty(va));

        pml4.set_accessed(va, false);
        assert!(!pml4.is_accessed(va));
        assert!(pml4.is_dirty(va));

        // Bits vanish with the mapping, as on real hardware.
        pml4.clear_page(va);
        assert!(!pml4.is_dirty(va));
    }
}
