// Task context seen by the VM core
//
// The scheduler proper is outside this crate. What the core needs from a
// task is its address space, its supplemental page table, and the user rsp
// saved on the most recent kernel entry (faults taken in kernel mode read
// the stack pointer from here rather than from the trap frame).
use alloc::sync::Arc;
use x86_64::VirtAddr;

use crate::memory::spt::SupplementalPageTable;
use crate::mmu::AddressSpace;

pub struct Thread {
    pub addr_space: Arc<AddressSpace>,
    pub spt: SupplementalPageTable,
    pub user_rsp: VirtAddr,
}

impl Thread {
    pub fn new() -> Self {
        Self {
            addr_space: AddressSpace::new(),
            spt: SupplementalPageTable::new(),
            user_rsp: VirtAddr::zero(),
        }
    }
}

impl Default for Thread {
    fn default() -> Self {
        Self::new()
    }
}

// Registers pushed by the CPU on a fault, as far as the VM core cares.
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    pub rip: VirtAddr,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: VirtAddr,
    pub ss: u64,
}

impl TrapFrame {
    pub fn with_rsp(rsp: VirtAddr) -> Self {
        Self {
            rip: VirtAddr::zero(),
            cs: 0,
            rflags: 0,
            rsp,
            ss: 0,
        }
    }
}
