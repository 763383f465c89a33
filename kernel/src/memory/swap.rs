// Swap-slot allocator
//
// The swap device is divided into page-sized slots, one bit each. A slot
// holds SPP consecutive sectors starting at slot * SPP. Slots are acquired
// on swap-out and released on swap-in or page destruction; there is no
// defragmentation to do because every slot is the same size.
use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;
use x86_64::VirtAddr;

use super::PGSIZE;
use crate::disk::{BlockDevice, SECTOR_SIZE};

/// Sectors per page-sized swap slot.
pub const SPP: usize = PGSIZE / SECTOR_SIZE;

struct SlotBitmap {
    bits: Vec<u64>,
    slots: usize,
}

impl SlotBitmap {
    fn new(slots: usize) -> Self {
        Self {
            bits: vec![0u64; (slots + 63) / 64],
            slots,
        }
    }

    fn is_set(&self, slot: usize) -> bool {
        self.bits[slot / 64] & (1 << (slot % 64)) != 0
    }

    fn set(&mut self, slot: usize) {
        self.bits[slot / 64] |= 1 << (slot % 64);
    }

    fn clear(&mut self, slot: usize) {
        self.bits[slot / 64] &= !(1 << (slot % 64));
    }

    // First clear bit, flipped to set. Linear scan; the map is small.
    fn scan_and_flip(&mut self) -> Option<usize> {
        for slot in 0..self.slots {
            if !self.is_set(slot) {
                self.set(slot);
                return Some(slot);
            }
        }
        None
    }
}

struct SwapSpace {
    disk: Box<dyn BlockDevice>,
    bitmap: SlotBitmap,
}

lazy_static! {
    static ref SWAP: Mutex<Option<SwapSpace>> = Mutex::new(None);
}

// Attach the swap device. Idempotent across the boot sequence; the first
// caller wins and later calls are ignored.
pub fn init(disk: Box<dyn BlockDevice>) {
    let mut swap = SWAP.lock();
    if swap.is_some() {
        return;
    }

    let slots = (disk.sector_count() / SPP as u64) as usize;
    *swap = Some(SwapSpace {
        disk,
        bitmap: SlotBitmap::new(slots),
    });

    crate::serial_println!("Swap space initialized: {} slots", slots);
}

pub fn is_initialized() -> bool {
    SWAP.lock().is_some()
}

/// Reserve a free slot, or None when swap is full.
pub fn slot_acquire() -> Option<usize> {
    let mut swap = SWAP.lock();
    let swap = swap.as_mut().expect("swap: not initialized");
    swap.bitmap.scan_and_flip()
}

/// Release a previously acquired slot.
pub fn slot_release(slot: usize) {
    let mut swap = SWAP.lock();
    if let Some(swap) = swap.as_mut() {
        debug_assert!(swap.bitmap.is_set(slot));
        swap.bitmap.clear(slot);
    }
}

// Read a whole slot into the frame at `kva` and release it.
pub fn read_slot(slot: usize, kva: VirtAddr) {
    let mut swap = SWAP.lock();
    let swap = swap.as_mut().expect("swap: not initialized");

    let start = (slot * SPP) as u64;
    for i in 0..SPP {
        let buf = unsafe {
            core::slice::from_raw_parts_mut(kva.as_mut_ptr::<u8>().add(i * SECTOR_SIZE), SECTOR_SIZE)
        };
        swap.disk.read(start + i as u64, buf);
    }

    debug_assert!(swap.bitmap.is_set(slot));
    swap.bitmap.clear(slot);
}

// Write the frame at `kva` out to `slot`.
pub fn write_slot(slot: usize, kva: VirtAddr) {
    let mut swap = SWAP.lock();
    let swap = swap.as_mut().expect("swap: not initialized");

    let start = (slot * SPP) as u64;
    for i in 0..SPP {
        let buf = unsafe {
            core::slice::from_raw_parts(kva.as_ptr::<u8>().add(i * SECTOR_SIZE), SECTOR_SIZE)
        };
        swap.disk.write(start + i as u64, buf);
    }
}

#[cfg(test)]
pub fn reset() {
    *SWAP.lock() = None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_scan_and_flip() {
        let mut bm = SlotBitmap::new(3);

        assert_eq!(bm.scan_and_flip(), Some(0));
        assert_eq!(bm.scan_and_flip(), Some(1));
        assert_eq!(bm.scan_and_flip(), Some(2));
        assert_eq!(bm.scan_and_flip(), None);

        bm.clear(1);
        assert!(!bm.is_set(1));
        assert_eq!(bm.scan_and_flip(), Some(1));
        assert_eq!(bm.scan_and_flip(), None);
    }

    #[test]
    fn bitmap_spans_words() {
        let mut bm = SlotBitmap::new(130);
        for i in 0..130 {
            assert_eq!(bm.scan_and_flip(), Some(i));
        }
        assert_eq!(bm.scan_and_flip(), None);

        bm.clear(64);
        bm.clear(129);
        assert_eq!(bm.scan_and_flip(), Some(64));
        assert_eq!(bm.scan_and_flip(), Some(129));
    }
}
