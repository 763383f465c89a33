// Block-device interface and registry
//
// The swap code addresses storage in fixed 512-byte sectors through the
// trait below. Real drivers register themselves under a (channel, device)
// pair during boot; the VM core claims the swap device from the registry.
// `RamDisk` is the memory-backed device used on the host.
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

pub const SECTOR_SIZE: usize = 512;

pub trait BlockDevice: Send {
    fn sector_count(&self) -> u64;
    /// Read one sector into `buf`. `buf` must be SECTOR_SIZE bytes.
    fn read(&mut self, sector: u64, buf: &mut [u8]);
    /// Write one sector from `buf`. `buf` must be SECTOR_SIZE bytes.
    fn write(&mut self, sector: u64, buf: &[u8]);
}

pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: vec![0u8; sectors as usize * SECTOR_SIZE],
        }
    }
}

impl BlockDevice for RamDisk {
    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }

    fn read(&mut self, sector: u64, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.data[start..start + SECTOR_SIZE]);
    }

    fn write(&mut self, sector: u64, buf: &[u8]) {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        let start = sector as usize * SECTOR_SIZE;
        self.data[start..start + SECTOR_SIZE].copy_from_slice(buf);
    }
}

lazy_static! {
    static ref DISKS: Mutex<BTreeMap<(u8, u8), Box<dyn BlockDevice>>> =
        Mutex::new(BTreeMap::new());
}

// Register a device under its (channel, device) slot.
pub fn register(channel: u8, device: u8, disk: Box<dyn BlockDevice>) {
    DISKS.lock().insert((channel, device), disk);
}

// Claim a registered device, transferring ownership to the caller.
pub fn take(channel: u8, device: u8) -> Option<Box<dyn BlockDevice>> {
    DISKS.lock().remove(&(channel, device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_disk_round_trip() {
        let mut disk = RamDisk::new(8);
        assert_eq!(disk.sector_count(), 8);

        let mut sector = [0u8; SECTOR_SIZE];
        for (i, b) in sector.iter_mut().enumerate() {
            *b = i as u8;
        }
        disk.write(3, &sector);

        let mut back = [0u8; SECTOR_SIZE];
        disk.read(3, &mut back);
        assert_eq!(sector, back);

        // Neighboring sectors stay untouched.
        disk.read(2, &mut back);
        assert!(back.iter().all(|&x| x == 0));
    }
}
