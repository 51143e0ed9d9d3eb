//! ATA disk drive model: geometry, IDENTIFY data and sector transfer
//! against a [`VirtualDisk`].

use ember_storage::{DiskError, VirtualDisk, SECTOR_SIZE};

pub const ATA_MODEL: &str = "PHP ATA DISK";
pub const ATA_SERIAL: &str = "EMB000001";
pub const ATA_FIRMWARE: &str = "1.0";

/// Default translation geometry for CHS addressing.
pub const HEADS: u64 = 16;
pub const SECTORS_PER_TRACK: u64 = 63;

pub struct AtaDrive {
    disk: Box<dyn VirtualDisk>,
}

impl AtaDrive {
    pub fn new(disk: Box<dyn VirtualDisk>) -> Result<Self, DiskError> {
        Ok(Self { disk })
    }

    pub fn total_sectors(&self) -> u64 {
        self.disk.capacity_bytes() / SECTOR_SIZE as u64
    }

    pub fn is_read_only(&self) -> bool {
        self.disk.is_read_only()
    }

    pub fn cylinders(&self) -> u64 {
        (self.total_sectors() / (HEADS * SECTORS_PER_TRACK)).max(1)
    }

    pub fn chs_to_lba(&self, cylinder: u64, head: u64, sector: u64) -> u64 {
        (cylinder * HEADS + head) * SECTORS_PER_TRACK + sector.saturating_sub(1)
    }

    pub fn read_sectors(&mut self, lba: u64, count: usize) -> Result<Vec<u8>, DiskError> {
        if lba + count as u64 > self.total_sectors() {
            return Err(DiskError::OutOfRange);
        }
        let mut buf = vec![0u8; count * SECTOR_SIZE];
        self.disk.read_sectors(lba, &mut buf)?;
        Ok(buf)
    }

    /// Write-through; silently succeeds on read-only media (the guest's
    /// view of a write-protected disk is an accepted-but-dropped write).
    pub fn write_sectors(&mut self, lba: u64, data: &[u8]) -> Result<(), DiskError> {
        if self.disk.is_read_only() {
            return Ok(());
        }
        if lba + (data.len() / SECTOR_SIZE) as u64 > self.total_sectors() {
            return Err(DiskError::OutOfRange);
        }
        self.disk.write_sectors(lba, data)
    }

    /// 512-byte IDENTIFY DEVICE block.
    pub fn identify(&self) -> [u8; 512] {
        let mut id = [0u8; 512];
        let total = self.total_sectors();

        put_word(&mut id, 0, 0x0040); // fixed drive
        put_word(&mut id, 1, self.cylinders().min(16383) as u16);
        put_word(&mut id, 3, HEADS as u16);
        put_word(&mut id, 6, SECTORS_PER_TRACK as u16);
        put_string(&mut id, 10, 20, ATA_SERIAL);
        put_string(&mut id, 23, 8, ATA_FIRMWARE);
        put_string(&mut id, 27, 40, ATA_MODEL);
        put_word(&mut id, 47, 0x8010); // up to 16 sectors per MULTIPLE
        put_word(&mut id, 49, 1 << 9 | 1 << 8); // LBA + DMA capable
        put_word(&mut id, 53, 0x0007);
        put_word(&mut id, 60, total as u16);
        put_word(&mut id, 61, (total >> 16) as u16);
        put_word(&mut id, 63, 0x0007); // MW DMA 0-2
        put_word(&mut id, 64, 0x0003); // PIO 3-4
        put_word(&mut id, 80, 0x0078); // ATA-3..6
        put_word(&mut id, 83, 1 << 10 | 1 << 14); // LBA48
        put_word(&mut id, 86, 1 << 10);
        put_word(&mut id, 88, 0x003F); // UDMA modes present
        for (i, w) in (100..104).enumerate() {
            put_word(&mut id, w, (total >> (16 * i)) as u16);
        }
        id
    }
}

pub(crate) fn put_word(id: &mut [u8; 512], word: usize, value: u16) {
    id[word * 2..word * 2 + 2].copy_from_slice(&value.to_le_bytes());
}

/// ATA strings are space-padded and byte-swapped within each word.
pub(crate) fn put_string(id: &mut [u8; 512], word: usize, bytes: usize, s: &str) {
    let mut padded = s.as_bytes().to_vec();
    padded.resize(bytes, b' ');
    for (i, pair) in padded.chunks_exact(2).enumerate() {
        id[(word + i) * 2] = pair[1];
        id[(word + i) * 2 + 1] = pair[0];
    }
}
