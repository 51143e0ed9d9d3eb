//! Disk-image access: the byte-addressable contract between media and the
//! device/firmware layers, raw-image plumbing, and ISO9660 / El Torito
//! boot metadata.

mod backend;
mod iso;
mod raw;

pub use backend::{FileBackend, MemBackend, StorageBackend};
pub use iso::{BootImage, BootMediaType, IsoImage, ISO_SECTOR_SIZE};
pub use raw::RawDisk;

use thiserror::Error;

/// ATA/BIOS sector granularity.
pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("access beyond end of media")]
    OutOfRange,
    #[error("media is read-only")]
    ReadOnly,
    #[error("not a recognised image format: {0}")]
    InvalidFormat(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiskError>;

/// Byte-addressable random-access media.
///
/// Every storage consumer in the workspace (ATA model, BIOS disk services,
/// boot loaders) speaks this trait, so image formats and backends compose
/// freely behind it.
pub trait VirtualDisk {
    fn capacity_bytes(&self) -> u64;

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    fn is_read_only(&self) -> bool {
        false
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        self.capacity_bytes() / SECTOR_SIZE as u64
    }

    fn read_sectors(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % SECTOR_SIZE, 0);
        self.read_at(lba * SECTOR_SIZE as u64, buf)
    }

    fn write_sectors(&mut self, lba: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() % SECTOR_SIZE, 0);
        self.write_at(lba * SECTOR_SIZE as u64, data)
    }
}
