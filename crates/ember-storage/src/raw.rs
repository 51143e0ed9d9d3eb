//! Flat (raw) disk images.

use crate::{DiskError, Result, StorageBackend, VirtualDisk};

pub struct RawDisk<B: StorageBackend> {
    backend: B,
    read_only: bool,
}

impl<B: StorageBackend> RawDisk<B> {
    /// Create a zero-filled image of `capacity` bytes.
    pub fn create(mut backend: B, capacity: u64) -> Result<Self> {
        backend.set_len(capacity)?;
        Ok(Self {
            backend,
            read_only: false,
        })
    }

    /// Open an existing image at the backend's current size.
    pub fn open(backend: B) -> Result<Self> {
        Ok(Self {
            backend,
            read_only: false,
        })
    }

    pub fn open_read_only(backend: B) -> Result<Self> {
        Ok(Self {
            backend,
            read_only: true,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }
}

impl<B: StorageBackend> VirtualDisk for RawDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.backend.len()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.backend.read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        self.backend.write_at(offset, data)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn flush(&mut self) -> Result<()> {
        self.backend.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemBackend, SECTOR_SIZE};

    #[test]
    fn sector_io_round_trips() {
        let mut disk = RawDisk::create(MemBackend::new(), 8 * SECTOR_SIZE as u64).unwrap();
        assert_eq!(disk.sector_count(), 8);

        let mut sector = vec![0u8; SECTOR_SIZE];
        sector[0..4].copy_from_slice(b"BOOT");
        disk.write_sectors(2, &sector).unwrap();

        let mut back = vec![0u8; SECTOR_SIZE];
        disk.read_sectors(2, &mut back).unwrap();
        assert_eq!(back, sector);
    }

    #[test]
    fn out_of_range_access_errors() {
        let mut disk = RawDisk::create(MemBackend::new(), 1024).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            disk.read_at(1020, &mut buf),
            Err(DiskError::OutOfRange)
        ));
    }

    #[test]
    fn read_only_rejects_writes() {
        let backend = MemBackend::from_bytes(vec![0; 1024]);
        let mut disk = RawDisk::open_read_only(backend).unwrap();
        assert!(disk.is_read_only());
        assert!(matches!(disk.write_at(0, b"x"), Err(DiskError::ReadOnly)));
    }
}
