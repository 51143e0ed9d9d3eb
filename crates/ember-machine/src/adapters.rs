//! Adapters bridging the BIOS collaborator traits onto the shared device
//! handles.

use std::cell::RefCell;
use std::rc::Rc;

use ember_bios::{BlockDevice, CdBootInfo, Keyboard, OpticalDevice};
use ember_devices::i8042::I8042;
use ember_devices_storage::IdeController;
use ember_storage::SECTOR_SIZE;

/// The first attached ATA disk, as the BIOS fixed-disk service sees it.
pub struct IdeBlockAdapter {
    pub ide: Rc<RefCell<IdeController>>,
}

impl BlockDevice for IdeBlockAdapter {
    fn read_sector(&mut self, lba: u64, buf: &mut [u8; 512]) -> Result<(), ()> {
        let mut ide = self.ide.borrow_mut();
        let drive = ide.find_ata().ok_or(())?;
        let data = drive.read_sectors(lba, 1).map_err(|_| ())?;
        buf.copy_from_slice(&data);
        Ok(())
    }

    fn write_sector(&mut self, lba: u64, buf: &[u8; 512]) -> Result<(), ()> {
        let mut ide = self.ide.borrow_mut();
        let drive = ide.find_ata().ok_or(())?;
        drive.write_sectors(lba, buf).map_err(|_| ())
    }

    fn sector_count(&self) -> u64 {
        let mut ide = self.ide.borrow_mut();
        ide.find_ata().map(|d| d.total_sectors()).unwrap_or(0)
    }

    fn is_read_only(&self) -> bool {
        let mut ide = self.ide.borrow_mut();
        ide.find_ata().map(|d| d.is_read_only()).unwrap_or(false)
    }
}

/// Raw in-memory floppy image for the DL<0x80 class.
pub struct VecBlockDevice {
    pub bytes: Vec<u8>,
    pub read_only: bool,
}

impl BlockDevice for VecBlockDevice {
    fn read_sector(&mut self, lba: u64, buf: &mut [u8; 512]) -> Result<(), ()> {
        let start = (lba as usize).checked_mul(SECTOR_SIZE).ok_or(())?;
        let slice = self.bytes.get(start..start + SECTOR_SIZE).ok_or(())?;
        buf.copy_from_slice(slice);
        Ok(())
    }

    fn write_sector(&mut self, lba: u64, buf: &[u8; 512]) -> Result<(), ()> {
        if self.read_only {
            return Err(());
        }
        let start = (lba as usize).checked_mul(SECTOR_SIZE).ok_or(())?;
        let slice = self.bytes.get_mut(start..start + SECTOR_SIZE).ok_or(())?;
        slice.copy_from_slice(buf);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        (self.bytes.len() / SECTOR_SIZE) as u64
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// The attached ATAPI CD, as the El Torito services see it.
pub struct IdeOpticalAdapter {
    pub ide: Rc<RefCell<IdeController>>,
    pub boot_info: Option<CdBootInfo>,
}

impl OpticalDevice for IdeOpticalAdapter {
    fn read_sectors_2048(&mut self, lba: u64, count: usize) -> Result<Vec<u8>, ()> {
        let mut ide = self.ide.borrow_mut();
        let cd = ide.find_cdrom().ok_or(())?;
        cd.media().read_iso_sectors(lba, count).map_err(|_| ())
    }

    fn sector_count(&self) -> u64 {
        let mut ide = self.ide.borrow_mut();
        ide.find_cdrom().map(|cd| cd.total_sectors()).unwrap_or(0)
    }

    fn boot_info(&mut self) -> Option<CdBootInfo> {
        self.boot_info
    }

    fn lock(&mut self) {
        if let Some(cd) = self.ide.borrow_mut().find_cdrom() {
            cd.lock();
        }
    }

    fn unlock(&mut self) {
        if let Some(cd) = self.ide.borrow_mut().find_cdrom() {
            cd.unlock();
        }
    }

    fn is_locked(&self) -> bool {
        self.ide
            .borrow_mut()
            .find_cdrom()
            .map(|cd| cd.is_locked())
            .unwrap_or(false)
    }
}

/// INT 16h view of the keyboard controller's cooked queue.
pub struct KeyboardAdapter(pub Rc<RefCell<I8042>>);

impl Keyboard for KeyboardAdapter {
    fn pop_key(&mut self) -> Option<u16> {
        self.0.borrow_mut().pop_key()
    }

    fn peek_key(&mut self) -> Option<u16> {
        self.0.borrow_mut().peek_key()
    }
}
