//! ISO9660 sector access and the El Torito boot catalog.
//!
//! Only the pieces the platform needs: 2048-byte sector reads for the
//! ATAPI model, and enough volume-descriptor walking to find the boot
//! image a CD BIOS would load.

use crate::{DiskError, Result, VirtualDisk};

pub const ISO_SECTOR_SIZE: usize = 2048;

const VOLUME_DESCRIPTORS_LBA: u64 = 16;
const DESCRIPTOR_BOOT_RECORD: u8 = 0;
const DESCRIPTOR_TERMINATOR: u8 = 0xFF;
const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";
const EL_TORITO_SYSTEM_ID: &[u8] = b"EL TORITO SPECIFICATION";

/// El Torito boot-media emulation class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootMediaType {
    NoEmulation,
    Floppy120M,
    Floppy144M,
    Floppy288M,
    HardDisk,
}

impl BootMediaType {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw & 0x0F {
            0 => Some(BootMediaType::NoEmulation),
            1 => Some(BootMediaType::Floppy120M),
            2 => Some(BootMediaType::Floppy144M),
            3 => Some(BootMediaType::Floppy288M),
            4 => Some(BootMediaType::HardDisk),
            _ => None,
        }
    }
}

/// The default boot entry of the catalog, as the BIOS consumes it.
#[derive(Clone, Debug)]
pub struct BootImage {
    pub media_type: BootMediaType,
    /// Real-mode load segment; 0 in the catalog means the traditional
    /// 0x7C0.
    pub load_segment: u16,
    /// First 2048-byte sector of the image on the disc.
    pub load_rba: u32,
    /// Virtual 512-byte sectors to load at boot.
    pub sector_count: u16,
    /// Total byte length of the catalog's boot image.
    pub size: u64,
}

impl BootImage {
    pub fn effective_load_segment(&self) -> u16 {
        if self.load_segment == 0 {
            0x7C0
        } else {
            self.load_segment
        }
    }

    pub fn is_no_emulation(&self) -> bool {
        self.media_type == BootMediaType::NoEmulation
    }
}

/// Read-only view of an ISO9660 disc image.
pub struct IsoImage {
    media: Box<dyn VirtualDisk>,
    boot: Option<BootImage>,
}

impl IsoImage {
    /// Parse the volume-descriptor chain. Fails if the image is not
    /// ISO9660; a missing or malformed boot catalog just leaves
    /// [`IsoImage::boot_image`] empty.
    pub fn open(mut media: Box<dyn VirtualDisk>) -> Result<Self> {
        let mut boot_catalog_lba = None;

        for lba in VOLUME_DESCRIPTORS_LBA..VOLUME_DESCRIPTORS_LBA + 16 {
            let mut sector = [0u8; ISO_SECTOR_SIZE];
            media.read_at(lba * ISO_SECTOR_SIZE as u64, &mut sector)?;

            if &sector[1..6] != STANDARD_IDENTIFIER {
                if lba == VOLUME_DESCRIPTORS_LBA {
                    return Err(DiskError::InvalidFormat("missing ISO9660 identifier"));
                }
                break;
            }
            match sector[0] {
                DESCRIPTOR_BOOT_RECORD => {
                    if sector[7..7 + EL_TORITO_SYSTEM_ID.len()] == *EL_TORITO_SYSTEM_ID {
                        boot_catalog_lba =
                            Some(u32::from_le_bytes(sector[0x47..0x4B].try_into().unwrap()));
                    }
                }
                DESCRIPTOR_TERMINATOR => break,
                _ => {}
            }
        }

        let boot = match boot_catalog_lba {
            Some(lba) => parse_boot_catalog(&mut *media, lba)?,
            None => None,
        };

        Ok(Self { media, boot })
    }

    pub fn boot_image(&self) -> Option<&BootImage> {
        self.boot.as_ref()
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.media.capacity_bytes()
    }

    pub fn sector_count(&self) -> u64 {
        self.media.capacity_bytes() / ISO_SECTOR_SIZE as u64
    }

    /// Read `count` 2048-byte sectors starting at `lba`.
    pub fn read_iso_sectors(&mut self, lba: u64, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count * ISO_SECTOR_SIZE];
        self.media.read_at(lba * ISO_SECTOR_SIZE as u64, &mut buf)?;
        Ok(buf)
    }

    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.media.read_at(offset, buf)
    }
}

fn parse_boot_catalog(media: &mut dyn VirtualDisk, lba: u32) -> Result<Option<BootImage>> {
    let mut catalog = [0u8; ISO_SECTOR_SIZE];
    media.read_at(lba as u64 * ISO_SECTOR_SIZE as u64, &mut catalog)?;

    // Validation entry: header id 0x01, key bytes 0x55 0xAA, zero word sum.
    if catalog[0] != 0x01 || catalog[0x1E] != 0x55 || catalog[0x1F] != 0xAA {
        return Ok(None);
    }
    let sum: u16 = catalog[..32]
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .fold(0u16, |acc, w| acc.wrapping_add(w));
    if sum != 0 {
        return Ok(None);
    }

    // Initial/default entry.
    let entry = &catalog[32..64];
    if entry[0] != 0x88 {
        // Not bootable.
        return Ok(None);
    }
    let Some(media_type) = BootMediaType::from_raw(entry[1]) else {
        return Ok(None);
    };
    let load_segment = u16::from_le_bytes([entry[2], entry[3]]);
    let sector_count = u16::from_le_bytes([entry[6], entry[7]]);
    let load_rba = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);

    let size = match media_type {
        BootMediaType::NoEmulation => sector_count as u64 * 512,
        BootMediaType::Floppy120M => 1_228_800,
        BootMediaType::Floppy144M => 1_474_560,
        BootMediaType::Floppy288M => 2_949_120,
        BootMediaType::HardDisk => sector_count as u64 * 512,
    };

    Ok(Some(BootImage {
        media_type,
        load_segment,
        load_rba,
        sector_count,
        size,
    }))
}
