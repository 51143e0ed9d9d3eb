//! ATAPI CD-ROM: the 12-byte packet command set over an ISO image.

use ember_storage::{IsoImage, ISO_SECTOR_SIZE};

use crate::ata::{put_string, put_word};

pub const ATAPI_MODEL: &str = "PHP ATAPI CD-ROM";
pub const INQUIRY_VENDOR: &str = "PHP";
pub const INQUIRY_PRODUCT: &str = "ATAPI CD-ROM";
pub const INQUIRY_REVISION: &str = "2.5+";

// SCSI sense keys / additional sense codes used by the model.
const SENSE_NONE: u8 = 0x00;
const SENSE_ILLEGAL_REQUEST: u8 = 0x05;
const ASC_INVALID_OPCODE: u8 = 0x20;
const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;

/// Outcome of one packet command.
#[derive(Debug)]
pub enum PacketResult {
    /// Data-in phase with the full transfer; the channel chunks it into
    /// the byte-count window.
    DataIn(Vec<u8>),
    /// Command complete, no data.
    NoDataSuccess,
    /// CHECK CONDITION with the latched sense.
    Error { sense_key: u8, asc: u8, ascq: u8 },
}

pub struct AtapiCdrom {
    media: IsoImage,
    sense: (u8, u8, u8),
    /// INT 13h lock/unlock nesting count.
    lock_count: u32,
}

impl AtapiCdrom {
    pub const SECTOR_SIZE: usize = ISO_SECTOR_SIZE;

    pub fn new(media: IsoImage) -> Self {
        Self {
            media,
            sense: (SENSE_NONE, 0, 0),
            lock_count: 0,
        }
    }

    pub fn media(&mut self) -> &mut IsoImage {
        &mut self.media
    }

    pub fn total_sectors(&self) -> u64 {
        self.media.sector_count()
    }

    pub fn lock(&mut self) {
        self.lock_count += 1;
    }

    pub fn unlock(&mut self) {
        self.lock_count = self.lock_count.saturating_sub(1);
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    fn ok(&mut self) -> PacketResult {
        self.sense = (SENSE_NONE, 0, 0);
        PacketResult::NoDataSuccess
    }

    fn data(&mut self, data: Vec<u8>) -> PacketResult {
        self.sense = (SENSE_NONE, 0, 0);
        PacketResult::DataIn(data)
    }

    fn error(&mut self, sense_key: u8, asc: u8) -> PacketResult {
        self.sense = (sense_key, asc, 0);
        PacketResult::Error {
            sense_key,
            asc,
            ascq: 0,
        }
    }

    /// Dispatch one 12-byte packet.
    pub fn handle_packet(&mut self, packet: &[u8; 12], _dma: bool) -> PacketResult {
        match packet[0] {
            0x00 => self.ok(), // TEST UNIT READY
            0x03 => {
                // REQUEST SENSE: 18-byte fixed format.
                let alloc = packet[4] as usize;
                let mut sense = vec![0u8; 18];
                sense[0] = 0x70; // current, fixed format
                sense[2] = self.sense.0;
                sense[7] = 10; // additional length
                sense[12] = self.sense.1;
                sense[13] = self.sense.2;
                sense.truncate(alloc.max(1).min(18));
                self.sense = (SENSE_NONE, 0, 0);
                PacketResult::DataIn(sense)
            }
            0x12 => {
                // INQUIRY: removable CD-ROM.
                let alloc = packet[4] as usize;
                let mut inq = vec![0u8; 36];
                inq[0] = 0x05; // CD-ROM device
                inq[1] = 0x80; // removable
                inq[2] = 0x00;
                inq[3] = 0x21; // ATAPI version, response format 1
                inq[4] = 31; // additional length
                put_inquiry_string(&mut inq[8..16], INQUIRY_VENDOR);
                put_inquiry_string(&mut inq[16..32], INQUIRY_PRODUCT);
                put_inquiry_string(&mut inq[32..36], INQUIRY_REVISION);
                inq.truncate(alloc.max(5).min(36));
                self.data(inq)
            }
            0x1A => {
                // MODE SENSE(6): minimal header.
                self.data(vec![0x03, 0x00, 0x00, 0x00])
            }
            0x1B => self.ok(), // START STOP UNIT
            0x1E => self.ok(), // PREVENT/ALLOW MEDIUM REMOVAL
            0x25 => {
                // READ CAPACITY: last LBA + block size, both BE32.
                let last = self.total_sectors().saturating_sub(1) as u32;
                let mut out = Vec::with_capacity(8);
                out.extend_from_slice(&last.to_be_bytes());
                out.extend_from_slice(&(ISO_SECTOR_SIZE as u32).to_be_bytes());
                self.data(out)
            }
            0x28 => {
                // READ(10): BE32 LBA, BE16 length in 2048-byte sectors.
                let lba = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
                let count = u16::from_be_bytes([packet[7], packet[8]]);
                if count == 0 {
                    return self.ok();
                }
                if lba as u64 + count as u64 > self.total_sectors() {
                    return self.error(SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE);
                }
                match self.media.read_iso_sectors(lba as u64, count as usize) {
                    Ok(data) => self.data(data),
                    Err(_) => self.error(SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE),
                }
            }
            0x43 => {
                // READ TOC: one data track plus lead-out.
                let msf = packet[1] & 0x02 != 0;
                let mut toc = Vec::new();
                toc.extend_from_slice(&[0, 0]); // length patched below
                toc.push(1); // first track
                toc.push(1); // last track

                // Track 1 descriptor.
                toc.extend_from_slice(&[0x00, 0x14, 0x01, 0x00]);
                toc.extend_from_slice(&track_address(0, msf));

                // Lead-out (track 0xAA).
                toc.extend_from_slice(&[0x00, 0x14, 0xAA, 0x00]);
                toc.extend_from_slice(&track_address(self.total_sectors() as u32, msf));

                let len = (toc.len() - 2) as u16;
                toc[0..2].copy_from_slice(&len.to_be_bytes());
                self.data(toc)
            }
            0x5A => {
                // MODE SENSE(10): 8-byte header.
                self.data(vec![0x00, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
            }
            0xBD => {
                // GET MECHANISM STATUS (used by some loaders as a probe).
                self.data(vec![0u8; 8])
            }
            _ => self.error(SENSE_ILLEGAL_REQUEST, ASC_INVALID_OPCODE),
        }
    }

    /// 512-byte IDENTIFY PACKET DEVICE block.
    pub fn identify_packet(&self) -> [u8; 512] {
        let mut id = [0u8; 512];
        // ATAPI, CD-ROM class, removable, 12-byte packets.
        put_word(&mut id, 0, 0x85C0);
        put_string(&mut id, 10, 20, "EMBCD00001");
        put_string(&mut id, 23, 8, "2.5");
        put_string(&mut id, 27, 40, ATAPI_MODEL);
        put_word(&mut id, 49, 1 << 9); // LBA
        put_word(&mut id, 63, 0x0007);
        put_word(&mut id, 64, 0x0003); // PIO 3-4
        id
    }
}

fn put_inquiry_string(dst: &mut [u8], s: &str) {
    for (i, slot) in dst.iter_mut().enumerate() {
        *slot = s.as_bytes().get(i).copied().unwrap_or(b' ');
    }
}

/// TOC track start in either LBA or MSF form (2-second lead-in offset).
fn track_address(lba: u32, msf: bool) -> [u8; 4] {
    if msf {
        let frames = lba + 150;
        [
            0,
            (frames / (75 * 60)) as u8,
            (frames / 75 % 60) as u8,
            (frames % 75) as u8,
        ]
    } else {
        lba.to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_storage::{MemBackend, RawDisk};

    fn build_iso(sectors: usize) -> IsoImage {
        let mut img = vec![0u8; sectors * ISO_SECTOR_SIZE];
        // Minimal PVD so IsoImage::open accepts the image.
        let pvd = 16 * ISO_SECTOR_SIZE;
        img[pvd] = 0x01;
        img[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        let term = 17 * ISO_SECTOR_SIZE;
        img[term] = 0xFF;
        img[term + 1..term + 6].copy_from_slice(b"CD001");
        // Marker in sector 42.
        let data = 42 * ISO_SECTOR_SIZE;
        img[data..data + 4].copy_from_slice(b"DATA");

        let disk = RawDisk::open(MemBackend::from_bytes(img)).unwrap();
        IsoImage::open(Box::new(disk)).unwrap()
    }

    fn cdrom() -> AtapiCdrom {
        AtapiCdrom::new(build_iso(64))
    }

    fn packet(bytes: &[u8]) -> [u8; 12] {
        let mut p = [0u8; 12];
        p[..bytes.len()].copy_from_slice(bytes);
        p
    }

    #[test]
    fn test_unit_ready_succeeds() {
        let mut cd = cdrom();
        assert!(matches!(
            cd.handle_packet(&packet(&[0x00]), false),
            PacketResult::NoDataSuccess
        ));
    }

    #[test]
    fn inquiry_identifies_a_removable_cdrom() {
        let mut cd = cdrom();
        let PacketResult::DataIn(inq) = cd.handle_packet(&packet(&[0x12, 0, 0, 0, 36, 0]), false)
        else {
            panic!("expected data");
        };
        assert_eq!(inq.len(), 36);
        assert_eq!(inq[0], 0x05);
        assert_eq!(inq[1], 0x80);
        assert_eq!(&inq[8..11], b"PHP");
        assert_eq!(&inq[16..28], b"ATAPI CD-ROM");
        assert_eq!(&inq[32..36], b"2.5+");
    }

    #[test]
    fn read_capacity_reports_last_lba_and_block_size() {
        let mut cd = cdrom();
        let PacketResult::DataIn(cap) = cd.handle_packet(&packet(&[0x25]), false) else {
            panic!("expected data");
        };
        assert_eq!(u32::from_be_bytes(cap[0..4].try_into().unwrap()), 63);
        assert_eq!(u32::from_be_bytes(cap[4..8].try_into().unwrap()), 2048);
    }

    #[test]
    fn read10_returns_sector_payload() {
        let mut cd = cdrom();
        let PacketResult::DataIn(data) =
            cd.handle_packet(&packet(&[0x28, 0, 0, 0, 0, 42, 0, 0, 1, 0]), false)
        else {
            panic!("expected data");
        };
        assert_eq!(data.len(), 2048);
        assert_eq!(&data[0..4], b"DATA");
    }

    #[test]
    fn read10_past_end_latches_sense() {
        let mut cd = cdrom();
        match cd.handle_packet(&packet(&[0x28, 0, 0, 0, 1, 0, 0, 0, 8, 0]), false) {
            PacketResult::Error { sense_key, asc, .. } => {
                assert_eq!(sense_key, SENSE_ILLEGAL_REQUEST);
                assert_eq!(asc, ASC_LBA_OUT_OF_RANGE);
            }
            other => panic!("expected error, got {other:?}"),
        }

        // REQUEST SENSE sees the latched condition exactly once.
        let PacketResult::DataIn(sense) = cd.handle_packet(&packet(&[0x03, 0, 0, 0, 18, 0]), false)
        else {
            panic!("expected sense data");
        };
        assert_eq!(sense[2] & 0x0F, SENSE_ILLEGAL_REQUEST);
        assert_eq!(sense[12], ASC_LBA_OUT_OF_RANGE);

        let PacketResult::DataIn(sense) = cd.handle_packet(&packet(&[0x03, 0, 0, 0, 18, 0]), false)
        else {
            panic!("expected sense data");
        };
        assert_eq!(sense[2] & 0x0F, SENSE_NONE);
    }

    #[test]
    fn read_toc_in_lba_and_msf_forms() {
        let mut cd = cdrom();
        let PacketResult::DataIn(toc) = cd.handle_packet(&packet(&[0x43]), false) else {
            panic!();
        };
        assert_eq!(toc[2], 1);
        assert_eq!(toc[3], 1);
        assert_eq!(toc[4 + 2], 0x01); // track 1
        assert_eq!(toc[12 + 2], 0xAA); // lead-out
        assert_eq!(
            u32::from_be_bytes(toc[16..20].try_into().unwrap()),
            64,
            "lead-out at total sector count"
        );

        let PacketResult::DataIn(toc) = cd.handle_packet(&packet(&[0x43, 0x02]), false) else {
            panic!();
        };
        // MSF address of LBA 0 is 00:02:00.
        assert_eq!(&toc[8..12], &[0, 0, 2, 0]);
    }

    #[test]
    fn unknown_opcode_is_illegal_request() {
        let mut cd = cdrom();
        match cd.handle_packet(&packet(&[0xEE]), false) {
            PacketResult::Error { sense_key, asc, .. } => {
                assert_eq!(sense_key, SENSE_ILLEGAL_REQUEST);
                assert_eq!(asc, ASC_INVALID_OPCODE);
            }
            other => panic!("expected error, got {other:?}"),
        }
    }
}
