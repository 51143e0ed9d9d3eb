//! The IDE channel state machine: task-file registers, PIO data windows,
//! ATAPI packet plumbing and the command dispatch of both channels.

use std::rc::Rc;

use bitflags::bitflags;
use ember_platform::{IoPortDevice, IrqLine};

use crate::ata::AtaDrive;
use crate::atapi::{AtapiCdrom, PacketResult};
use crate::bmdma::BusMaster;

pub const ATA_IRQ_PRIMARY: u8 = 14;
pub const ATA_IRQ_SECONDARY: u8 = 15;

pub const PRIMARY_CMD_BASE: u16 = 0x1F0;
pub const PRIMARY_CTRL_PORT: u16 = 0x3F6;
pub const SECONDARY_CMD_BASE: u16 = 0x170;
pub const SECONDARY_CTRL_PORT: u16 = 0x376;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status: u8 {
        const ERR = 1 << 0;
        const DRQ = 1 << 3;
        const DSC = 1 << 4;
        const DF = 1 << 5;
        const DRDY = 1 << 6;
        const BSY = 1 << 7;
    }
}

const ERROR_ABRT: u8 = 1 << 2;

/// ATAPI interrupt-reason bits (the sector-count register after a packet
/// phase change).
const REASON_CD: u8 = 1 << 0;
const REASON_IO: u8 = 1 << 1;

pub enum Drive {
    Ata(AtaDrive),
    Atapi(AtapiCdrom),
}

impl Drive {
    fn is_atapi(&self) -> bool {
        matches!(self, Drive::Atapi(_))
    }
}

/// A queued DMA transfer, serviced by the machine between instructions.
pub(crate) enum DmaOp {
    /// Device-to-memory with the prepared bytes.
    Read(Vec<u8>),
    /// Memory-to-device write of `sectors × 512` bytes at `lba`.
    Write { lba: u64, bytes: usize },
}

pub struct Channel {
    drives: [Option<Drive>; 2],
    selected: usize,

    // Task-file registers.
    features: u8,
    sector_count: u8,
    lba0: u8,
    lba1: u8,
    lba2: u8,
    drive_head: u8,
    error: u8,
    status: Status,

    // PIO data-in buffer.
    data: Vec<u8>,
    data_pos: usize,
    /// Remaining ATAPI transfer after the current chunk.
    pending: Vec<u8>,

    // PIO data-out state.
    write_buf: Vec<u8>,
    write_expected: usize,
    write_lba: u64,

    // ATAPI packet collection.
    packet: Vec<u8>,
    awaiting_packet: bool,
    packet_dma: bool,

    pub(crate) bus_master: BusMaster,
    pub(crate) dma_op: Option<DmaOp>,

    irq: Rc<dyn IrqLine>,
    irq_disabled: bool,
    srst: bool,
}

impl Channel {
    fn new(irq: Rc<dyn IrqLine>) -> Self {
        let mut ch = Self {
            drives: [None, None],
            selected: 0,
            features: 0,
            sector_count: 0,
            lba0: 0,
            lba1: 0,
            lba2: 0,
            drive_head: 0,
            error: 0,
            status: Status::DRDY,
            data: Vec::new(),
            data_pos: 0,
            pending: Vec::new(),
            write_buf: Vec::new(),
            write_expected: 0,
            write_lba: 0,
            packet: Vec::new(),
            awaiting_packet: false,
            packet_dma: false,
            bus_master: BusMaster::default(),
            dma_op: None,
            irq,
            irq_disabled: false,
            srst: false,
        };
        ch.apply_signature();
        ch
    }

    pub fn attach(&mut self, slot: usize, drive: Drive) {
        self.drives[slot] = Some(drive);
        if slot == self.selected {
            self.apply_signature();
        }
    }

    fn selected_drive(&mut self) -> Option<&mut Drive> {
        self.drives[self.selected].as_mut()
    }

    fn has_any_drive(&self) -> bool {
        self.drives.iter().any(Option::is_some)
    }

    /// Post-reset / post-select signature in the task-file registers.
    fn apply_signature(&mut self) {
        match &self.drives[self.selected] {
            Some(Drive::Ata(_)) => {
                self.lba1 = 0x00;
                self.lba2 = 0x00;
                self.status = Status::DRDY | Status::DSC;
            }
            Some(Drive::Atapi(_)) => {
                self.lba1 = 0x14;
                self.lba2 = 0xEB;
                self.status = Status::DRDY;
            }
            None => {
                self.lba1 = 0xFF;
                self.lba2 = 0xFF;
                self.status = Status::empty();
            }
        }
        self.sector_count = 0x01;
        self.lba0 = 0x01;
        self.error = 0x01;
    }

    fn raise_irq(&mut self) {
        if !self.irq_disabled {
            self.irq.raise();
        }
    }

    fn abort(&mut self) {
        self.error = ERROR_ABRT;
        self.status = Status::DRDY | Status::ERR;
        self.raise_irq();
    }

    fn lba(&self) -> u64 {
        if self.drive_head & 0x40 != 0 {
            (self.drive_head as u64 & 0xF) << 24
                | (self.lba2 as u64) << 16
                | (self.lba1 as u64) << 8
                | self.lba0 as u64
        } else {
            // CHS translation through the fixed geometry.
            let cylinder = (self.lba2 as u64) << 8 | self.lba1 as u64;
            let head = self.drive_head as u64 & 0xF;
            let sector = self.lba0 as u64;
            (cylinder * crate::ata::HEADS + head) * crate::ata::SECTORS_PER_TRACK
                + sector.saturating_sub(1)
        }
    }

    fn transfer_count(&self) -> usize {
        if self.sector_count == 0 {
            256
        } else {
            self.sector_count as usize
        }
    }

    /// The host's ATAPI byte-count window (cylinder registers).
    fn byte_count_window(&self) -> usize {
        let raw = (self.lba2 as usize) << 8 | self.lba1 as usize;
        match raw {
            0 => 0xFFFE,
            n => n & !1, // keep word alignment
        }
    }

    fn start_data_in(&mut self, data: Vec<u8>) {
        self.data = data;
        self.data_pos = 0;
        self.status = Status::DRDY | Status::DRQ | Status::DSC;
        self.raise_irq();
    }

    /// Present the next ATAPI chunk, advertising its length in the
    /// byte-count registers.
    fn start_atapi_chunk(&mut self) {
        let window = self.byte_count_window();
        let chunk_len = window.min(self.pending.len());
        let rest = self.pending.split_off(chunk_len);
        let chunk = std::mem::replace(&mut self.pending, rest);

        self.lba1 = chunk_len as u8;
        self.lba2 = (chunk_len >> 8) as u8;
        self.sector_count = REASON_IO; // data to host
        self.data = chunk;
        self.data_pos = 0;
        self.status = Status::DRDY | Status::DRQ;
        self.raise_irq();
    }

    fn finish_atapi_command(&mut self) {
        self.sector_count = REASON_IO | REASON_CD;
        self.status = Status::DRDY;
        self.raise_irq();
    }

    fn dispatch_packet(&mut self) {
        let mut packet = [0u8; 12];
        packet.copy_from_slice(&self.packet);
        self.packet.clear();
        self.awaiting_packet = false;

        let dma = self.packet_dma;
        let result = match self.selected_drive() {
            Some(Drive::Atapi(cd)) => cd.handle_packet(&packet, dma),
            _ => {
                self.abort();
                return;
            }
        };

        match result {
            PacketResult::NoDataSuccess => {
                self.error = 0;
                self.finish_atapi_command();
            }
            PacketResult::DataIn(data) => {
                self.error = 0;
                if dma && self.bus_master.active() {
                    self.dma_op = Some(DmaOp::Read(data));
                    self.sector_count = REASON_IO | REASON_CD;
                    self.status = Status::DRDY;
                } else {
                    self.pending = data;
                    self.start_atapi_chunk();
                }
            }
            PacketResult::Error { sense_key, .. } => {
                self.error = sense_key << 4 | ERROR_ABRT;
                self.sector_count = REASON_IO | REASON_CD;
                self.status = Status::DRDY | Status::ERR;
                self.raise_irq();
            }
        }
    }

    fn execute(&mut self, command: u8) {
        if !self.has_any_drive() {
            return;
        }
        self.error = 0;

        match command {
            0x20 | 0x21 | 0xC4 => {
                // READ SECTORS (and READ MULTIPLE, PIO).
                let lba = self.lba();
                let count = self.transfer_count();
                match self.selected_drive() {
                    Some(Drive::Ata(drive)) => match drive.read_sectors(lba, count) {
                        Ok(data) => self.start_data_in(data),
                        Err(_) => self.abort(),
                    },
                    _ => self.abort(),
                }
            }
            0x30 | 0x31 | 0xC5 => {
                // WRITE SECTORS: bytes arrive through the data port.
                let lba = self.lba();
                let count = self.transfer_count();
                match self.selected_drive() {
                    Some(Drive::Ata(_)) => {
                        self.write_lba = lba;
                        self.write_expected = count * 512;
                        self.write_buf = Vec::with_capacity(self.write_expected);
                        self.status = Status::DRDY | Status::DRQ | Status::DSC;
                    }
                    _ => self.abort(),
                }
            }
            0xC8 => {
                // READ DMA.
                let lba = self.lba();
                let count = self.transfer_count();
                match self.selected_drive() {
                    Some(Drive::Ata(drive)) => match drive.read_sectors(lba, count) {
                        Ok(data) => {
                            self.dma_op = Some(DmaOp::Read(data));
                            self.status = Status::DRDY | Status::DSC;
                        }
                        Err(_) => self.abort(),
                    },
                    _ => self.abort(),
                }
            }
            0xCA => {
                // WRITE DMA.
                let lba = self.lba();
                let count = self.transfer_count();
                match self.selected_drive() {
                    Some(Drive::Ata(_)) => {
                        self.dma_op = Some(DmaOp::Write {
                            lba,
                            bytes: count * 512,
                        });
                        self.status = Status::DRDY | Status::DSC;
                    }
                    _ => self.abort(),
                }
            }
            0xEC => {
                // IDENTIFY DEVICE: aborts on ATAPI with the signature.
                match self.selected_drive() {
                    Some(Drive::Ata(drive)) => {
                        let id = drive.identify().to_vec();
                        self.start_data_in(id);
                    }
                    Some(Drive::Atapi(_)) => {
                        self.apply_signature();
                        self.abort();
                    }
                    None => self.abort(),
                }
            }
            0xA0 => {
                // PACKET: expect 12 command bytes on the data port.
                match self.selected_drive() {
                    Some(Drive::Atapi(_)) => {
                        self.awaiting_packet = true;
                        self.packet.clear();
                        self.packet_dma = self.features & 0x01 != 0;
                        self.sector_count = REASON_CD; // command phase
                        self.status = Status::DRDY | Status::DRQ;
                    }
                    _ => self.abort(),
                }
            }
            0xA1 => {
                // IDENTIFY PACKET DEVICE.
                match self.selected_drive() {
                    Some(Drive::Atapi(cd)) => {
                        let id = cd.identify_packet().to_vec();
                        self.start_data_in(id);
                    }
                    _ => self.abort(),
                }
            }
            0xE7 | 0xEA => {
                // FLUSH CACHE.
                self.status = Status::DRDY | Status::DSC;
                self.raise_irq();
            }
            0x08 => {
                // DEVICE RESET.
                self.apply_signature();
                self.raise_irq();
            }
            0x10..=0x1F | 0x91 | 0xEF | 0xC6 => {
                // RECALIBRATE / INIT PARAMS / SET FEATURES / SET MULTIPLE.
                self.status = Status::DRDY | Status::DSC;
                self.raise_irq();
            }
            _ => {
                tracing::debug!(command = format_args!("{command:#04x}"), "unhandled ATA command");
                self.abort();
            }
        }
    }

    fn read_data_u16(&mut self) -> u16 {
        if !self.has_any_drive() {
            return 0xFFFF;
        }
        if self.data_pos >= self.data.len() {
            return 0;
        }
        let lo = self.data.get(self.data_pos).copied().unwrap_or(0);
        let hi = self.data.get(self.data_pos + 1).copied().unwrap_or(0);
        self.data_pos += 2;

        if self.data_pos >= self.data.len() {
            self.data.clear();
            self.data_pos = 0;
            if !self.pending.is_empty() {
                // More ATAPI data behind the window.
                self.start_atapi_chunk();
            } else if self.drives[self.selected]
                .as_ref()
                .map(Drive::is_atapi)
                .unwrap_or(false)
            {
                self.finish_atapi_command();
            } else {
                self.status = Status::DRDY | Status::DSC;
            }
        }
        (hi as u16) << 8 | lo as u16
    }

    fn write_data_u16(&mut self, value: u16) {
        if self.awaiting_packet {
            self.packet.push(value as u8);
            self.packet.push((value >> 8) as u8);
            if self.packet.len() >= 12 {
                self.dispatch_packet();
            }
            return;
        }

        if self.write_expected > 0 {
            self.write_buf.push(value as u8);
            self.write_buf.push((value >> 8) as u8);
            if self.write_buf.len() >= self.write_expected {
                let lba = self.write_lba;
                let buf = std::mem::take(&mut self.write_buf);
                self.write_expected = 0;
                match self.selected_drive() {
                    Some(Drive::Ata(drive)) => {
                        if drive.write_sectors(lba, &buf).is_err() {
                            self.abort();
                            return;
                        }
                        self.status = Status::DRDY | Status::DSC;
                        self.raise_irq();
                    }
                    _ => self.abort(),
                }
            }
        }
    }

    pub(crate) fn finish_dma_read(&mut self) {
        self.status = Status::DRDY | Status::DSC;
        self.raise_irq();
    }

    pub(crate) fn finish_dma_write(&mut self, lba: u64, data: &[u8]) -> bool {
        match self.selected_drive() {
            Some(Drive::Ata(drive)) => {
                if drive.write_sectors(lba, data).is_ok() {
                    self.status = Status::DRDY | Status::DSC;
                    self.raise_irq();
                    true
                } else {
                    self.abort();
                    false
                }
            }
            _ => {
                self.abort();
                false
            }
        }
    }

    fn read_register(&mut self, offset: u16) -> u8 {
        if !self.has_any_drive() {
            return 0xFF;
        }
        match offset {
            1 => self.error,
            2 => self.sector_count,
            3 => self.lba0,
            4 => self.lba1,
            5 => self.lba2,
            6 => self.drive_head,
            _ => self.status.bits(),
        }
    }

    fn write_register(&mut self, offset: u16, value: u8) {
        match offset {
            1 => self.features = value,
            2 => self.sector_count = value,
            3 => self.lba0 = value,
            4 => self.lba1 = value,
            5 => self.lba2 = value,
            6 => {
                self.drive_head = value;
                let select = (value as usize >> 4) & 1;
                if select != self.selected {
                    self.selected = select;
                    self.apply_signature();
                }
            }
            7 => self.execute(value),
            _ => {}
        }
    }

    fn write_control(&mut self, value: u8) {
        self.irq_disabled = value & 0x02 != 0;
        let srst = value & 0x04 != 0;
        if self.srst && !srst {
            // Falling edge completes the soft reset.
            self.data.clear();
            self.pending.clear();
            self.write_buf.clear();
            self.write_expected = 0;
            self.awaiting_packet = false;
            self.dma_op = None;
            self.apply_signature();
        }
        self.srst = srst;
    }
}

pub struct IdeController {
    pub(crate) channels: [Channel; 2],
}

impl IdeController {
    pub fn new(irq_primary: Rc<dyn IrqLine>, irq_secondary: Rc<dyn IrqLine>) -> Self {
        Self {
            channels: [Channel::new(irq_primary), Channel::new(irq_secondary)],
        }
    }

    pub fn attach_primary_master_ata(&mut self, drive: AtaDrive) {
        self.channels[0].attach(0, Drive::Ata(drive));
    }

    pub fn attach_primary_slave_ata(&mut self, drive: AtaDrive) {
        self.channels[0].attach(1, Drive::Ata(drive));
    }

    pub fn attach_secondary_master_atapi(&mut self, cdrom: AtapiCdrom) {
        self.channels[1].attach(0, Drive::Atapi(cdrom));
    }

    pub fn attach_primary_master_atapi(&mut self, cdrom: AtapiCdrom) {
        self.channels[0].attach(0, Drive::Atapi(cdrom));
    }

    pub fn channel(&mut self, index: usize) -> &mut Channel {
        &mut self.channels[index]
    }

    /// Borrow an attached ATAPI drive, wherever it sits.
    pub fn find_cdrom(&mut self) -> Option<&mut AtapiCdrom> {
        for ch in &mut self.channels {
            for slot in &mut ch.drives {
                if let Some(Drive::Atapi(cd)) = slot.as_mut() {
                    return Some(cd);
                }
            }
        }
        None
    }

    pub fn find_ata(&mut self) -> Option<&mut AtaDrive> {
        for ch in &mut self.channels {
            for slot in &mut ch.drives {
                if let Some(Drive::Ata(drive)) = slot.as_mut() {
                    return Some(drive);
                }
            }
        }
        None
    }

    /// A DMA transfer is armed and the engine is running.
    pub fn has_pending_dma(&self) -> bool {
        self.channels
            .iter()
            .any(|ch| ch.dma_op.is_some() && ch.bus_master.active())
    }

    fn route(&mut self, port: u16) -> Option<(usize, u16)> {
        match port {
            PRIMARY_CMD_BASE..=0x1F7 => Some((0, port - PRIMARY_CMD_BASE)),
            PRIMARY_CTRL_PORT => Some((0, 8)),
            SECONDARY_CMD_BASE..=0x177 => Some((1, port - SECONDARY_CMD_BASE)),
            SECONDARY_CTRL_PORT => Some((1, 8)),
            _ => None,
        }
    }
}

impl IoPortDevice for IdeController {
    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        let Some((index, offset)) = self.route(port) else {
            return 0xFF;
        };
        let ch = &mut self.channels[index];
        match offset {
            0 => {
                if size == 1 {
                    ch.read_data_u16() as u8 as u32
                } else if size == 4 {
                    let lo = ch.read_data_u16() as u32;
                    let hi = ch.read_data_u16() as u32;
                    hi << 16 | lo
                } else {
                    ch.read_data_u16() as u32
                }
            }
            8 => {
                // Alternate status.
                if ch.has_any_drive() {
                    ch.status.bits() as u32
                } else {
                    0xFF
                }
            }
            off => ch.read_register(off) as u32,
        }
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        let Some((index, offset)) = self.route(port) else {
            return;
        };
        let ch = &mut self.channels[index];
        match offset {
            0 => {
                if size == 4 {
                    ch.write_data_u16(value as u16);
                    ch.write_data_u16((value >> 16) as u16);
                } else {
                    ch.write_data_u16(value as u16);
                }
            }
            8 => ch.write_control(value as u8),
            off => ch.write_register(off, value as u8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_platform::irq::NullIrqLine;
    use ember_storage::{IsoImage, MemBackend, RawDisk, VirtualDisk, ISO_SECTOR_SIZE, SECTOR_SIZE};
    use std::cell::Cell;

    #[derive(Default)]
    struct CountingLine(Cell<u32>);

    impl IrqLine for CountingLine {
        fn raise(&self) {
            self.0.set(self.0.get() + 1);
        }
        fn lower(&self) {}
    }

    fn disk_with_marker() -> AtaDrive {
        let mut disk = RawDisk::create(MemBackend::new(), 8 * SECTOR_SIZE as u64).unwrap();
        let mut sector = vec![0u8; SECTOR_SIZE];
        sector[0..4].copy_from_slice(b"BOOT");
        sector[510] = 0x55;
        sector[511] = 0xAA;
        disk.write_sectors(0, &sector).unwrap();
        let mut sector1 = vec![0u8; SECTOR_SIZE];
        sector1[0..4].copy_from_slice(b"NEXT");
        disk.write_sectors(1, &sector1).unwrap();
        AtaDrive::new(Box::new(disk)).unwrap()
    }

    fn iso_with_marker() -> IsoImage {
        let mut img = vec![0u8; 64 * ISO_SECTOR_SIZE];
        let pvd = 16 * ISO_SECTOR_SIZE;
        img[pvd] = 0x01;
        img[pvd + 1..pvd + 6].copy_from_slice(b"CD001");
        let term = 17 * ISO_SECTOR_SIZE;
        img[term] = 0xFF;
        img[term + 1..term + 6].copy_from_slice(b"CD001");
        let data = 42 * ISO_SECTOR_SIZE;
        img[data..data + 4].copy_from_slice(b"CDAT");
        IsoImage::open(Box::new(RawDisk::open(MemBackend::from_bytes(img)).unwrap())).unwrap()
    }

    fn controller() -> (Rc<CountingLine>, IdeController) {
        let line = Rc::new(CountingLine::default());
        let ide = IdeController::new(line.clone(), Rc::new(NullIrqLine));
        (line, ide)
    }

    #[test]
    fn pio_read_sectors_via_ports() {
        let (irq, mut ide) = controller();
        ide.attach_primary_master_ata(disk_with_marker());

        ide.io_write(0x1F6, 1, 0xE0); // master, LBA
        ide.io_write(0x1F2, 1, 1);
        ide.io_write(0x1F3, 1, 0);
        ide.io_write(0x1F4, 1, 0);
        ide.io_write(0x1F5, 1, 0);
        ide.io_write(0x1F7, 1, 0x20);

        assert_ne!(ide.io_read(0x1F7, 1) as u8 & Status::DRQ.bits(), 0);
        assert_eq!(irq.0.get(), 1);

        let mut buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTOR_SIZE / 2 {
            let w = ide.io_read(0x1F0, 2) as u16;
            buf[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
        }
        assert_eq!(&buf[0..4], b"BOOT");
        assert_eq!(&buf[510..512], &[0x55, 0xAA]);
        // Transfer complete: DRQ dropped.
        assert_eq!(ide.io_read(0x1F7, 1) as u8 & Status::DRQ.bits(), 0);
    }

    #[test]
    fn pio_write_sectors_flushes_on_completion() {
        let (irq, mut ide) = controller();
        ide.attach_primary_master_ata(disk_with_marker());

        ide.io_write(0x1F6, 1, 0xE0);
        ide.io_write(0x1F2, 1, 1);
        ide.io_write(0x1F3, 1, 2); // LBA 2
        ide.io_write(0x1F4, 1, 0);
        ide.io_write(0x1F5, 1, 0);
        ide.io_write(0x1F7, 1, 0x30);

        let irq_before = irq.0.get();
        for i in 0..SECTOR_SIZE as u32 / 2 {
            ide.io_write(0x1F0, 2, 0x4242 + i % 7);
        }
        assert_eq!(irq.0.get(), irq_before + 1);

        // Read it back through the same port interface.
        ide.io_write(0x1F2, 1, 1);
        ide.io_write(0x1F3, 1, 2);
        ide.io_write(0x1F7, 1, 0x20);
        let w = ide.io_read(0x1F0, 2) as u16;
        assert_eq!(w, 0x4242);
    }

    #[test]
    fn identify_on_atapi_aborts_with_signature() {
        let (_irq, mut ide) = controller();
        ide.attach_primary_master_atapi(AtapiCdrom::new(iso_with_marker()));

        ide.io_write(0x1F6, 1, 0xA0);
        ide.io_write(0x1F7, 1, 0xEC);

        let status = ide.io_read(0x1F7, 1) as u8;
        assert_ne!(status & Status::ERR.bits(), 0);
        assert_eq!(ide.io_read(0x1F4, 1), 0x14);
        assert_eq!(ide.io_read(0x1F5, 1), 0xEB);
    }

    #[test]
    fn absent_channel_reads_all_ones() {
        let (_irq, mut ide) = controller();
        assert_eq!(ide.io_read(0x1F7, 1), 0xFF);
        assert_eq!(ide.io_read(0x1F0, 2), 0xFFFF);
        assert_eq!(ide.io_read(0x170, 1), 0xFF);
    }

    #[test]
    fn atapi_packet_read10_chunks_through_the_byte_count_window() {
        let (_irq, mut ide) = controller();
        ide.attach_primary_master_atapi(AtapiCdrom::new(iso_with_marker()));

        // Byte-count window of 1024: a 2048-byte sector needs two chunks.
        ide.io_write(0x1F6, 1, 0xA0);
        ide.io_write(0x1F4, 1, 0x00);
        ide.io_write(0x1F5, 1, 0x04);
        ide.io_write(0x1F7, 1, 0xA0); // PACKET

        assert_ne!(ide.io_read(0x1F7, 1) as u8 & Status::DRQ.bits(), 0);

        // READ(10) of sector 42.
        let packet: [u8; 12] = [0x28, 0, 0, 0, 0, 42, 0, 0, 1, 0, 0, 0];
        for pair in packet.chunks_exact(2) {
            ide.io_write(0x1F0, 2, u16::from_le_bytes([pair[0], pair[1]]) as u32);
        }

        let mut received = Vec::new();
        for _chunk in 0..2 {
            assert_ne!(ide.io_read(0x1F7, 1) as u8 & Status::DRQ.bits(), 0);
            let len =
                (ide.io_read(0x1F5, 1) as usize) << 8 | ide.io_read(0x1F4, 1) as usize;
            assert_eq!(len, 1024);
            for _ in 0..len / 2 {
                let w = ide.io_read(0x1F0, 2) as u16;
                received.extend_from_slice(&w.to_le_bytes());
            }
        }

        assert_eq!(received.len(), 2048);
        assert_eq!(&received[0..4], b"CDAT");
        let status = ide.io_read(0x1F7, 1) as u8;
        assert_eq!(status & Status::DRQ.bits(), 0);
        assert_ne!(ide.io_read(0x1F2, 1) as u8 & (REASON_IO | REASON_CD), 0);
    }

    #[test]
    fn atapi_read10_single_chunk_advertises_2048() {
        let (_irq, mut ide) = controller();
        ide.attach_primary_master_atapi(AtapiCdrom::new(iso_with_marker()));

        // Byte-count window wide open (0x0800 covers a whole sector).
        ide.io_write(0x1F6, 1, 0xA0);
        ide.io_write(0x1F4, 1, 0x00);
        ide.io_write(0x1F5, 1, 0x08);
        ide.io_write(0x1F7, 1, 0xA0);

        let packet: [u8; 12] = [0x28, 0, 0, 0, 0, 42, 0, 0, 1, 0, 0, 0];
        for pair in packet.chunks_exact(2) {
            ide.io_write(0x1F0, 2, u16::from_le_bytes([pair[0], pair[1]]) as u32);
        }

        // The byte-count registers advertise the full 2048 ahead of DRQ.
        assert_eq!(ide.io_read(0x1F4, 1), 0x00);
        assert_eq!(ide.io_read(0x1F5, 1), 0x08);
        assert_ne!(ide.io_read(0x1F7, 1) as u8 & Status::DRQ.bits(), 0);

        let mut received = Vec::new();
        for _ in 0..1024 {
            let w = ide.io_read(0x1F0, 2) as u16;
            received.extend_from_slice(&w.to_le_bytes());
        }
        assert_eq!(&received[0..4], b"CDAT");
        assert_eq!(ide.io_read(0x1F7, 1) as u8 & Status::DRQ.bits(), 0);
    }

    #[test]
    fn test_unit_ready_sets_the_reason_bits() {
        let (_irq, mut ide) = controller();
        ide.attach_primary_master_atapi(AtapiCdrom::new(iso_with_marker()));

        ide.io_write(0x1F6, 1, 0xA0);
        ide.io_write(0x1F7, 1, 0xA0);
        for _ in 0..6 {
            ide.io_write(0x1F0, 2, 0);
        }
        assert_eq!(ide.io_read(0x1F2, 1) as u8, REASON_IO | REASON_CD);
        assert_eq!(ide.io_read(0x1F7, 1) as u8 & Status::ERR.bits(), 0);
    }

    #[test]
    fn drive_select_reapplies_the_signature() {
        let (_irq, mut ide) = controller();
        ide.attach_primary_master_ata(disk_with_marker());

        ide.io_write(0x1F6, 1, 0xE0);
        assert_eq!(ide.io_read(0x1F4, 1), 0x00);

        // Slave slot is empty.
        ide.io_write(0x1F6, 1, 0xF0);
        assert_eq!(ide.io_read(0x1F4, 1), 0xFF);
        assert_eq!(ide.io_read(0x1F5, 1), 0xFF);

        ide.io_write(0x1F6, 1, 0xE0);
        assert_eq!(ide.io_read(0x1F4, 1), 0x00);
    }

    #[test]
    fn srst_falling_edge_resets_the_channel() {
        let (_irq, mut ide) = controller();
        ide.attach_primary_master_ata(disk_with_marker());

        ide.io_write(0x1F6, 1, 0xE0);
        ide.io_write(0x1F2, 1, 1);
        ide.io_write(0x1F7, 1, 0x20);
        assert_ne!(ide.io_read(0x1F7, 1) as u8 & Status::DRQ.bits(), 0);

        ide.io_write(0x3F6, 1, 0x04);
        ide.io_write(0x3F6, 1, 0x00);
        let status = ide.io_read(0x1F7, 1) as u8;
        assert_eq!(status & Status::DRQ.bits(), 0);
        assert_ne!(status & Status::DRDY.bits(), 0);
    }

    #[test]
    fn nien_gates_the_irq_line() {
        let (irq, mut ide) = controller();
        ide.attach_primary_master_ata(disk_with_marker());

        ide.io_write(0x3F6, 1, 0x02); // nIEN
        ide.io_write(0x1F6, 1, 0xE0);
        ide.io_write(0x1F2, 1, 1);
        ide.io_write(0x1F3, 1, 0);
        ide.io_write(0x1F7, 1, 0x20);
        assert_eq!(irq.0.get(), 0);
    }
}
