use std::cell::RefCell;
use std::rc::Rc;

use ember_devices_storage::ata::AtaDrive;
use ember_devices_storage::pci_ide::register_ide_ports;
use ember_devices_storage::{IdeController, PciIdeFunction};
use ember_platform::irq::NullIrqLine;
use ember_platform::IoPortBus;
use ember_storage::{MemBackend, RawDisk, VirtualDisk, SECTOR_SIZE};
use memory::{GuestRam, MemoryBus};

fn ata_disk_with_pattern() -> AtaDrive {
    let mut disk = RawDisk::create(MemBackend::new(), 64 * SECTOR_SIZE as u64).unwrap();
    let mut sector = vec![0u8; SECTOR_SIZE];
    for (i, b) in sector.iter_mut().enumerate() {
        *b = (i % 251) as u8;
    }
    disk.write_sectors(5, &sector).unwrap();
    AtaDrive::new(Box::new(disk)).unwrap()
}

fn rig() -> (IoPortBus, Rc<RefCell<IdeController>>, GuestRam) {
    let ide = Rc::new(RefCell::new(IdeController::new(
        Rc::new(NullIrqLine),
        Rc::new(NullIrqLine),
    )));
    ide.borrow_mut().attach_primary_master_ata(ata_disk_with_pattern());

    let function = PciIdeFunction::new(ide.clone());
    let mut io = IoPortBus::new();
    register_ide_ports(&mut io, ide.clone(), function.bm_base());

    (io, ide, GuestRam::new(1024 * 1024))
}

fn write_prd(ram: &mut GuestRam, addr: u64, base: u32, count: u16, eot: bool) {
    ram.write_u32(addr, base);
    ram.write_u16(addr + 4, count);
    ram.write_u16(addr + 6, if eot { 0x8000 } else { 0 });
}

#[test]
fn read_dma_scatters_a_sector_into_guest_memory() {
    let (mut io, ide, mut ram) = rig();

    // PRD list: two 256-byte regions.
    write_prd(&mut ram, 0x8000, 0x9000, 256, false);
    write_prd(&mut ram, 0x8008, 0xA000, 256, true);

    // Program the bus-master window (default base 0xCC00).
    io.write(0xCC04, 4, 0x8000);

    // READ DMA of LBA 5.
    io.write(0x1F6, 1, 0xE0);
    io.write(0x1F2, 1, 1);
    io.write(0x1F3, 1, 5);
    io.write(0x1F4, 1, 0);
    io.write(0x1F5, 1, 0);
    io.write(0x1F7, 1, 0xC8);

    // Start the engine (device-to-memory).
    io.write(0xCC00, 1, 0x09);
    ide.borrow_mut().service_dma(&mut ram);

    for i in 0..256u64 {
        assert_eq!(ram.read_u8(0x9000 + i), (i % 251) as u8);
        assert_eq!(ram.read_u8(0xA000 + i), ((256 + i) % 251) as u8);
    }

    // Status: interrupt set, engine idle.
    let status = io.read(0xCC02, 1) as u8;
    assert_ne!(status & 0x04, 0);
    assert_eq!(status & 0x01, 0);

    // Write-one clears the interrupt bit.
    io.write(0xCC02, 1, 0x04);
    assert_eq!(io.read(0xCC02, 1) as u8 & 0x04, 0);
}

#[test]
fn write_dma_gathers_from_guest_memory() {
    let (mut io, ide, mut ram) = rig();

    for i in 0..SECTOR_SIZE as u64 {
        ram.write_u8(0x9000 + i, (i % 7) as u8 + 1);
    }
    write_prd(&mut ram, 0x8000, 0x9000, 0, true); // count 0 = 64 KiB window

    io.write(0xCC04, 4, 0x8000);

    io.write(0x1F6, 1, 0xE0);
    io.write(0x1F2, 1, 1);
    io.write(0x1F3, 1, 9); // LBA 9
    io.write(0x1F4, 1, 0);
    io.write(0x1F5, 1, 0);
    io.write(0x1F7, 1, 0xCA);

    io.write(0xCC00, 1, 0x01); // memory-to-device
    ide.borrow_mut().service_dma(&mut ram);

    // Read LBA 9 back via PIO.
    io.write(0x1F2, 1, 1);
    io.write(0x1F3, 1, 9);
    io.write(0x1F7, 1, 0x20);
    let w = io.read(0x1F0, 2) as u16;
    assert_eq!(w.to_le_bytes(), [1, 2]);
}

#[test]
fn bm_base_follows_a_bar_rewrite() {
    let ide = Rc::new(RefCell::new(IdeController::new(
        Rc::new(NullIrqLine),
        Rc::new(NullIrqLine),
    )));
    let mut function = PciIdeFunction::new(ide.clone());

    use ember_devices::pci::PciFunction;
    function.config_mut().write(0x20, 4, 0xD001);
    function.sync_bm_base();
    assert_eq!(function.bm_base().get(), 0xD000);
}
