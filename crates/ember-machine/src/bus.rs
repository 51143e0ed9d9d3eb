//! The machine's physical bus stack and port-fabric glue.

use std::cell::RefCell;
use std::rc::Rc;

use ember_interrupts::PicPair;
use ember_pc_constants::VBE_LFB_BASE;
use ember_platform::{IoPortBus, IoPortDevice};
use memory::{A20Bus, A20Gate, GuestRam};

/// 16 MiB linear framebuffer window behind the VBE physical base.
const LFB_SIZE: usize = 16 * 1024 * 1024;

/// Guest-visible physical memory: RAM behind the A20 gate, plus the
/// high framebuffer carve-out. The legacy VGA window and the BIOS ROM
/// shadow live in ordinary RAM.
pub struct PcBus {
    ram: A20Bus<GuestRam>,
    lfb: Vec<u8>,
    lfb_base: u64,
}

impl PcBus {
    pub fn new(ram_size_bytes: usize, a20: A20Gate) -> Self {
        Self {
            ram: A20Bus::new(GuestRam::new(ram_size_bytes), a20),
            lfb: vec![0; LFB_SIZE],
            lfb_base: VBE_LFB_BASE,
        }
    }

    fn lfb_offset(&self, paddr: u64) -> Option<usize> {
        if (self.lfb_base..self.lfb_base + self.lfb.len() as u64).contains(&paddr) {
            Some((paddr - self.lfb_base) as usize)
        } else {
            None
        }
    }

    pub fn framebuffer(&self) -> &[u8] {
        &self.lfb
    }

    fn read8(&mut self, paddr: u64) -> u8 {
        use memory::MemoryBus as _;
        match self.lfb_offset(paddr) {
            Some(off) => self.lfb[off],
            None => self.ram.read_u8(paddr),
        }
    }

    fn write8(&mut self, paddr: u64, value: u8) {
        use memory::MemoryBus as _;
        match self.lfb_offset(paddr) {
            Some(off) => self.lfb[off] = value,
            None => self.ram.write_u8(paddr, value),
        }
    }
}

impl memory::MemoryBus for PcBus {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.read8(paddr)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.write8(paddr, value);
    }
}

impl ember_mmu::MemoryBus for PcBus {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.read8(paddr)
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        memory::MemoryBus::read_u16(self, paddr)
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        memory::MemoryBus::read_u32(self, paddr)
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        memory::MemoryBus::read_u64(self, paddr)
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.write8(paddr, value);
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        memory::MemoryBus::write_u16(self, paddr, value);
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        memory::MemoryBus::write_u32(self, paddr, value);
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        memory::MemoryBus::write_u64(self, paddr, value);
    }
}

/// The CPU's port window onto the shared [`IoPortBus`].
#[derive(Clone)]
pub struct SharedIo(pub Rc<RefCell<IoPortBus>>);

impl ember_cpu_core::IoBus for SharedIo {
    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        self.0.borrow_mut().read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.0.borrow_mut().write(port, size, value);
    }
}

/// Port face of the 8259 pair: 0x20/0x21 master, 0xA0/0xA1 slave.
pub struct PicPorts(pub Rc<RefCell<PicPair>>);

impl IoPortDevice for PicPorts {
    fn io_read(&mut self, port: u16, _size: u8) -> u32 {
        let pics = self.0.borrow();
        (match port {
            0x20 => pics.master.read_command(),
            0x21 => pics.master.read_data(),
            0xA0 => pics.slave.read_command(),
            _ => pics.slave.read_data(),
        }) as u32
    }

    fn io_write(&mut self, port: u16, _size: u8, value: u32) {
        let mut pics = self.0.borrow_mut();
        let value = value as u8;
        match port {
            0x20 => pics.master.write_command(value),
            0x21 => pics.master.write_data(value),
            0xA0 => pics.slave.write_command(value),
            _ => pics.slave.write_data(value),
        }
    }
}
