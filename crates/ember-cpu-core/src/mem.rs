//! The CPU-facing memory interface.
//!
//! [`PagingBus`] sits between the interpreter and physical memory: it
//! applies the linear-address width, walks page tables when CR0.PG is set,
//! memoizes translations in the TLB and routes IN/OUT to the port bus.
//! It learns the current translation regime from [`CpuBus::sync`], which
//! the interpreter calls at every instruction boundary and after any
//! control-register write.

use std::collections::HashSet;

use ember_mmu::{walk, Access, MemoryBus, PageFault, PagingMode, Tlb, PAGE_MASK, PAGE_SHIFT};

use crate::exception::Exception;
use crate::state::{CpuMode, CpuState, CR0_PG, CR0_WP, CR4_PAE, CR4_PSE};

/// Port I/O sink. Sizes are 1, 2 or 4 bytes.
pub trait IoBus {
    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, value: u32);
}

/// Open-bus port fabric for tests and bare CPUs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullIo;

impl IoBus for NullIo {
    fn io_read(&mut self, _port: u16, size: u8) -> u32 {
        match size {
            1 => 0xFF,
            2 => 0xFFFF,
            _ => 0xFFFF_FFFF,
        }
    }

    fn io_write(&mut self, _port: u16, _size: u8, _value: u32) {}
}

/// Everything the interpreter needs from the outside world.
pub trait CpuBus {
    /// Refresh the cached translation regime from CPU state.
    fn sync(&mut self, state: &CpuState);

    fn read_u8(&mut self, linear: u64) -> Result<u8, Exception>;
    fn read_u16(&mut self, linear: u64) -> Result<u16, Exception>;
    fn read_u32(&mut self, linear: u64) -> Result<u32, Exception>;
    fn read_u64(&mut self, linear: u64) -> Result<u64, Exception>;
    fn write_u8(&mut self, linear: u64, value: u8) -> Result<(), Exception>;
    fn write_u16(&mut self, linear: u64, value: u16) -> Result<(), Exception>;
    fn write_u32(&mut self, linear: u64, value: u32) -> Result<(), Exception>;
    fn write_u64(&mut self, linear: u64, value: u64) -> Result<(), Exception>;

    /// Code fetch (sets the instruction-fetch bit in #PF error codes).
    fn fetch_u8(&mut self, linear: u64) -> Result<u8, Exception>;

    /// Implicit supervisor accesses: descriptor tables, TSS, IVT.
    fn read_system_u8(&mut self, linear: u64) -> Result<u8, Exception>;
    fn read_system_u16(&mut self, linear: u64) -> Result<u16, Exception>;
    fn read_system_u32(&mut self, linear: u64) -> Result<u32, Exception>;
    fn read_system_u64(&mut self, linear: u64) -> Result<u64, Exception>;
    fn write_system_u8(&mut self, linear: u64, value: u8) -> Result<(), Exception>;
    fn write_system_u16(&mut self, linear: u64, value: u16) -> Result<(), Exception>;
    fn write_system_u32(&mut self, linear: u64, value: u32) -> Result<(), Exception>;

    fn read_bytes(&mut self, linear: u64, buf: &mut [u8]) -> Result<(), Exception>;
    fn write_bytes(&mut self, linear: u64, bytes: &[u8]) -> Result<(), Exception>;

    fn invlpg(&mut self, linear: u64);
    fn flush_tlb(&mut self);

    fn io_read(&mut self, port: u16, size: u8) -> u32;
    fn io_write(&mut self, port: u16, size: u8, value: u32);
}

#[derive(Clone, Copy, Debug)]
struct BusConfig {
    paging: bool,
    mode: PagingMode,
    cr3: u64,
    write_protect: bool,
    user: bool,
    long: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            paging: false,
            mode: PagingMode::Legacy { pse: false },
            cr3: 0,
            write_protect: false,
            user: false,
            long: false,
        }
    }
}

/// Translating bus over a physical memory and a port fabric.
pub struct PagingBus<M, I = NullIo> {
    phys: M,
    io: I,
    tlb: Tlb,
    /// Physical pages the walker touched as table frames under the current
    /// root; a guest store into any of them drops the whole TLB.
    table_pages: HashSet<u64>,
    cfg: BusConfig,
    seen_generation: u64,
}

impl<M: MemoryBus> PagingBus<M, NullIo> {
    pub fn new(phys: M) -> Self {
        Self::with_io(phys, NullIo)
    }
}

impl<M: MemoryBus, I: IoBus> PagingBus<M, I> {
    pub fn with_io(phys: M, io: I) -> Self {
        Self {
            phys,
            io,
            tlb: Tlb::new(),
            table_pages: HashSet::new(),
            cfg: BusConfig::default(),
            seen_generation: 0,
        }
    }

    pub fn physical(&self) -> &M {
        &self.phys
    }

    pub fn physical_mut(&mut self) -> &mut M {
        &mut self.phys
    }

    pub fn io(&mut self) -> &mut I {
        &mut self.io
    }

    /// Linear-address wrap outside IA-32e: everything above 4 GiB aliases.
    fn mask_linear(&self, linear: u64) -> u64 {
        if self.cfg.long {
            linear
        } else {
            linear & 0xFFFF_FFFF
        }
    }

    fn check_canonical(&self, linear: u64) -> Result<(), Exception> {
        if !self.cfg.long {
            return Ok(());
        }
        let top = (linear as i64) >> 47;
        if top == 0 || top == -1 {
            Ok(())
        } else {
            Err(Exception::GP0)
        }
    }

    fn translate(&mut self, linear: u64, access: Access) -> Result<u64, Exception> {
        if !self.cfg.paging {
            return Ok(linear);
        }

        if let Some(t) = self.tlb.lookup(linear, access.user, access.write) {
            return Ok(t.physical(linear));
        }

        let result = walk(
            &mut TableRecorder {
                bus: &mut self.phys,
                touched: &mut self.table_pages,
            },
            self.cfg.cr3,
            self.cfg.mode,
            self.cfg.write_protect,
            linear,
            access,
        );

        match result {
            Ok(t) => {
                self.tlb.insert(linear, access.user, access.write, t);
                Ok(t.physical(linear))
            }
            Err(PageFault { addr, error_code }) => Err(Exception::PageFault { addr, error_code }),
        }
    }

    fn after_write(&mut self, paddr: u64, len: u64) {
        if !self.cfg.paging || self.table_pages.is_empty() {
            return;
        }
        let first = paddr >> PAGE_SHIFT;
        let last = (paddr + len.saturating_sub(1)) >> PAGE_SHIFT;
        if (first..=last).any(|p| self.table_pages.contains(&p)) {
            self.tlb.flush_all();
            self.table_pages.clear();
        }
    }

    fn access(&mut self, linear: u64, mut acc: Access) -> Result<u64, Exception> {
        acc.user = acc.user && self.cfg.user;
        self.check_canonical(linear)?;
        let linear = self.mask_linear(linear);
        self.translate(linear, acc)
    }

    fn read_n(&mut self, linear: u64, buf: &mut [u8], acc: Access) -> Result<(), Exception> {
        let len = buf.len() as u64;
        if len == 0 {
            return Ok(());
        }
        if (self.mask_linear(linear) & PAGE_MASK) + len <= ember_mmu::PAGE_SIZE {
            let paddr = self.access(linear, acc)?;
            for (i, b) in buf.iter_mut().enumerate() {
                *b = self.phys.read_u8(paddr + i as u64);
            }
        } else {
            for (i, b) in buf.iter_mut().enumerate() {
                let paddr = self.access(linear.wrapping_add(i as u64), acc)?;
                *b = self.phys.read_u8(paddr);
            }
        }
        Ok(())
    }

    fn write_n(&mut self, linear: u64, bytes: &[u8], acc: Access) -> Result<(), Exception> {
        let len = bytes.len() as u64;
        if len == 0 {
            return Ok(());
        }
        if (self.mask_linear(linear) & PAGE_MASK) + len <= ember_mmu::PAGE_SIZE {
            let paddr = self.access(linear, acc)?;
            for (i, b) in bytes.iter().enumerate() {
                self.phys.write_u8(paddr + i as u64, *b);
            }
            self.after_write(paddr, len);
        } else {
            for (i, b) in bytes.iter().enumerate() {
                let paddr = self.access(linear.wrapping_add(i as u64), acc)?;
                self.phys.write_u8(paddr, *b);
                self.after_write(paddr, 1);
            }
        }
        Ok(())
    }
}

/// Records which physical pages served as page-table frames.
struct TableRecorder<'a, M: MemoryBus> {
    bus: &'a mut M,
    touched: &'a mut HashSet<u64>,
}

impl<'a, M: MemoryBus> MemoryBus for TableRecorder<'a, M> {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.touched.insert(paddr >> PAGE_SHIFT);
        self.bus.read_u8(paddr)
    }
    fn read_u16(&mut self, paddr: u64) -> u16 {
        self.touched.insert(paddr >> PAGE_SHIFT);
        self.bus.read_u16(paddr)
    }
    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.touched.insert(paddr >> PAGE_SHIFT);
        self.bus.read_u32(paddr)
    }
    fn read_u64(&mut self, paddr: u64) -> u64 {
        self.touched.insert(paddr >> PAGE_SHIFT);
        self.bus.read_u64(paddr)
    }
    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.bus.write_u8(paddr, value);
    }
    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.bus.write_u16(paddr, value);
    }
    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.bus.write_u32(paddr, value);
    }
    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.bus.write_u64(paddr, value);
    }
}

macro_rules! read_via_bytes {
    ($name:ident, $sys:ident, $ty:ty, $len:expr) => {
        fn $name(&mut self, linear: u64) -> Result<$ty, Exception> {
            let mut buf = [0u8; $len];
            self.read_n(linear, &mut buf, Access::read(true))?;
            Ok(<$ty>::from_le_bytes(buf))
        }

        fn $sys(&mut self, linear: u64) -> Result<$ty, Exception> {
            let mut buf = [0u8; $len];
            self.read_n(linear, &mut buf, Access::read(false))?;
            Ok(<$ty>::from_le_bytes(buf))
        }
    };
}

impl<M: MemoryBus, I: IoBus> CpuBus for PagingBus<M, I> {
    fn sync(&mut self, state: &CpuState) {
        if state.tlb_generation != self.seen_generation {
            self.tlb.flush_all();
            self.table_pages.clear();
            self.seen_generation = state.tlb_generation;
        }
        self.cfg = BusConfig {
            paging: state.control.cr0 & CR0_PG != 0,
            mode: if state.long_mode_active() {
                PagingMode::Long
            } else if state.control.cr4 & CR4_PAE != 0 {
                PagingMode::Pae
            } else {
                PagingMode::Legacy {
                    pse: state.control.cr4 & CR4_PSE != 0,
                }
            },
            cr3: state.control.cr3,
            write_protect: state.control.cr0 & CR0_WP != 0,
            user: state.is_user_mode(),
            long: state.mode() == CpuMode::Long,
        };
    }

    read_via_bytes!(read_u8, read_system_u8, u8, 1);
    read_via_bytes!(read_u16, read_system_u16, u16, 2);
    read_via_bytes!(read_u32, read_system_u32, u32, 4);
    read_via_bytes!(read_u64, read_system_u64, u64, 8);

    fn write_u8(&mut self, linear: u64, value: u8) -> Result<(), Exception> {
        self.write_n(linear, &value.to_le_bytes(), Access::write(true))
    }

    fn write_u16(&mut self, linear: u64, value: u16) -> Result<(), Exception> {
        self.write_n(linear, &value.to_le_bytes(), Access::write(true))
    }

    fn write_u32(&mut self, linear: u64, value: u32) -> Result<(), Exception> {
        self.write_n(linear, &value.to_le_bytes(), Access::write(true))
    }

    fn write_u64(&mut self, linear: u64, value: u64) -> Result<(), Exception> {
        self.write_n(linear, &value.to_le_bytes(), Access::write(true))
    }

    fn fetch_u8(&mut self, linear: u64) -> Result<u8, Exception> {
        let mut buf = [0u8; 1];
        self.read_n(linear, &mut buf, Access::fetch(true))?;
        Ok(buf[0])
    }

    fn write_system_u8(&mut self, linear: u64, value: u8) -> Result<(), Exception> {
        self.write_n(linear, &value.to_le_bytes(), Access::write(false))
    }

    fn write_system_u16(&mut self, linear: u64, value: u16) -> Result<(), Exception> {
        self.write_n(linear, &value.to_le_bytes(), Access::write(false))
    }

    fn write_system_u32(&mut self, linear: u64, value: u32) -> Result<(), Exception> {
        self.write_n(linear, &value.to_le_bytes(), Access::write(false))
    }

    fn read_bytes(&mut self, linear: u64, buf: &mut [u8]) -> Result<(), Exception> {
        self.read_n(linear, buf, Access::read(true))
    }

    fn write_bytes(&mut self, linear: u64, bytes: &[u8]) -> Result<(), Exception> {
        self.write_n(linear, bytes, Access::write(true))
    }

    fn invlpg(&mut self, linear: u64) {
        self.tlb.flush_page(linear);
    }

    fn flush_tlb(&mut self) {
        self.tlb.flush_all();
        self.table_pages.clear();
    }

    fn io_read(&mut self, port: u16, size: u8) -> u32 {
        self.io.io_read(port, size)
    }

    fn io_write(&mut self, port: u16, size: u8, value: u32) {
        self.io.io_write(port, size, value)
    }
}
