#![allow(dead_code)]

use ember_cpu_core::state::{CpuState, SegReg};
use ember_cpu_core::{CpuMode, PagingBus};
use ember_mmu::MemoryBus;

#[derive(Clone, Debug)]
pub struct TestMemory {
    pub data: Vec<u8>,
}

impl TestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn load(&mut self, paddr: u64, bytes: &[u8]) {
        let start = paddr as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl MemoryBus for TestMemory {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.data.get(paddr as usize).copied().unwrap_or(0)
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        self.read_u8(paddr) as u16 | (self.read_u8(paddr + 1) as u16) << 8
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.read_u16(paddr) as u32 | (self.read_u16(paddr + 2) as u32) << 16
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        self.read_u32(paddr) as u64 | (self.read_u32(paddr + 4) as u64) << 32
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        if let Some(b) = self.data.get_mut(paddr as usize) {
            *b = value;
        }
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.write_u8(paddr, value as u8);
        self.write_u8(paddr + 1, (value >> 8) as u8);
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_u16(paddr, value as u16);
        self.write_u16(paddr + 2, (value >> 16) as u16);
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_u32(paddr, value as u32);
        self.write_u32(paddr + 4, (value >> 32) as u32);
    }
}

/// Real-mode CPU with `code` placed at 0000:7C00.
pub fn boot_real(code: &[u8]) -> (CpuState, PagingBus<TestMemory>) {
    let mut mem = TestMemory::new(0x20000);
    mem.load(0x7C00, code);

    let mut state = CpuState::new(CpuMode::Real);
    state.load_segment_real(SegReg::Cs, 0);
    state.load_segment_real(SegReg::Ds, 0);
    state.load_segment_real(SegReg::Es, 0);
    state.load_segment_real(SegReg::Ss, 0);
    state.set_rip(0x7C00);
    state.set_rsp(0x7C00);

    (state, PagingBus::new(mem))
}
