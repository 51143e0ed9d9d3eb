//! String instructions (MOVS/CMPS/STOS/LODS/SCAS/INS/OUTS) with their REP
//! forms.
//!
//! The whole repeat runs inside one `step` call. Register updates are
//! committed per element and the instruction pointer only advances on
//! completion, so a page fault mid-string restarts exactly where it
//! stopped, as on hardware.

use crate::decode::{mask_addr, Rep};
use crate::exception::Exception;
use crate::flags::RFlags;
use crate::mem::CpuBus;
use crate::segments;
use crate::state::{SegReg, RDI, RSI};

use super::{alu, Ctx};

fn step_delta(df: bool, size: u64) -> u64 {
    if df {
        size.wrapping_neg()
    } else {
        size
    }
}

impl<'a, B: CpuBus> Ctx<'a, B> {
    fn advance_index(&mut self, reg: usize, size: u64) {
        let delta = step_delta(self.state.flag(RFlags::DF), size);
        let cur = self.state.read_gpr64(reg);
        let new = mask_addr(cur.wrapping_add(delta), self.addr_bits);
        match self.addr_bits {
            16 => self.state.write_gpr16(reg, new as u16),
            32 => self.state.write_gpr32(reg, new as u32),
            _ => self.state.write_gpr64(reg, new),
        }
    }

    fn src_linear(&mut self, size: u64) -> Result<u64, Exception> {
        let offset = mask_addr(self.state.read_gpr64(RSI), self.addr_bits);
        segments::linear_for(self.state, self.data_seg(), offset, size as u32, false)
    }

    fn dst_linear(&mut self, size: u64, write: bool) -> Result<u64, Exception> {
        let offset = mask_addr(self.state.read_gpr64(RDI), self.addr_bits);
        segments::linear_for(self.state, SegReg::Es, offset, size as u32, write)
    }

    /// Drive one string opcode, with or without a REP prefix.
    pub(super) fn string_op(&mut self, opcode: u8, bits: u8) -> Result<(), Exception> {
        let size = bits as u64 / 8;
        let rep = self.prefixes.rep;

        loop {
            if rep.is_some() && self.count_reg() == 0 {
                break;
            }

            let mut compare_zf = None;

            match opcode {
                0xA4 | 0xA5 => {
                    // MOVS
                    let src = self.src_linear(size)?;
                    let value = self.read_mem(src, bits)?;
                    let dst = self.dst_linear(size, true)?;
                    self.write_mem(dst, bits, value)?;
                    self.advance_index(RSI, size);
                    self.advance_index(RDI, size);
                }
                0xA6 | 0xA7 => {
                    // CMPS: src - dst, flags only.
                    let src = self.src_linear(size)?;
                    let a = self.read_mem(src, bits)?;
                    let dst = self.dst_linear(size, false)?;
                    let b = self.read_mem(dst, bits)?;
                    alu::alu_op(self.state, 7, a, b, bits);
                    self.advance_index(RSI, size);
                    self.advance_index(RDI, size);
                    compare_zf = Some(self.state.flag(RFlags::ZF));
                }
                0xAA | 0xAB => {
                    // STOS
                    let value = self.state.read_gpr(0, bits.max(16)) & crate::flags::mask_width(u64::MAX, bits);
                    let dst = self.dst_linear(size, true)?;
                    self.write_mem(dst, bits, value)?;
                    self.advance_index(RDI, size);
                }
                0xAC | 0xAD => {
                    // LODS
                    let src = self.src_linear(size)?;
                    let value = self.read_mem(src, bits)?;
                    if bits == 8 {
                        self.state.write_gpr8(0, false, value as u8);
                    } else {
                        self.state.write_gpr(0, bits, value);
                    }
                    self.advance_index(RSI, size);
                }
                0xAE | 0xAF => {
                    // SCAS: rAX - [ES:rDI].
                    let a = self.state.read_gpr(0, bits.max(16)) & crate::flags::mask_width(u64::MAX, bits);
                    let dst = self.dst_linear(size, false)?;
                    let b = self.read_mem(dst, bits)?;
                    alu::alu_op(self.state, 7, a, b, bits);
                    self.advance_index(RDI, size);
                    compare_zf = Some(self.state.flag(RFlags::ZF));
                }
                0x6C | 0x6D => {
                    // INS
                    let port = self.state.read_gpr16(2);
                    let value = self.bus.io_read(port, (bits / 8) as u8) as u64;
                    let dst = self.dst_linear(size, true)?;
                    self.write_mem(dst, bits, value)?;
                    self.advance_index(RDI, size);
                }
                0x6E | 0x6F => {
                    // OUTS
                    let src = self.src_linear(size)?;
                    let value = self.read_mem(src, bits)?;
                    let port = self.state.read_gpr16(2);
                    self.bus.io_write(port, (bits / 8) as u8, value as u32);
                    self.advance_index(RSI, size);
                }
                _ => unreachable!("not a string opcode: {opcode:#x}"),
            }

            match rep {
                None => break,
                Some(kind) => {
                    let count = self.count_reg().wrapping_sub(1);
                    self.set_count_reg(count);
                    if let Some(zf) = compare_zf {
                        let cont = match kind {
                            Rep::Repe => zf,
                            Rep::Repne => !zf,
                        };
                        if !cont {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::tier0::exec;
    use crate::mem::PagingBus;
    use crate::state::{CpuMode, CpuState};
    use ember_mmu::MemoryBus as PhysBus;

    struct Ram(Vec<u8>);

    impl PhysBus for Ram {
        fn read_u8(&mut self, p: u64) -> u8 {
            self.0.get(p as usize).copied().unwrap_or(0)
        }
        fn read_u16(&mut self, p: u64) -> u16 {
            self.read_u8(p) as u16 | (self.read_u8(p + 1) as u16) << 8
        }
        fn read_u32(&mut self, p: u64) -> u32 {
            self.read_u16(p) as u32 | (self.read_u16(p + 2) as u32) << 16
        }
        fn read_u64(&mut self, p: u64) -> u64 {
            self.read_u32(p) as u64 | (self.read_u32(p + 4) as u64) << 32
        }
        fn write_u8(&mut self, p: u64, v: u8) {
            if let Some(b) = self.0.get_mut(p as usize) {
                *b = v;
            }
        }
        fn write_u16(&mut self, p: u64, v: u16) {
            self.write_u8(p, v as u8);
            self.write_u8(p + 1, (v >> 8) as u8);
        }
        fn write_u32(&mut self, p: u64, v: u32) {
            self.write_u16(p, v as u16);
            self.write_u16(p + 2, (v >> 16) as u16);
        }
        fn write_u64(&mut self, p: u64, v: u64) {
            self.write_u32(p, v as u32);
            self.write_u32(p + 4, (v >> 32) as u32);
        }
    }

    fn real_cpu_with(code: &[u8]) -> (CpuState, PagingBus<Ram>) {
        let mut ram = Ram(vec![0; 0x20000]);
        for (i, b) in code.iter().enumerate() {
            ram.write_u8(0x7C00 + i as u64, *b);
        }
        let mut state = CpuState::new(CpuMode::Real);
        state.load_segment_real(SegReg::Cs, 0);
        state.set_rip(0x7C00);
        (state, PagingBus::new(ram))
    }

    #[test]
    fn rep_movsb_copies_and_decrements_cx() {
        // rep movsb
        let (mut state, mut bus) = real_cpu_with(&[0xF3, 0xA4]);
        state.load_segment_real(SegReg::Ds, 0);
        state.load_segment_real(SegReg::Es, 0);
        state.write_gpr16(RSI, 0x9000);
        state.write_gpr16(RDI, 0xA000);
        state.write_gpr16(1, 4); // CX
        for (i, b) in b"EMBR".iter().enumerate() {
            bus.physical_mut().write_u8(0x9000 + i as u64, *b);
        }

        exec::step(&mut state, &mut bus).unwrap();

        assert_eq!(state.read_gpr16(1), 0);
        assert_eq!(state.read_gpr16(RSI), 0x9004);
        assert_eq!(state.read_gpr16(RDI), 0xA004);
        for (i, b) in b"EMBR".iter().enumerate() {
            assert_eq!(bus.physical_mut().read_u8(0xA000 + i as u64), *b);
        }
    }

    #[test]
    fn repne_scasb_finds_a_byte() {
        // repne scasb
        let (mut state, mut bus) = real_cpu_with(&[0xF2, 0xAE]);
        state.load_segment_real(SegReg::Es, 0);
        state.write_gpr16(RDI, 0x9000);
        state.write_gpr16(1, 8);
        state.write_gpr8(0, false, b'X');
        bus.physical_mut().write_u8(0x9003, b'X');

        exec::step(&mut state, &mut bus).unwrap();

        // Found at offset 3: DI one past the match, CX = 8 - 4.
        assert_eq!(state.read_gpr16(RDI), 0x9004);
        assert_eq!(state.read_gpr16(1), 4);
        assert!(state.flag(RFlags::ZF));
    }

    #[test]
    fn std_reverses_direction() {
        // std; movsb
        let (mut state, mut bus) = real_cpu_with(&[0xFD, 0xA4]);
        state.load_segment_real(SegReg::Ds, 0);
        state.load_segment_real(SegReg::Es, 0);
        state.write_gpr16(RSI, 0x9000);
        state.write_gpr16(RDI, 0xA000);
        bus.physical_mut().write_u8(0x9000, 0x5A);

        exec::step(&mut state, &mut bus).unwrap(); // STD
        exec::step(&mut state, &mut bus).unwrap(); // MOVSB

        assert_eq!(bus.physical_mut().read_u8(0xA000), 0x5A);
        assert_eq!(state.read_gpr16(RSI), 0x8FFF);
        assert_eq!(state.read_gpr16(RDI), 0x9FFF);
    }
}
