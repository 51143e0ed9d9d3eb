//! Tier-0 interpreter: one architectural instruction per [`exec::step`]
//! call.

pub mod exec;

mod alu;
mod control;
mod string;

use crate::decode::{self, MemRef, ModRm, Prefixes};
use crate::exception::Exception;
use crate::flags::sign_extend;
use crate::mem::CpuBus;
use crate::segments;
use crate::state::{CpuState, SegReg};

pub use control::{deliver_interrupt, InterruptKind};

/// Per-instruction execution context: the decoder cursor plus operand
/// plumbing shared by every handler.
pub(crate) struct Ctx<'a, B: CpuBus> {
    pub state: &'a mut CpuState,
    pub bus: &'a mut B,
    pub prefixes: Prefixes,
    /// Fetch cursor: the IP of the next byte to pull. The architectural
    /// RIP stays at the instruction start until the handler commits.
    pub ip: u64,
    ip_mask: u64,
    pub code_bits: u8,
    pub op_bits: u8,
    pub addr_bits: u8,
    modrm: Option<ModRm>,
    mem: Option<MemRef>,
}

impl<'a, B: CpuBus> Ctx<'a, B> {
    pub fn new(state: &'a mut CpuState, bus: &'a mut B) -> Self {
        let code_bits = state.code_bits();
        let ip_mask = match code_bits {
            16 => 0xFFFF,
            32 => 0xFFFF_FFFF,
            _ => u64::MAX,
        };
        let start_ip = state.rip() & ip_mask;
        Self {
            state,
            bus,
            prefixes: Prefixes::default(),
            ip: start_ip,
            ip_mask,
            code_bits,
            op_bits: 0,
            addr_bits: 0,
            modrm: None,
            mem: None,
        }
    }

    pub fn in_long64(&self) -> bool {
        self.code_bits == 64
    }

    // --- code fetch -------------------------------------------------------

    pub fn fetch_u8(&mut self) -> Result<u8, Exception> {
        let linear = segments::linear_for(self.state, SegReg::Cs, self.ip, 1, false)?;
        let byte = self.bus.fetch_u8(linear)?;
        self.ip = self.ip.wrapping_add(1) & self.ip_mask;
        Ok(byte)
    }

    pub fn fetch_u16(&mut self) -> Result<u16, Exception> {
        let lo = self.fetch_u8()? as u16;
        let hi = self.fetch_u8()? as u16;
        Ok(lo | hi << 8)
    }

    pub fn fetch_u32(&mut self) -> Result<u32, Exception> {
        let lo = self.fetch_u16()? as u32;
        let hi = self.fetch_u16()? as u32;
        Ok(lo | hi << 16)
    }

    pub fn fetch_u64(&mut self) -> Result<u64, Exception> {
        let lo = self.fetch_u32()? as u64;
        let hi = self.fetch_u32()? as u64;
        Ok(lo | hi << 32)
    }

    /// Immediate of the operand size (imm16/imm32; 64-bit operands take a
    /// sign-extended imm32 except MOV r64, imm64).
    pub fn fetch_imm(&mut self) -> Result<u64, Exception> {
        Ok(match self.op_bits {
            16 => self.fetch_u16()? as u64,
            _ => sign_extend(self.fetch_u32()? as u64, 32),
        })
    }

    pub fn fetch_imm8s(&mut self) -> Result<u64, Exception> {
        Ok(sign_extend(self.fetch_u8()? as u64, 8))
    }

    // --- ModR/M and operands ----------------------------------------------

    pub fn modrm(&mut self) -> Result<ModRm, Exception> {
        if let Some(m) = self.modrm {
            return Ok(m);
        }
        let m = ModRm {
            raw: self.fetch_u8()?,
        };
        self.modrm = Some(m);
        if !m.is_register() {
            let gpr = self.state.gpr;
            let prefixes = self.prefixes;
            let addr_bits = self.addr_bits;
            let mem = decode::decode_ea(&gpr, &prefixes, m, addr_bits, || {
                let linear = segments::linear_for(self.state, SegReg::Cs, self.ip, 1, false)?;
                let byte = self.bus.fetch_u8(linear)?;
                self.ip = self.ip.wrapping_add(1) & self.ip_mask;
                Ok(byte)
            })?;
            self.mem = Some(mem);
        }
        Ok(m)
    }

    /// `reg` field of ModR/M with REX.R applied.
    pub fn reg_index(&self) -> usize {
        self.modrm.expect("modrm pulled").reg() as usize | self.prefixes.rex_r()
    }

    /// `rm` field as a register index with REX.B applied.
    pub fn rm_index(&self) -> usize {
        self.modrm.expect("modrm pulled").rm() as usize | self.prefixes.rex_b()
    }

    pub fn rm_is_register(&self) -> bool {
        self.modrm.expect("modrm pulled").is_register()
    }

    /// Linear address of the decoded memory operand.
    pub fn mem_linear(&mut self, len: u32, write: bool) -> Result<u64, Exception> {
        let mem = self.mem.expect("memory operand");
        let offset = mem.offset(self.ip, self.addr_bits);
        segments::linear_for(self.state, mem.seg(), offset, len, write)
    }

    /// Effective offset (not translated through the segment); LEA.
    pub fn mem_offset(&self) -> u64 {
        let mem = self.mem.expect("memory operand");
        mem.offset(self.ip, self.addr_bits)
    }

    pub fn read_mem(&mut self, linear: u64, bits: u8) -> Result<u64, Exception> {
        Ok(match bits {
            8 => self.bus.read_u8(linear)? as u64,
            16 => self.bus.read_u16(linear)? as u64,
            32 => self.bus.read_u32(linear)? as u64,
            64 => self.bus.read_u64(linear)?,
            _ => unreachable!(),
        })
    }

    pub fn write_mem(&mut self, linear: u64, bits: u8, value: u64) -> Result<(), Exception> {
        match bits {
            8 => self.bus.write_u8(linear, value as u8),
            16 => self.bus.write_u16(linear, value as u16),
            32 => self.bus.write_u32(linear, value as u32),
            64 => self.bus.write_u64(linear, value),
            _ => unreachable!(),
        }
    }

    /// Read the r/m operand at `bits` width.
    pub fn rm_read(&mut self, bits: u8) -> Result<u64, Exception> {
        if self.rm_is_register() {
            let index = self.rm_index();
            Ok(if bits == 8 {
                self.state.read_gpr8(index, self.prefixes.rex.is_some()) as u64
            } else {
                self.state.read_gpr(index, bits)
            })
        } else {
            let linear = self.mem_linear(bits as u32 / 8, false)?;
            self.read_mem(linear, bits)
        }
    }

    /// Write the r/m operand at `bits` width.
    pub fn rm_write(&mut self, bits: u8, value: u64) -> Result<(), Exception> {
        if self.rm_is_register() {
            let index = self.rm_index();
            if bits == 8 {
                self.state
                    .write_gpr8(index, self.prefixes.rex.is_some(), value as u8);
            } else {
                self.state.write_gpr(index, bits, value);
            }
            Ok(())
        } else {
            let linear = self.mem_linear(bits as u32 / 8, true)?;
            self.write_mem(linear, bits, value)
        }
    }

    pub fn reg_read(&mut self, bits: u8) -> u64 {
        let index = self.reg_index();
        if bits == 8 {
            self.state.read_gpr8(index, self.prefixes.rex.is_some()) as u64
        } else {
            self.state.read_gpr(index, bits)
        }
    }

    pub fn reg_write(&mut self, bits: u8, value: u64) {
        let index = self.reg_index();
        if bits == 8 {
            self.state
                .write_gpr8(index, self.prefixes.rex.is_some(), value as u8);
        } else {
            self.state.write_gpr(index, bits, value);
        }
    }

    // --- stack ------------------------------------------------------------

    fn sp_mask(&self) -> u64 {
        match self.state.stack_bits() {
            16 => 0xFFFF,
            32 => 0xFFFF_FFFF,
            _ => u64::MAX,
        }
    }

    pub fn push(&mut self, bits: u8, value: u64) -> Result<(), Exception> {
        let size = bits as u64 / 8;
        let mask = self.sp_mask();
        let sp = self.state.rsp().wrapping_sub(size) & mask;
        let linear = segments::linear_for(self.state, SegReg::Ss, sp, size as u32, true)?;
        self.write_mem(linear, bits, value)?;
        let keep = self.state.rsp() & !mask;
        self.state.set_rsp(keep | sp);
        Ok(())
    }

    pub fn pop(&mut self, bits: u8) -> Result<u64, Exception> {
        let size = bits as u64 / 8;
        let mask = self.sp_mask();
        let sp = self.state.rsp() & mask;
        let linear = segments::linear_for(self.state, SegReg::Ss, sp, size as u32, false)?;
        let value = self.read_mem(linear, bits)?;
        let keep = self.state.rsp() & !mask;
        self.state.set_rsp(keep | (sp.wrapping_add(size) & mask));
        Ok(value)
    }

    /// Width pushes default to in this sub-mode: 64-bit code promotes
    /// 32-bit push/pop/call to 64.
    pub fn stack_op_bits(&self) -> u8 {
        if self.in_long64() {
            if self.prefixes.operand_size {
                16
            } else {
                64
            }
        } else {
            self.op_bits
        }
    }

    // --- control flow ------------------------------------------------------

    /// Commit the fall-through IP (cursor position) to the state.
    pub fn commit_ip(&mut self) {
        self.state.set_rip(self.ip & self.ip_mask);
    }

    /// Transfer to `target` within CS, masking to the code width.
    pub fn jump_near(&mut self, target: u64) {
        self.state.set_rip(target & self.ip_mask);
    }

    /// Condition-code predicate for Jcc/SETcc/CMOVcc.
    pub fn cond(&self, cc: u8) -> bool {
        use crate::flags::RFlags;
        let f = |fl: RFlags| self.state.flag(fl);
        let base = match cc >> 1 {
            0 => f(RFlags::OF),
            1 => f(RFlags::CF),
            2 => f(RFlags::ZF),
            3 => f(RFlags::CF) || f(RFlags::ZF),
            4 => f(RFlags::SF),
            5 => f(RFlags::PF),
            6 => f(RFlags::SF) != f(RFlags::OF),
            _ => f(RFlags::ZF) || (f(RFlags::SF) != f(RFlags::OF)),
        };
        base != (cc & 1 != 0)
    }

    /// rCX masked to the address size, for LOOP/JCXZ/REP counters.
    pub fn count_reg(&self) -> u64 {
        decode::mask_addr(self.state.read_gpr64(1), self.addr_bits)
    }

    pub fn set_count_reg(&mut self, value: u64) {
        match self.addr_bits {
            16 => self.state.write_gpr16(1, value as u16),
            32 => self.state.write_gpr32(1, value as u32),
            _ => self.state.write_gpr64(1, value),
        }
    }

    /// Default data segment for string/XLAT style accesses, honouring an
    /// override.
    pub fn data_seg(&self) -> SegReg {
        self.prefixes.seg.unwrap_or(SegReg::Ds)
    }
}
