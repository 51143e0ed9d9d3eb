//! Fetch/decode/dispatch: one architectural instruction per [`step`].

use crate::decode;
use crate::exception::Exception;
use crate::flags::{mask_width, sign_extend, RFlags};
use crate::mem::CpuBus;
use crate::segments::{self, SYS_LDT, SYS_TSS32_AVAIL};
use crate::state::{CpuMode, CpuState, SegReg, CR0_EM, CR0_TS, RAX, RBX, RCX, RDX, RSP};

use super::control::{self, InterruptKind};
use super::{alu, Ctx};

/// Execute one instruction at CS:IP.
///
/// On `Err` the instruction pointer still names the faulting instruction;
/// the caller owns delivery (and the #DF/triple-fault promotion).
pub fn step<B: CpuBus>(state: &mut CpuState, bus: &mut B) -> Result<(), Exception> {
    bus.sync(state);
    if state.halted {
        return Ok(());
    }
    state.tsc = state.tsc.wrapping_add(1);

    let result = {
        let mut ctx = Ctx::new(state, bus);
        ctx.run()
    };
    if let Err(err) = &result {
        if let Some(addr) = err.page_fault_addr() {
            state.control.cr2 = addr;
        }
    }
    result
}

impl<'a, B: CpuBus> Ctx<'a, B> {
    fn run(&mut self) -> Result<(), Exception> {
        let long64 = self.in_long64();
        let (prefixes, opcode) = decode::scan_prefixes(|| self.fetch_u8(), long64)?;
        self.prefixes = prefixes;
        self.op_bits = prefixes.op_bits(self.code_bits);
        self.addr_bits = prefixes.addr_bits(self.code_bits);

        let branched = if opcode == 0x0F {
            let op2 = self.fetch_u8()?;
            self.exec_0f(op2)?
        } else {
            self.exec_primary(opcode)?
        };

        if !branched {
            self.commit_ip();
        }
        Ok(())
    }

    /// Primary-map dispatch. Returns `true` when the handler set the
    /// instruction pointer itself.
    fn exec_primary(&mut self, opcode: u8) -> Result<bool, Exception> {
        match opcode {
            // ALU block: 00-05 ADD, 08-0D OR, 10-15 ADC, 18-1D SBB,
            // 20-25 AND, 28-2D SUB, 30-35 XOR, 38-3D CMP.
            0x00..=0x05
            | 0x08..=0x0D
            | 0x10..=0x15
            | 0x18..=0x1D
            | 0x20..=0x25
            | 0x28..=0x2D
            | 0x30..=0x35
            | 0x38..=0x3D => {
                self.alu_block(opcode)?;
                Ok(false)
            }

            0x06 => self.push_seg(SegReg::Es),
            0x07 => self.pop_seg(SegReg::Es),
            0x0E => self.push_seg(SegReg::Cs),
            0x16 => self.push_seg(SegReg::Ss),
            0x17 => self.pop_seg(SegReg::Ss),
            0x1E => self.push_seg(SegReg::Ds),
            0x1F => self.pop_seg(SegReg::Ds),

            0x27 => self.daa_das(false),
            0x2F => self.daa_das(true),
            0x37 => self.aaa_aas(false),
            0x3F => self.aaa_aas(true),

            // INC/DEC r16/32 (REX re-purposes these in 64-bit code, so the
            // prefix scanner never lets them through there).
            0x40..=0x47 => {
                let bits = self.op_bits;
                let reg = (opcode & 7) as usize;
                let a = self.state.read_gpr(reg, bits);
                let v = alu::inc(self.state, a, bits);
                self.state.write_gpr(reg, bits, v);
                Ok(false)
            }
            0x48..=0x4F => {
                let bits = self.op_bits;
                let reg = (opcode & 7) as usize;
                let a = self.state.read_gpr(reg, bits);
                let v = alu::dec(self.state, a, bits);
                self.state.write_gpr(reg, bits, v);
                Ok(false)
            }

            0x50..=0x57 => {
                let bits = self.stack_op_bits();
                let reg = (opcode & 7) as usize | self.prefixes.rex_b();
                let v = self.state.read_gpr(reg, bits);
                self.push(bits, v)?;
                Ok(false)
            }
            0x58..=0x5F => {
                let bits = self.stack_op_bits();
                let reg = (opcode & 7) as usize | self.prefixes.rex_b();
                let v = self.pop(bits)?;
                self.state.write_gpr(reg, bits, v);
                Ok(false)
            }

            0x60 => self.pusha(),
            0x61 => self.popa(),

            0x63 => {
                if self.in_long64() {
                    // MOVSXD r64, r/m32.
                    self.modrm()?;
                    let v = self.rm_read(32)?;
                    let bits = self.op_bits;
                    self.reg_write(bits.max(32), sign_extend(v, 32));
                    Ok(false)
                } else {
                    self.arpl()
                }
            }

            0x68 => {
                let v = self.fetch_imm()?;
                self.push(self.stack_op_bits(), v)?;
                Ok(false)
            }
            0x69 => {
                // IMUL r, r/m, imm.
                let bits = self.op_bits;
                self.modrm()?;
                let b = self.fetch_imm()?;
                let a = self.rm_read(bits)?;
                let (lo, _, ovf) = alu::imul_wide(a, b, bits);
                self.state.set_flag(RFlags::CF, ovf);
                self.state.set_flag(RFlags::OF, ovf);
                self.reg_write(bits, lo);
                Ok(false)
            }
            0x6A => {
                let v = self.fetch_imm8s()?;
                self.push(self.stack_op_bits(), v)?;
                Ok(false)
            }
            0x6B => {
                let bits = self.op_bits;
                self.modrm()?;
                let b = self.fetch_imm8s()?;
                let a = self.rm_read(bits)?;
                let (lo, _, ovf) = alu::imul_wide(a, b, bits);
                self.state.set_flag(RFlags::CF, ovf);
                self.state.set_flag(RFlags::OF, ovf);
                self.reg_write(bits, lo);
                Ok(false)
            }

            0x6C | 0x6E => {
                self.check_io_permission()?;
                self.string_op(opcode, 8)?;
                Ok(false)
            }
            0x6D | 0x6F => {
                self.check_io_permission()?;
                let bits = self.op_bits.min(32);
                self.string_op(opcode, bits)?;
                Ok(false)
            }

            // Jcc rel8.
            0x70..=0x7F => {
                let disp = self.fetch_imm8s()?;
                if self.cond(opcode & 0xF) {
                    let target = self.ip.wrapping_add(disp);
                    self.jump_near(target);
                    return Ok(true);
                }
                Ok(false)
            }

            // Group 1: ALU with immediate.
            0x80 | 0x82 => self.group1(8, false),
            0x81 => self.group1(self.op_bits, false),
            0x83 => self.group1(self.op_bits, true),

            0x84 => {
                self.modrm()?;
                let a = self.rm_read(8)?;
                let b = self.reg_read(8);
                alu::alu_op(self.state, 4, a, b, 8);
                // TEST: AND flags without writeback.
                Ok(false)
            }
            0x85 => {
                let bits = self.op_bits;
                self.modrm()?;
                let a = self.rm_read(bits)?;
                let b = self.reg_read(bits);
                alu::alu_op(self.state, 4, a, b, bits);
                Ok(false)
            }

            0x86 => {
                self.modrm()?;
                let a = self.rm_read(8)?;
                let b = self.reg_read(8);
                self.rm_write(8, b)?;
                self.reg_write(8, a);
                Ok(false)
            }
            0x87 => {
                let bits = self.op_bits;
                self.modrm()?;
                let a = self.rm_read(bits)?;
                let b = self.reg_read(bits);
                self.rm_write(bits, b)?;
                self.reg_write(bits, a);
                Ok(false)
            }

            0x88 => {
                self.modrm()?;
                let v = self.reg_read(8);
                self.rm_write(8, v)?;
                Ok(false)
            }
            0x89 => {
                let bits = self.op_bits;
                self.modrm()?;
                let v = self.reg_read(bits);
                self.rm_write(bits, v)?;
                Ok(false)
            }
            0x8A => {
                self.modrm()?;
                let v = self.rm_read(8)?;
                self.reg_write(8, v);
                Ok(false)
            }
            0x8B => {
                let bits = self.op_bits;
                self.modrm()?;
                let v = self.rm_read(bits)?;
                self.reg_write(bits, v);
                Ok(false)
            }

            0x8C => {
                // MOV r/m16, Sreg.
                self.modrm()?;
                let seg = SegReg::from_index(self.modrm_reg_raw()).ok_or(Exception::InvalidOpcode)?;
                let v = self.state.segments.get(seg).selector as u64;
                // Register destinations take the operand size; memory is 16-bit.
                if self.rm_is_register() {
                    let bits = self.op_bits;
                    self.rm_write(bits, v)?;
                } else {
                    self.rm_write(16, v)?;
                }
                Ok(false)
            }
            0x8D => {
                // LEA.
                let bits = self.op_bits;
                self.modrm()?;
                if self.rm_is_register() {
                    return Err(Exception::InvalidOpcode);
                }
                let offset = self.mem_offset();
                self.reg_write(bits, offset);
                Ok(false)
            }
            0x8E => {
                // MOV Sreg, r/m16.
                self.modrm()?;
                let seg = SegReg::from_index(self.modrm_reg_raw()).ok_or(Exception::InvalidOpcode)?;
                if seg == SegReg::Cs {
                    return Err(Exception::InvalidOpcode);
                }
                let sel = self.rm_read(16)? as u16;
                segments::load_segment(self.state, self.bus, seg, sel)?;
                if seg == SegReg::Ss {
                    self.state.set_interrupt_shadow();
                }
                Ok(false)
            }
            0x8F => {
                // POP r/m.
                let bits = self.stack_op_bits();
                let v = self.pop(bits)?;
                self.modrm()?;
                self.rm_write(bits, v)?;
                Ok(false)
            }

            0x90..=0x97 => {
                // XCHG rAX, r (0x90 with no REX.B is NOP).
                let reg = (opcode & 7) as usize | self.prefixes.rex_b();
                if reg != RAX {
                    let bits = self.op_bits;
                    let a = self.state.read_gpr(RAX, bits);
                    let b = self.state.read_gpr(reg, bits);
                    self.state.write_gpr(RAX, bits, b);
                    self.state.write_gpr(reg, bits, a);
                }
                Ok(false)
            }

            0x98 => {
                // CBW/CWDE/CDQE.
                let bits = self.op_bits;
                let v = sign_extend(self.state.read_gpr(RAX, bits), bits / 2);
                self.state.write_gpr(RAX, bits, v);
                Ok(false)
            }
            0x99 => {
                // CWD/CDQ/CQO.
                let bits = self.op_bits;
                let sign = crate::flags::sign_bit(self.state.read_gpr(RAX, bits), bits);
                let v = if sign { mask_width(u64::MAX, bits) } else { 0 };
                self.state.write_gpr(RDX, bits, v);
                Ok(false)
            }

            0x9A => {
                // CALL ptr16:16/32.
                if self.in_long64() {
                    return Err(Exception::InvalidOpcode);
                }
                let offset = if self.op_bits == 16 {
                    self.fetch_u16()? as u64
                } else {
                    self.fetch_u32()? as u64
                };
                let selector = self.fetch_u16()?;
                self.far_call(selector, offset)?;
                Ok(true)
            }
            0x9B => Ok(false), // FWAIT

            0x9C => {
                // PUSHF.
                let bits = self.stack_op_bits();
                self.push(bits, self.state.rflags())?;
                Ok(false)
            }
            0x9D => {
                // POPF.
                let bits = self.stack_op_bits();
                let v = self.pop(bits)?;
                self.state.write_flags_checked(v, bits);
                Ok(false)
            }
            0x9E => {
                // SAHF.
                let ah = self.state.read_gpr8(4, false) as u64;
                let keep = self.state.rflags() & !0xFF;
                self.state.set_rflags(keep | ah);
                Ok(false)
            }
            0x9F => {
                // LAHF.
                let fl = self.state.rflags() as u8;
                self.state.write_gpr8(4, false, fl);
                Ok(false)
            }

            0xA0..=0xA3 => self.mov_moffs(opcode),

            0xA4..=0xA7 | 0xAA..=0xAF => {
                let bits = if opcode & 1 == 0 { 8 } else { self.op_bits };
                self.string_op(opcode, bits)?;
                Ok(false)
            }

            0xA8 => {
                let b = self.fetch_u8()? as u64;
                let a = self.state.read_gpr8(0, false) as u64;
                alu::alu_op(self.state, 4, a, b, 8);
                Ok(false)
            }
            0xA9 => {
                let bits = self.op_bits;
                let b = self.fetch_imm()?;
                let a = self.state.read_gpr(RAX, bits);
                alu::alu_op(self.state, 4, a, b, bits);
                Ok(false)
            }

            0xB0..=0xB7 => {
                let imm = self.fetch_u8()?;
                let reg = (opcode & 7) as usize | self.prefixes.rex_b();
                self.state.write_gpr8(reg, self.prefixes.rex.is_some(), imm);
                Ok(false)
            }
            0xB8..=0xBF => {
                let bits = self.op_bits;
                let reg = (opcode & 7) as usize | self.prefixes.rex_b();
                let imm = if bits == 64 {
                    self.fetch_u64()?
                } else {
                    self.fetch_imm()? & mask_width(u64::MAX, bits)
                };
                self.state.write_gpr(reg, bits, imm);
                Ok(false)
            }

            0xC0 => self.group2_imm(8),
            0xC1 => self.group2_imm(self.op_bits),

            0xC2 => {
                let imm = self.fetch_u16()? as u64;
                let bits = self.stack_op_bits();
                let target = self.pop(bits)?;
                self.add_rsp(imm);
                self.jump_near(target);
                Ok(true)
            }
            0xC3 => {
                let bits = self.stack_op_bits();
                let target = self.pop(bits)?;
                self.jump_near(target);
                Ok(true)
            }

            0xC4 => self.load_far_pointer(SegReg::Es),
            0xC5 => self.load_far_pointer(SegReg::Ds),

            0xC6 => {
                self.modrm()?;
                let imm = self.fetch_u8()? as u64;
                self.rm_write(8, imm)?;
                Ok(false)
            }
            0xC7 => {
                let bits = self.op_bits;
                self.modrm()?;
                let imm = self.fetch_imm()?;
                self.rm_write(bits, imm)?;
                Ok(false)
            }

            0xC8 => self.enter(),
            0xC9 => {
                // LEAVE.
                let bits = self.stack_op_bits();
                let bp = self.state.read_gpr64(5);
                self.state.set_rsp(bp);
                let v = self.pop(bits)?;
                self.state.write_gpr(5, bits, v);
                Ok(false)
            }

            0xCA => {
                let imm = self.fetch_u16()? as u64;
                self.far_ret(imm)?;
                Ok(true)
            }
            0xCB => {
                self.far_ret(0)?;
                Ok(true)
            }

            0xCC => {
                self.commit_ip();
                control::deliver_interrupt(self.state, self.bus, 3, InterruptKind::Software)?;
                Ok(true)
            }
            0xCD => {
                let vector = self.fetch_u8()?;
                self.commit_ip();
                control::deliver_interrupt(self.state, self.bus, vector, InterruptKind::Software)?;
                Ok(true)
            }
            0xCE => {
                if self.state.flag(RFlags::OF) {
                    self.commit_ip();
                    control::deliver_interrupt(self.state, self.bus, 4, InterruptKind::Software)?;
                    return Ok(true);
                }
                Ok(false)
            }
            0xCF => {
                self.iret()?;
                Ok(true)
            }

            0xD0 => self.group2_count(8, 1),
            0xD1 => self.group2_count(self.op_bits, 1),
            0xD2 => {
                let cl = self.state.read_gpr8(1, false) as u64;
                self.group2_count(8, cl)
            }
            0xD3 => {
                let cl = self.state.read_gpr8(1, false) as u64;
                self.group2_count(self.op_bits, cl)
            }

            0xD4 => self.aam(),
            0xD5 => self.aad(),

            0xD7 => {
                // XLAT: AL = [seg:rBX + AL].
                let base = decode::mask_addr(self.state.read_gpr64(RBX), self.addr_bits);
                let al = self.state.read_gpr8(0, false) as u64;
                let offset = decode::mask_addr(base.wrapping_add(al), self.addr_bits);
                let lin = segments::linear_for(self.state, self.data_seg(), offset, 1, false)?;
                let v = self.bus.read_u8(lin)?;
                self.state.write_gpr8(0, false, v);
                Ok(false)
            }

            // x87 escape range: decode the operand, do nothing (FPU is
            // stubbed), unless the FPU is masked off entirely.
            0xD8..=0xDF => {
                if self.state.control.cr0 & (CR0_EM | CR0_TS) != 0 {
                    return Err(Exception::DeviceNotAvailable);
                }
                self.modrm()?;
                Ok(false)
            }

            0xE0..=0xE2 => {
                // LOOPNE/LOOPE/LOOP.
                let disp = self.fetch_imm8s()?;
                let count = self.count_reg().wrapping_sub(1);
                self.set_count_reg(count);
                let zf = self.state.flag(RFlags::ZF);
                let taken = count != 0
                    && match opcode {
                        0xE0 => !zf,
                        0xE1 => zf,
                        _ => true,
                    };
                if taken {
                    let target = self.ip.wrapping_add(disp);
                    self.jump_near(target);
                    return Ok(true);
                }
                Ok(false)
            }
            0xE3 => {
                // JCXZ/JECXZ/JRCXZ.
                let disp = self.fetch_imm8s()?;
                if self.count_reg() == 0 {
                    let target = self.ip.wrapping_add(disp);
                    self.jump_near(target);
                    return Ok(true);
                }
                Ok(false)
            }

            0xE4 => {
                let port = self.fetch_u8()? as u16;
                self.check_io_permission()?;
                let v = self.bus.io_read(port, 1);
                self.state.write_gpr8(0, false, v as u8);
                Ok(false)
            }
            0xE5 => {
                let port = self.fetch_u8()? as u16;
                self.check_io_permission()?;
                let bits = self.op_bits.min(32);
                let v = self.bus.io_read(port, bits / 8);
                self.state.write_gpr(RAX, bits, v as u64);
                Ok(false)
            }
            0xE6 => {
                let port = self.fetch_u8()? as u16;
                self.check_io_permission()?;
                let v = self.state.read_gpr8(0, false);
                self.bus.io_write(port, 1, v as u32);
                Ok(false)
            }
            0xE7 => {
                let port = self.fetch_u8()? as u16;
                self.check_io_permission()?;
                let bits = self.op_bits.min(32);
                let v = self.state.read_gpr(RAX, bits) as u32;
                self.bus.io_write(port, bits / 8, v);
                Ok(false)
            }

            0xE8 => {
                // CALL rel16/32.
                let disp = if self.op_bits == 16 {
                    sign_extend(self.fetch_u16()? as u64, 16)
                } else {
                    sign_extend(self.fetch_u32()? as u64, 32)
                };
                let next = self.ip;
                self.push(self.stack_op_bits(), next)?;
                self.jump_near(next.wrapping_add(disp));
                Ok(true)
            }
            0xE9 => {
                let disp = if self.op_bits == 16 {
                    sign_extend(self.fetch_u16()? as u64, 16)
                } else {
                    sign_extend(self.fetch_u32()? as u64, 32)
                };
                let target = self.ip.wrapping_add(disp);
                self.jump_near(target);
                Ok(true)
            }
            0xEA => {
                // JMP ptr16:16/32.
                if self.in_long64() {
                    return Err(Exception::InvalidOpcode);
                }
                let offset = if self.op_bits == 16 {
                    self.fetch_u16()? as u64
                } else {
                    self.fetch_u32()? as u64
                };
                let selector = self.fetch_u16()?;
                self.far_jump(selector, offset)?;
                Ok(true)
            }
            0xEB => {
                let disp = self.fetch_imm8s()?;
                let target = self.ip.wrapping_add(disp);
                self.jump_near(target);
                Ok(true)
            }

            0xEC => {
                self.check_io_permission()?;
                let port = self.state.read_gpr16(RDX);
                let v = self.bus.io_read(port, 1);
                self.state.write_gpr8(0, false, v as u8);
                Ok(false)
            }
            0xED => {
                self.check_io_permission()?;
                let port = self.state.read_gpr16(RDX);
                let bits = self.op_bits.min(32);
                let v = self.bus.io_read(port, bits / 8);
                self.state.write_gpr(RAX, bits, v as u64);
                Ok(false)
            }
            0xEE => {
                self.check_io_permission()?;
                let port = self.state.read_gpr16(RDX);
                let v = self.state.read_gpr8(0, false);
                self.bus.io_write(port, 1, v as u32);
                Ok(false)
            }
            0xEF => {
                self.check_io_permission()?;
                let port = self.state.read_gpr16(RDX);
                let bits = self.op_bits.min(32);
                let v = self.state.read_gpr(RAX, bits) as u32;
                self.bus.io_write(port, bits / 8, v);
                Ok(false)
            }

            0xF4 => {
                // HLT.
                if self.state.mode() != CpuMode::Real && self.state.cpl() != 0 {
                    return Err(Exception::GP0);
                }
                self.state.halted = true;
                Ok(false)
            }
            0xF5 => {
                let cf = self.state.flag(RFlags::CF);
                self.state.set_flag(RFlags::CF, !cf);
                Ok(false)
            }

            0xF6 => self.group3(8),
            0xF7 => self.group3(self.op_bits),

            0xF8 => {
                self.state.set_flag(RFlags::CF, false);
                Ok(false)
            }
            0xF9 => {
                self.state.set_flag(RFlags::CF, true);
                Ok(false)
            }
            0xFA => {
                self.check_iopl_sensitive()?;
                self.state.set_flag(RFlags::IF, false);
                Ok(false)
            }
            0xFB => {
                self.check_iopl_sensitive()?;
                if !self.state.flag(RFlags::IF) {
                    self.state.set_flag(RFlags::IF, true);
                    self.state.set_interrupt_shadow();
                }
                Ok(false)
            }
            0xFC => {
                self.state.set_flag(RFlags::DF, false);
                Ok(false)
            }
            0xFD => {
                self.state.set_flag(RFlags::DF, true);
                Ok(false)
            }

            0xFE => {
                // Group 4: INC/DEC r/m8.
                self.modrm()?;
                let v = self.rm_read(8)?;
                let r = match self.modrm_reg_raw() {
                    0 => alu::inc(self.state, v, 8),
                    1 => alu::dec(self.state, v, 8),
                    _ => return Err(Exception::InvalidOpcode),
                };
                self.rm_write(8, r)?;
                Ok(false)
            }
            0xFF => self.group5(),

            _ => Err(Exception::InvalidOpcode),
        }
    }

    /// Two-byte (0F xx) dispatch.
    fn exec_0f(&mut self, opcode: u8) -> Result<bool, Exception> {
        match opcode {
            0x00 => self.group6(),
            0x01 => self.group7(),

            0x05 => {
                self.syscall()?;
                Ok(true)
            }
            0x06 => {
                // CLTS.
                if self.state.cpl() != 0 {
                    return Err(Exception::GP0);
                }
                self.state.control.cr0 &= !CR0_TS;
                Ok(false)
            }
            0x07 => {
                self.sysret()?;
                Ok(true)
            }

            0x08 | 0x09 => Ok(false), // INVD/WBINVD: caches are not modelled

            0x0B => Err(Exception::InvalidOpcode), // UD2

            0x20 => {
                // MOV r, CRn.
                if self.state.mode() != CpuMode::Real && self.state.cpl() != 0 {
                    return Err(Exception::GP0);
                }
                self.modrm()?;
                let cr = self.reg_index();
                let v = match cr {
                    0 => self.state.control.cr0,
                    2 => self.state.control.cr2,
                    3 => self.state.control.cr3,
                    4 => self.state.control.cr4,
                    _ => return Err(Exception::InvalidOpcode),
                };
                let bits = if self.in_long64() { 64 } else { 32 };
                let index = self.rm_index();
                self.state.write_gpr(index, bits, v);
                Ok(false)
            }
            0x22 => {
                // MOV CRn, r.
                if self.state.mode() != CpuMode::Real && self.state.cpl() != 0 {
                    return Err(Exception::GP0);
                }
                self.modrm()?;
                let cr = self.reg_index();
                let bits = if self.in_long64() { 64 } else { 32 };
                let v = self.state.read_gpr(self.rm_index(), bits);
                match cr {
                    0 => self.state.write_cr0(v),
                    2 => self.state.control.cr2 = v,
                    3 => self.state.write_cr3(v),
                    4 => self.state.write_cr4(v),
                    _ => return Err(Exception::InvalidOpcode),
                }
                self.bus.sync(self.state);
                Ok(false)
            }
            0x21 | 0x23 => {
                // MOV r, DRn / DRn, r: stored, never acted on.
                self.modrm()?;
                let dr = self.reg_index().min(7);
                let bits = if self.in_long64() { 64 } else { 32 };
                if opcode == 0x21 {
                    let v = self.state.dr[dr];
                    let index = self.rm_index();
                    self.state.write_gpr(index, bits, v);
                } else {
                    self.state.dr[dr] = self.state.read_gpr(self.rm_index(), bits);
                }
                Ok(false)
            }

            0x30 => {
                // WRMSR.
                if self.state.cpl() != 0 {
                    return Err(Exception::GP0);
                }
                let msr = self.state.read_gpr32(RCX);
                let value =
                    self.state.read_gpr32(RAX) as u64 | (self.state.read_gpr32(RDX) as u64) << 32;
                self.write_msr(msr, value);
                Ok(false)
            }
            0x31 => {
                // RDTSC.
                let tsc = self.state.tsc;
                self.state.write_gpr32(RAX, tsc as u32);
                self.state.write_gpr32(RDX, (tsc >> 32) as u32);
                Ok(false)
            }
            0x32 => {
                // RDMSR.
                if self.state.cpl() != 0 {
                    return Err(Exception::GP0);
                }
                let msr = self.state.read_gpr32(RCX);
                let v = self.read_msr(msr);
                self.state.write_gpr32(RAX, v as u32);
                self.state.write_gpr32(RDX, (v >> 32) as u32);
                Ok(false)
            }

            // CMOVcc.
            0x40..=0x4F => {
                let bits = self.op_bits;
                self.modrm()?;
                let v = self.rm_read(bits)?;
                if self.cond(opcode & 0xF) {
                    self.reg_write(bits, v);
                }
                Ok(false)
            }

            // Jcc rel16/32.
            0x80..=0x8F => {
                let disp = if self.op_bits == 16 {
                    sign_extend(self.fetch_u16()? as u64, 16)
                } else {
                    sign_extend(self.fetch_u32()? as u64, 32)
                };
                if self.cond(opcode & 0xF) {
                    let target = self.ip.wrapping_add(disp);
                    self.jump_near(target);
                    return Ok(true);
                }
                Ok(false)
            }

            // SETcc.
            0x90..=0x9F => {
                self.modrm()?;
                let v = u64::from(self.cond(opcode & 0xF));
                self.rm_write(8, v)?;
                Ok(false)
            }

            0xA0 => self.push_seg(SegReg::Fs),
            0xA1 => self.pop_seg(SegReg::Fs),
            0xA8 => self.push_seg(SegReg::Gs),
            0xA9 => self.pop_seg(SegReg::Gs),

            0xA2 => self.cpuid(),

            0xA3 => self.bt_group(4, None),
            0xAB => self.bt_group(5, None),
            0xB3 => self.bt_group(6, None),
            0xBB => self.bt_group(7, None),
            0xBA => {
                self.modrm()?;
                let op = self.modrm_reg_raw();
                if op < 4 {
                    return Err(Exception::InvalidOpcode);
                }
                let bit = self.fetch_u8()?;
                self.bt_group(op, Some(bit))
            }

            0xA4 => {
                let bits = self.op_bits;
                self.modrm()?;
                let count = self.fetch_u8()? as u64;
                let dst = self.rm_read(bits)?;
                let src = self.reg_read(bits);
                let r = alu::shld(self.state, dst, src, count, bits);
                self.rm_write(bits, r)?;
                Ok(false)
            }
            0xA5 => {
                let bits = self.op_bits;
                self.modrm()?;
                let count = self.state.read_gpr8(1, false) as u64;
                let dst = self.rm_read(bits)?;
                let src = self.reg_read(bits);
                let r = alu::shld(self.state, dst, src, count, bits);
                self.rm_write(bits, r)?;
                Ok(false)
            }
            0xAC => {
                let bits = self.op_bits;
                self.modrm()?;
                let count = self.fetch_u8()? as u64;
                let dst = self.rm_read(bits)?;
                let src = self.reg_read(bits);
                let r = alu::shrd(self.state, dst, src, count, bits);
                self.rm_write(bits, r)?;
                Ok(false)
            }
            0xAD => {
                let bits = self.op_bits;
                self.modrm()?;
                let count = self.state.read_gpr8(1, false) as u64;
                let dst = self.rm_read(bits)?;
                let src = self.reg_read(bits);
                let r = alu::shrd(self.state, dst, src, count, bits);
                self.rm_write(bits, r)?;
                Ok(false)
            }

            0xAF => {
                // IMUL r, r/m.
                let bits = self.op_bits;
                self.modrm()?;
                let a = self.reg_read(bits);
                let b = self.rm_read(bits)?;
                let (lo, _, ovf) = alu::imul_wide(a, b, bits);
                self.state.set_flag(RFlags::CF, ovf);
                self.state.set_flag(RFlags::OF, ovf);
                self.reg_write(bits, lo);
                Ok(false)
            }

            0xB0 => {
                // CMPXCHG r/m8, r8.
                self.modrm()?;
                let dst = self.rm_read(8)?;
                let acc = self.state.read_gpr8(0, false) as u64;
                alu::alu_op(self.state, 7, acc, dst, 8);
                if acc == dst {
                    let v = self.reg_read(8);
                    self.rm_write(8, v)?;
                } else {
                    self.state.write_gpr8(0, false, dst as u8);
                }
                Ok(false)
            }
            0xB1 => {
                let bits = self.op_bits;
                self.modrm()?;
                let dst = self.rm_read(bits)?;
                let acc = self.state.read_gpr(RAX, bits);
                alu::alu_op(self.state, 7, acc, dst, bits);
                if acc == dst {
                    let v = self.reg_read(bits);
                    self.rm_write(bits, v)?;
                } else {
                    self.state.write_gpr(RAX, bits, dst);
                }
                Ok(false)
            }

            0xB2 => self.load_far_pointer(SegReg::Ss),
            0xB4 => self.load_far_pointer(SegReg::Fs),
            0xB5 => self.load_far_pointer(SegReg::Gs),

            0xB6 => {
                let bits = self.op_bits;
                self.modrm()?;
                let v = self.rm_read(8)?;
                self.reg_write(bits, v & 0xFF);
                Ok(false)
            }
            0xB7 => {
                let bits = self.op_bits;
                self.modrm()?;
                let v = self.rm_read(16)?;
                self.reg_write(bits, v & 0xFFFF);
                Ok(false)
            }
            0xBE => {
                let bits = self.op_bits;
                self.modrm()?;
                let v = self.rm_read(8)?;
                self.reg_write(bits, sign_extend(v, 8));
                Ok(false)
            }
            0xBF => {
                let bits = self.op_bits;
                self.modrm()?;
                let v = self.rm_read(16)?;
                self.reg_write(bits, sign_extend(v, 16));
                Ok(false)
            }

            0xBC => {
                // BSF.
                let bits = self.op_bits;
                self.modrm()?;
                let v = self.rm_read(bits)?;
                if v == 0 {
                    self.state.set_flag(RFlags::ZF, true);
                } else {
                    self.state.set_flag(RFlags::ZF, false);
                    self.reg_write(bits, v.trailing_zeros() as u64);
                }
                Ok(false)
            }
            0xBD => {
                // BSR.
                let bits = self.op_bits;
                self.modrm()?;
                let v = self.rm_read(bits)?;
                if v == 0 {
                    self.state.set_flag(RFlags::ZF, true);
                } else {
                    self.state.set_flag(RFlags::ZF, false);
                    self.reg_write(bits, 63 - v.leading_zeros() as u64);
                }
                Ok(false)
            }

            0xC0 => {
                // XADD r/m8, r8.
                self.modrm()?;
                let dst = self.rm_read(8)?;
                let src = self.reg_read(8);
                let sum = alu::add(self.state, dst, src, 8);
                self.rm_write(8, sum)?;
                self.reg_write(8, dst);
                Ok(false)
            }
            0xC1 => {
                let bits = self.op_bits;
                self.modrm()?;
                let dst = self.rm_read(bits)?;
                let src = self.reg_read(bits);
                let sum = alu::add(self.state, dst, src, bits);
                self.rm_write(bits, sum)?;
                self.reg_write(bits, dst);
                Ok(false)
            }

            0xC8..=0xCF => {
                // BSWAP.
                let bits = if self.prefixes.rex_w() { 64 } else { 32 };
                let reg = (opcode & 7) as usize | self.prefixes.rex_b();
                let v = self.state.read_gpr(reg, bits);
                let swapped = if bits == 64 {
                    v.swap_bytes()
                } else {
                    (v as u32).swap_bytes() as u64
                };
                self.state.write_gpr(reg, bits, swapped);
                Ok(false)
            }

            0x1F => {
                // Multi-byte NOP.
                self.modrm()?;
                Ok(false)
            }

            _ => Err(Exception::InvalidOpcode),
        }
    }

    // --- helpers ------------------------------------------------------------

    fn modrm_reg_raw(&self) -> u8 {
        (self.reg_index() & 7) as u8
    }

    fn alu_block(&mut self, opcode: u8) -> Result<(), Exception> {
        let op = (opcode >> 3) & 7;
        match opcode & 7 {
            0 => {
                self.modrm()?;
                let a = self.rm_read(8)?;
                let b = self.reg_read(8);
                let (r, wb) = alu::alu_op(self.state, op, a, b, 8);
                if wb {
                    self.rm_write(8, r)?;
                }
            }
            1 => {
                let bits = self.op_bits;
                self.modrm()?;
                let a = self.rm_read(bits)?;
                let b = self.reg_read(bits);
                let (r, wb) = alu::alu_op(self.state, op, a, b, bits);
                if wb {
                    self.rm_write(bits, r)?;
                }
            }
            2 => {
                self.modrm()?;
                let a = self.reg_read(8);
                let b = self.rm_read(8)?;
                let (r, wb) = alu::alu_op(self.state, op, a, b, 8);
                if wb {
                    self.reg_write(8, r);
                }
            }
            3 => {
                let bits = self.op_bits;
                self.modrm()?;
                let a = self.reg_read(bits);
                let b = self.rm_read(bits)?;
                let (r, wb) = alu::alu_op(self.state, op, a, b, bits);
                if wb {
                    self.reg_write(bits, r);
                }
            }
            4 => {
                let b = self.fetch_u8()? as u64;
                let a = self.state.read_gpr8(0, false) as u64;
                let (r, wb) = alu::alu_op(self.state, op, a, b, 8);
                if wb {
                    self.state.write_gpr8(0, false, r as u8);
                }
            }
            _ => {
                let bits = self.op_bits;
                let b = self.fetch_imm()?;
                let a = self.state.read_gpr(RAX, bits);
                let (r, wb) = alu::alu_op(self.state, op, a, b, bits);
                if wb {
                    self.state.write_gpr(RAX, bits, r);
                }
            }
        }
        Ok(())
    }

    fn group1(&mut self, bits: u8, imm8: bool) -> Result<bool, Exception> {
        self.modrm()?;
        let op = self.modrm_reg_raw();
        let imm = if imm8 {
            self.fetch_imm8s()?
        } else if bits == 8 {
            self.fetch_u8()? as u64
        } else {
            self.fetch_imm()?
        };
        let a = self.rm_read(bits)?;
        let (r, wb) = alu::alu_op(self.state, op, a, imm, bits);
        if wb {
            self.rm_write(bits, r)?;
        }
        Ok(false)
    }

    fn group2_imm(&mut self, bits: u8) -> Result<bool, Exception> {
        self.modrm()?;
        let op = self.modrm_reg_raw();
        let count = self.fetch_u8()? as u64;
        let v = self.rm_read(bits)?;
        let r = alu::shift(self.state, op, v, count, bits);
        self.rm_write(bits, r)?;
        Ok(false)
    }

    fn group2_count(&mut self, bits: u8, count: u64) -> Result<bool, Exception> {
        self.modrm()?;
        let op = self.modrm_reg_raw();
        let v = self.rm_read(bits)?;
        let r = alu::shift(self.state, op, v, count, bits);
        self.rm_write(bits, r)?;
        Ok(false)
    }

    fn group3(&mut self, bits: u8) -> Result<bool, Exception> {
        self.modrm()?;
        match self.modrm_reg_raw() {
            0 | 1 => {
                // TEST r/m, imm.
                let imm = if bits == 8 {
                    self.fetch_u8()? as u64
                } else {
                    self.fetch_imm()?
                };
                let a = self.rm_read(bits)?;
                alu::alu_op(self.state, 4, a, imm, bits);
            }
            2 => {
                let v = self.rm_read(bits)?;
                self.rm_write(bits, !v)?;
            }
            3 => {
                let v = self.rm_read(bits)?;
                let r = alu::neg(self.state, v, bits);
                self.rm_write(bits, r)?;
            }
            4 => {
                // MUL: rDX:rAX = rAX * r/m.
                let b = self.rm_read(bits)?;
                let a = if bits == 8 {
                    self.state.read_gpr8(0, false) as u64
                } else {
                    self.state.read_gpr(RAX, bits)
                };
                let (lo, hi) = alu::mul_wide(a, b, bits);
                if bits == 8 {
                    self.state.write_gpr16(RAX, (hi << 8 | lo) as u16);
                } else {
                    self.state.write_gpr(RAX, bits, lo);
                    self.state.write_gpr(RDX, bits, hi);
                }
                let upper = hi != 0;
                self.state.set_flag(RFlags::CF, upper);
                self.state.set_flag(RFlags::OF, upper);
            }
            5 => {
                let b = self.rm_read(bits)?;
                let a = if bits == 8 {
                    self.state.read_gpr8(0, false) as u64
                } else {
                    self.state.read_gpr(RAX, bits)
                };
                let (lo, hi, ovf) = alu::imul_wide(a, b, bits);
                if bits == 8 {
                    self.state.write_gpr16(RAX, (hi << 8 | lo) as u16);
                } else {
                    self.state.write_gpr(RAX, bits, lo);
                    self.state.write_gpr(RDX, bits, hi);
                }
                self.state.set_flag(RFlags::CF, ovf);
                self.state.set_flag(RFlags::OF, ovf);
            }
            6 => {
                // DIV.
                let divisor = self.rm_read(bits)?;
                if divisor == 0 {
                    return Err(Exception::DivideError);
                }
                if bits == 8 {
                    let dividend = self.state.read_gpr16(RAX) as u64;
                    let q = dividend / divisor;
                    if q > 0xFF {
                        return Err(Exception::DivideError);
                    }
                    let r = dividend % divisor;
                    self.state.write_gpr8(0, false, q as u8);
                    self.state.write_gpr8(4, false, r as u8); // AH
                } else {
                    let lo = self.state.read_gpr(RAX, bits) as u128;
                    let hi = self.state.read_gpr(RDX, bits) as u128;
                    let dividend = hi << bits | lo;
                    let q = dividend / divisor as u128;
                    if q > mask_width(u64::MAX, bits) as u128 {
                        return Err(Exception::DivideError);
                    }
                    let r = dividend % divisor as u128;
                    self.state.write_gpr(RAX, bits, q as u64);
                    self.state.write_gpr(RDX, bits, r as u64);
                }
            }
            _ => {
                // IDIV.
                let divisor = sign_extend(self.rm_read(bits)?, bits) as i64;
                if divisor == 0 {
                    return Err(Exception::DivideError);
                }
                if bits == 8 {
                    let dividend = self.state.read_gpr16(RAX) as i16 as i64;
                    let q = dividend / divisor;
                    let r = dividend % divisor;
                    if q > i8::MAX as i64 || q < i8::MIN as i64 {
                        return Err(Exception::DivideError);
                    }
                    self.state.write_gpr8(0, false, q as u8);
                    self.state.write_gpr8(4, false, r as u8);
                } else {
                    let lo = self.state.read_gpr(RAX, bits) as u128;
                    let hi = self.state.read_gpr(RDX, bits) as u128;
                    let dividend = ((hi << bits | lo) as i128) << (128 - 2 * bits as u32)
                        >> (128 - 2 * bits as u32);
                    let q = dividend / divisor as i128;
                    let r = dividend % divisor as i128;
                    let max = (mask_width(u64::MAX, bits) >> 1) as i128;
                    if q > max || q < -max - 1 {
                        return Err(Exception::DivideError);
                    }
                    self.state.write_gpr(RAX, bits, q as u64);
                    self.state.write_gpr(RDX, bits, r as u64);
                }
            }
        }
        Ok(false)
    }

    fn group5(&mut self) -> Result<bool, Exception> {
        self.modrm()?;
        match self.modrm_reg_raw() {
            0 => {
                let bits = self.op_bits;
                let v = self.rm_read(bits)?;
                let r = alu::inc(self.state, v, bits);
                self.rm_write(bits, r)?;
                Ok(false)
            }
            1 => {
                let bits = self.op_bits;
                let v = self.rm_read(bits)?;
                let r = alu::dec(self.state, v, bits);
                self.rm_write(bits, r)?;
                Ok(false)
            }
            2 => {
                // CALL near r/m.
                let bits = if self.in_long64() { 64 } else { self.op_bits };
                let target = self.rm_read(bits)?;
                let next = self.ip;
                self.push(self.stack_op_bits(), next)?;
                self.jump_near(target);
                Ok(true)
            }
            3 => {
                // CALL m16:16/32.
                let (selector, offset) = self.far_pointer_operand()?;
                self.far_call(selector, offset)?;
                Ok(true)
            }
            4 => {
                let bits = if self.in_long64() { 64 } else { self.op_bits };
                let target = self.rm_read(bits)?;
                self.jump_near(target);
                Ok(true)
            }
            5 => {
                // JMP m16:16/32.
                let (selector, offset) = self.far_pointer_operand()?;
                self.far_jump(selector, offset)?;
                Ok(true)
            }
            6 => {
                let bits = self.stack_op_bits();
                let v = self.rm_read(bits)?;
                self.push(bits, v)?;
                Ok(false)
            }
            _ => Err(Exception::InvalidOpcode),
        }
    }

    fn far_pointer_operand(&mut self) -> Result<(u16, u64), Exception> {
        if self.rm_is_register() {
            return Err(Exception::InvalidOpcode);
        }
        let off_bytes = self.op_bits as u32 / 8;
        let lin = self.mem_linear(off_bytes + 2, false)?;
        let offset = self.read_mem(lin, self.op_bits)?;
        let selector = self.bus.read_u16(lin + off_bytes as u64)?;
        Ok((selector, offset))
    }

    fn load_far_pointer(&mut self, seg: SegReg) -> Result<bool, Exception> {
        if !self.in_long64() || matches!(seg, SegReg::Fs | SegReg::Gs | SegReg::Ss) {
            let bits = self.op_bits;
            self.modrm()?;
            let (selector, offset) = self.far_pointer_operand()?;
            segments::load_segment(self.state, self.bus, seg, selector)?;
            self.reg_write(bits, offset);
            if seg == SegReg::Ss {
                self.state.set_interrupt_shadow();
            }
            Ok(false)
        } else {
            Err(Exception::InvalidOpcode)
        }
    }

    fn push_seg(&mut self, seg: SegReg) -> Result<bool, Exception> {
        if self.in_long64() && !matches!(seg, SegReg::Fs | SegReg::Gs) {
            return Err(Exception::InvalidOpcode);
        }
        let bits = self.stack_op_bits();
        let v = self.state.segments.get(seg).selector as u64;
        self.push(bits, v)?;
        Ok(false)
    }

    fn pop_seg(&mut self, seg: SegReg) -> Result<bool, Exception> {
        if seg == SegReg::Cs {
            return Err(Exception::InvalidOpcode);
        }
        if self.in_long64() && !matches!(seg, SegReg::Fs | SegReg::Gs) {
            return Err(Exception::InvalidOpcode);
        }
        let bits = self.stack_op_bits();
        let v = self.pop(bits)? as u16;
        segments::load_segment(self.state, self.bus, seg, v)?;
        if seg == SegReg::Ss {
            self.state.set_interrupt_shadow();
        }
        Ok(false)
    }

    fn pusha(&mut self) -> Result<bool, Exception> {
        if self.in_long64() {
            return Err(Exception::InvalidOpcode);
        }
        let bits = self.op_bits;
        let sp = self.state.read_gpr(RSP, bits);
        for reg in [0, 1, 2, 3] {
            let v = self.state.read_gpr(reg, bits);
            self.push(bits, v)?;
        }
        self.push(bits, sp)?;
        for reg in [5, 6, 7] {
            let v = self.state.read_gpr(reg, bits);
            self.push(bits, v)?;
        }
        Ok(false)
    }

    fn popa(&mut self) -> Result<bool, Exception> {
        if self.in_long64() {
            return Err(Exception::InvalidOpcode);
        }
        let bits = self.op_bits;
        for reg in [7, 6, 5] {
            let v = self.pop(bits)?;
            self.state.write_gpr(reg, bits, v);
        }
        let _ = self.pop(bits)?; // skip the pushed SP
        for reg in [3, 2, 1, 0] {
            let v = self.pop(bits)?;
            self.state.write_gpr(reg, bits, v);
        }
        Ok(false)
    }

    fn arpl(&mut self) -> Result<bool, Exception> {
        if self.state.mode() == CpuMode::Real {
            return Err(Exception::InvalidOpcode);
        }
        self.modrm()?;
        let dst = self.rm_read(16)?;
        let src = self.reg_read(16);
        if dst & 3 < src & 3 {
            self.state.set_flag(RFlags::ZF, true);
            self.rm_write(16, (dst & !3) | (src & 3))?;
        } else {
            self.state.set_flag(RFlags::ZF, false);
        }
        Ok(false)
    }

    fn mov_moffs(&mut self, opcode: u8) -> Result<bool, Exception> {
        let offset = match self.addr_bits {
            16 => self.fetch_u16()? as u64,
            32 => self.fetch_u32()? as u64,
            _ => self.fetch_u64()?,
        };
        let seg = self.data_seg();
        match opcode {
            0xA0 => {
                let lin = segments::linear_for(self.state, seg, offset, 1, false)?;
                let v = self.bus.read_u8(lin)?;
                self.state.write_gpr8(0, false, v);
            }
            0xA1 => {
                let bits = self.op_bits;
                let lin = segments::linear_for(self.state, seg, offset, bits as u32 / 8, false)?;
                let v = self.read_mem(lin, bits)?;
                self.state.write_gpr(RAX, bits, v);
            }
            0xA2 => {
                let lin = segments::linear_for(self.state, seg, offset, 1, true)?;
                let v = self.state.read_gpr8(0, false);
                self.bus.write_u8(lin, v)?;
            }
            _ => {
                let bits = self.op_bits;
                let lin = segments::linear_for(self.state, seg, offset, bits as u32 / 8, true)?;
                let v = self.state.read_gpr(RAX, bits);
                self.write_mem(lin, bits, v)?;
            }
        }
        Ok(false)
    }

    fn enter(&mut self) -> Result<bool, Exception> {
        let alloc = self.fetch_u16()? as u64;
        let nesting = self.fetch_u8()? & 0x1F;
        let bits = self.stack_op_bits();

        let bp = self.state.read_gpr(5, bits);
        self.push(bits, bp)?;
        let frame = self.state.rsp() & control::stack_mask(self.state);

        for level in 1..nesting {
            let src = bp.wrapping_sub(level as u64 * (bits as u64 / 8));
            let lin = segments::linear_for(self.state, SegReg::Ss, src, bits as u32 / 8, false)?;
            let v = self.read_mem(lin, bits)?;
            self.push(bits, v)?;
        }
        if nesting > 0 {
            self.push(bits, frame)?;
        }

        self.state.write_gpr(5, bits, frame);
        self.sub_rsp(alloc);
        Ok(false)
    }

    fn daa_das(&mut self, das: bool) -> Result<bool, Exception> {
        let mut al = self.state.read_gpr8(0, false);
        let mut cf = self.state.flag(RFlags::CF);
        let af = self.state.flag(RFlags::AF);

        let old_al = al;
        if al & 0x0F > 9 || af {
            al = if das {
                al.wrapping_sub(6)
            } else {
                al.wrapping_add(6)
            };
            self.state.set_flag(RFlags::AF, true);
        } else {
            self.state.set_flag(RFlags::AF, false);
        }
        if old_al > 0x99 || cf {
            al = if das {
                al.wrapping_sub(0x60)
            } else {
                al.wrapping_add(0x60)
            };
            cf = true;
        } else {
            cf = false;
        }

        self.state.write_gpr8(0, false, al);
        self.state.set_flag(RFlags::CF, cf);
        let f = crate::flags::result_flags(al as u64, 8);
        self.state.set_flag(RFlags::ZF, f.contains(RFlags::ZF));
        self.state.set_flag(RFlags::SF, f.contains(RFlags::SF));
        self.state.set_flag(RFlags::PF, f.contains(RFlags::PF));
        Ok(false)
    }

    fn aaa_aas(&mut self, aas: bool) -> Result<bool, Exception> {
        let al = self.state.read_gpr8(0, false);
        let ah = self.state.read_gpr8(4, false);
        if al & 0x0F > 9 || self.state.flag(RFlags::AF) {
            let (new_al, new_ah) = if aas {
                (al.wrapping_sub(6), ah.wrapping_sub(1))
            } else {
                (al.wrapping_add(6), ah.wrapping_add(1))
            };
            self.state.write_gpr8(0, false, new_al & 0x0F);
            self.state.write_gpr8(4, false, new_ah);
            self.state.set_flag(RFlags::AF, true);
            self.state.set_flag(RFlags::CF, true);
        } else {
            self.state.write_gpr8(0, false, al & 0x0F);
            self.state.set_flag(RFlags::AF, false);
            self.state.set_flag(RFlags::CF, false);
        }
        Ok(false)
    }

    fn aam(&mut self) -> Result<bool, Exception> {
        let base = self.fetch_u8()?;
        if base == 0 {
            return Err(Exception::DivideError);
        }
        let al = self.state.read_gpr8(0, false);
        self.state.write_gpr8(4, false, al / base);
        let al = al % base;
        self.state.write_gpr8(0, false, al);
        let f = crate::flags::result_flags(al as u64, 8);
        self.state.set_flag(RFlags::ZF, f.contains(RFlags::ZF));
        self.state.set_flag(RFlags::SF, f.contains(RFlags::SF));
        self.state.set_flag(RFlags::PF, f.contains(RFlags::PF));
        Ok(false)
    }

    fn aad(&mut self) -> Result<bool, Exception> {
        let base = self.fetch_u8()?;
        let al = self.state.read_gpr8(0, false);
        let ah = self.state.read_gpr8(4, false);
        let r = al.wrapping_add(ah.wrapping_mul(base));
        self.state.write_gpr8(0, false, r);
        self.state.write_gpr8(4, false, 0);
        let f = crate::flags::result_flags(r as u64, 8);
        self.state.set_flag(RFlags::ZF, f.contains(RFlags::ZF));
        self.state.set_flag(RFlags::SF, f.contains(RFlags::SF));
        self.state.set_flag(RFlags::PF, f.contains(RFlags::PF));
        Ok(false)
    }

    fn bt_group(&mut self, op: u8, imm: Option<u8>) -> Result<bool, Exception> {
        let bits = self.op_bits;
        if imm.is_none() {
            self.modrm()?;
        }

        if self.rm_is_register() {
            let bit = match imm {
                Some(i) => (i as u32) & (bits as u32 - 1),
                None => (self.reg_read(bits) as u32) & (bits as u32 - 1),
            };
            let v = self.rm_read(bits)?;
            let (set, new) = alu::bt_op(op, v, bit);
            self.state.set_flag(RFlags::CF, set);
            if op != 4 {
                self.rm_write(bits, new)?;
            }
        } else {
            // Register bit offsets address memory beyond the operand.
            let (byte_delta, bit) = match imm {
                Some(i) => (0i64, (i as u32) & (bits as u32 - 1)),
                None => {
                    let off = sign_extend(self.reg_read(bits), bits) as i64;
                    (off.div_euclid(8), off.rem_euclid(8) as u32)
                }
            };
            let lin = self
                .mem_linear(1, op != 4)?
                .wrapping_add(byte_delta as u64);
            let v = self.bus.read_u8(lin)? as u64;
            let (set, new) = alu::bt_op(op, v, bit);
            self.state.set_flag(RFlags::CF, set);
            if op != 4 {
                self.bus.write_u8(lin, new as u8)?;
            }
        }
        Ok(false)
    }

    fn group6(&mut self) -> Result<bool, Exception> {
        if self.state.mode() == CpuMode::Real {
            return Err(Exception::InvalidOpcode);
        }
        self.modrm()?;
        match self.modrm_reg_raw() {
            0 => {
                // SLDT.
                let v = self.state.ldtr.selector as u64;
                self.rm_write(16, v)?;
            }
            1 => {
                // STR.
                let v = self.state.tr.selector as u64;
                self.rm_write(16, v)?;
            }
            2 => {
                // LLDT.
                if self.state.cpl() != 0 {
                    return Err(Exception::GP0);
                }
                let selector = self.rm_read(16)? as u16;
                if selector & !3 == 0 {
                    self.state.ldtr = Default::default();
                } else {
                    let raw = segments::read_descriptor(self.state, self.bus, selector)?
                        .ok_or(Exception::GeneralProtection { selector })?;
                    if raw.seg_type() != SYS_LDT || raw.non_system() {
                        return Err(Exception::GeneralProtection { selector });
                    }
                    if !raw.present() {
                        return Err(Exception::SegmentNotPresent { selector });
                    }
                    self.state.ldtr.selector = selector;
                    self.state.ldtr.base = raw.base();
                    self.state.ldtr.limit = raw.limit_bytes();
                    self.state.ldtr.seg_type = SYS_LDT;
                }
            }
            3 => {
                // LTR.
                if self.state.cpl() != 0 {
                    return Err(Exception::GP0);
                }
                let selector = self.rm_read(16)? as u16;
                let raw = segments::read_descriptor(self.state, self.bus, selector)?
                    .ok_or(Exception::GeneralProtection { selector })?;
                if raw.non_system() || raw.seg_type() != SYS_TSS32_AVAIL {
                    return Err(Exception::GeneralProtection { selector });
                }
                if !raw.present() {
                    return Err(Exception::SegmentNotPresent { selector });
                }
                self.state.tr.selector = selector;
                self.state.tr.base = raw.base();
                self.state.tr.limit = raw.limit_bytes();
                self.state.tr.seg_type = raw.seg_type() | 0x2;
                segments::write_descriptor_access(
                    self.state,
                    self.bus,
                    selector,
                    raw.access() | 0x02,
                )?;
            }
            4 | 5 => {
                // VERR/VERW.
                let selector = self.rm_read(16)? as u16;
                let ok = match segments::read_descriptor(self.state, self.bus, selector)? {
                    Some(raw) if raw.non_system() => {
                        let cache = raw.to_cache();
                        let rpl = (selector & 3) as u8;
                        let dpl_ok = cache.is_conforming()
                            || (cache.dpl >= self.state.cpl() && cache.dpl >= rpl);
                        if self.modrm_reg_raw() == 4 {
                            dpl_ok && cache.is_readable()
                        } else {
                            dpl_ok && cache.is_writable_data()
                        }
                    }
                    _ => false,
                };
                self.state.set_flag(RFlags::ZF, ok);
            }
            _ => return Err(Exception::InvalidOpcode),
        }
        Ok(false)
    }

    fn group7(&mut self) -> Result<bool, Exception> {
        self.modrm()?;
        let op = self.modrm_reg_raw();

        // SMSW is the only member usable outside CPL0.
        if op != 4 && self.state.mode() != CpuMode::Real && self.state.cpl() != 0 {
            return Err(Exception::GP0);
        }

        match op {
            0 | 1 => {
                // SGDT/SIDT.
                if self.rm_is_register() {
                    return Err(Exception::InvalidOpcode);
                }
                let table = if op == 0 {
                    self.state.gdtr
                } else {
                    self.state.idtr
                };
                let lin = self.mem_linear(if self.in_long64() { 10 } else { 6 }, true)?;
                self.bus.write_u16(lin, table.limit)?;
                if self.in_long64() {
                    self.bus.write_u64(lin + 2, table.base)?;
                } else {
                    let base = if self.op_bits == 16 {
                        table.base & 0xFF_FFFF
                    } else {
                        table.base
                    };
                    self.bus.write_u32(lin + 2, base as u32)?;
                }
            }
            2 | 3 => {
                // LGDT/LIDT.
                if self.rm_is_register() {
                    return Err(Exception::InvalidOpcode);
                }
                let lin = self.mem_linear(if self.in_long64() { 10 } else { 6 }, false)?;
                let limit = self.bus.read_u16(lin)?;
                let base = if self.in_long64() {
                    self.bus.read_u64(lin + 2)?
                } else {
                    let b = self.bus.read_u32(lin + 2)? as u64;
                    if self.op_bits == 16 {
                        b & 0xFF_FFFF
                    } else {
                        b
                    }
                };
                let table = crate::state::TableRegister { base, limit };
                if op == 2 {
                    self.state.gdtr = table;
                } else {
                    self.state.idtr = table;
                }
            }
            4 => {
                // SMSW.
                let bits = if self.rm_is_register() { self.op_bits } else { 16 };
                let v = self.state.control.cr0 & mask_width(u64::MAX, bits);
                self.rm_write(bits, v)?;
            }
            6 => {
                // LMSW: sets the low CR0 bits, can set PE but never clear it.
                let v = self.rm_read(16)? & 0xF;
                let pe = self.state.control.cr0 & 1;
                let new = (self.state.control.cr0 & !0xFu64) | v | pe;
                self.state.write_cr0(new);
                self.bus.sync(self.state);
            }
            7 => {
                // INVLPG.
                if self.rm_is_register() {
                    return Err(Exception::InvalidOpcode);
                }
                let mem_off = self.mem_offset();
                let seg = self.prefixes.seg.unwrap_or(SegReg::Ds);
                let base = self.state.segments.get(seg).cache.base;
                self.bus.invlpg(base.wrapping_add(mem_off));
            }
            _ => return Err(Exception::InvalidOpcode),
        }
        Ok(false)
    }

    fn cpuid(&mut self) -> Result<bool, Exception> {
        let leaf = self.state.read_gpr32(RAX);
        let (a, b, c, d): (u32, u32, u32, u32) = match leaf {
            0 => (1, 0x756E_6547, 0x6C65_746E, 0x4965_6E69), // "GenuineIntel"
            1 => {
                // Family 6 model 0; FPU PSE TSC MSR PAE CX8 SEP PGE CMOV.
                let edx = 1 | 1 << 3 | 1 << 4 | 1 << 5 | 1 << 6 | 1 << 8 | 1 << 11 | 1 << 13 | 1 << 15;
                (0x0600, 0, 0, edx)
            }
            0x8000_0000 => (0x8000_0001, 0, 0, 0),
            0x8000_0001 => {
                // SYSCALL + long mode.
                (0, 0, 0, 1 << 11 | 1 << 29)
            }
            _ => (0, 0, 0, 0),
        };
        self.state.write_gpr32(RAX, a);
        self.state.write_gpr32(RBX, b);
        self.state.write_gpr32(RCX, c);
        self.state.write_gpr32(RDX, d);
        Ok(false)
    }

    fn read_msr(&self, msr: u32) -> u64 {
        match msr {
            0xC000_0080 => self.state.msr.efer,
            0xC000_0081 => self.state.msr.star,
            0xC000_0082 => self.state.msr.lstar,
            0xC000_0084 => self.state.msr.fmask,
            _ => 0,
        }
    }

    fn write_msr(&mut self, msr: u32, value: u64) {
        match msr {
            0xC000_0080 => {
                self.state.write_efer(value);
                self.bus.sync(self.state);
            }
            0xC000_0081 => self.state.msr.star = value,
            0xC000_0082 => self.state.msr.lstar = value,
            0xC000_0084 => self.state.msr.fmask = value,
            _ => {}
        }
    }

    fn add_rsp(&mut self, delta: u64) {
        let mask = control::stack_mask(self.state);
        let sp = (self.state.rsp() & mask).wrapping_add(delta) & mask;
        self.state.set_rsp((self.state.rsp() & !mask) | sp);
    }

    fn sub_rsp(&mut self, delta: u64) {
        self.add_rsp(delta.wrapping_neg());
    }

    /// IN/OUT/INS/OUTS privilege: CPL must not exceed IOPL outside real
    /// mode (no I/O-permission bitmap is modelled).
    fn check_io_permission(&self) -> Result<(), Exception> {
        if self.state.mode() == CpuMode::Real {
            return Ok(());
        }
        if u64::from(self.state.cpl()) > self.state.iopl() {
            return Err(Exception::GP0);
        }
        Ok(())
    }

    fn check_iopl_sensitive(&self) -> Result<(), Exception> {
        self.check_io_permission()
    }
}
