//! Instruction-stream decoding: prefixes, ModR/M, SIB and effective
//! addresses.
//!
//! The decoder is a pull interface: the interpreter feeds it one byte at a
//! time from the code stream and asks for the pieces it needs in encoding
//! order (prefixes, opcode, ModR/M, SIB, displacement, immediate). Nothing
//! here touches memory directly, so the same routines serve every
//! translation regime.

use crate::exception::Exception;
use crate::flags::sign_extend;
use crate::state::{SegReg, RBP, RSP};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rep {
    /// REP / REPE (0xF3).
    Repe,
    /// REPNE (0xF2).
    Repne,
}

/// Legacy prefixes plus the REX byte collected ahead of the opcode.
#[derive(Clone, Copy, Debug, Default)]
pub struct Prefixes {
    pub lock: bool,
    pub rep: Option<Rep>,
    pub seg: Option<SegReg>,
    pub operand_size: bool,
    pub address_size: bool,
    pub rex: Option<u8>,
}

impl Prefixes {
    pub fn rex_w(&self) -> bool {
        self.rex.is_some_and(|r| r & 0x8 != 0)
    }

    pub fn rex_r(&self) -> usize {
        usize::from(self.rex.is_some_and(|r| r & 0x4 != 0)) << 3
    }

    pub fn rex_x(&self) -> usize {
        usize::from(self.rex.is_some_and(|r| r & 0x2 != 0)) << 3
    }

    pub fn rex_b(&self) -> usize {
        usize::from(self.rex.is_some_and(|r| r & 0x1 != 0)) << 3
    }

    /// Operand width in bits for the default-sized operand class.
    pub fn op_bits(&self, code_bits: u8) -> u8 {
        match code_bits {
            16 => {
                if self.operand_size {
                    32
                } else {
                    16
                }
            }
            32 => {
                if self.operand_size {
                    16
                } else {
                    32
                }
            }
            64 => {
                if self.rex_w() {
                    64
                } else if self.operand_size {
                    16
                } else {
                    32
                }
            }
            _ => unreachable!(),
        }
    }

    pub fn addr_bits(&self, code_bits: u8) -> u8 {
        match code_bits {
            16 => {
                if self.address_size {
                    32
                } else {
                    16
                }
            }
            32 => {
                if self.address_size {
                    16
                } else {
                    32
                }
            }
            64 => {
                if self.address_size {
                    32
                } else {
                    64
                }
            }
            _ => unreachable!(),
        }
    }
}

/// Scan prefix bytes up to the first opcode byte. In 64-bit code a REX
/// byte participates only when it immediately precedes the opcode; an
/// earlier one is silently dropped, as on hardware.
pub fn scan_prefixes<F>(mut fetch: F, long64: bool) -> Result<(Prefixes, u8), Exception>
where
    F: FnMut() -> Result<u8, Exception>,
{
    let mut p = Prefixes::default();
    let mut pending_rex: Option<u8> = None;

    loop {
        let byte = fetch()?;
        match byte {
            0xF0 => p.lock = true,
            0xF2 => p.rep = Some(Rep::Repne),
            0xF3 => p.rep = Some(Rep::Repe),
            0x2E => p.seg = Some(SegReg::Cs),
            0x36 => p.seg = Some(SegReg::Ss),
            0x3E => p.seg = Some(SegReg::Ds),
            0x26 => p.seg = Some(SegReg::Es),
            0x64 => p.seg = Some(SegReg::Fs),
            0x65 => p.seg = Some(SegReg::Gs),
            0x66 => p.operand_size = true,
            0x67 => p.address_size = true,
            0x40..=0x4F if long64 => {
                pending_rex = Some(byte);
                continue;
            }
            _ => {
                // A REX byte counts only when it immediately precedes the
                // opcode.
                p.rex = pending_rex;
                return Ok((p, byte));
            }
        }
        pending_rex = None;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModRm {
    pub raw: u8,
}

impl ModRm {
    pub fn mode(&self) -> u8 {
        self.raw >> 6
    }

    pub fn reg(&self) -> u8 {
        (self.raw >> 3) & 7
    }

    pub fn rm(&self) -> u8 {
        self.raw & 7
    }

    pub fn is_register(&self) -> bool {
        self.mode() == 3
    }
}

/// A decoded memory operand. RIP-relative references resolve against the
/// address of the *next* instruction, which is only known once the whole
/// instruction has been pulled, hence the split representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemRef {
    Abs { seg: SegReg, offset: u64 },
    RipRel { seg: SegReg, disp: i32 },
}

impl MemRef {
    pub fn seg(&self) -> SegReg {
        match self {
            MemRef::Abs { seg, .. } | MemRef::RipRel { seg, .. } => *seg,
        }
    }

    pub fn offset(&self, next_ip: u64, addr_bits: u8) -> u64 {
        let raw = match self {
            MemRef::Abs { offset, .. } => *offset,
            MemRef::RipRel { disp, .. } => next_ip.wrapping_add(*disp as i64 as u64),
        };
        mask_addr(raw, addr_bits)
    }
}

pub fn mask_addr(addr: u64, addr_bits: u8) -> u64 {
    match addr_bits {
        16 => addr & 0xFFFF,
        32 => addr & 0xFFFF_FFFF,
        _ => addr,
    }
}

/// Decode the memory side of a ModR/M byte, pulling SIB/displacement bytes
/// through `fetch` as the encoding requires.
pub fn decode_ea<F>(
    gpr: &[u64; 16],
    prefixes: &Prefixes,
    modrm: ModRm,
    addr_bits: u8,
    mut fetch: F,
) -> Result<MemRef, Exception>
where
    F: FnMut() -> Result<u8, Exception>,
{
    debug_assert!(!modrm.is_register());

    fn fetch_bytes(
        fetch: &mut impl FnMut() -> Result<u8, Exception>,
        count: u8,
    ) -> Result<u64, Exception> {
        let mut v = 0u64;
        for shift in (0..count).map(|i| i * 8) {
            v |= (fetch()? as u64) << shift;
        }
        Ok(v)
    }

    if addr_bits == 16 {
        let (base, default_ss): (u64, bool) = match modrm.rm() {
            0 => (gpr[3] as u16 as u64 + gpr[6] as u16 as u64, false), // BX+SI
            1 => (gpr[3] as u16 as u64 + gpr[7] as u16 as u64, false), // BX+DI
            2 => (gpr[5] as u16 as u64 + gpr[6] as u16 as u64, true),  // BP+SI
            3 => (gpr[5] as u16 as u64 + gpr[7] as u16 as u64, true),  // BP+DI
            4 => (gpr[6] as u16 as u64, false),                              // SI
            5 => (gpr[7] as u16 as u64, false),                              // DI
            6 => {
                if modrm.mode() == 0 {
                    let disp = fetch_bytes(&mut fetch, 2)?;
                    let seg = prefixes.seg.unwrap_or(SegReg::Ds);
                    return Ok(MemRef::Abs {
                        seg,
                        offset: disp & 0xFFFF,
                    });
                }
                (gpr[5] as u16 as u64, true) // BP
            }
            _ => (gpr[3] as u16 as u64, false), // BX
        };

        let disp = match modrm.mode() {
            0 => 0,
            1 => sign_extend(fetch()? as u64, 8),
            _ => sign_extend(fetch_bytes(&mut fetch, 2)?, 16),
        };

        let seg = prefixes
            .seg
            .unwrap_or(if default_ss { SegReg::Ss } else { SegReg::Ds });
        Ok(MemRef::Abs {
            seg,
            offset: base.wrapping_add(disp) & 0xFFFF,
        })
    } else {
        let wide = addr_bits == 64;
        let read_reg = |index: usize| -> u64 {
            if wide {
                gpr[index]
            } else {
                gpr[index] as u32 as u64
            }
        };

        let mut base: u64 = 0;
        let mut default_ss = false;
        let mut disp_bits_32 = false;

        if modrm.rm() == 4 {
            // SIB byte required.
            let sib = fetch()?;
            let scale = sib >> 6;
            let index = ((sib >> 3) & 7) as usize | prefixes.rex_x();
            let base_enc = (sib & 7) as usize;

            if index != RSP {
                base = base.wrapping_add(read_reg(index) << scale);
            }

            if base_enc == 5 && modrm.mode() == 0 {
                disp_bits_32 = true;
            } else {
                let base_reg = base_enc | prefixes.rex_b();
                base = base.wrapping_add(read_reg(base_reg));
                default_ss = base_reg & 7 == RSP || base_reg & 7 == RBP;
            }
        } else if modrm.rm() == 5 && modrm.mode() == 0 {
            if wide {
                // RIP-relative.
                let disp = fetch_bytes(&mut fetch, 4)? as u32 as i32;
                let seg = prefixes.seg.unwrap_or(SegReg::Ds);
                return Ok(MemRef::RipRel { seg, disp });
            }
            disp_bits_32 = true;
        } else {
            let reg = modrm.rm() as usize | prefixes.rex_b();
            base = read_reg(reg);
            default_ss = reg & 7 == RBP;
        }

        let disp = if disp_bits_32 {
            sign_extend(fetch_bytes(&mut fetch, 4)?, 32)
        } else {
            match modrm.mode() {
                0 => 0,
                1 => sign_extend(fetch()? as u64, 8),
                _ => sign_extend(fetch_bytes(&mut fetch, 4)?, 32),
            }
        };

        let seg = prefixes
            .seg
            .unwrap_or(if default_ss { SegReg::Ss } else { SegReg::Ds });
        Ok(MemRef::Abs {
            seg,
            offset: mask_addr(base.wrapping_add(disp), addr_bits),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CpuMode, CpuState};

    fn feeder(bytes: &[u8]) -> impl FnMut() -> Result<u8, Exception> + '_ {
        let mut it = bytes.iter().copied();
        move || it.next().ok_or(Exception::InvalidOpcode)
    }

    #[test]
    fn prefix_scan_collects_and_stops_at_opcode() {
        let (p, op) = scan_prefixes(feeder(&[0x66, 0x2E, 0xF3, 0x89]), false).unwrap();
        assert!(p.operand_size);
        assert_eq!(p.seg, Some(SegReg::Cs));
        assert_eq!(p.rep, Some(Rep::Repe));
        assert_eq!(op, 0x89);
    }

    #[test]
    fn rex_only_recognised_in_64bit_code() {
        let (p, op) = scan_prefixes(feeder(&[0x48, 0x89]), false).unwrap();
        assert!(p.rex.is_none());
        assert_eq!(op, 0x48); // INC AX territory in legacy code

        let (p, op) = scan_prefixes(feeder(&[0x48, 0x89]), true).unwrap();
        assert_eq!(p.rex, Some(0x48));
        assert!(p.rex_w());
        assert_eq!(op, 0x89);
    }

    #[test]
    fn rex_before_legacy_prefix_is_dropped() {
        // REX not adjacent to the opcode is ignored.
        let (p, op) = scan_prefixes(feeder(&[0x48, 0x66, 0x89]), true).unwrap();
        assert!(p.rex.is_none());
        assert!(p.operand_size);
        assert_eq!(op, 0x89);
    }

    #[test]
    fn op_and_addr_size_tables() {
        let none = Prefixes::default();
        assert_eq!(none.op_bits(16), 16);
        assert_eq!(none.op_bits(32), 32);
        assert_eq!(none.op_bits(64), 32);
        assert_eq!(none.addr_bits(64), 64);

        let osz = Prefixes {
            operand_size: true,
            ..Default::default()
        };
        assert_eq!(osz.op_bits(16), 32);
        assert_eq!(osz.op_bits(32), 16);
        assert_eq!(osz.op_bits(64), 16);

        let rexw = Prefixes {
            rex: Some(0x48),
            operand_size: true,
            ..Default::default()
        };
        // REX.W wins over 0x66.
        assert_eq!(rexw.op_bits(64), 64);

        let asz = Prefixes {
            address_size: true,
            ..Default::default()
        };
        assert_eq!(asz.addr_bits(16), 32);
        assert_eq!(asz.addr_bits(32), 16);
        assert_eq!(asz.addr_bits(64), 32);
    }

    #[test]
    fn ea_16bit_classic_combinations() {
        let mut state = CpuState::reset();
        state.write_gpr16(3, 0x1000); // BX
        state.write_gpr16(6, 0x0020); // SI
        state.write_gpr16(5, 0x8000); // BP

        // [BX+SI]
        let m = decode_ea(
            &state.gpr,
            &Prefixes::default(),
            ModRm { raw: 0x00 },
            16,
            feeder(&[]),
        )
        .unwrap();
        assert_eq!(
            m,
            MemRef::Abs {
                seg: SegReg::Ds,
                offset: 0x1020
            }
        );

        // [BP+disp8] defaults to SS.
        let m = decode_ea(
            &state.gpr,
            &Prefixes::default(),
            ModRm { raw: 0x46 },
            16,
            feeder(&[0x10]),
        )
        .unwrap();
        assert_eq!(
            m,
            MemRef::Abs {
                seg: SegReg::Ss,
                offset: 0x8010
            }
        );

        // mod=0 rm=6 is a bare disp16.
        let m = decode_ea(
            &state.gpr,
            &Prefixes::default(),
            ModRm { raw: 0x06 },
            16,
            feeder(&[0x34, 0x12]),
        )
        .unwrap();
        assert_eq!(
            m,
            MemRef::Abs {
                seg: SegReg::Ds,
                offset: 0x1234
            }
        );
    }

    #[test]
    fn ea_32bit_sib_and_disp32() {
        let mut state = CpuState::new(CpuMode::Protected);
        state.write_gpr32(0, 0x1000); // EAX
        state.write_gpr32(1, 0x10); // ECX

        // [EAX + ECX*4 + 0x10]: modrm mod=01 rm=100, sib scale=2 index=001 base=000.
        let m = decode_ea(
            &state.gpr,
            &Prefixes::default(),
            ModRm { raw: 0x44 },
            32,
            feeder(&[0x88, 0x10]),
        )
        .unwrap();
        assert_eq!(
            m,
            MemRef::Abs {
                seg: SegReg::Ds,
                offset: 0x1000 + 0x40 + 0x10
            }
        );

        // mod=0 rm=101: bare disp32.
        let m = decode_ea(
            &state.gpr,
            &Prefixes::default(),
            ModRm { raw: 0x05 },
            32,
            feeder(&[0x78, 0x56, 0x34, 0x12]),
        )
        .unwrap();
        assert_eq!(
            m,
            MemRef::Abs {
                seg: SegReg::Ds,
                offset: 0x1234_5678
            }
        );
    }

    #[test]
    fn ea_64bit_rip_relative() {
        let state = CpuState::new(CpuMode::Long);
        let m = decode_ea(
            &state.gpr,
            &Prefixes::default(),
            ModRm { raw: 0x05 },
            64,
            feeder(&[0x10, 0x00, 0x00, 0x00]),
        )
        .unwrap();
        assert_eq!(
            m,
            MemRef::RipRel {
                seg: SegReg::Ds,
                disp: 0x10
            }
        );
        assert_eq!(m.offset(0x40_0000, 64), 0x40_0010);
    }

    #[test]
    fn ea_default_ss_for_rbp_rsp_bases() {
        let mut state = CpuState::new(CpuMode::Protected);
        state.write_gpr32(RBP, 0x100);
        state.write_gpr32(RSP, 0x200);

        // [EBP+0]: mod=1 rm=101 disp8=0 -> SS.
        let m = decode_ea(
            &state.gpr,
            &Prefixes::default(),
            ModRm { raw: 0x45 },
            32,
            feeder(&[0x00]),
        )
        .unwrap();
        assert_eq!(m.seg(), SegReg::Ss);

        // [ESP]: SIB base=100 -> SS.
        let m = decode_ea(
            &state.gpr,
            &Prefixes::default(),
            ModRm { raw: 0x04 },
            32,
            feeder(&[0x24]),
        )
        .unwrap();
        assert_eq!(m.seg(), SegReg::Ss);
        assert_eq!(
            m,
            MemRef::Abs {
                seg: SegReg::Ss,
                offset: 0x200
            }
        );

        // Override wins.
        let p = Prefixes {
            seg: Some(SegReg::Es),
            ..Default::default()
        };
        let m = decode_ea(&state.gpr, &p, ModRm { raw: 0x45 }, 32, feeder(&[0x00])).unwrap();
        assert_eq!(m.seg(), SegReg::Es);
    }
}
