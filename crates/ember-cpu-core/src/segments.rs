//! Segmentation: descriptor-table access, selector loads and the
//! segment:offset → linear mapping with its protection checks.

use crate::exception::Exception;
use crate::mem::CpuBus;
use crate::state::{CpuMode, CpuState, SegReg, SegmentCache, SegmentRegister};

pub const SELECTOR_TI: u16 = 1 << 2;

/// Raw 8-byte descriptor split into fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawDescriptor {
    pub raw: u64,
}

impl RawDescriptor {
    pub fn base(&self) -> u64 {
        let raw = self.raw;
        ((raw >> 16) & 0xFF_FFFF) | ((raw >> 56) & 0xFF) << 24
    }

    pub fn limit_raw(&self) -> u32 {
        ((self.raw & 0xFFFF) | ((self.raw >> 32) & 0xF_0000)) as u32
    }

    /// Byte-granular limit after applying G.
    pub fn limit_bytes(&self) -> u32 {
        let limit = self.limit_raw();
        if self.granularity() {
            (limit << 12) | 0xFFF
        } else {
            limit
        }
    }

    pub fn access(&self) -> u8 {
        (self.raw >> 40) as u8
    }

    pub fn seg_type(&self) -> u8 {
        self.access() & 0xF
    }

    pub fn non_system(&self) -> bool {
        self.access() & 0x10 != 0
    }

    pub fn dpl(&self) -> u8 {
        (self.access() >> 5) & 3
    }

    pub fn present(&self) -> bool {
        self.access() & 0x80 != 0
    }

    pub fn default_32(&self) -> bool {
        self.raw >> 54 & 1 != 0
    }

    pub fn long(&self) -> bool {
        self.raw >> 53 & 1 != 0
    }

    pub fn granularity(&self) -> bool {
        self.raw >> 55 & 1 != 0
    }

    pub fn to_cache(&self) -> SegmentCache {
        SegmentCache {
            base: self.base(),
            limit: self.limit_bytes(),
            seg_type: self.seg_type(),
            non_system: self.non_system(),
            dpl: self.dpl(),
            present: self.present(),
            default_32: self.default_32(),
            long: self.long(),
            granularity: self.granularity(),
        }
    }
}

/// Call/interrupt/trap/task gate fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Gate {
    pub selector: u16,
    pub offset: u64,
    pub word_count: u8,
    pub gate_type: u8,
    pub dpl: u8,
    pub present: bool,
}

pub const GATE_TASK: u8 = 0x5;
pub const GATE_CALL16: u8 = 0x4;
pub const GATE_CALL32: u8 = 0xC;
pub const GATE_INT16: u8 = 0x6;
pub const GATE_TRAP16: u8 = 0x7;
pub const GATE_INT32: u8 = 0xE;
pub const GATE_TRAP32: u8 = 0xF;

pub const SYS_TSS16_AVAIL: u8 = 0x1;
pub const SYS_LDT: u8 = 0x2;
pub const SYS_TSS16_BUSY: u8 = 0x3;
pub const SYS_TSS32_AVAIL: u8 = 0x9;
pub const SYS_TSS32_BUSY: u8 = 0xB;

impl Gate {
    pub fn from_raw(raw: u64) -> Self {
        let access = (raw >> 40) as u8;
        Self {
            selector: (raw >> 16) as u16,
            offset: (raw & 0xFFFF) | ((raw >> 48) & 0xFFFF) << 16,
            word_count: ((raw >> 32) & 0x1F) as u8,
            gate_type: access & 0xF,
            dpl: (access >> 5) & 3,
            present: access & 0x80 != 0,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(self.gate_type, GATE_INT16 | GATE_INT32)
    }

    pub fn is_trap(&self) -> bool {
        matches!(self.gate_type, GATE_TRAP16 | GATE_TRAP32)
    }

    pub fn is_call(&self) -> bool {
        matches!(self.gate_type, GATE_CALL16 | GATE_CALL32)
    }

    pub fn is_task(&self) -> bool {
        self.gate_type == GATE_TASK
    }

    pub fn is_32bit(&self) -> bool {
        matches!(self.gate_type, GATE_CALL32 | GATE_INT32 | GATE_TRAP32)
    }
}

/// Fetch the raw descriptor named by `selector` from the GDT or LDT.
/// Returns `None` when the index reaches past the table limit.
pub fn read_descriptor<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    selector: u16,
) -> Result<Option<RawDescriptor>, Exception> {
    let index = (selector >> 3) as u64;
    let (base, limit) = if selector & SELECTOR_TI != 0 {
        (state.ldtr.base, state.ldtr.limit as u64)
    } else {
        (state.gdtr.base, state.gdtr.limit as u64)
    };

    if index * 8 + 7 > limit {
        return Ok(None);
    }

    let raw = bus.read_system_u64(base + index * 8)?;
    Ok(Some(RawDescriptor { raw }))
}

/// Write one byte into a descriptor's access field; used by the task
/// switch to set/clear TSS busy bits atomically.
pub fn write_descriptor_access<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    selector: u16,
    access: u8,
) -> Result<(), Exception> {
    let index = (selector >> 3) as u64;
    let base = if selector & SELECTOR_TI != 0 {
        state.ldtr.base
    } else {
        state.gdtr.base
    };
    bus.write_system_u8(base + index * 8 + 5, access)
}

/// Load a data/stack segment register in protected mode, rebuilding the
/// hidden cache with the architectural checks.
pub fn load_segment<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    reg: SegReg,
    selector: u16,
) -> Result<(), Exception> {
    debug_assert_ne!(reg, SegReg::Cs, "CS loads go through far transfers");

    if state.mode() == CpuMode::Real {
        state.load_segment_real(reg, selector);
        return Ok(());
    }

    let rpl = (selector & 3) as u8;
    let cpl = state.cpl();

    // Null selector: legal for data segments, traps on use; #GP for SS.
    if selector & !3 == 0 {
        if reg == SegReg::Ss {
            return Err(Exception::GP0);
        }
        let seg = state.segments.get_mut(reg);
        seg.selector = selector;
        seg.cache.present = false;
        seg.cache.base = 0;
        seg.cache.limit = 0;
        return Ok(());
    }

    let raw = read_descriptor(state, bus, selector)?
        .ok_or(Exception::GeneralProtection { selector })?;
    let cache = raw.to_cache();

    if !cache.non_system {
        return Err(Exception::GeneralProtection { selector });
    }

    if reg == SegReg::Ss {
        if !cache.is_writable_data() || cache.dpl != cpl || rpl != cpl {
            return Err(Exception::GeneralProtection { selector });
        }
        if !cache.present {
            return Err(Exception::StackFault { selector });
        }
    } else {
        if !cache.is_readable() {
            return Err(Exception::GeneralProtection { selector });
        }
        // Non-conforming code and data: DPL must dominate CPL and RPL.
        if !(cache.is_code() && cache.is_conforming()) && cache.dpl < cpl.max(rpl) {
            return Err(Exception::GeneralProtection { selector });
        }
        if !cache.present {
            return Err(Exception::SegmentNotPresent { selector });
        }
    }

    *state.segments.get_mut(reg) = SegmentRegister { selector, cache };
    Ok(())
}

/// Validate a far-transfer target code descriptor and produce the CS cache
/// to install. `set_rpl_to_cpl` reflects the JMP/CALL rule that the new
/// CS.RPL becomes the (possibly unchanged) CPL.
pub fn check_code_target(
    state: &CpuState,
    selector: u16,
    cache: &SegmentCache,
) -> Result<(), Exception> {
    let cpl = state.cpl();
    let rpl = (selector & 3) as u8;

    if !cache.is_code() {
        return Err(Exception::GeneralProtection { selector });
    }
    if cache.is_conforming() {
        if cache.dpl > cpl {
            return Err(Exception::GeneralProtection { selector });
        }
    } else {
        if rpl > cpl || cache.dpl != cpl {
            return Err(Exception::GeneralProtection { selector });
        }
    }
    if !cache.present {
        return Err(Exception::SegmentNotPresent { selector });
    }
    Ok(())
}

/// Translate segment:offset to a linear address for an access of `len`
/// bytes, applying the mode-appropriate limit and attribute checks.
pub fn linear_for(
    state: &CpuState,
    seg: SegReg,
    offset: u64,
    len: u32,
    write: bool,
) -> Result<u64, Exception> {
    let reg = state.segments.get(seg);
    let cache = &reg.cache;

    match state.mode() {
        CpuMode::Real => {
            // Unreal fallback: a cached big limit from a protected-mode
            // excursion wins over the 64 KiB clamp.
            if cache.limit > 0xFFFF {
                limit_check(seg, reg.selector, cache, offset, len)?;
                Ok(cache.base.wrapping_add(offset))
            } else {
                let offset = offset & 0xFFFF;
                Ok(((reg.selector as u64) << 4).wrapping_add(offset))
            }
        }
        CpuMode::Long if state.segments.cs.cache.long => {
            // 64-bit sub-mode: no limit checks; only FS/GS carry a base.
            let base = match seg {
                SegReg::Fs | SegReg::Gs => cache.base,
                _ => 0,
            };
            Ok(base.wrapping_add(offset))
        }
        _ => {
            if !cache.present {
                return Err(Exception::SegmentNotPresent {
                    selector: reg.selector,
                });
            }
            if write && cache.non_system && !cache.is_code() && !cache.is_writable_data() {
                return Err(Exception::GeneralProtection {
                    selector: reg.selector,
                });
            }
            if write && cache.is_code() {
                return Err(Exception::GeneralProtection {
                    selector: reg.selector,
                });
            }
            limit_check(seg, reg.selector, cache, offset, len)?;
            Ok(cache.base.wrapping_add(offset) & 0xFFFF_FFFF)
        }
    }
}

fn limit_check(
    seg: SegReg,
    selector: u16,
    cache: &SegmentCache,
    offset: u64,
    len: u32,
) -> Result<(), Exception> {
    let end = offset.wrapping_add(len as u64).wrapping_sub(1);

    let violated = if cache.is_expand_down() {
        // Valid range is (limit, 0xFFFF/0xFFFFFFFF].
        let upper = if cache.default_32 { 0xFFFF_FFFF } else { 0xFFFF };
        offset <= cache.limit as u64 || end > upper
    } else {
        end > cache.limit as u64 || end < offset
    };

    if violated {
        if seg == SegReg::Ss {
            Err(Exception::StackFault { selector })
        } else {
            Err(Exception::GeneralProtection { selector })
        }
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A flat 4 GiB ring-0 data descriptor: base 0, limit 0xFFFFF pages.
    const FLAT_DATA: u64 = 0x00CF_9200_0000_FFFF;
    const FLAT_CODE: u64 = 0x00CF_9A00_0000_FFFF;

    #[test]
    fn raw_descriptor_fields() {
        let d = RawDescriptor { raw: FLAT_DATA };
        assert_eq!(d.base(), 0);
        assert_eq!(d.limit_bytes(), 0xFFFF_FFFF);
        assert!(d.present());
        assert!(d.non_system());
        assert_eq!(d.dpl(), 0);
        assert!(d.default_32());
        assert!(!d.long());

        let code = RawDescriptor { raw: FLAT_CODE };
        assert!(code.to_cache().is_code());
        assert!(!code.to_cache().is_conforming());
    }

    #[test]
    fn descriptor_with_base_and_byte_limit() {
        // base=0x12345610, limit=0x1000 bytes, G=0, type=data rw present.
        let raw: u64 = 0x0000_9234_5610_0000 | 0x1000 | (0x12u64 << 56);
        let d = RawDescriptor { raw };
        assert_eq!(d.base(), 0x1234_5610);
        assert_eq!(d.limit_bytes(), 0x1000);
    }

    #[test]
    fn gate_fields() {
        // 32-bit interrupt gate: selector 0x08, offset 0x00401234, DPL 0, present.
        let raw: u64 = 0x1234 | (0x08u64 << 16) | (0x8Eu64 << 40) | (0x0040u64 << 48);
        let g = Gate::from_raw(raw);
        assert_eq!(g.selector, 0x08);
        assert_eq!(g.offset, 0x0040_1234);
        assert!(g.is_interrupt());
        assert!(!g.is_trap());
        assert!(g.present);
    }

    #[test]
    fn real_mode_linear_is_selector_shifted() {
        let state = CpuState::reset();
        let lin = linear_for(&state, SegReg::Ds, 0x1234, 2, false).unwrap();
        assert_eq!(lin, 0x1234);

        let mut state = CpuState::reset();
        state.load_segment_real(SegReg::Ds, 0x7000);
        let lin = linear_for(&state, SegReg::Ds, 0x0010, 1, false).unwrap();
        assert_eq!(lin, 0x70010);
    }

    #[test]
    fn real_mode_offsets_wrap_at_64k() {
        let state = CpuState::reset();
        let lin = linear_for(&state, SegReg::Ds, 0x1_0005, 1, false).unwrap();
        assert_eq!(lin, 0x0005);
    }

    #[test]
    fn unreal_mode_uses_the_cached_limit() {
        let mut state = CpuState::reset();
        state.segments.ds.cache = RawDescriptor { raw: FLAT_DATA }.to_cache();
        let lin = linear_for(&state, SegReg::Ds, 0x10_0000, 4, false).unwrap();
        assert_eq!(lin, 0x10_0000);
    }

    #[test]
    fn protected_limit_violation_is_gp_with_selector() {
        let mut state = CpuState::new(CpuMode::Protected);
        state.segments.ds.selector = 0x10;
        state.segments.ds.cache = RawDescriptor { raw: FLAT_DATA }.to_cache();
        state.segments.ds.cache.limit = 0xFFF;

        let err = linear_for(&state, SegReg::Ds, 0xFFD, 4, false).unwrap_err();
        assert_eq!(err, Exception::GeneralProtection { selector: 0x10 });
    }

    #[test]
    fn stack_limit_violation_is_ss_fault() {
        let mut state = CpuState::new(CpuMode::Protected);
        state.segments.ss.selector = 0x18;
        state.segments.ss.cache = RawDescriptor { raw: FLAT_DATA }.to_cache();
        state.segments.ss.cache.limit = 0xFFF;

        let err = linear_for(&state, SegReg::Ss, 0x2000, 4, true).unwrap_err();
        assert_eq!(err, Exception::StackFault { selector: 0x18 });
    }

    #[test]
    fn write_through_code_segment_faults() {
        let mut state = CpuState::new(CpuMode::Protected);
        state.segments.ds.selector = 0x08;
        state.segments.ds.cache = RawDescriptor { raw: FLAT_CODE }.to_cache();
        assert!(linear_for(&state, SegReg::Ds, 0, 1, true).is_err());
        assert!(linear_for(&state, SegReg::Ds, 0, 1, false).is_ok());
    }
}
