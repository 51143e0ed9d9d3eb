//! Control transfers that cross segments or privilege levels: far
//! JMP/CALL/RET, INT/IRET, hardware task switching and the fast system
//! call pair.

use crate::exception::Exception;
use crate::flags::RFlags;
use crate::mem::CpuBus;
use crate::segments::{
    self, Gate, SYS_LDT, SYS_TSS16_AVAIL, SYS_TSS32_AVAIL, SYS_TSS32_BUSY,
};
use crate::state::{CpuMode, CpuState, SegReg, SegmentCache, SegmentRegister};

use super::Ctx;

/// How a vector arrived; decides privilege checks and error-code pushes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InterruptKind {
    /// INT n / INT3 / INTO: gate DPL must admit the current CPL.
    Software,
    /// External (PIC/NMI) interrupt.
    Hardware,
    /// CPU exception, optionally carrying an error code.
    Exception(Option<u32>),
}

// --- stack primitives shared with the Ctx methods -------------------------

pub(crate) fn stack_mask(state: &CpuState) -> u64 {
    match state.stack_bits() {
        16 => 0xFFFF,
        32 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

pub(crate) fn push_value<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    bits: u8,
    value: u64,
) -> Result<(), Exception> {
    let size = bits as u64 / 8;
    let mask = stack_mask(state);
    let sp = state.rsp().wrapping_sub(size) & mask;
    let linear = segments::linear_for(state, SegReg::Ss, sp, size as u32, true)?;
    match bits {
        16 => bus.write_u16(linear, value as u16)?,
        32 => bus.write_u32(linear, value as u32)?,
        _ => bus.write_u64(linear, value)?,
    }
    let keep = state.rsp() & !mask;
    state.set_rsp(keep | sp);
    Ok(())
}

pub(crate) fn pop_value<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    bits: u8,
) -> Result<u64, Exception> {
    let size = bits as u64 / 8;
    let mask = stack_mask(state);
    let sp = state.rsp() & mask;
    let linear = segments::linear_for(state, SegReg::Ss, sp, size as u32, false)?;
    let value = match bits {
        16 => bus.read_u16(linear)? as u64,
        32 => bus.read_u32(linear)? as u64,
        _ => bus.read_u64(linear)?,
    };
    let keep = state.rsp() & !mask;
    state.set_rsp(keep | (sp.wrapping_add(size) & mask));
    Ok(value)
}

fn add_sp(state: &mut CpuState, delta: u64) {
    let mask = stack_mask(state);
    let sp = (state.rsp() & mask).wrapping_add(delta) & mask;
    state.set_rsp((state.rsp() & !mask) | sp);
}

fn ip_mask(bits: u8) -> u64 {
    match bits {
        16 => 0xFFFF,
        32 => 0xFFFF_FFFF,
        _ => u64::MAX,
    }
}

/// Load the CS cache for a real-mode far transfer.
fn real_mode_cs(state: &mut CpuState, selector: u16, offset: u64) {
    let mut cache = state.segments.cs.cache;
    cache.base = (selector as u64) << 4;
    if cache.limit <= 0xFFFF {
        cache = SegmentCache::flat_code16(selector);
    }
    state.write_code_segment(selector, cache);
    state.set_rip(offset & 0xFFFF);
}

// --- far transfers --------------------------------------------------------

impl<'a, B: CpuBus> Ctx<'a, B> {
    /// JMP ptr16:16/32 or JMP r/m far.
    pub(super) fn far_jump(&mut self, selector: u16, offset: u64) -> Result<(), Exception> {
        if self.state.mode() == CpuMode::Real {
            real_mode_cs(self.state, selector, offset);
            return Ok(());
        }

        if selector & !3 == 0 {
            return Err(Exception::GP0);
        }

        let raw = segments::read_descriptor(self.state, self.bus, selector)?
            .ok_or(Exception::GeneralProtection { selector })?;
        let cache = raw.to_cache();

        if cache.non_system {
            segments::check_code_target(self.state, selector, &cache)?;
            let cpl = self.state.cpl();
            self.state
                .write_code_segment((selector & !3) | cpl as u16, cache);
            self.state.set_rip(offset & ip_mask(self.target_bits(&cache)));
            Ok(())
        } else {
            match cache.seg_type {
                t if t == segments::GATE_CALL16 || t == segments::GATE_CALL32 => {
                    let gate = Gate::from_raw(raw.raw);
                    self.through_call_gate(selector, gate, false)
                }
                t if t == SYS_TSS16_AVAIL || t == SYS_TSS32_AVAIL => {
                    self.task_switch(selector, TaskSwitchSource::JmpOrCall { nested: false })
                }
                t if t == segments::GATE_TASK => {
                    let gate = Gate::from_raw(raw.raw);
                    self.task_switch(
                        gate.selector,
                        TaskSwitchSource::JmpOrCall { nested: false },
                    )
                }
                _ => Err(Exception::GeneralProtection { selector }),
            }
        }
    }

    fn target_bits(&self, cache: &SegmentCache) -> u8 {
        if cache.long {
            64
        } else if cache.default_32 {
            32
        } else {
            16
        }
    }

    /// CALL ptr16:16/32 or CALL r/m far.
    pub(super) fn far_call(&mut self, selector: u16, offset: u64) -> Result<(), Exception> {
        let bits = self.op_bits;

        if self.state.mode() == CpuMode::Real {
            let cs = self.state.segments.cs.selector as u64;
            let next = self.ip;
            push_value(self.state, self.bus, bits, cs)?;
            push_value(self.state, self.bus, bits, next)?;
            real_mode_cs(self.state, selector, offset);
            return Ok(());
        }

        if selector & !3 == 0 {
            return Err(Exception::GP0);
        }

        let raw = segments::read_descriptor(self.state, self.bus, selector)?
            .ok_or(Exception::GeneralProtection { selector })?;
        let cache = raw.to_cache();

        if cache.non_system {
            segments::check_code_target(self.state, selector, &cache)?;
            let cs = self.state.segments.cs.selector as u64;
            let next = self.ip;
            push_value(self.state, self.bus, bits, cs)?;
            push_value(self.state, self.bus, bits, next)?;
            let cpl = self.state.cpl();
            self.state
                .write_code_segment((selector & !3) | cpl as u16, cache);
            self.state.set_rip(offset & ip_mask(self.target_bits(&cache)));
            Ok(())
        } else {
            match cache.seg_type {
                t if t == segments::GATE_CALL16 || t == segments::GATE_CALL32 => {
                    let gate = Gate::from_raw(raw.raw);
                    self.through_call_gate(selector, gate, true)
                }
                t if t == SYS_TSS16_AVAIL || t == SYS_TSS32_AVAIL => {
                    self.task_switch(selector, TaskSwitchSource::JmpOrCall { nested: true })
                }
                t if t == segments::GATE_TASK => {
                    let gate = Gate::from_raw(raw.raw);
                    self.task_switch(gate.selector, TaskSwitchSource::JmpOrCall { nested: true })
                }
                _ => Err(Exception::GeneralProtection { selector }),
            }
        }
    }

    /// Transfer through a call gate, optionally pushing a return frame
    /// (CALL) and copying parameters on a privilege change.
    fn through_call_gate(
        &mut self,
        gate_selector: u16,
        gate: Gate,
        is_call: bool,
    ) -> Result<(), Exception> {
        let cpl = self.state.cpl();
        let rpl = (gate_selector & 3) as u8;
        if gate.dpl < cpl || gate.dpl < rpl {
            return Err(Exception::GeneralProtection {
                selector: gate_selector,
            });
        }
        if !gate.present {
            return Err(Exception::SegmentNotPresent {
                selector: gate_selector,
            });
        }

        let code_selector = gate.selector;
        if code_selector & !3 == 0 {
            return Err(Exception::GP0);
        }
        let raw = segments::read_descriptor(self.state, self.bus, code_selector)?
            .ok_or(Exception::GeneralProtection {
                selector: code_selector,
            })?;
        let cache = raw.to_cache();
        if !cache.is_code() || !cache.present {
            return Err(Exception::GeneralProtection {
                selector: code_selector,
            });
        }

        let gate_bits = if gate.is_32bit() { 32 } else { 16 };
        let target_cpl = if cache.is_conforming() { cpl } else { cache.dpl };

        if is_call && target_cpl < cpl {
            // Inter-privilege call: switch to the stack from the TSS, copy
            // parameters, push the old stack and return address.
            let old_cs = self.state.segments.cs.selector as u64;
            let old_ss = self.state.segments.ss.selector as u64;
            let old_sp = self.state.rsp() & stack_mask(self.state);

            let mut params = Vec::with_capacity(gate.word_count as usize);
            for i in 0..gate.word_count as u64 {
                let off = (old_sp + i * (gate_bits as u64 / 8)) & stack_mask(self.state);
                let lin =
                    segments::linear_for(self.state, SegReg::Ss, off, gate_bits as u32 / 8, false)?;
                params.push(self.read_mem(lin, gate_bits)?);
            }

            let (new_ss_sel, new_sp) = self.tss_stack_for(target_cpl)?;
            self.load_inner_stack(new_ss_sel, new_sp, target_cpl)?;

            self.state.set_cpl(target_cpl);
            self.state
                .write_code_segment((code_selector & !3) | target_cpl as u16, cache);

            push_value(self.state, self.bus, gate_bits, old_ss)?;
            push_value(self.state, self.bus, gate_bits, old_sp)?;
            for p in params.iter().rev() {
                push_value(self.state, self.bus, gate_bits, *p)?;
            }
            push_value(self.state, self.bus, gate_bits, old_cs)?;
            push_value(self.state, self.bus, gate_bits, self.ip)?;
        } else {
            if is_call {
                let cs = self.state.segments.cs.selector as u64;
                let next = self.ip;
                push_value(self.state, self.bus, gate_bits, cs)?;
                push_value(self.state, self.bus, gate_bits, next)?;
            }
            self.state
                .write_code_segment((code_selector & !3) | cpl as u16, cache);
        }

        self.state.set_rip(gate.offset & ip_mask(gate_bits));
        Ok(())
    }

    /// RETF (+imm): pop IP and CS; on privilege return pop SS:SP as well.
    pub(super) fn far_ret(&mut self, extra_pop: u64) -> Result<(), Exception> {
        let bits = self.op_bits;

        if self.state.mode() == CpuMode::Real {
            let ip = pop_value(self.state, self.bus, bits)?;
            let cs = pop_value(self.state, self.bus, bits)? as u16;
            add_sp(self.state, extra_pop);
            real_mode_cs(self.state, cs, ip);
            return Ok(());
        }

        let ip = pop_value(self.state, self.bus, bits)?;
        let selector = pop_value(self.state, self.bus, bits)? as u16;
        let rpl = (selector & 3) as u8;
        let cpl = self.state.cpl();

        if selector & !3 == 0 {
            return Err(Exception::GP0);
        }
        if rpl < cpl {
            return Err(Exception::GeneralProtection { selector });
        }

        let raw = segments::read_descriptor(self.state, self.bus, selector)?
            .ok_or(Exception::GeneralProtection { selector })?;
        let cache = raw.to_cache();
        if !cache.is_code() || !cache.present {
            return Err(Exception::GeneralProtection { selector });
        }

        // Discard gate parameters before a possible stack switch.
        add_sp(self.state, extra_pop);

        if rpl > cpl {
            let new_sp = pop_value(self.state, self.bus, bits)?;
            let new_ss = pop_value(self.state, self.bus, bits)? as u16;
            self.state.set_cpl(rpl);
            segments::load_segment(self.state, self.bus, SegReg::Ss, new_ss)?;
            let mask = stack_mask(self.state);
            self.state.set_rsp((self.state.rsp() & !mask) | (new_sp & mask));
            self.validate_data_segments_for_cpl();
        }

        self.state.write_code_segment(selector, cache);
        self.state.set_rip(ip & ip_mask(self.target_bits(&cache)));
        Ok(())
    }

    /// On a return to lesser privilege, data segments whose DPL is below
    /// the new CPL are emptied.
    fn validate_data_segments_for_cpl(&mut self) {
        let cpl = self.state.cpl();
        for reg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
            let seg = self.state.segments.get(reg);
            if seg.cache.non_system
                && !(seg.cache.is_code() && seg.cache.is_conforming())
                && seg.cache.dpl < cpl
            {
                let seg = self.state.segments.get_mut(reg);
                seg.selector = 0;
                seg.cache.present = false;
            }
        }
    }

    // --- IRET -------------------------------------------------------------

    pub(super) fn iret(&mut self) -> Result<(), Exception> {
        let bits = if self.in_long64() && self.prefixes.rex_w() {
            64
        } else {
            self.op_bits
        };

        if self.state.mode() == CpuMode::Real {
            let ip = pop_value(self.state, self.bus, bits)?;
            let cs = pop_value(self.state, self.bus, bits)? as u16;
            let fl = pop_value(self.state, self.bus, bits)?;
            self.state.write_flags_checked(fl, bits);
            real_mode_cs(self.state, cs, ip);
            return Ok(());
        }

        if self.state.flag(RFlags::NT) && self.state.mode() == CpuMode::Protected {
            // Task return through the backlink word of the current TSS.
            let backlink = self.bus.read_system_u16(self.state.tr.base)?;
            return self.task_switch(backlink, TaskSwitchSource::Iret);
        }

        let ip = pop_value(self.state, self.bus, bits)?;
        let selector = pop_value(self.state, self.bus, bits)? as u16;
        let fl = pop_value(self.state, self.bus, bits)?;

        let rpl = (selector & 3) as u8;
        let cpl = self.state.cpl();
        if selector & !3 == 0 {
            return Err(Exception::GP0);
        }
        if rpl < cpl {
            return Err(Exception::GeneralProtection { selector });
        }

        let raw = segments::read_descriptor(self.state, self.bus, selector)?
            .ok_or(Exception::GeneralProtection { selector })?;
        let cache = raw.to_cache();
        if !cache.is_code() || !cache.present {
            return Err(Exception::GeneralProtection { selector });
        }

        // 64-bit IRET always pops SS:RSP; legacy only on a CPL change.
        if rpl > cpl || self.in_long64() {
            let new_sp = pop_value(self.state, self.bus, bits)?;
            let new_ss = pop_value(self.state, self.bus, bits)? as u16;
            self.state.set_cpl(rpl);
            if new_ss & !3 != 0 {
                segments::load_segment(self.state, self.bus, SegReg::Ss, new_ss)?;
            } else {
                // Null SS is legal when returning to 64-bit CPL0.
                let ss = self.state.segments.get_mut(SegReg::Ss);
                ss.selector = new_ss;
                ss.cache.present = false;
            }
            let mask = stack_mask(self.state);
            self.state
                .set_rsp((self.state.rsp() & !mask) | (new_sp & mask));
            self.validate_data_segments_for_cpl();
        }

        self.state.write_flags_checked(fl, bits);
        self.state.write_code_segment(selector, cache);
        self.state.set_rip(ip & ip_mask(self.target_bits(&cache)));
        Ok(())
    }

    // --- task switch --------------------------------------------------------

    pub(super) fn task_switch(
        &mut self,
        selector: u16,
        source: TaskSwitchSource,
    ) -> Result<(), Exception> {
        task_switch(self.state, self.bus, selector, source, self.ip)
    }

    fn tss_stack_for(&mut self, dpl: u8) -> Result<(u16, u64), Exception> {
        tss_stack_for(self.state, self.bus, dpl)
    }

    fn load_inner_stack(&mut self, ss_sel: u16, sp: u64, cpl: u8) -> Result<(), Exception> {
        let saved_cpl = self.state.cpl();
        self.state.set_cpl(cpl);
        let result = segments::load_segment(self.state, self.bus, SegReg::Ss, ss_sel);
        if result.is_err() {
            self.state.set_cpl(saved_cpl);
            result?;
        }
        let mask = stack_mask(self.state);
        self.state.set_rsp((self.state.rsp() & !mask) | (sp & mask));
        Ok(())
    }

    // --- SYSCALL / SYSRET ---------------------------------------------------

    pub(super) fn syscall(&mut self) -> Result<(), Exception> {
        use crate::state::EFER_SCE;
        if !self.state.long_mode_active() || self.state.msr.efer & EFER_SCE == 0 {
            return Err(Exception::InvalidOpcode);
        }

        // RCX <- next RIP, R11 <- RFLAGS.
        self.state.write_gpr64(1, self.ip);
        self.state.write_gpr64(11, self.state.rflags());

        let star = self.state.msr.star;
        let cs_sel = ((star >> 32) & 0xFFFC) as u16;
        let mut cs = SegmentCache::flat_code16(cs_sel);
        cs.long = true;
        cs.default_32 = false;
        cs.seg_type = 0b1011;
        cs.dpl = 0;
        cs.base = 0;
        cs.limit = 0xFFFF_FFFF;
        self.state.set_cpl(0);
        self.state.write_code_segment(cs_sel, cs);

        let mut ss = SegmentCache::real_mode(cs_sel + 8);
        ss.base = 0;
        ss.limit = 0xFFFF_FFFF;
        ss.default_32 = true;
        self.state.segments.ss = SegmentRegister {
            selector: cs_sel + 8,
            cache: ss,
        };

        let masked = self.state.rflags() & !self.state.msr.fmask;
        self.state.set_rflags(masked & !(RFlags::RF.bits()));
        self.state.set_rip(self.state.msr.lstar);
        Ok(())
    }

    pub(super) fn sysret(&mut self) -> Result<(), Exception> {
        use crate::state::EFER_SCE;
        if !self.state.long_mode_active() || self.state.msr.efer & EFER_SCE == 0 {
            return Err(Exception::InvalidOpcode);
        }
        if self.state.cpl() != 0 {
            return Err(Exception::GP0);
        }

        let star = self.state.msr.star;
        let base = ((star >> 48) & 0xFFFC) as u16;
        let (cs_sel, long) = if self.prefixes.rex_w() {
            (base + 16, true)
        } else {
            (base, false)
        };

        let mut cs = SegmentCache::flat_code16(cs_sel | 3);
        cs.long = long;
        cs.default_32 = !long;
        cs.seg_type = 0b1011;
        cs.dpl = 3;
        cs.base = 0;
        cs.limit = 0xFFFF_FFFF;
        self.state.set_cpl(3);
        self.state.write_code_segment(cs_sel | 3, cs);

        let ss_sel = base + 8;
        let mut ss = SegmentCache::real_mode(ss_sel | 3);
        ss.base = 0;
        ss.limit = 0xFFFF_FFFF;
        ss.default_32 = true;
        ss.dpl = 3;
        self.state.segments.ss = SegmentRegister {
            selector: ss_sel | 3,
            cache: ss,
        };

        let r11 = self.state.read_gpr64(11);
        self.state.write_flags_checked(r11, 64);
        self.state.set_rip(self.state.read_gpr64(1));
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskSwitchSource {
    /// JMP/CALL to a TSS or task gate; CALL and gated interrupts nest.
    JmpOrCall { nested: bool },
    /// IRET with NT set: returning to the back-linked task.
    Iret,
}

// 32-bit TSS field offsets.
const TSS_BACKLINK: u64 = 0x00;
const TSS_CR3: u64 = 0x1C;
const TSS_EIP: u64 = 0x20;
const TSS_EFLAGS: u64 = 0x24;
const TSS_GPR: u64 = 0x28; // EAX..EDI, 8 dwords
const TSS_SEG: u64 = 0x48; // ES,CS,SS,DS,FS,GS, 6 dwords
const TSS_LDT: u64 = 0x60;

/// Inner stack pointer for a privilege transition, from the current TSS.
pub(crate) fn tss_stack_for<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    dpl: u8,
) -> Result<(u16, u64), Exception> {
    let base = state.tr.base;
    if state.long_mode_active() {
        let rsp = bus.read_system_u64(base + 4 + dpl as u64 * 8)?;
        Ok((0, rsp))
    } else {
        let esp = bus.read_system_u32(base + 4 + dpl as u64 * 8)?;
        let ss = bus.read_system_u16(base + 8 + dpl as u64 * 8)?;
        Ok((ss, esp as u64))
    }
}

/// Hardware task switch through a 32-bit TSS.
///
/// Atomic with respect to the guest: every fault is raised before any
/// state is committed, then the register file swaps in one motion.
pub(crate) fn task_switch<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    selector: u16,
    source: TaskSwitchSource,
    next_ip: u64,
) -> Result<(), Exception> {
    let raw = segments::read_descriptor(state, bus, selector)?
        .ok_or(Exception::GeneralProtection { selector })?;
    let desc = raw.to_cache();

    let expects_busy = source == TaskSwitchSource::Iret;
    match desc.seg_type {
        t if t == SYS_TSS32_AVAIL && !expects_busy => {}
        t if t == SYS_TSS32_BUSY && expects_busy => {}
        t if t == SYS_TSS16_AVAIL => {
            // 16-bit TSSs are not modelled.
            return Err(Exception::InvalidTss { selector });
        }
        _ => return Err(Exception::GeneralProtection { selector }),
    }
    if !desc.present {
        return Err(Exception::SegmentNotPresent { selector });
    }
    if desc.limit < 0x67 {
        return Err(Exception::InvalidTss { selector });
    }

    let old_tss = state.tr.base;
    let new_tss = desc.base;

    // Save the outgoing context into the old TSS.
    if state.tr.selector != 0 {
        bus.write_system_u32(old_tss + TSS_EIP, next_ip as u32)?;
        bus.write_system_u32(old_tss + TSS_EFLAGS, state.rflags() as u32)?;
        for i in 0..8 {
            bus.write_system_u32(old_tss + TSS_GPR + i as u64 * 4, state.read_gpr32(i))?;
        }
        for (i, seg) in SegReg::ALL.iter().enumerate() {
            bus.write_system_u32(
                old_tss + TSS_SEG + i as u64 * 4,
                state.segments.get(*seg).selector as u32,
            )?;
        }
        bus.write_system_u32(old_tss + TSS_CR3, state.control.cr3 as u32)?;
    }

    // Busy-bit bookkeeping via byte writes to the access bytes.
    match source {
        TaskSwitchSource::JmpOrCall { nested } => {
            if !nested && state.tr.selector != 0 {
                clear_busy(state, bus, state.tr.selector)?;
            }
            set_busy(state, bus, selector)?;
            if nested && state.tr.selector != 0 {
                bus.write_system_u16(new_tss + TSS_BACKLINK, state.tr.selector)?;
            }
        }
        TaskSwitchSource::Iret => {
            let old_selector = state.tr.selector;
            if old_selector != 0 {
                clear_busy(state, bus, old_selector)?;
            }
        }
    }

    // Load the incoming context.
    let new_cr3 = bus.read_system_u32(new_tss + TSS_CR3)? as u64;
    let new_eip = bus.read_system_u32(new_tss + TSS_EIP)? as u64;
    let mut new_flags = bus.read_system_u32(new_tss + TSS_EFLAGS)? as u64;
    let mut gpr = [0u32; 8];
    for (i, r) in gpr.iter_mut().enumerate() {
        *r = bus.read_system_u32(new_tss + TSS_GPR + i as u64 * 4)?;
    }
    let mut selectors = [0u16; 6];
    for (i, s) in selectors.iter_mut().enumerate() {
        *s = bus.read_system_u32(new_tss + TSS_SEG + i as u64 * 4)? as u16;
    }
    let new_ldt = bus.read_system_u32(new_tss + TSS_LDT)? as u16;

    if let TaskSwitchSource::JmpOrCall { nested: true } = source {
        new_flags |= RFlags::NT.bits();
    }

    state.tr.selector = selector;
    state.tr.base = new_tss;
    state.tr.limit = desc.limit;
    state.tr.seg_type = SYS_TSS32_BUSY;

    state.write_cr3(new_cr3);
    bus.sync(state);
    for (i, r) in gpr.iter().enumerate() {
        state.write_gpr32(i, *r);
    }
    state.set_rflags(new_flags);

    // LDTR first so segment loads can resolve LDT selectors.
    if new_ldt & !3 != 0 {
        if let Some(ldt_raw) = segments::read_descriptor(state, bus, new_ldt & !0x4)? {
            if ldt_raw.seg_type() == SYS_LDT {
                state.ldtr.selector = new_ldt;
                state.ldtr.base = ldt_raw.base();
                state.ldtr.limit = ldt_raw.limit_bytes();
                state.ldtr.seg_type = SYS_LDT;
            }
        }
    } else {
        state.ldtr = Default::default();
    }

    // CS decides the new CPL; load it first, then the data segments.
    let cs_sel = selectors[1];
    let cs_raw = segments::read_descriptor(state, bus, cs_sel)?
        .ok_or(Exception::InvalidTss { selector: cs_sel })?;
    let cs_cache = cs_raw.to_cache();
    if !cs_cache.is_code() {
        return Err(Exception::InvalidTss { selector: cs_sel });
    }
    state.set_cpl((cs_sel & 3) as u8);
    state.write_code_segment(cs_sel, cs_cache);
    state.set_rip(new_eip);

    for (reg, sel) in [
        (SegReg::Es, selectors[0]),
        (SegReg::Ss, selectors[2]),
        (SegReg::Ds, selectors[3]),
        (SegReg::Fs, selectors[4]),
        (SegReg::Gs, selectors[5]),
    ] {
        if sel & !3 == 0 && reg != SegReg::Ss {
            let seg = state.segments.get_mut(reg);
            seg.selector = sel;
            seg.cache.present = false;
            continue;
        }
        segments::load_segment(state, bus, reg, sel)
            .map_err(|_| Exception::InvalidTss { selector: sel })?;
    }

    Ok(())
}

fn set_busy<B: CpuBus>(state: &CpuState, bus: &mut B, selector: u16) -> Result<(), Exception> {
    modify_access(state, bus, selector, |a| a | 0x02)
}

fn clear_busy<B: CpuBus>(state: &CpuState, bus: &mut B, selector: u16) -> Result<(), Exception> {
    modify_access(state, bus, selector, |a| a & !0x02)
}

fn modify_access<B: CpuBus>(
    state: &CpuState,
    bus: &mut B,
    selector: u16,
    f: impl FnOnce(u8) -> u8,
) -> Result<(), Exception> {
    let raw = segments::read_descriptor(state, bus, selector)?
        .ok_or(Exception::GeneralProtection { selector })?;
    segments::write_descriptor_access(state, bus, selector, f(raw.access()))
}

// --- interrupt delivery ----------------------------------------------------

/// Deliver `vector` through the IVT/IDT, pushing the return frame on the
/// target stack. Shared by software INT, exceptions and hardware IRQs.
pub fn deliver_interrupt<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    kind: InterruptKind,
) -> Result<(), Exception> {
    state.halted = false;

    match state.mode() {
        CpuMode::Real => deliver_real(state, bus, vector),
        CpuMode::Protected => deliver_protected(state, bus, vector, kind),
        CpuMode::Long => deliver_long(state, bus, vector, kind),
    }
}

fn deliver_real<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
) -> Result<(), Exception> {
    let entry = state.idtr.base + vector as u64 * 4;
    let offset = bus.read_system_u16(entry)?;
    let segment = bus.read_system_u16(entry + 2)?;

    push_value(state, bus, 16, state.rflags())?;
    push_value(state, bus, 16, state.segments.cs.selector as u64)?;
    push_value(state, bus, 16, state.rip())?;

    state.set_flag(RFlags::IF, false);
    state.set_flag(RFlags::TF, false);
    state.set_flag(RFlags::AC, false);

    real_mode_cs(state, segment, offset as u64);
    Ok(())
}

fn deliver_protected<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    kind: InterruptKind,
) -> Result<(), Exception> {
    let entry = vector as u64 * 8;
    if entry + 7 > state.idtr.limit as u64 {
        return Err(Exception::GeneralProtection {
            selector: ext_selector(vector, kind),
        });
    }
    let raw = bus.read_system_u64(state.idtr.base + entry)?;
    let gate = Gate::from_raw(raw);

    if gate.is_task() {
        return task_switch(
            state,
            bus,
            gate.selector,
            TaskSwitchSource::JmpOrCall { nested: true },
            state.rip(),
        );
    }

    if !gate.is_interrupt() && !gate.is_trap() {
        return Err(Exception::GeneralProtection {
            selector: ext_selector(vector, kind),
        });
    }
    if kind == InterruptKind::Software && gate.dpl < state.cpl() {
        return Err(Exception::GeneralProtection {
            selector: vector as u16 * 8 | 2,
        });
    }
    if !gate.present {
        return Err(Exception::SegmentNotPresent {
            selector: ext_selector(vector, kind),
        });
    }

    let code_selector = gate.selector;
    let raw = segments::read_descriptor(state, bus, code_selector)?
        .ok_or(Exception::GeneralProtection {
            selector: code_selector,
        })?;
    let cache = raw.to_cache();
    if !cache.is_code() || !cache.present {
        return Err(Exception::GeneralProtection {
            selector: code_selector,
        });
    }

    let bits = if gate.is_32bit() { 32 } else { 16 };
    let cpl = state.cpl();
    let target_cpl = if cache.is_conforming() || cache.dpl >= cpl {
        cpl
    } else {
        cache.dpl
    };

    let old_flags = state.rflags();

    if target_cpl < cpl {
        let old_ss = state.segments.ss.selector as u64;
        let old_sp = state.rsp() & stack_mask(state);

        let (ss_sel, sp) = tss_stack_for(state, bus, target_cpl)?;
        state.set_cpl(target_cpl);
        segments::load_segment(state, bus, SegReg::Ss, ss_sel)
            .map_err(|_| Exception::InvalidTss { selector: ss_sel })?;
        let mask = stack_mask(state);
        state.set_rsp((state.rsp() & !mask) | (sp & mask));

        push_value(state, bus, bits, old_ss)?;
        push_value(state, bus, bits, old_sp)?;
    }

    push_value(state, bus, bits, old_flags)?;
    push_value(state, bus, bits, state.segments.cs.selector as u64)?;
    push_value(state, bus, bits, state.rip())?;
    if let InterruptKind::Exception(Some(code)) = kind {
        push_value(state, bus, bits, code as u64)?;
    }

    if gate.is_interrupt() {
        state.set_flag(RFlags::IF, false);
    }
    state.set_flag(RFlags::TF, false);
    state.set_flag(RFlags::NT, false);

    state.set_cpl(target_cpl);
    state.write_code_segment((code_selector & !3) | target_cpl as u16, cache);
    state.set_rip(gate.offset & ip_mask(bits));
    Ok(())
}

fn deliver_long<B: CpuBus>(
    state: &mut CpuState,
    bus: &mut B,
    vector: u8,
    kind: InterruptKind,
) -> Result<(), Exception> {
    let entry = vector as u64 * 16;
    if entry + 15 > state.idtr.limit as u64 {
        return Err(Exception::GeneralProtection {
            selector: ext_selector(vector, kind),
        });
    }
    let lo = bus.read_system_u64(state.idtr.base + entry)?;
    let hi = bus.read_system_u64(state.idtr.base + entry + 8)?;
    let gate = Gate::from_raw(lo);
    let offset = (gate.offset & 0xFFFF_FFFF) | (hi & 0xFFFF_FFFF) << 32;

    if !gate.is_interrupt() && !gate.is_trap() {
        return Err(Exception::GeneralProtection {
            selector: ext_selector(vector, kind),
        });
    }
    if kind == InterruptKind::Software && gate.dpl < state.cpl() {
        return Err(Exception::GeneralProtection {
            selector: vector as u16 * 8 | 2,
        });
    }
    if !gate.present {
        return Err(Exception::SegmentNotPresent {
            selector: ext_selector(vector, kind),
        });
    }

    let code_selector = gate.selector;
    let raw = segments::read_descriptor(state, bus, code_selector)?
        .ok_or(Exception::GeneralProtection {
            selector: code_selector,
        })?;
    let cache = raw.to_cache();
    if !cache.is_code() || !cache.present {
        return Err(Exception::GeneralProtection {
            selector: code_selector,
        });
    }

    let cpl = state.cpl();
    let target_cpl = if cache.is_conforming() { cpl } else { cache.dpl };

    let old_ss = state.segments.ss.selector as u64;
    let old_sp = state.rsp();
    let old_flags = state.rflags();

    if target_cpl < cpl {
        let (_, rsp0) = tss_stack_for(state, bus, target_cpl)?;
        state.set_cpl(target_cpl);
        let ss = state.segments.get_mut(SegReg::Ss);
        ss.selector = 0;
        ss.cache = SegmentCache::real_mode(0);
        ss.cache.base = 0;
        state.set_rsp(rsp0 & !0xF);
    } else {
        // Interrupts in 64-bit mode align the stack regardless.
        state.set_rsp(state.rsp() & !0xF);
    }

    push_value(state, bus, 64, old_ss)?;
    push_value(state, bus, 64, old_sp)?;
    push_value(state, bus, 64, old_flags)?;
    push_value(state, bus, 64, state.segments.cs.selector as u64)?;
    push_value(state, bus, 64, state.rip())?;
    if let InterruptKind::Exception(Some(code)) = kind {
        push_value(state, bus, 64, code as u64)?;
    }

    if gate.is_interrupt() {
        state.set_flag(RFlags::IF, false);
    }
    state.set_flag(RFlags::TF, false);

    state.set_cpl(target_cpl);
    state.write_code_segment((code_selector & !3) | target_cpl as u16, cache);
    state.set_rip(offset);
    Ok(())
}

fn ext_selector(vector: u8, kind: InterruptKind) -> u16 {
    let ext = u16::from(!matches!(kind, InterruptKind::Software));
    (vector as u16) * 8 | 2 | ext
}
