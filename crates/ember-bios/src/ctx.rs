//! Register and return-frame plumbing shared by every handler.

use ember_cpu_core::flags::RFlags;
use ember_cpu_core::state::{SegReg, RAX, RBX, RCX, RDX, RSI};
use ember_cpu_core::CpuState;
use memory::MemoryBus;

/// One in-flight service call: guest registers plus the IRET frame the
/// INT instruction pushed (IP, CS, FLAGS at SS:SP).
pub struct BiosCtx<'a> {
    pub cpu: &'a mut CpuState,
    pub mem: &'a mut dyn MemoryBus,
    frame: u64,
}

impl<'a> BiosCtx<'a> {
    pub fn new(cpu: &'a mut CpuState, mem: &'a mut dyn MemoryBus) -> Self {
        let ss_base = cpu.segments.ss.cache.base;
        let frame = ss_base.wrapping_add(cpu.rsp() & 0xFFFF);
        Self { cpu, mem, frame }
    }

    // --- register slices ---------------------------------------------------

    pub fn ax(&self) -> u16 {
        self.cpu.read_gpr16(RAX)
    }

    pub fn ah(&self) -> u8 {
        (self.ax() >> 8) as u8
    }

    pub fn al(&self) -> u8 {
        self.ax() as u8
    }

    pub fn bx(&self) -> u16 {
        self.cpu.read_gpr16(RBX)
    }

    pub fn bh(&self) -> u8 {
        (self.bx() >> 8) as u8
    }

    pub fn bl(&self) -> u8 {
        self.bx() as u8
    }

    pub fn cx(&self) -> u16 {
        self.cpu.read_gpr16(RCX)
    }

    pub fn ch(&self) -> u8 {
        (self.cx() >> 8) as u8
    }

    pub fn cl(&self) -> u8 {
        self.cx() as u8
    }

    pub fn dx(&self) -> u16 {
        self.cpu.read_gpr16(RDX)
    }

    pub fn dh(&self) -> u8 {
        (self.dx() >> 8) as u8
    }

    pub fn dl(&self) -> u8 {
        self.dx() as u8
    }

    pub fn ebx(&self) -> u32 {
        self.cpu.read_gpr32(RBX)
    }

    pub fn ecx(&self) -> u32 {
        self.cpu.read_gpr32(RCX)
    }

    pub fn edx(&self) -> u32 {
        self.cpu.read_gpr32(RDX)
    }

    pub fn si(&self) -> u16 {
        self.cpu.read_gpr16(RSI)
    }

    pub fn di(&self) -> u16 {
        self.cpu.read_gpr16(7)
    }

    pub fn set_ax(&mut self, value: u16) {
        self.cpu.write_gpr16(RAX, value);
    }

    pub fn set_ah(&mut self, value: u8) {
        self.set_ax((self.ax() & 0xFF) | (value as u16) << 8);
    }

    pub fn set_al(&mut self, value: u8) {
        self.set_ax((self.ax() & 0xFF00) | value as u16);
    }

    pub fn set_bx(&mut self, value: u16) {
        self.cpu.write_gpr16(RBX, value);
    }

    pub fn set_cx(&mut self, value: u16) {
        self.cpu.write_gpr16(RCX, value);
    }

    pub fn set_ch(&mut self, value: u8) {
        self.set_cx((self.cx() & 0xFF) | (value as u16) << 8);
    }

    pub fn set_cl(&mut self, value: u8) {
        self.set_cx((self.cx() & 0xFF00) | value as u16);
    }

    pub fn set_dx(&mut self, value: u16) {
        self.cpu.write_gpr16(RDX, value);
    }

    pub fn set_dh(&mut self, value: u8) {
        self.set_dx((self.dx() & 0xFF) | (value as u16) << 8);
    }

    pub fn set_dl(&mut self, value: u8) {
        self.set_dx((self.dx() & 0xFF00) | value as u16);
    }

    pub fn set_ebx(&mut self, value: u32) {
        self.cpu.write_gpr32(RBX, value);
    }

    pub fn set_ecx(&mut self, value: u32) {
        self.cpu.write_gpr32(RCX, value);
    }

    pub fn set_eax(&mut self, value: u32) {
        self.cpu.write_gpr32(RAX, value);
    }

    pub fn set_edx(&mut self, value: u32) {
        self.cpu.write_gpr32(RDX, value);
    }

    pub fn set_di(&mut self, value: u16) {
        self.cpu.write_gpr16(7, value);
    }

    // --- segments / addressing ---------------------------------------------

    pub fn seg_base(&self, seg: SegReg) -> u64 {
        self.cpu.segments.get(seg).cache.base
    }

    /// Physical address of seg:off in the handler's real-mode world.
    pub fn linear(&self, seg: SegReg, offset: u16) -> u64 {
        self.seg_base(seg).wrapping_add(offset as u64)
    }

    pub fn set_es(&mut self, selector: u16) {
        self.cpu.load_segment_real(SegReg::Es, selector);
    }

    // --- result flags -------------------------------------------------------

    /// Set CF in both the live flags and the stacked image the stub's
    /// IRET will restore.
    pub fn set_cf(&mut self, set: bool) {
        self.cpu.set_flag(RFlags::CF, set);
        self.patch_stacked_flag(RFlags::CF, set);
    }

    pub fn set_zf(&mut self, set: bool) {
        self.cpu.set_flag(RFlags::ZF, set);
        self.patch_stacked_flag(RFlags::ZF, set);
    }

    fn patch_stacked_flag(&mut self, flag: RFlags, set: bool) {
        let addr = self.frame + 4; // IP, CS, then FLAGS
        let mut flags = self.mem.read_u16(addr);
        if set {
            flags |= flag.bits() as u16;
        } else {
            flags &= !(flag.bits() as u16);
        }
        self.mem.write_u16(addr, flags);
    }

    /// Re-arm the interrupt: step the stacked return IP back over the
    /// two-byte INT instruction so it re-executes next cycle.
    pub fn rewind_return_ip(&mut self, bytes: u16) {
        let ip = self.mem.read_u16(self.frame);
        self.mem.write_u16(self.frame, ip.wrapping_sub(bytes));
    }
}
