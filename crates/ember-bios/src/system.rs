//! INT 15h system services: the E820 memory map and the A20 gate.

use ember_cpu_core::state::SegReg;
use memory::MemoryBus;

use crate::ctx::BiosCtx;
use crate::{Bios, E820_TYPE_RAM, E820_TYPE_RESERVED};

const SMAP: u32 = 0x534D_4150;

/// One E820 descriptor as written to ES:DI.
struct Region {
    base: u64,
    length: u64,
    kind: u32,
}

impl Bios {
    fn e820_regions(&self) -> [Region; 2] {
        let usable = self.config.ram_size_bytes.min(0x4000_0000);
        [
            Region {
                base: 0,
                length: usable,
                kind: E820_TYPE_RAM,
            },
            Region {
                base: 0x4000_0000,
                length: 0x0100_0000,
                kind: E820_TYPE_RESERVED,
            },
        ]
    }

    pub(crate) fn int15(&mut self, ctx: &mut BiosCtx) {
        match (ctx.ah(), ctx.al()) {
            (0xE8, 0x20) => self.e820(ctx),
            (0x24, _) => self.a20_services(ctx),
            (0x88, _) => {
                // Extended memory above 1 MiB, in KiB (16-bit limited).
                let above_1m = self.config.ram_size_bytes.saturating_sub(0x10_0000) / 1024;
                ctx.set_ax(above_1m.min(0xFFFF) as u16);
                ctx.set_cf(false);
            }
            _ => {
                ctx.set_cf(true);
                ctx.set_ah(0x86);
            }
        }
    }

    fn e820(&mut self, ctx: &mut BiosCtx) {
        if ctx.edx() != SMAP {
            ctx.set_cf(true);
            ctx.set_ah(0x86);
            return;
        }
        if ctx.ecx() < 20 {
            ctx.set_cf(true);
            ctx.set_ah(0x01);
            return;
        }

        let regions = self.e820_regions();
        let index = ctx.ebx() as usize;
        let Some(region) = regions.get(index) else {
            // Continuation ran off the end; terminate cleanly.
            ctx.set_ebx(0);
            ctx.set_cf(true);
            ctx.set_ah(0x86);
            return;
        };

        let dst = ctx.linear(SegReg::Es, ctx.di());
        ctx.mem.write_u64(dst, region.base);
        ctx.mem.write_u64(dst + 8, region.length);
        ctx.mem.write_u32(dst + 16, region.kind);

        ctx.set_eax(SMAP);
        ctx.set_ecx(20);
        let next = index + 1;
        ctx.set_ebx(if next >= regions.len() { 0 } else { next as u32 });
        self.last_e820_index = index as u32;
        ctx.set_cf(false);
    }

    fn a20_services(&mut self, ctx: &mut BiosCtx) {
        match ctx.al() {
            0x00 => {
                self.a20.set_enabled(false);
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
            0x01 => {
                self.a20.set_enabled(true);
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
            0x02 => {
                ctx.set_al(u8::from(self.a20.is_enabled()));
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
            0x03 => {
                // Support bitmap: keyboard controller + fast gate.
                ctx.set_bx(0x0003);
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
            _ => {
                ctx.set_cf(true);
                ctx.set_ah(0x86);
            }
        }
    }
}
