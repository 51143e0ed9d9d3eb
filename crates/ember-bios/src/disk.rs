//! INT 13h disk services: CHS transfers, EDD extensions and the El Torito
//! boot-information packet.

use ember_cpu_core::state::SegReg;
use memory::MemoryBus;

use crate::ctx::BiosCtx;
use crate::geometry::{floppy_geometry, hdd_geometry, ChsGeometry};
use crate::{Bios, BiosOutcome};

// INT 13h status codes (AH on CF=1).
const STATUS_INVALID: u8 = 0x01;
const STATUS_WRITE_PROTECT: u8 = 0x03;
const STATUS_SECTOR_NOT_FOUND: u8 = 0x04;
const STATUS_CONTROLLER_FAILURE: u8 = 0x20;
const STATUS_UNSUPPORTED: u8 = 0x86;
const STATUS_LOCKED: u8 = 0xB1;

/// 512-byte sector media: floppies and fixed disks.
pub trait BlockDevice {
    fn read_sector(&mut self, lba: u64, buf: &mut [u8; 512]) -> Result<(), ()>;
    fn write_sector(&mut self, lba: u64, buf: &[u8; 512]) -> Result<(), ()>;
    fn sector_count(&self) -> u64;

    fn is_read_only(&self) -> bool {
        false
    }
}

/// What INT 13h AH=4Bh reports about the El Torito boot session.
#[derive(Clone, Copy, Debug)]
pub struct CdBootInfo {
    /// 0 = no emulation.
    pub media_type: u8,
    pub drive: u8,
    pub load_rba: u32,
    pub load_segment: u16,
    pub sector_count: u16,
}

/// 2048-byte sector media with the boot-catalog metadata.
pub trait OpticalDevice {
    fn read_sectors_2048(&mut self, lba: u64, count: usize) -> Result<Vec<u8>, ()>;
    fn sector_count(&self) -> u64;
    fn boot_info(&mut self) -> Option<CdBootInfo>;
    fn lock(&mut self);
    fn unlock(&mut self);
    fn is_locked(&self) -> bool;
}

/// The drive table the BIOS dispatches DL values across.
#[derive(Default)]
pub struct DiskSet {
    pub floppies: Vec<Box<dyn BlockDevice>>,
    pub hdds: Vec<Box<dyn BlockDevice>>,
    pub cdrom: Option<Box<dyn OpticalDevice>>,
    /// Drive number the CD answers to (El Torito no-emulation).
    pub cd_drive: u8,
}

impl DiskSet {
    pub fn fixed_disk_count(&self) -> u8 {
        self.hdds.len() as u8
    }
}

enum Target<'a> {
    Floppy(&'a mut dyn BlockDevice),
    Hdd(&'a mut dyn BlockDevice),
    Cd(&'a mut dyn OpticalDevice),
}

impl<'a> Target<'a> {
    fn geometry(&self) -> Option<ChsGeometry> {
        match self {
            Target::Floppy(d) => Some(floppy_geometry(d.sector_count() * 512)),
            Target::Hdd(d) => Some(hdd_geometry(d.sector_count())),
            Target::Cd(_) => None,
        }
    }

    fn sector_size(&self) -> usize {
        match self {
            Target::Cd(_) => 2048,
            _ => 512,
        }
    }

    fn total_sectors(&self) -> u64 {
        match self {
            Target::Floppy(d) | Target::Hdd(d) => d.sector_count(),
            Target::Cd(d) => d.sector_count(),
        }
    }
}

fn resolve<'a>(disks: &'a mut DiskSet, dl: u8) -> Option<Target<'a>> {
    if disks.cdrom.is_some() && dl == disks.cd_drive {
        return disks.cdrom.as_deref_mut().map(|d| Target::Cd(d));
    }
    if dl >= 0x80 {
        disks
            .hdds
            .get_mut((dl - 0x80) as usize)
            .map(|d| Target::Hdd(d.as_mut()))
    } else {
        disks
            .floppies
            .get_mut(dl as usize)
            .map(|d| Target::Floppy(d.as_mut()))
    }
}

impl Bios {
    pub(crate) fn int13(
        &mut self,
        ctx: &mut BiosCtx,
        disks: &mut DiskSet,
        outcome: &mut BiosOutcome,
    ) {
        let ah = ctx.ah();
        let dl = ctx.dl();

        // Reset/status work even with a slightly off DL.
        match ah {
            0x00 => {
                ctx.set_ah(0);
                ctx.set_cf(false);
                return;
            }
            0x01 => {
                ctx.set_ah(0);
                ctx.set_cf(false);
                return;
            }
            _ => {}
        }

        let drive_counts = (disks.floppies.len() as u8, disks.hdds.len() as u8);
        let Some(mut target) = resolve(disks, dl) else {
            fail(ctx, STATUS_INVALID);
            return;
        };

        match ah {
            0x02 => self.chs_read(ctx, &mut target, outcome),
            0x03 => self.chs_write(ctx, &mut target),
            0x04 | 0x05 => {
                // Verify / format: accept and report the full count.
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
            0x08 => self.drive_parameters(ctx, &target, drive_counts),
            0x15 => self.drive_type(ctx, &target),
            0x41 => {
                // Extensions check.
                if ctx.bx() == 0x55AA {
                    ctx.set_bx(0xAA55);
                    ctx.set_ah(0x30); // EDD 3.0
                    ctx.set_cx(0x0007);
                    ctx.set_cf(false);
                } else {
                    fail(ctx, STATUS_INVALID);
                }
            }
            0x42 => self.extended_read(ctx, &mut target, outcome),
            0x43 => self.extended_write(ctx, &mut target),
            0x44 | 0x47 => {
                // Extended verify / seek.
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
            0x45 => self.lock_unlock(ctx, &mut target),
            0x46 => self.eject(ctx, &mut target),
            0x48 => self.extended_parameters(ctx, &target),
            0x49 => {
                // Extended media change: no change.
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
            0x4B => self.eltorito_status(ctx, &mut target),
            _ => fail(ctx, STATUS_UNSUPPORTED),
        }
    }

    fn chs_read(&mut self, ctx: &mut BiosCtx, target: &mut Target, outcome: &mut BiosOutcome) {
        let Some(geometry) = target.geometry() else {
            fail(ctx, STATUS_INVALID);
            return;
        };
        let count = ctx.al() as usize;
        let cylinder = ctx.ch() as u32 | ((ctx.cl() as u32 & 0xC0) << 2);
        let sector = (ctx.cl() & 0x3F) as u32;
        let head = ctx.dh() as u32;

        let Some(lba) = geometry.lba(cylinder, head, sector) else {
            fail(ctx, STATUS_SECTOR_NOT_FOUND);
            return;
        };
        outcome.read_lba = Some(lba);

        let device = match target {
            Target::Floppy(d) | Target::Hdd(d) => d,
            Target::Cd(_) => unreachable!("geometry() filtered CDs"),
        };

        let mut dst = ctx.linear(SegReg::Es, ctx.bx());
        let mut buf = [0u8; 512];
        for i in 0..count {
            if device.read_sector(lba + i as u64, &mut buf).is_err() {
                ctx.set_al(i as u8);
                fail(ctx, STATUS_SECTOR_NOT_FOUND);
                return;
            }
            ctx.mem.write_bytes(dst, &buf);
            dst += 512;
        }

        ctx.set_al(count as u8);
        ctx.set_ah(0);
        ctx.set_cf(false);
    }

    fn chs_write(&mut self, ctx: &mut BiosCtx, target: &mut Target) {
        let Some(geometry) = target.geometry() else {
            fail(ctx, STATUS_INVALID);
            return;
        };
        let count = ctx.al() as usize;
        let cylinder = ctx.ch() as u32 | ((ctx.cl() as u32 & 0xC0) << 2);
        let sector = (ctx.cl() & 0x3F) as u32;
        let head = ctx.dh() as u32;

        let Some(lba) = geometry.lba(cylinder, head, sector) else {
            fail(ctx, STATUS_SECTOR_NOT_FOUND);
            return;
        };

        let device = match target {
            Target::Floppy(d) | Target::Hdd(d) => d,
            Target::Cd(_) => unreachable!(),
        };
        // Writes to write-protected media succeed as no-ops at the BIOS
        // level; the data simply does not land.
        if !device.is_read_only() {
            let mut src = ctx.linear(SegReg::Es, ctx.bx());
            let mut buf = [0u8; 512];
            for i in 0..count {
                ctx.mem.read_bytes(src, &mut buf);
                if device.write_sector(lba + i as u64, &buf).is_err() {
                    ctx.set_al(i as u8);
                    fail(ctx, STATUS_CONTROLLER_FAILURE);
                    return;
                }
                src += 512;
            }
        }

        ctx.set_al(count as u8);
        ctx.set_ah(0);
        ctx.set_cf(false);
    }

    fn drive_parameters(&mut self, ctx: &mut BiosCtx, target: &Target, counts: (u8, u8)) {
        let (floppies, hdds) = counts;
        match target {
            Target::Cd(_) => fail(ctx, STATUS_INVALID),
            Target::Floppy(d) => {
                let g = floppy_geometry(d.sector_count() * 512);
                let max_cyl = g.cylinders - 1;
                ctx.set_ch((max_cyl & 0xFF) as u8);
                ctx.set_cl(((max_cyl >> 2) as u8 & 0xC0) | g.sectors as u8);
                ctx.set_dh((g.heads - 1) as u8);
                ctx.set_dl(floppies);
                ctx.set_bx(floppy_drive_type(d.sector_count() * 512) as u16);
                // Diskette parameter table planted during BDA init.
                ctx.set_es(0xF000);
                ctx.set_di(0xEFC7);
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
            Target::Hdd(d) => {
                let g = hdd_geometry(d.sector_count());
                let max_cyl = g.cylinders - 1;
                ctx.set_ch((max_cyl & 0xFF) as u8);
                ctx.set_cl(((max_cyl >> 2) as u8 & 0xC0) | g.sectors as u8);
                ctx.set_dh((g.heads - 1) as u8);
                ctx.set_dl(hdds);
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
        }
    }

    fn drive_type(&mut self, ctx: &mut BiosCtx, target: &Target) {
        match target {
            Target::Floppy(_) => {
                ctx.set_ah(0x02); // floppy with change-line support
                ctx.set_cf(false);
            }
            Target::Hdd(d) => {
                let total = d.sector_count();
                ctx.set_ah(0x03);
                ctx.set_cx((total >> 16) as u16);
                ctx.set_dx(total as u16);
                ctx.set_cf(false);
            }
            Target::Cd(_) => {
                ctx.set_ah(0x00);
                ctx.set_cf(false);
            }
        }
    }

    fn extended_read(&mut self, ctx: &mut BiosCtx, target: &mut Target, outcome: &mut BiosOutcome) {
        let Some(dap) = read_dap(ctx) else {
            fail(ctx, STATUS_INVALID);
            return;
        };
        outcome.read_lba = Some(dap.lba);

        let sector_size = target.sector_size();
        if dap.lba + dap.count as u64 > target.total_sectors() {
            fail(ctx, STATUS_SECTOR_NOT_FOUND);
            return;
        }

        match target {
            Target::Cd(device) => match device.read_sectors_2048(dap.lba, dap.count as usize) {
                Ok(data) => {
                    ctx.mem.write_bytes(dap.buffer, &data);
                }
                Err(()) => {
                    fail(ctx, STATUS_CONTROLLER_FAILURE);
                    return;
                }
            },
            Target::Floppy(device) | Target::Hdd(device) => {
                let mut dst = dap.buffer;
                let mut buf = [0u8; 512];
                for i in 0..dap.count as u64 {
                    if device.read_sector(dap.lba + i, &mut buf).is_err() {
                        fail(ctx, STATUS_SECTOR_NOT_FOUND);
                        return;
                    }
                    ctx.mem.write_bytes(dst, &buf);
                    dst += sector_size as u64;
                }
            }
        }

        ctx.set_ah(0);
        ctx.set_cf(false);
    }

    fn extended_write(&mut self, ctx: &mut BiosCtx, target: &mut Target) {
        let Some(dap) = read_dap(ctx) else {
            fail(ctx, STATUS_INVALID);
            return;
        };

        match target {
            Target::Cd(_) => fail(ctx, STATUS_INVALID),
            Target::Floppy(device) | Target::Hdd(device) => {
                if dap.lba + dap.count as u64 > device.sector_count() {
                    fail(ctx, STATUS_SECTOR_NOT_FOUND);
                    return;
                }
                if !device.is_read_only() {
                    let mut src = dap.buffer;
                    let mut buf = [0u8; 512];
                    for i in 0..dap.count as u64 {
                        ctx.mem.read_bytes(src, &mut buf);
                        if device.write_sector(dap.lba + i, &buf).is_err() {
                            fail(ctx, STATUS_CONTROLLER_FAILURE);
                            return;
                        }
                        src += 512;
                    }
                }
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
        }
    }

    fn lock_unlock(&mut self, ctx: &mut BiosCtx, target: &mut Target) {
        match target {
            Target::Cd(device) => {
                match ctx.al() {
                    0x00 => device.lock(),
                    0x01 => device.unlock(),
                    0x02 => {}
                    _ => {
                        fail(ctx, STATUS_INVALID);
                        return;
                    }
                }
                ctx.set_al(u8::from(device.is_locked()));
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
            _ => {
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
        }
    }

    fn eject(&mut self, ctx: &mut BiosCtx, target: &mut Target) {
        match target {
            Target::Cd(device) if device.is_locked() => fail(ctx, STATUS_LOCKED),
            _ => {
                ctx.set_ah(0);
                ctx.set_cf(false);
            }
        }
    }

    fn extended_parameters(&mut self, ctx: &mut BiosCtx, target: &Target) {
        let dst = ctx.linear(SegReg::Ds, ctx.si());
        let size = ctx.mem.read_u16(dst);
        if size < 0x1A {
            fail(ctx, STATUS_INVALID);
            return;
        }

        let (cylinders, heads, sectors, total, bytes_per_sector): (u32, u32, u32, u64, u16) =
            match target {
                Target::Cd(d) => (
                    0xFFFF_FFFF,
                    0xFFFF_FFFF,
                    0xFFFF_FFFF,
                    d.sector_count(),
                    2048,
                ),
                Target::Floppy(d) => {
                    let g = floppy_geometry(d.sector_count() * 512);
                    (g.cylinders, g.heads, g.sectors, d.sector_count(), 512)
                }
                Target::Hdd(d) => {
                    let g = hdd_geometry(d.sector_count());
                    (g.cylinders, g.heads, g.sectors, d.sector_count(), 512)
                }
            };

        ctx.mem.write_u16(dst, 0x1A);
        // Flags: CHS information valid for media with real geometry.
        let flags: u16 = if matches!(target, Target::Cd(_)) { 0x0074 } else { 0x0002 };
        ctx.mem.write_u16(dst + 2, flags);
        ctx.mem.write_u32(dst + 4, cylinders);
        ctx.mem.write_u32(dst + 8, heads);
        ctx.mem.write_u32(dst + 12, sectors);
        ctx.mem.write_u64(dst + 16, total);
        ctx.mem.write_u16(dst + 0x18, bytes_per_sector);

        ctx.set_ah(0);
        ctx.set_cf(false);
    }

    fn eltorito_status(&mut self, ctx: &mut BiosCtx, target: &mut Target) {
        if ctx.al() != 0x01 {
            fail(ctx, STATUS_INVALID);
            return;
        }
        let Target::Cd(device) = target else {
            fail(ctx, STATUS_INVALID);
            return;
        };
        let Some(info) = device.boot_info() else {
            fail(ctx, STATUS_INVALID);
            return;
        };

        let dst = ctx.linear(SegReg::Ds, ctx.si());
        // El Torito v1.0 specification packet.
        ctx.mem.write_u8(dst, 0x13);
        ctx.mem.write_u8(dst + 1, info.media_type);
        ctx.mem.write_u8(dst + 2, info.drive);
        ctx.mem.write_u8(dst + 3, 0); // controller index
        ctx.mem.write_u32(dst + 4, info.load_rba);
        ctx.mem.write_u16(dst + 8, 0); // device specification
        ctx.mem.write_u16(dst + 0x0A, 0); // user buffer segment
        ctx.mem.write_u16(dst + 0x0C, info.load_segment);
        ctx.mem.write_u16(dst + 0x0E, info.sector_count);
        // CHS of the emulated image; zero for no-emulation boots.
        ctx.mem.write_u8(dst + 0x10, 0);
        ctx.mem.write_u8(dst + 0x11, 0);
        ctx.mem.write_u8(dst + 0x12, 0);

        ctx.set_ah(0);
        ctx.set_cf(false);
    }
}

fn fail(ctx: &mut BiosCtx, status: u8) {
    ctx.set_ah(status);
    ctx.set_cf(true);
}

fn floppy_drive_type(size_bytes: u64) -> u8 {
    match size_bytes {
        0..=737_280 => 3,         // 720K
        737_281..=1_228_800 => 2, // 1.2M
        1_228_801..=1_474_560 => 4,
        _ => 5, // 2.88M
    }
}

struct Dap {
    count: u16,
    buffer: u64,
    lba: u64,
}

/// Disk address packet at DS:SI; v1 (0x10, seg:off buffer) or v3 (0x18+
/// with a 64-bit flat buffer when the seg:off field is all-ones).
fn read_dap(ctx: &mut BiosCtx) -> Option<Dap> {
    let base = ctx.linear(SegReg::Ds, ctx.si());
    let size = ctx.mem.read_u8(base);
    if size < 0x10 {
        return None;
    }
    let count = ctx.mem.read_u16(base + 2);
    let offset = ctx.mem.read_u16(base + 4);
    let segment = ctx.mem.read_u16(base + 6);
    let lba = ctx.mem.read_u64(base + 8);

    let buffer = if size >= 0x18 && offset == 0xFFFF && segment == 0xFFFF {
        ctx.mem.read_u64(base + 0x10)
    } else {
        ((segment as u64) << 4).wrapping_add(offset as u64)
    };

    Some(Dap { count, buffer, lba })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floppy_types() {
        assert_eq!(floppy_drive_type(1_474_560), 4);
        assert_eq!(floppy_drive_type(1_228_800), 2);
        assert_eq!(floppy_drive_type(2_949_120), 5);
    }
}
