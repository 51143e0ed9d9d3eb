//! INT 1Ah time-of-day services.

use ember_devices::cmos::to_bcd;
use memory::MemoryBus;
use ember_pc_constants::{BDA_MIDNIGHT_FLAG_ADDR, BDA_TICK_COUNT_ADDR};

use crate::ctx::BiosCtx;
use crate::Bios;

/// Civil time pieces from a Unix timestamp, mirroring the RTC.
fn civil(secs: u64) -> (u16, u8, u8, u8, u8, u8) {
    let days = (secs / 86_400) as i64;
    let tod = secs % 86_400;
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u8;
    let m = (if mp < 10 { mp + 3 } else { mp - 9 }) as u8;
    let year = (if m <= 2 { y + 1 } else { y }) as u16;
    (
        year,
        m,
        d,
        (tod / 3600) as u8,
        (tod % 3600 / 60) as u8,
        (tod % 60) as u8,
    )
}

impl Bios {
    pub(crate) fn int1a(&mut self, ctx: &mut BiosCtx) {
        match ctx.ah() {
            0x00 => {
                // Tick count since midnight; AL reports (and clears) the
                // rollover flag.
                let ticks = ctx.mem.read_u32(BDA_TICK_COUNT_ADDR);
                let midnight = ctx.mem.read_u8(BDA_MIDNIGHT_FLAG_ADDR);
                ctx.mem.write_u8(BDA_MIDNIGHT_FLAG_ADDR, 0);
                ctx.set_cx((ticks >> 16) as u16);
                ctx.set_dx(ticks as u16);
                ctx.set_al(midnight);
                ctx.set_cf(false);
            }
            0x02 => {
                // RTC time in BCD: CH=hours, CL=minutes, DH=seconds.
                let (_, _, _, h, m, s) = civil(self.clock.unix_secs());
                ctx.set_ch(to_bcd(h));
                ctx.set_cl(to_bcd(m));
                ctx.set_dh(to_bcd(s));
                ctx.set_dl(0); // no DST
                ctx.set_cf(false);
            }
            0x04 => {
                // RTC date in BCD: CH=century, CL=year, DH=month, DL=day.
                let (year, month, day, _, _, _) = civil(self.clock.unix_secs());
                ctx.set_ch(to_bcd((year / 100) as u8));
                ctx.set_cl(to_bcd((year % 100) as u8));
                ctx.set_dh(to_bcd(month));
                ctx.set_dl(to_bcd(day));
                ctx.set_cf(false);
            }
            _ => ctx.set_cf(true),
        }
    }
}
