//! INT 16h keyboard services.

use crate::ctx::BiosCtx;
use crate::{Bios, BiosOutcome};

/// The BIOS-visible key queue: (scancode << 8) | ascii events.
pub trait Keyboard {
    fn pop_key(&mut self) -> Option<u16>;
    fn peek_key(&mut self) -> Option<u16>;
}

impl Bios {
    pub(crate) fn int16(
        &mut self,
        ctx: &mut BiosCtx,
        kbd: &mut dyn Keyboard,
        outcome: &mut BiosOutcome,
    ) {
        match ctx.ah() {
            // Blocking read. With nothing queued, re-arm by rewinding the
            // return IP over the INT 16h so the wait re-enters next cycle
            // (a key may arrive between cycles).
            0x00 | 0x10 => match kbd.pop_key() {
                Some(key) => ctx.set_ax(key),
                None => {
                    ctx.rewind_return_ip(2);
                    outcome.waited_for_key = true;
                }
            },
            // Non-blocking peek: ZF=1 when empty.
            0x01 | 0x11 => match kbd.peek_key() {
                Some(key) => {
                    ctx.set_ax(key);
                    ctx.set_zf(false);
                }
                None => {
                    ctx.set_ax(0);
                    ctx.set_zf(true);
                }
            },
            // Shift flags.
            0x02 | 0x12 => ctx.set_al(0),
            _ => {
                ctx.set_cf(true);
                ctx.set_ah(0x86);
            }
        }
    }
}
