//! INT 10h video services: text output with an ANSI CSI interpreter,
//! cursor bookkeeping through the BDA, and the VBE subset.

use ember_pc_constants::{
    BDA_CURSOR_POS_ADDR, BDA_VIDEO_COLS_ADDR, BDA_VIDEO_MODE_ADDR, VBE_LFB_BASE, VGA_TEXT_BASE,
};
use ember_cpu_core::state::SegReg;
use memory::MemoryBus;

use crate::ctx::BiosCtx;
use crate::{Bios, BiosOutcome};

/// VBE mode the firmware advertises: 1024×768 at 32bpp with a linear
/// framebuffer.
pub const VBE_MODE_LFB: u16 = 0x141;
pub const VBE_WIDTH: u16 = 1024;
pub const VBE_HEIGHT: u16 = 768;
pub const VBE_BPP: u8 = 32;

const DEFAULT_ATTR: u8 = 0x07;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SupportedVideoMode {
    pub number: u8,
    pub cols: u16,
    pub rows: u16,
    pub text: bool,
}

const SUPPORTED_MODES: &[SupportedVideoMode] = &[
    SupportedVideoMode { number: 0x00, cols: 40, rows: 25, text: true },
    SupportedVideoMode { number: 0x01, cols: 40, rows: 25, text: true },
    SupportedVideoMode { number: 0x02, cols: 80, rows: 25, text: true },
    SupportedVideoMode { number: 0x03, cols: 80, rows: 25, text: true },
    SupportedVideoMode { number: 0x07, cols: 80, rows: 25, text: true },
    SupportedVideoMode { number: 0x13, cols: 40, rows: 25, text: false },
];

#[derive(Clone, Debug, Default)]
enum AnsiState {
    #[default]
    Idle,
    Escape,
    Csi {
        params: Vec<u16>,
        current: Option<u16>,
    },
}

#[derive(Clone, Debug)]
pub(crate) struct VideoState {
    mode: u8,
    cols: u16,
    rows: u16,
    attr: u8,
    ansi: AnsiState,
    vbe_mode: Option<u16>,
}

impl Default for VideoState {
    fn default() -> Self {
        Self {
            mode: 0x03,
            cols: 80,
            rows: 25,
            attr: DEFAULT_ATTR,
            ansi: AnsiState::Idle,
            vbe_mode: None,
        }
    }
}

fn cursor(mem: &mut dyn MemoryBus) -> (u8, u8) {
    let packed = mem.read_u16(BDA_CURSOR_POS_ADDR);
    ((packed >> 8) as u8, packed as u8)
}

fn set_cursor(mem: &mut dyn MemoryBus, row: u8, col: u8) {
    mem.write_u16(BDA_CURSOR_POS_ADDR, (row as u16) << 8 | col as u16);
}

impl VideoState {
    fn cell_addr(&self, row: u8, col: u8) -> u64 {
        VGA_TEXT_BASE + (row as u64 * self.cols as u64 + col as u64) * 2
    }

    fn put_cell(&self, mem: &mut dyn MemoryBus, row: u8, col: u8, ch: u8, attr: u8) {
        let addr = self.cell_addr(row, col);
        mem.write_u8(addr, ch);
        mem.write_u8(addr + 1, attr);
    }

    fn clear(&self, mem: &mut dyn MemoryBus, attr: u8) {
        for row in 0..self.rows as u8 {
            for col in 0..self.cols as u8 {
                self.put_cell(mem, row, col, b' ', attr);
            }
        }
    }

    fn scroll_up(&self, mem: &mut dyn MemoryBus, lines: u8, attr: u8, window: (u8, u8, u8, u8)) {
        let (top, left, bottom, right) = window;
        if lines == 0 {
            for row in top..=bottom.min(self.rows as u8 - 1) {
                for col in left..=right.min(self.cols as u8 - 1) {
                    self.put_cell(mem, row, col, b' ', attr);
                }
            }
            return;
        }
        for row in top..=bottom.min(self.rows as u8 - 1) {
            for col in left..=right.min(self.cols as u8 - 1) {
                let src_row = row + lines;
                let (ch, at) = if src_row <= bottom {
                    let addr = self.cell_addr(src_row, col);
                    (mem.read_u8(addr), mem.read_u8(addr + 1))
                } else {
                    (b' ', attr)
                };
                self.put_cell(mem, row, col, ch, at);
            }
        }
    }

    fn scroll_down(&self, mem: &mut dyn MemoryBus, lines: u8, attr: u8, window: (u8, u8, u8, u8)) {
        let (top, left, bottom, right) = window;
        if lines == 0 {
            self.scroll_up(mem, 0, attr, window);
            return;
        }
        for row in (top..=bottom.min(self.rows as u8 - 1)).rev() {
            for col in left..=right.min(self.cols as u8 - 1) {
                let (ch, at) = if row >= top + lines {
                    let addr = self.cell_addr(row - lines, col);
                    (mem.read_u8(addr), mem.read_u8(addr + 1))
                } else {
                    (b' ', attr)
                };
                self.put_cell(mem, row, col, ch, at);
            }
        }
    }

    /// Plain glyph output at the cursor with wrap and bottom-line scroll.
    fn emit(&mut self, mem: &mut dyn MemoryBus, ch: u8) {
        let (mut row, mut col) = cursor(mem);
        self.put_cell(mem, row, col, ch, self.attr);
        col += 1;
        if col as u16 >= self.cols {
            col = 0;
            row += 1;
        }
        if row as u16 >= self.rows {
            row = self.rows as u8 - 1;
            self.scroll_up(
                mem,
                1,
                self.attr,
                (0, 0, self.rows as u8 - 1, self.cols as u8 - 1),
            );
        }
        set_cursor(mem, row, col);
    }

    /// Teletype byte: control characters, CSI sequences, or a glyph.
    fn teletype(&mut self, mem: &mut dyn MemoryBus, ch: u8) {
        match std::mem::take(&mut self.ansi) {
            AnsiState::Idle => match ch {
                0x1B => self.ansi = AnsiState::Escape,
                b'\r' => {
                    let (row, _) = cursor(mem);
                    set_cursor(mem, row, 0);
                }
                b'\n' => {
                    let (mut row, col) = cursor(mem);
                    row += 1;
                    if row as u16 >= self.rows {
                        row = self.rows as u8 - 1;
                        self.scroll_up(
                            mem,
                            1,
                            self.attr,
                            (0, 0, self.rows as u8 - 1, self.cols as u8 - 1),
                        );
                    }
                    set_cursor(mem, row, col);
                }
                0x08 => {
                    let (row, col) = cursor(mem);
                    if col > 0 {
                        set_cursor(mem, row, col - 1);
                    }
                }
                0x07 => {} // BEL
                b'\t' => {
                    let (_, col) = cursor(mem);
                    let spaces = 8 - (col % 8);
                    for _ in 0..spaces {
                        self.emit(mem, b' ');
                    }
                }
                _ => self.emit(mem, ch),
            },
            AnsiState::Escape => match ch {
                b'[' => {
                    self.ansi = AnsiState::Csi {
                        params: Vec::new(),
                        current: None,
                    };
                }
                _ => self.emit(mem, ch),
            },
            AnsiState::Csi {
                mut params,
                mut current,
            } => match ch {
                b'0'..=b'9' => {
                    let digit = (ch - b'0') as u16;
                    current = Some(current.unwrap_or(0).saturating_mul(10) + digit);
                    self.ansi = AnsiState::Csi { params, current };
                }
                b';' => {
                    params.push(current.take().unwrap_or(0));
                    self.ansi = AnsiState::Csi { params, current };
                }
                final_byte => {
                    if let Some(v) = current {
                        params.push(v);
                    }
                    self.csi_command(mem, final_byte, &params);
                }
            },
        }
    }

    fn csi_command(&mut self, mem: &mut dyn MemoryBus, command: u8, params: &[u16]) {
        let p = |i: usize, default: u16| params.get(i).copied().unwrap_or(default);
        match command {
            b'H' | b'f' => {
                // 1-based row;col.
                let row = (p(0, 1).max(1) - 1).min(self.rows - 1) as u8;
                let col = (p(1, 1).max(1) - 1).min(self.cols - 1) as u8;
                set_cursor(mem, row, col);
            }
            b'A' => {
                let (row, col) = cursor(mem);
                set_cursor(mem, row.saturating_sub(p(0, 1) as u8), col);
            }
            b'B' => {
                let (row, col) = cursor(mem);
                let row = (row + p(0, 1) as u8).min(self.rows as u8 - 1);
                set_cursor(mem, row, col);
            }
            b'C' => {
                let (row, col) = cursor(mem);
                let col = (col + p(0, 1) as u8).min(self.cols as u8 - 1);
                set_cursor(mem, row, col);
            }
            b'D' => {
                let (row, col) = cursor(mem);
                set_cursor(mem, row, col.saturating_sub(p(0, 1) as u8));
            }
            b'J' => {
                // Erase display; mode 2 clears and homes.
                if p(0, 0) == 2 {
                    self.clear(mem, self.attr);
                    set_cursor(mem, 0, 0);
                } else {
                    let (row, col) = cursor(mem);
                    for c in col..self.cols as u8 {
                        self.put_cell(mem, row, c, b' ', self.attr);
                    }
                    for r in row + 1..self.rows as u8 {
                        for c in 0..self.cols as u8 {
                            self.put_cell(mem, r, c, b' ', self.attr);
                        }
                    }
                }
            }
            b'K' => {
                let (row, col) = cursor(mem);
                for c in col..self.cols as u8 {
                    self.put_cell(mem, row, c, b' ', self.attr);
                }
            }
            b'm' => {
                for &sgr in params.iter().chain(params.is_empty().then_some(&0)) {
                    self.apply_sgr(sgr);
                }
            }
            _ => {}
        }
    }

    fn apply_sgr(&mut self, sgr: u16) {
        // ANSI colour order to the VGA palette nibble.
        const MAP: [u8; 8] = [0, 4, 2, 6, 1, 5, 3, 7];
        match sgr {
            0 => self.attr = DEFAULT_ATTR,
            1 => self.attr |= 0x08,
            30..=37 => self.attr = (self.attr & 0xF8) | MAP[(sgr - 30) as usize],
            40..=47 => self.attr = (self.attr & 0x8F) | MAP[(sgr - 40) as usize] << 4,
            90..=97 => self.attr = (self.attr & 0xF8) | MAP[(sgr - 90) as usize] | 0x08,
            _ => {}
        }
    }
}

impl Bios {
    pub(crate) fn int10(&mut self, ctx: &mut BiosCtx, outcome: &mut BiosOutcome) {
        match ctx.ah() {
            0x00 => {
                let requested = ctx.al() & 0x7F;
                match SUPPORTED_MODES.iter().find(|m| m.number == requested) {
                    Some(mode) => {
                        self.video.mode = mode.number;
                        self.video.cols = mode.cols;
                        self.video.rows = mode.rows;
                        self.video.attr = DEFAULT_ATTR;
                        ctx.mem.write_u8(BDA_VIDEO_MODE_ADDR, mode.number);
                        ctx.mem.write_u16(BDA_VIDEO_COLS_ADDR, mode.cols);
                        if mode.text && ctx.al() & 0x80 == 0 {
                            self.video.clear(ctx.mem, DEFAULT_ATTR);
                        }
                        set_cursor(ctx.mem, 0, 0);
                        outcome.video_mode_set = Some(mode.number);
                    }
                    None => {
                        tracing::debug!(mode = requested, "unsupported video mode requested");
                    }
                }
            }
            0x01 => {} // cursor shape
            0x02 => {
                let (row, col) = (ctx.dh(), ctx.dl());
                set_cursor(ctx.mem, row, col);
            }
            0x03 => {
                let (row, col) = cursor(ctx.mem);
                ctx.set_dh(row);
                ctx.set_dl(col);
                ctx.set_cx(0x0607); // stock cursor shape
            }
            0x05 => {} // page select: page 0 only
            0x06 => {
                let window = (ctx.ch(), ctx.cl(), ctx.dh(), ctx.dl());
                let (lines, attr) = (ctx.al(), ctx.bh());
                self.video.scroll_up(ctx.mem, lines, attr, window);
            }
            0x07 => {
                let window = (ctx.ch(), ctx.cl(), ctx.dh(), ctx.dl());
                let (lines, attr) = (ctx.al(), ctx.bh());
                self.video.scroll_down(ctx.mem, lines, attr, window);
            }
            0x08 => {
                let (row, col) = cursor(ctx.mem);
                let addr = self.video.cell_addr(row, col);
                let ch = ctx.mem.read_u8(addr);
                let attr = ctx.mem.read_u8(addr + 1);
                ctx.set_ax((attr as u16) << 8 | ch as u16);
            }
            0x09 | 0x0A => {
                // Write char (0x09 with attribute), CX times, cursor fixed.
                let (row, col) = cursor(ctx.mem);
                let count = ctx.cx().max(1);
                let attr = if ctx.ah() == 0x09 {
                    ctx.bl()
                } else {
                    let addr = self.video.cell_addr(row, col);
                    ctx.mem.read_u8(addr + 1)
                };
                let glyph = ctx.al();
                let mut r = row;
                let mut c = col;
                for _ in 0..count {
                    self.video.put_cell(ctx.mem, r, c, glyph, attr);
                    c += 1;
                    if c as u16 >= self.video.cols {
                        c = 0;
                        r += 1;
                        if r as u16 >= self.video.rows {
                            break;
                        }
                    }
                }
            }
            0x0E => {
                let ch = ctx.al();
                self.video.teletype(ctx.mem, ch);
            }
            0x0F => {
                ctx.set_al(self.video.mode);
                ctx.set_ah(self.video.cols as u8);
                ctx.set_bx(ctx.bx() & 0x00FF); // BH = active page 0
            }
            0x10 | 0x11 | 0x12 | 0x1C => {} // palette / font / EGA / state
            0x13 => self.write_string(ctx, outcome),
            0x1A => {
                // Display combination: VGA with colour display.
                ctx.set_al(0x1A);
                ctx.set_bx(0x0008);
            }
            0x4F => self.vbe(ctx, outcome),
            _ => {}
        }
    }

    fn write_string(&mut self, ctx: &mut BiosCtx, outcome: &mut BiosOutcome) {
        outcome.wrote_string = true;
        let flags = ctx.al();
        let update_cursor = flags & 0x01 != 0;
        let interleaved = flags & 0x02 != 0;
        let count = ctx.cx();
        let attr = ctx.bl();
        let src = ctx.linear(SegReg::Es, ctx.cpu.read_gpr16(5) as u16); // ES:BP

        let (saved_row, saved_col) = cursor(ctx.mem);
        let (row, col) = (ctx.dh(), ctx.dl());
        set_cursor(ctx.mem, row, col);

        let mut addr = src;
        for _ in 0..count {
            let ch = ctx.mem.read_u8(addr);
            addr += 1;
            if interleaved {
                self.video.attr = ctx.mem.read_u8(addr);
                addr += 1;
            } else {
                self.video.attr = attr;
            }
            self.video.teletype(ctx.mem, ch);
        }
        self.video.attr = DEFAULT_ATTR;

        if !update_cursor {
            set_cursor(ctx.mem, saved_row, saved_col);
        }
    }

    fn vbe(&mut self, ctx: &mut BiosCtx, outcome: &mut BiosOutcome) {
        match ctx.al() {
            0x00 => {
                // Controller info block at ES:DI.
                let dst = ctx.linear(SegReg::Es, ctx.di());
                ctx.mem.write_bytes(dst, b"VESA");
                ctx.mem.write_u16(dst + 4, 0x0200); // VBE 2.0
                // OEM string pointer: reuse the block's own tail.
                ctx.mem.write_u32(dst + 6, 0);
                ctx.mem.write_u32(dst + 10, 0); // capabilities
                // Mode list immediately after the fixed part, as a
                // real-mode far pointer back into this block.
                let list_off = ctx.di().wrapping_add(0x22);
                let es = (ctx.seg_base(SegReg::Es) >> 4) as u16;
                ctx.mem.write_u16(dst + 14, list_off);
                ctx.mem.write_u16(dst + 16, es);
                ctx.mem.write_u16(dst + 18, 256); // 16 MiB in 64K blocks
                ctx.mem.write_u16(dst + 0x22, VBE_MODE_LFB);
                ctx.mem.write_u16(dst + 0x24, 0xFFFF);
                ctx.set_ax(0x004F);
            }
            0x01 => {
                // Mode info for the single supported mode.
                let mode = ctx.cx() & 0x3FFF;
                if mode != VBE_MODE_LFB {
                    ctx.set_ax(0x014F);
                    return;
                }
                let dst = ctx.linear(SegReg::Es, ctx.di());
                for i in 0..256 {
                    ctx.mem.write_u8(dst + i, 0);
                }
                // Attributes: supported, colour, graphics, LFB.
                ctx.mem.write_u16(dst, 0x009B);
                ctx.mem.write_u16(dst + 0x10, VBE_WIDTH * 4); // bytes per scanline
                ctx.mem.write_u16(dst + 0x12, VBE_WIDTH);
                ctx.mem.write_u16(dst + 0x14, VBE_HEIGHT);
                ctx.mem.write_u8(dst + 0x19, VBE_BPP);
                ctx.mem.write_u8(dst + 0x1B, 0x06); // direct colour
                ctx.mem.write_u32(dst + 0x28, VBE_LFB_BASE as u32);
                ctx.set_ax(0x004F);
            }
            0x02 => {
                let mode = ctx.bx() & 0x3FFF;
                if mode == VBE_MODE_LFB {
                    self.video.vbe_mode = Some(ctx.bx());
                    outcome.vbe_mode_set = Some(ctx.bx());
                    ctx.set_ax(0x004F);
                } else {
                    ctx.set_ax(0x014F);
                }
            }
            0x03 => {
                ctx.set_bx(self.video.vbe_mode.unwrap_or(0x0003));
                ctx.set_ax(0x004F);
            }
            _ => ctx.set_ax(0x014F),
        }
    }
}
