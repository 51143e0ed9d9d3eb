use ember_bios::{Bios, BiosConfig, DiskSet, Keyboard};
use ember_cpu_core::state::{CpuMode, CpuState, SegReg, RAX, RBX, RCX, RDX};
use ember_devices::Clock;
use ember_pc_constants::{BDA_CURSOR_POS_ADDR, VGA_TEXT_BASE};
use memory::{A20Gate, GuestRam, MemoryBus};

struct NoKeys;

impl Keyboard for NoKeys {
    fn pop_key(&mut self) -> Option<u16> {
        None
    }
    fn peek_key(&mut self) -> Option<u16> {
        None
    }
}

struct Rig {
    bios: Bios,
    cpu: CpuState,
    mem: GuestRam,
    disks: DiskSet,
}

fn rig() -> Rig {
    let mut cpu = CpuState::new(CpuMode::Real);
    cpu.load_segment_real(SegReg::Ss, 0);
    cpu.load_segment_real(SegReg::Es, 0);
    cpu.set_rsp(0x6FFA);

    let mut mem = GuestRam::new(2 * 1024 * 1024);
    mem.write_u16(0x6FFA, 0x1234);
    mem.write_u16(0x6FFC, 0);
    mem.write_u16(0x6FFE, 0x0202);

    let bios = Bios::new(BiosConfig::default(), Clock::new(), A20Gate::new(true));
    bios.init_bda(&mut mem, 0);

    Rig {
        bios,
        cpu,
        mem,
        disks: DiskSet::default(),
    }
}

impl Rig {
    fn int10(&mut self) -> ember_bios::BiosOutcome {
        self.bios
            .handle_interrupt(0x10, &mut self.cpu, &mut self.mem, &mut self.disks, &mut NoKeys)
    }

    fn teletype(&mut self, ch: u8) {
        self.cpu.write_gpr16(RAX, 0x0E00 | ch as u16);
        self.int10();
    }

    fn teletype_str(&mut self, s: &[u8]) {
        for &b in s {
            self.teletype(b);
        }
    }

    fn cell(&mut self, row: u64, col: u64) -> (u8, u8) {
        let addr = VGA_TEXT_BASE + (row * 80 + col) * 2;
        (self.mem.read_u8(addr), self.mem.read_u8(addr + 1))
    }

    fn cursor(&mut self) -> (u8, u8) {
        let packed = self.mem.read_u16(BDA_CURSOR_POS_ADDR);
        ((packed >> 8) as u8, packed as u8)
    }
}

#[test]
fn teletype_writes_glyphs_and_advances_the_cursor() {
    let mut r = rig();
    r.teletype_str(b"Hi");
    assert_eq!(r.cell(0, 0), (b'H', 0x07));
    assert_eq!(r.cell(0, 1), (b'i', 0x07));
    assert_eq!(r.cursor(), (0, 2));
}

#[test]
fn cr_lf_and_backspace() {
    let mut r = rig();
    r.teletype_str(b"ab\r\nc");
    assert_eq!(r.cursor(), (1, 1));
    assert_eq!(r.cell(1, 0), (b'c', 0x07));
    r.teletype(0x08);
    assert_eq!(r.cursor(), (1, 0));
}

#[test]
fn bottom_line_overflow_scrolls_up() {
    let mut r = rig();
    // Cursor to the last row, then two newlines.
    r.cpu.write_gpr16(RAX, 0x0200);
    r.cpu.write_gpr16(RBX, 0);
    r.cpu.write_gpr16(RDX, 24 << 8); // row 24, col 0
    r.int10();
    r.teletype_str(b"X");
    assert_eq!(r.cell(24, 0), (b'X', 0x07));
    // A newline on the last row scrolls the window up.
    r.teletype_str(b"\r\n");
    assert_eq!(r.cell(23, 0), (b'X', 0x07));
    assert_eq!(r.cell(24, 0).0, b' ');
}

#[test]
fn ansi_cursor_position_and_sgr_colors() {
    let mut r = rig();
    // ESC[5;10H then a coloured glyph: ESC[31m (red foreground).
    r.teletype_str(b"\x1b[5;10H\x1b[31mR");
    // ANSI red maps to VGA red (4).
    assert_eq!(r.cell(4, 9), (b'R', 0x04));
    // ESC[0m resets.
    r.teletype_str(b"\x1b[0mn");
    assert_eq!(r.cell(4, 10), (b'n', 0x07));
}

#[test]
fn ansi_erase_display_clears_and_homes() {
    let mut r = rig();
    r.teletype_str(b"junk");
    r.teletype_str(b"\x1b[2J");
    assert_eq!(r.cursor(), (0, 0));
    assert_eq!(r.cell(0, 0).0, b' ');
}

#[test]
fn ansi_line_erase_stops_at_eol() {
    let mut r = rig();
    r.teletype_str(b"abcdef\r");
    r.teletype_str(b"\x1b[K");
    assert_eq!(r.cell(0, 0).0, b' ');
    assert_eq!(r.cell(0, 5).0, b' ');
}

#[test]
fn set_mode_updates_bda_and_reports_via_get_mode() {
    let mut r = rig();
    r.cpu.write_gpr16(RAX, 0x0003);
    let outcome = r.int10();
    assert_eq!(outcome.video_mode_set, Some(0x03));

    r.cpu.write_gpr16(RAX, 0x0F00);
    r.int10();
    assert_eq!(r.cpu.read_gpr16(RAX) & 0xFF, 0x03);
    assert_eq!(r.cpu.read_gpr16(RAX) >> 8, 80);
}

#[test]
fn write_char_with_count_does_not_move_the_cursor() {
    let mut r = rig();
    r.cpu.write_gpr16(RAX, 0x0900 | b'=' as u16);
    r.cpu.write_gpr16(RBX, 0x0030); // attr 0x30
    r.cpu.write_gpr16(RCX, 3);
    r.int10();
    assert_eq!(r.cell(0, 0), (b'=', 0x30));
    assert_eq!(r.cell(0, 2), (b'=', 0x30));
    assert_eq!(r.cursor(), (0, 0));
}

#[test]
fn write_string_with_cursor_update() {
    let mut r = rig();
    // ES:BP -> string, DH:DL position, AL bit0 = move cursor.
    let s = b"boot";
    r.mem.write_bytes(0x2000, s);
    r.cpu.write_gpr16(5, 0x2000); // BP
    r.cpu.write_gpr16(RAX, 0x1301);
    r.cpu.write_gpr16(RBX, 0x0007);
    r.cpu.write_gpr16(RCX, s.len() as u16);
    r.cpu.write_gpr16(RDX, 0x0200); // row 2, col 0
    let outcome = r.int10();

    assert!(outcome.wrote_string);
    assert_eq!(r.cell(2, 0).0, b'b');
    assert_eq!(r.cell(2, 3).0, b't');
    assert_eq!(r.cursor(), (2, 4));
}

#[test]
fn vbe_get_info_and_set_mode() {
    let mut r = rig();
    // 4F00: controller info at ES:DI.
    r.cpu.write_gpr16(RAX, 0x4F00);
    r.cpu.write_gpr16(7, 0x3000); // DI
    r.int10();
    assert_eq!(r.cpu.read_gpr16(RAX), 0x004F);
    let mut sig = [0u8; 4];
    r.mem.read_bytes(0x3000, &mut sig);
    assert_eq!(&sig, b"VESA");

    // 4F01: mode info for 0x141.
    r.cpu.write_gpr16(RAX, 0x4F01);
    r.cpu.write_gpr16(RCX, 0x0141);
    r.cpu.write_gpr16(7, 0x3400);
    r.int10();
    assert_eq!(r.cpu.read_gpr16(RAX), 0x004F);
    assert_eq!(r.mem.read_u16(0x3412), 1024);
    assert_eq!(r.mem.read_u16(0x3414), 768);
    assert_eq!(r.mem.read_u8(0x3419), 32);
    assert_eq!(r.mem.read_u32(0x3428), 0xE000_0000);

    // 4F02: set with the LFB bit; 4F03 reads it back.
    r.cpu.write_gpr16(RAX, 0x4F02);
    r.cpu.write_gpr16(RBX, 0x4141);
    let outcome = r.int10();
    assert_eq!(outcome.vbe_mode_set, Some(0x4141));
    assert_eq!(r.cpu.read_gpr16(RAX), 0x004F);

    r.cpu.write_gpr16(RAX, 0x4F03);
    r.int10();
    assert_eq!(r.cpu.read_gpr16(RBX), 0x4141);

    // Unsupported mode fails.
    r.cpu.write_gpr16(RAX, 0x4F02);
    r.cpu.write_gpr16(RBX, 0x0101);
    r.int10();
    assert_eq!(r.cpu.read_gpr16(RAX), 0x014F);
}
