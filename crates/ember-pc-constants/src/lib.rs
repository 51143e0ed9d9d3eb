//! Canonical physical addresses and I/O port numbers of the emulated PC.
//!
//! Everything in here is fixed by the platform contract between the BIOS,
//! the chipset devices and guest software; firmware and device models pull
//! from this crate instead of re-declaring magic numbers.

/// Real-mode interrupt vector table base.
pub const IVT_BASE: u64 = 0x0000;

/// BIOS data area base.
pub const BDA_BASE: u64 = 0x0400;

/// BDA: equipment-list word.
pub const BDA_EQUIPMENT_ADDR: u64 = 0x0410;

/// BDA: conventional memory size in KiB (word).
pub const BDA_MEMORY_SIZE_ADDR: u64 = 0x0413;

/// BDA: active video mode (byte) and columns (word).
pub const BDA_VIDEO_MODE_ADDR: u64 = 0x0449;
pub const BDA_VIDEO_COLS_ADDR: u64 = 0x044A;

/// BDA: cursor position for page 0, column then row.
pub const BDA_CURSOR_POS_ADDR: u64 = 0x0450;

/// BDA: master timer tick counter (dword, incremented by IRQ0).
pub const BDA_TICK_COUNT_ADDR: u64 = 0x046C;

/// BDA: timer-overflow ("midnight") flag byte.
pub const BDA_MIDNIGHT_FLAG_ADDR: u64 = 0x0470;

/// BDA: number of fixed disks.
pub const BDA_FIXED_DISK_COUNT_ADDR: u64 = 0x0475;

/// IRQ0 ticks per day; the BDA counter wraps here and latches the
/// midnight flag.
pub const TICKS_PER_DAY: u32 = 0x1800B0;

/// PIT input clock in Hz.
pub const PIT_FREQUENCY_HZ: u64 = 1_193_182;

/// Conventional boot-sector entry point (0000:7C00).
pub const BOOT_SECTOR_ADDR: u64 = 0x7C00;

/// Size of a boot sector and of an ATA sector.
pub const BOOT_SECTOR_LEN: usize = 512;

/// VGA legacy memory window.
pub const VGA_WINDOW_BASE: u64 = 0xA0000;
pub const VGA_WINDOW_END: u64 = 0xC0000;

/// Colour text-mode buffer inside the VGA window.
pub const VGA_TEXT_BASE: u64 = 0xB8000;

/// BIOS ROM shadow window.
pub const BIOS_ROM_BASE: u64 = 0xF0000;
pub const BIOS_ROM_END: u64 = 0x100000;

/// Segment the BIOS interrupt stubs live in.
pub const BIOS_STUB_SEGMENT: u16 = 0xF000;

/// Default physical base of the VBE linear framebuffer.
pub const VBE_LFB_BASE: u64 = 0xE000_0000;

/// First megabyte boundary; the A20 gate aliases across it while disabled.
pub const ONE_MEGABYTE: u64 = 0x10_0000;

// --- ISA port numbers -----------------------------------------------------

pub const PIC1_CMD_PORT: u16 = 0x20;
pub const PIC1_DATA_PORT: u16 = 0x21;
pub const PIC2_CMD_PORT: u16 = 0xA0;
pub const PIC2_DATA_PORT: u16 = 0xA1;

pub const PIT_CH0_PORT: u16 = 0x40;
pub const PIT_CH1_PORT: u16 = 0x41;
pub const PIT_CH2_PORT: u16 = 0x42;
pub const PIT_CMD_PORT: u16 = 0x43;

pub const I8042_DATA_PORT: u16 = 0x60;
pub const I8042_STATUS_PORT: u16 = 0x64;

pub const CMOS_ADDR_PORT: u16 = 0x70;
pub const CMOS_DATA_PORT: u16 = 0x71;

/// Fast A20 gate (bit 1).
pub const A20_GATE_PORT: u16 = 0x92;

pub const ATA_PRIMARY_CMD_BASE: u16 = 0x1F0;
pub const ATA_PRIMARY_CTRL_PORT: u16 = 0x3F6;
pub const ATA_SECONDARY_CMD_BASE: u16 = 0x170;
pub const ATA_SECONDARY_CTRL_PORT: u16 = 0x376;

/// Default bus-master IDE base programmed into BAR4 by the BIOS POST.
pub const BM_IDE_DEFAULT_BASE: u16 = 0xCC00;

pub const PCI_CFG_ADDR_PORT: u16 = 0xCF8;
pub const PCI_CFG_DATA_PORT: u16 = 0xCFC;

pub const VGA_ATTR_PORT: u16 = 0x3C0;
pub const VGA_MISC_WRITE_PORT: u16 = 0x3C2;
pub const VGA_SEQ_INDEX_PORT: u16 = 0x3C4;
pub const VGA_SEQ_DATA_PORT: u16 = 0x3C5;
pub const VGA_GFX_INDEX_PORT: u16 = 0x3CE;
pub const VGA_GFX_DATA_PORT: u16 = 0x3CF;
pub const VGA_CRTC_INDEX_PORT: u16 = 0x3D4;
pub const VGA_CRTC_DATA_PORT: u16 = 0x3D5;
pub const VGA_INPUT_STATUS_PORT: u16 = 0x3DA;

pub const COM1_BASE: u16 = 0x3F8;

/// Master PIC vector base after BIOS POST (IRQ0 -> INT 08h).
pub const PIC1_VECTOR_BASE: u8 = 0x08;
/// Slave PIC vector base after BIOS POST (IRQ8 -> INT 70h).
pub const PIC2_VECTOR_BASE: u8 = 0x70;
