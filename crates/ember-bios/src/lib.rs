//! BIOS services: the INT 10h/12h/13h/15h/16h/1Ah handlers and the IRQ0
//! tick, modelled host-side behind real-mode IVT stubs.
//!
//! Each handler reads its inputs from guest registers, acts through the
//! physical memory bus and the device traits, writes results back to the
//! registers and reports success in the *stacked* CF image (handlers run
//! between the INT push and the stub's IRET, so the live flags would be
//! thrown away).

mod ctx;
mod disk;
mod keyboard;
mod system;
mod time;
mod video;

pub mod geometry;

pub use ctx::BiosCtx;
pub use disk::{BlockDevice, CdBootInfo, DiskSet, OpticalDevice};
pub use keyboard::Keyboard;
pub use video::SupportedVideoMode;

use ember_cpu_core::CpuState;
use ember_devices::Clock;
use memory::{A20Gate, MemoryBus};

pub use ember_pc_constants::{
    BDA_EQUIPMENT_ADDR, BDA_FIXED_DISK_COUNT_ADDR, BDA_MEMORY_SIZE_ADDR, BDA_MIDNIGHT_FLAG_ADDR,
    BDA_TICK_COUNT_ADDR, TICKS_PER_DAY,
};

/// E820 region types.
pub const E820_TYPE_RAM: u32 = 1;
pub const E820_TYPE_RESERVED: u32 = 2;

#[derive(Clone, Debug)]
pub struct BiosConfig {
    pub ram_size_bytes: u64,
    /// Drive number the boot sector came from (DL at entry).
    pub boot_drive: u8,
    /// Drive number assigned to an El Torito CD.
    pub cd_drive: u8,
}

impl Default for BiosConfig {
    fn default() -> Self {
        Self {
            ram_size_bytes: 2 * 1024 * 1024,
            boot_drive: 0x80,
            cd_drive: 0xE0,
        }
    }
}

/// Facts the machine layer reacts to after a service call (debug
/// tracepoints, halts).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BiosOutcome {
    /// INT 16h blocked and re-armed itself by rewinding the return IP.
    pub waited_for_key: bool,
    /// INT 10h AH=00h accepted this mode.
    pub video_mode_set: Option<u8>,
    /// VBE 4F02 accepted this mode.
    pub vbe_mode_set: Option<u16>,
    /// INT 10h AH=13h ran.
    pub wrote_string: bool,
    /// First LBA of an INT 13h read (AH=02h/42h).
    pub read_lba: Option<u64>,
}

pub struct Bios {
    config: BiosConfig,
    clock: Clock,
    a20: A20Gate,
    video: video::VideoState,
    /// E820 continuation values handed out, for sanity checks only.
    last_e820_index: u32,
}

impl Bios {
    pub fn new(config: BiosConfig, clock: Clock, a20: A20Gate) -> Self {
        Self {
            config,
            clock,
            a20,
            video: video::VideoState::default(),
            last_e820_index: 0,
        }
    }

    pub fn config(&self) -> &BiosConfig {
        &self.config
    }

    /// Populate the BIOS data area at power-on.
    pub fn init_bda(&self, mem: &mut dyn MemoryBus, fixed_disks: u8) {
        // Equipment: boot floppy present, 80x25 colour, one floppy drive.
        mem.write_u16(BDA_EQUIPMENT_ADDR, 0x0021);
        let conventional_kib = (self.config.ram_size_bytes / 1024).min(640) as u16;
        mem.write_u16(BDA_MEMORY_SIZE_ADDR, conventional_kib);
        mem.write_u8(ember_pc_constants::BDA_VIDEO_MODE_ADDR, 0x03);
        mem.write_u16(ember_pc_constants::BDA_VIDEO_COLS_ADDR, 80);
        mem.write_u16(ember_pc_constants::BDA_CURSOR_POS_ADDR, 0);
        mem.write_u32(BDA_TICK_COUNT_ADDR, 0);
        mem.write_u8(BDA_MIDNIGHT_FLAG_ADDR, 0);
        mem.write_u8(BDA_FIXED_DISK_COUNT_ADDR, fixed_disks);

        // Diskette parameter table; INT 13h AH=08h points ES:DI here.
        let dpt: [u8; 11] = [
            0xAF, 0x02, 0x25, 0x02, 18, 0x1B, 0xFF, 0x6C, 0xF6, 0x0F, 0x08,
        ];
        mem.write_bytes(0xF_EFC7, &dpt);
    }

    /// Dispatch one service interrupt. `vector` is the INT number the
    /// stub intercepted.
    pub fn handle_interrupt(
        &mut self,
        vector: u8,
        cpu: &mut CpuState,
        mem: &mut dyn MemoryBus,
        disks: &mut DiskSet,
        kbd: &mut dyn Keyboard,
    ) -> BiosOutcome {
        let mut ctx = BiosCtx::new(cpu, mem);
        let mut outcome = BiosOutcome::default();
        match vector {
            0x08 => {
                self.timer_tick(ctx.mem, 1);
            }
            0x10 => self.int10(&mut ctx, &mut outcome),
            0x11 => {
                let equipment = ctx.mem.read_u16(BDA_EQUIPMENT_ADDR);
                ctx.set_ax(equipment);
            }
            0x12 => {
                let kib = ctx.mem.read_u16(BDA_MEMORY_SIZE_ADDR);
                ctx.set_ax(kib);
            }
            0x13 => self.int13(&mut ctx, disks, &mut outcome),
            0x15 => self.int15(&mut ctx),
            0x16 => self.int16(&mut ctx, kbd, &mut outcome),
            0x1A => self.int1a(&mut ctx),
            _ => {
                tracing::debug!(vector, "unhandled BIOS interrupt");
                ctx.set_cf(true);
                ctx.set_ah(0x86);
            }
        }
        outcome
    }

    /// IRQ0 bookkeeping: advance the BDA tick counter by `ticks`
    /// underflows, wrapping at the 24-hour mark.
    pub fn timer_tick(&mut self, mem: &mut dyn MemoryBus, ticks: u32) {
        if ticks == 0 {
            return;
        }
        let mut count = mem.read_u32(BDA_TICK_COUNT_ADDR);
        for _ in 0..ticks {
            count += 1;
            if count >= TICKS_PER_DAY {
                count = 0;
                mem.write_u8(BDA_MIDNIGHT_FLAG_ADDR, 1);
            }
        }
        mem.write_u32(BDA_TICK_COUNT_ADDR, count);
    }
}
