//! The machine: CPU, memory fabric, chipset devices and firmware wired
//! into one bootable PC.

mod adapters;
mod bus;
mod debug;

pub use debug::{cpu_snapshot, DebugTrigger, DebugTriggers};

use std::cell::RefCell;
use std::rc::Rc;

use thiserror::Error;

use adapters::{IdeBlockAdapter, IdeOpticalAdapter, KeyboardAdapter, VecBlockDevice};
use bus::{PcBus, PicPorts, SharedIo};

use ember_bios::{Bios, BiosConfig, BiosOutcome, CdBootInfo, DiskSet};
use ember_cpu_core::interp::tier0::exec;
use ember_cpu_core::state::{CpuState, SegReg};
use ember_cpu_core::{deliver_interrupt, CpuBus as _, Exception, InterruptKind, PagingBus};
use ember_devices::a20::A20Port;
use ember_devices::cmos::Cmos;
use ember_devices::i8042::I8042;
use ember_devices::pci::{profile, PciAddr, PciBus, PciConfig, PciFunction};
use ember_devices::pit::Pit;
use ember_devices::serial::Serial;
use ember_devices::vga::VgaRegs;
use ember_devices::Clock;
use ember_interrupts::{Arbiter, NmiLine, PicPair};
use ember_pc_constants::{
    BIOS_STUB_SEGMENT, BOOT_SECTOR_ADDR, BOOT_SECTOR_LEN, COM1_BASE, IVT_BASE,
};
use ember_platform::irq::PicIrqLine;
use ember_platform::IoPortBus;
use ember_platform::IoPortDevice;
use ember_storage::{IsoImage, MemBackend, RawDisk, VirtualDisk};
use memory::{A20Gate, MemoryBus as _};

/// Offset of the BIOS interrupt stubs inside segment F000; stub for
/// vector N is a single IRET at F000:E000+N.
const STUB_BASE: u16 = 0xE000;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error("disk image: {0}")]
    Disk(#[from] ember_storage::DiskError),
    #[error("no bootable media")]
    NoBootMedia,
}

#[derive(Clone, Debug)]
pub struct MachineConfig {
    pub ram_size_bytes: usize,
    /// Drive the firmware boots from; `None` prefers CD, then fixed disk,
    /// then floppy.
    pub boot_drive: Option<u8>,
    /// Unix time the RTC reports at power-on.
    pub rtc_unix_secs: u64,
    pub debug: DebugTriggers,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size_bytes: 2 * 1024 * 1024,
            boot_drive: None,
            rtc_unix_secs: 0,
            debug: DebugTriggers::default(),
        }
    }
}

/// Why `run_slice` returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunExit {
    /// Instruction budget exhausted.
    Completed { executed: u64 },
    /// HLT with no deliverable wakeup.
    Halted { executed: u64 },
    /// Exception delivery collapsed; the machine is wedged.
    TripleFault { executed: u64 },
    /// An armed tracepoint fired.
    DebugStop {
        executed: u64,
        trigger: DebugTrigger,
        snapshot: String,
    },
}

enum StepOutcome {
    Ran,
    Halted,
    TripleFault,
    Debug(DebugTrigger),
}

pub struct Machine {
    config: MachineConfig,
    state: CpuState,
    bus: PagingBus<PcBus, SharedIo>,
    io: Rc<RefCell<IoPortBus>>,
    clock: Clock,
    a20: A20Gate,

    pics: Rc<RefCell<PicPair>>,
    arbiter: Arbiter,
    nmi: Rc<RefCell<NmiLine>>,
    pit: Rc<RefCell<Pit>>,
    i8042: Rc<RefCell<I8042>>,
    serial: Rc<RefCell<Serial>>,
    vga: Rc<RefCell<VgaRegs>>,
    pci: Rc<RefCell<PciBus>>,
    ide: Rc<RefCell<ember_devices_storage::IdeController>>,
    ide_function: Rc<RefCell<ember_devices_storage::PciIdeFunction>>,

    bios: Bios,
    disks: DiskSet,
    cd_boot: Option<CdBootInfo>,

    /// Trigger latched by a BIOS service; surfaced after the stub's IRET
    /// retires so a resumed run does not replay the handler.
    pending_debug: Option<DebugTrigger>,
    was_long_mode: bool,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        let clock = Clock::new();
        clock.set_epoch_unix_secs(config.rtc_unix_secs);
        let a20 = A20Gate::new(false);

        let io = Rc::new(RefCell::new(IoPortBus::new()));

        let pics = Rc::new(RefCell::new(PicPair::new()));
        io.borrow_mut()
            .register(0x20, 0x21, Rc::new(RefCell::new(PicPorts(pics.clone()))));
        io.borrow_mut()
            .register(0xA0, 0xA1, Rc::new(RefCell::new(PicPorts(pics.clone()))));

        let mut arbiter = Arbiter::new();
        arbiter.register(pics.clone());
        let nmi = Rc::new(RefCell::new(NmiLine::default()));

        let irq0 = Rc::new(PicIrqLine::new(pics.clone(), 0));
        let pit = Rc::new(RefCell::new(Pit::new(clock.clone(), irq0)));
        io.borrow_mut().register(0x40, 0x43, pit.clone());

        let cmos = Rc::new(RefCell::new(Cmos::new(clock.clone())));
        io.borrow_mut().register(0x70, 0x71, cmos);

        let irq1 = Rc::new(PicIrqLine::new(pics.clone(), 1));
        let i8042 = Rc::new(RefCell::new(I8042::new(a20.clone(), irq1)));
        io.borrow_mut().register_one(0x60, i8042.clone());
        io.borrow_mut().register_one(0x64, i8042.clone());

        let vga = Rc::new(RefCell::new(VgaRegs::new()));
        io.borrow_mut().register(0x3C0, 0x3CF, vga.clone());
        io.borrow_mut().register(0x3D4, 0x3D5, vga.clone());
        io.borrow_mut().register_one(0x3DA, vga.clone());

        let serial = Rc::new(RefCell::new(Serial::new()));
        io.borrow_mut().register(COM1_BASE, COM1_BASE + 7, serial.clone());

        io.borrow_mut()
            .register_one(0x92, Rc::new(RefCell::new(A20Port::new(a20.clone()))));

        // PCI: host bridge plus the IDE function.
        let irq14 = Rc::new(PicIrqLine::new(pics.clone(), 14));
        let irq15 = Rc::new(PicIrqLine::new(pics.clone(), 15));
        let ide = Rc::new(RefCell::new(ember_devices_storage::IdeController::new(
            irq14, irq15,
        )));
        let ide_function = Rc::new(RefCell::new(ember_devices_storage::PciIdeFunction::new(
            ide.clone(),
        )));

        let pci = Rc::new(RefCell::new(PciBus::new()));
        pci.borrow_mut().attach(
            PciAddr {
                bus: 0,
                device: 0,
                function: 0,
            },
            Rc::new(RefCell::new(HostBridge::new())),
        );
        pci.borrow_mut().attach(
            PciAddr {
                bus: 0,
                device: 1,
                function: 1,
            },
            ide_function.clone(),
        );
        io.borrow_mut().register(0xCF8, 0xCFF, pci.clone());

        let bm_base = ide_function.borrow().bm_base();
        ember_devices_storage::register_ide_ports(&mut io.borrow_mut(), ide.clone(), bm_base);

        let bios = Bios::new(
            BiosConfig {
                ram_size_bytes: config.ram_size_bytes as u64,
                boot_drive: config.boot_drive.unwrap_or(0x80),
                cd_drive: 0xE0,
            },
            clock.clone(),
            a20.clone(),
        );

        let pc_bus = PcBus::new(config.ram_size_bytes, a20.clone());
        let bus = PagingBus::with_io(pc_bus, SharedIo(io.clone()));

        let mut machine = Self {
            config,
            state: CpuState::reset(),
            bus,
            io,
            clock,
            a20,
            pics,
            arbiter,
            nmi,
            pit,
            i8042,
            serial,
            vga,
            pci,
            ide,
            ide_function,
            bios,
            disks: DiskSet {
                cd_drive: 0xE0,
                ..DiskSet::default()
            },
            cd_boot: None,
            pending_debug: None,
            was_long_mode: false,
        };
        machine.reset();
        Ok(machine)
    }

    // --- media -------------------------------------------------------------

    /// Attach a raw fixed-disk image from bytes (padded to a whole
    /// sector).
    pub fn set_disk_image(&mut self, mut bytes: Vec<u8>) -> Result<(), MachineError> {
        let len = bytes.len().div_ceil(BOOT_SECTOR_LEN).max(1) * BOOT_SECTOR_LEN;
        bytes.resize(len, 0);
        let disk = RawDisk::open(MemBackend::from_bytes(bytes))?;
        self.set_disk(Box::new(disk))
    }

    /// Attach fixed-disk media behind both the ATA channel and the BIOS
    /// disk services.
    pub fn set_disk(&mut self, disk: Box<dyn VirtualDisk>) -> Result<(), MachineError> {
        let drive = ember_devices_storage::AtaDrive::new(disk)?;
        self.ide.borrow_mut().attach_primary_master_ata(drive);
        self.disks.hdds.clear();
        self.disks.hdds.push(Box::new(IdeBlockAdapter {
            ide: self.ide.clone(),
        }));
        Ok(())
    }

    /// Attach an ISO image as the secondary-master ATAPI CD.
    pub fn set_cd_image(&mut self, bytes: Vec<u8>) -> Result<(), MachineError> {
        let disk = RawDisk::open(MemBackend::from_bytes(bytes))?;
        let iso = IsoImage::open(Box::new(disk))?;
        self.cd_boot = iso.boot_image().map(|image| CdBootInfo {
            media_type: if image.is_no_emulation() { 0 } else { 2 },
            drive: self.disks.cd_drive,
            load_rba: image.load_rba,
            load_segment: image.effective_load_segment(),
            sector_count: image.sector_count,
        });

        let cdrom = ember_devices_storage::AtapiCdrom::new(iso);
        self.ide.borrow_mut().attach_secondary_master_atapi(cdrom);
        self.disks.cdrom = Some(Box::new(IdeOpticalAdapter {
            ide: self.ide.clone(),
            boot_info: self.cd_boot,
        }));
        Ok(())
    }

    /// Attach a floppy image (drive 0x00).
    pub fn set_floppy_image(&mut self, bytes: Vec<u8>) {
        self.disks.floppies.clear();
        self.disks.floppies.push(Box::new(VecBlockDevice {
            bytes,
            read_only: false,
        }));
    }

    // --- power-on ----------------------------------------------------------

    /// Architectural reset plus firmware POST: IVT, stubs, BDA, boot
    /// load. Media must already be attached.
    pub fn reset(&mut self) {
        self.state = CpuState::reset();
        self.bus.flush_tlb();
        self.a20.set_enabled(false);

        let mem = self.bus.physical_mut();

        // IVT: every vector points at its stub in the ROM segment.
        for vector in 0..256u64 {
            mem.write_u16(IVT_BASE + vector * 4, STUB_BASE + vector as u16);
            mem.write_u16(IVT_BASE + vector * 4 + 2, BIOS_STUB_SEGMENT);
        }
        // The stubs themselves: one IRET each.
        for vector in 0..256u64 {
            mem.write_u8(0xF_0000 + STUB_BASE as u64 + vector, 0xCF);
        }

        self.bios.init_bda(mem, self.disks.fixed_disk_count());

        // Real-mode entry stack.
        self.state.load_segment_real(SegReg::Ss, 0);
        self.state.set_rsp(BOOT_SECTOR_ADDR);
        for seg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
            self.state.load_segment_real(seg, 0);
        }

        if self.load_boot_image().is_err() {
            // Leave the CPU halted at the reset vector; the caller finds
            // out through RunExit::Halted.
            self.state.halted = true;
        }
        self.was_long_mode = false;
    }

    fn load_boot_image(&mut self) -> Result<(), MachineError> {
        // El Torito no-emulation boot wins when a bootable CD is present.
        let prefer_cd = match self.config.boot_drive {
            Some(drive) => drive == self.disks.cd_drive,
            None => self.cd_boot.is_some(),
        };

        if prefer_cd {
            if let Some(info) = self.cd_boot {
                let sectors_2048 = (info.sector_count as usize * 512).div_ceil(2048).max(1);
                let data = {
                    let mut ide = self.ide.borrow_mut();
                    let cd = ide.find_cdrom().ok_or(MachineError::NoBootMedia)?;
                    cd.media()
                        .read_iso_sectors(info.load_rba as u64, sectors_2048)?
                };
                let load_addr = (info.load_segment as u64) << 4;
                let take = (info.sector_count as usize * 512).min(data.len());
                self.bus.physical_mut().write_bytes(load_addr, &data[..take]);

                self.state.load_segment_real(SegReg::Cs, info.load_segment);
                self.state.set_rip(0);
                self.state.write_gpr16(2, self.disks.cd_drive as u16); // DL
                return Ok(());
            }
        }

        // Fixed disk, then floppy: MBR to 0000:7C00.
        let (boot_dl, sector): (u8, Option<[u8; 512]>) = if !self.disks.hdds.is_empty() {
            let mut buf = [0u8; 512];
            let ok = self.disks.hdds[0].read_sector(0, &mut buf).is_ok();
            (0x80, ok.then_some(buf))
        } else if !self.disks.floppies.is_empty() {
            let mut buf = [0u8; 512];
            let ok = self.disks.floppies[0].read_sector(0, &mut buf).is_ok();
            (0x00, ok.then_some(buf))
        } else {
            (0, None)
        };

        let sector = sector.ok_or(MachineError::NoBootMedia)?;
        self.bus.physical_mut().write_bytes(BOOT_SECTOR_ADDR, &sector);

        self.state.load_segment_real(SegReg::Cs, 0);
        self.state.set_rip(BOOT_SECTOR_ADDR);
        self.state.write_gpr16(2, boot_dl as u16); // DL
        Ok(())
    }

    // --- host access ---------------------------------------------------------

    pub fn read_physical_bytes(&mut self, paddr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.bus.physical_mut().read_bytes(paddr, &mut buf);
        buf
    }

    pub fn write_physical_bytes(&mut self, paddr: u64, bytes: &[u8]) {
        self.bus.physical_mut().write_bytes(paddr, bytes);
    }

    pub fn inject_key(&mut self, scancode: u8, ascii: u8) {
        self.i8042.borrow_mut().inject_key(scancode, ascii);
    }

    pub fn take_serial_output(&mut self) -> Vec<u8> {
        self.serial.borrow_mut().take_output()
    }

    pub fn cpu(&self) -> &CpuState {
        &self.state
    }

    pub fn cpu_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    pub fn vga(&self) -> Rc<RefCell<VgaRegs>> {
        self.vga.clone()
    }

    pub fn raise_nmi(&mut self) {
        self.nmi.borrow_mut().raise();
    }

    /// Advance virtual time: the PIT and BDA tick bookkeeping run even
    /// while the CPU sits in HLT.
    pub fn tick(&mut self, delta_ns: u64) {
        self.clock.advance_ns(delta_ns);
        self.process_time();
    }

    fn process_time(&mut self) {
        self.pit.borrow_mut().tick();
        let pending = self.pit.borrow_mut().take_pending_irq0();
        if pending > 0 {
            self.bios.timer_tick(self.bus.physical_mut(), pending);
        }
    }

    // --- the fetch loop -------------------------------------------------------

    pub fn run_slice(&mut self, max_instructions: u64) -> RunExit {
        let mut executed = 0u64;
        while executed < max_instructions {
            match self.step() {
                StepOutcome::Ran => executed += 1,
                StepOutcome::Halted => return RunExit::Halted { executed },
                StepOutcome::TripleFault => return RunExit::TripleFault { executed },
                StepOutcome::Debug(trigger) => {
                    return RunExit::DebugStop {
                        executed,
                        trigger,
                        snapshot: cpu_snapshot(&self.state),
                    }
                }
            }
        }
        RunExit::Completed { executed }
    }

    fn step(&mut self) -> StepOutcome {
        self.process_time();

        // Between-instruction interrupt window.
        let shadow = self.state.consume_interrupt_shadow();
        if !shadow {
            use ember_interrupts::InterruptSource;
            let nmi_vector = {
                let mut nmi = self.nmi.borrow_mut();
                let pending = nmi.pending_vector();
                if let Some(vector) = pending {
                    nmi.acknowledge(vector);
                }
                pending
            };
            if let Some(vector) = nmi_vector {
                if let Some(exit) = self.deliver(vector) {
                    return exit;
                }
            } else if self.state.interrupts_enabled() {
                if let Some(vector) = self.arbiter.take_pending() {
                    if let Some(exit) = self.deliver(vector) {
                        return exit;
                    }
                }
            }
        }

        if self.state.halted {
            return StepOutcome::Halted;
        }

        // BIOS service intercept: the IVT stubs live at F000:E000+n; the
        // handler runs host-side, then the stub's IRET unwinds the frame.
        if self.state.segments.cs.cache.base == 0xF_0000 {
            let ip = self.state.rip() & 0xFFFF;
            if (STUB_BASE as u64..STUB_BASE as u64 + 256).contains(&ip) {
                let vector = (ip - STUB_BASE as u64) as u8;
                if let Some(trigger) = self.bios_service(vector) {
                    self.pending_debug = Some(trigger);
                }
            }
        }

        match exec::step(&mut self.state, &mut self.bus) {
            Ok(()) => {}
            Err(exception) => {
                if let Some(exit) = self.handle_fault(exception) {
                    return exit;
                }
            }
        }

        // Device work the instruction may have queued.
        self.after_instruction();

        if let Some(trigger) = self.pending_debug.take() {
            return StepOutcome::Debug(trigger);
        }

        if self.config.debug.stop_on_ia32e_active
            && !self.was_long_mode
            && self.state.long_mode_active()
        {
            self.was_long_mode = true;
            return StepOutcome::Debug(DebugTrigger::Ia32eActive);
        }
        self.was_long_mode = self.state.long_mode_active();

        StepOutcome::Ran
    }

    fn after_instruction(&mut self) {
        // Live PCI BARs: a rewrite moves the bus-master window.
        let bar_writes = self.pci.borrow_mut().take_bar_writes();
        if !bar_writes.is_empty() {
            for write in bar_writes {
                if write.bar == 4 {
                    let function = self.ide_function.borrow();
                    function.sync_bm_base();
                    let base = function.bm_base().get();
                    drop(function);
                    let bm = Rc::new(RefCell::new(ember_devices_storage::BmPorts::new(
                        self.ide.clone(),
                        self.ide_function.borrow().bm_base(),
                    )));
                    self.io.borrow_mut().register(base, base + 15, bm);
                }
            }
        }

        if self.ide.borrow().has_pending_dma() {
            let mut ide = self.ide.borrow_mut();
            ide.service_dma(self.bus.physical_mut());
        }
    }

    fn deliver(&mut self, vector: u8) -> Option<StepOutcome> {
        self.arbiter.enter_delivery();
        let result = deliver_interrupt(
            &mut self.state,
            &mut self.bus,
            vector,
            InterruptKind::Hardware,
        );
        self.arbiter.exit_delivery();
        match result {
            Ok(()) => None,
            Err(exception) => self.handle_fault(exception),
        }
    }

    /// Deliver a CPU exception, promoting per the architectural rules:
    /// a fault during delivery raises #DF; a fault during #DF delivery is
    /// a triple fault.
    fn handle_fault(&mut self, exception: Exception) -> Option<StepOutcome> {
        if let Some(addr) = exception.page_fault_addr() {
            self.state.control.cr2 = addr;
        }

        let mut current = exception;
        for _ in 0..2 {
            self.arbiter.enter_delivery();
            let result = deliver_interrupt(
                &mut self.state,
                &mut self.bus,
                current.vector(),
                InterruptKind::Exception(current.error_code()),
            );
            self.arbiter.exit_delivery();
            match result {
                Ok(()) => return None,
                Err(_) if current.vector() == Exception::DoubleFault.vector() => {
                    tracing::warn!(?exception, "triple fault: delivery collapsed");
                    return Some(StepOutcome::TripleFault);
                }
                Err(_) => current = Exception::DoubleFault,
            }
        }
        Some(StepOutcome::TripleFault)
    }

    /// One BIOS service call. Returns an armed tracepoint when it fired.
    fn bios_service(&mut self, vector: u8) -> Option<DebugTrigger> {
        // Hardware-IRQ stubs: acknowledge at the PIC, nothing more.
        match vector {
            0x08 => {
                // The BDA tick advanced in process_time; the stub only
                // owes the controller its EOI.
                self.pics.borrow_mut().eoi_master();
                return None;
            }
            0x09 => {
                // Drain the scancode that raised IRQ1.
                let _ = self.i8042.borrow_mut().io_read(0x60, 1);
                self.pics.borrow_mut().eoi_master();
                return None;
            }
            0x70..=0x77 => {
                self.pics.borrow_mut().eoi_slave();
                self.pics.borrow_mut().eoi_master();
                return None;
            }
            _ => {}
        }

        let mut kbd = KeyboardAdapter(self.i8042.clone());
        let outcome = self.bios.handle_interrupt(
            vector,
            &mut self.state,
            self.bus.physical_mut(),
            &mut self.disks,
            &mut kbd,
        );

        self.sync_cursor_to_crtc();
        self.debug_trigger_for(outcome)
    }

    /// Mirror the BDA cursor into the CRTC registers so register-level
    /// guests and the BIOS agree.
    fn sync_cursor_to_crtc(&mut self) {
        let packed = self
            .bus
            .physical_mut()
            .read_u16(ember_pc_constants::BDA_CURSOR_POS_ADDR);
        let row = (packed >> 8) as u16;
        let col = packed & 0xFF;
        let cols = self
            .bus
            .physical_mut()
            .read_u16(ember_pc_constants::BDA_VIDEO_COLS_ADDR)
            .max(1);
        self.vga
            .borrow_mut()
            .set_cursor_offset(row * cols + col);
    }

    fn debug_trigger_for(&self, outcome: BiosOutcome) -> Option<DebugTrigger> {
        let debug = &self.config.debug;
        if let Some(lba) = outcome.read_lba {
            if debug.stop_on_int13_read_lba.contains(&lba) {
                return Some(DebugTrigger::Int13ReadLba(lba));
            }
        }
        if let Some(mode) = outcome.video_mode_set {
            if debug.stop_on_set_video_mode {
                return Some(DebugTrigger::SetVideoMode(mode));
            }
        }
        if let Some(mode) = outcome.vbe_mode_set {
            if debug.stop_on_vbe_setmode {
                return Some(DebugTrigger::VbeSetMode(mode));
            }
        }
        if outcome.wrote_string && debug.stop_on_int10_write_string {
            return Some(DebugTrigger::Int10WriteString);
        }
        if outcome.waited_for_key && debug.stop_on_int16_wait {
            return Some(DebugTrigger::Int16Wait);
        }
        None
    }

    /// Render the 80×25 text buffer as lines of trimmed text.
    pub fn text_screen(&mut self) -> Vec<String> {
        let mut lines = Vec::with_capacity(25);
        for row in 0..25u64 {
            let mut line = String::with_capacity(80);
            for col in 0..80u64 {
                let ch = self
                    .bus
                    .physical_mut()
                    .read_u8(ember_pc_constants::VGA_TEXT_BASE + (row * 80 + col) * 2);
                line.push(if ch.is_ascii_graphic() || ch == b' ' {
                    ch as char
                } else {
                    '.'
                });
            }
            lines.push(line.trim_end().to_string());
        }
        lines
    }
}

/// The host-bridge PCI function: identity registers only.
struct HostBridge {
    config: PciConfig,
}

impl HostBridge {
    fn new() -> Self {
        Self {
            config: PciConfig::new(&profile::HOST_I440FX),
        }
    }
}

impl PciFunction for HostBridge {
    fn config(&self) -> &PciConfig {
        &self.config
    }

    fn config_mut(&mut self) -> &mut PciConfig {
        &mut self.config
    }
}
