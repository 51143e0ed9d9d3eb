//! Named debug tracepoints: halt the fetch loop with a diagnostic
//! snapshot when a watched BIOS event fires.

use ember_cpu_core::CpuState;

/// The tracepoint that fired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebugTrigger {
    Int13ReadLba(u64),
    SetVideoMode(u8),
    VbeSetMode(u16),
    Int10WriteString,
    Int16Wait,
    Ia32eActive,
}

/// Which tracepoints are armed. The CLI populates this from the
/// `PHPME_STOP_ON_*` environment toggles.
#[derive(Clone, Debug, Default)]
pub struct DebugTriggers {
    pub stop_on_int13_read_lba: Vec<u64>,
    pub stop_on_set_video_mode: bool,
    pub stop_on_vbe_setmode: bool,
    pub stop_on_int10_write_string: bool,
    pub stop_on_int16_wait: bool,
    pub stop_on_ia32e_active: bool,
}

impl DebugTriggers {
    /// Read the `PHPME_STOP_ON_*` toggles from the environment.
    pub fn from_env() -> Self {
        let flag = |name: &str| std::env::var_os(name).is_some();
        let lba_list = std::env::var("PHPME_STOP_ON_INT13_READ_LBA")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|part| {
                        let part = part.trim();
                        if let Some(hex) = part.strip_prefix("0x") {
                            u64::from_str_radix(hex, 16).ok()
                        } else {
                            part.parse().ok()
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            stop_on_int13_read_lba: lba_list,
            stop_on_set_video_mode: flag("PHPME_STOP_ON_SET_VIDEO_MODE"),
            stop_on_vbe_setmode: flag("PHPME_STOP_ON_VBE_SETMODE"),
            stop_on_int10_write_string: flag("PHPME_STOP_ON_INT10_WRITE_STRING"),
            stop_on_int16_wait: flag("PHPME_STOP_ON_INT16_WAIT"),
            stop_on_ia32e_active: flag("PHPME_STOP_ON_IA32E_ACTIVE"),
        }
    }

    pub fn any_armed(&self) -> bool {
        !self.stop_on_int13_read_lba.is_empty()
            || self.stop_on_set_video_mode
            || self.stop_on_vbe_setmode
            || self.stop_on_int10_write_string
            || self.stop_on_int16_wait
            || self.stop_on_ia32e_active
    }
}

/// One-line CPU snapshot for trigger diagnostics.
pub fn cpu_snapshot(state: &CpuState) -> String {
    format!(
        "cs={:04x} ip={:08x} ax={:08x} bx={:08x} cx={:08x} dx={:08x} sp={:08x} flags={:08x} cr0={:08x}",
        state.segments.cs.selector,
        state.rip(),
        state.read_gpr32(0),
        state.read_gpr32(3),
        state.read_gpr32(1),
        state.read_gpr32(2),
        state.rsp() as u32,
        state.rflags() as u32,
        state.control.cr0 as u32,
    )
}
