//! Host driver: load an image, run the fetch loop, stream guest output.

use std::io::Write;
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use clap::Parser;

use ember_machine::{DebugTriggers, Machine, MachineConfig, RunExit};

#[derive(Parser, Debug)]
#[command(name = "ember-machine", about = "Boot a legacy PC image")]
struct Args {
    /// Raw disk or ISO9660 image to boot.
    image: PathBuf,

    /// Treat the image as a CD (otherwise decided by extension).
    #[arg(long)]
    cdrom: bool,

    /// Treat the image as a floppy.
    #[arg(long)]
    floppy: bool,

    /// Guest RAM size in MiB.
    #[arg(long, default_value_t = 64)]
    ram_mib: usize,

    /// Stop after this many instructions (0 = run until halt).
    #[arg(long, default_value_t = 0)]
    max_instructions: u64,

    /// Dump the text screen on exit.
    #[arg(long)]
    screen: bool,
}

const SLICE: u64 = 100_000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let bytes = std::fs::read(&args.image)
        .with_context(|| format!("reading {}", args.image.display()))?;

    let rtc_unix_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut machine = Machine::new(MachineConfig {
        ram_size_bytes: args.ram_mib * 1024 * 1024,
        rtc_unix_secs,
        debug: DebugTriggers::from_env(),
        ..MachineConfig::default()
    })?;

    let is_iso = args.cdrom
        || args
            .image
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("iso"));

    if is_iso {
        machine.set_cd_image(bytes)?;
    } else if args.floppy {
        machine.set_floppy_image(bytes);
    } else {
        machine.set_disk_image(bytes)?;
    }
    machine.reset();

    let mut stdout = std::io::stdout();
    let mut executed_total = 0u64;
    let mut last_wall = Instant::now();

    let exit = loop {
        let exit = machine.run_slice(SLICE);

        let serial = machine.take_serial_output();
        if !serial.is_empty() {
            stdout.write_all(&serial)?;
            stdout.flush()?;
        }

        // Feed real elapsed time to the PIT/RTC.
        let now = Instant::now();
        machine.tick(now.duration_since(last_wall).as_nanos() as u64);
        last_wall = now;

        match exit {
            RunExit::Completed { executed } => {
                executed_total += executed;
                if args.max_instructions != 0 && executed_total >= args.max_instructions {
                    break RunExit::Completed {
                        executed: executed_total,
                    };
                }
            }
            other => break other,
        }
    };

    match &exit {
        RunExit::Halted { executed } => {
            eprintln!("machine halted after {executed} instructions");
        }
        RunExit::TripleFault { executed } => {
            eprintln!("triple fault after {executed} instructions");
        }
        RunExit::DebugStop {
            trigger, snapshot, ..
        } => {
            eprintln!("debug stop: {trigger:?}");
            eprintln!("{snapshot}");
        }
        RunExit::Completed { executed } => {
            eprintln!("instruction budget reached ({executed})");
        }
    }

    if args.screen {
        for line in machine.text_screen() {
            println!("{line}");
        }
    }

    if matches!(exit, RunExit::TripleFault { .. }) {
        bail!("guest triple-faulted");
    }
    Ok(())
}
