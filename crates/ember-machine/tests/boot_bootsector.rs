use ember_cpu_core::flags::RFlags;
use ember_machine::{Machine, MachineConfig, RunExit};
use pretty_assertions::assert_eq;

/// Minimal MBR: cli; hlt plus filler and the boot signature.
fn boot_sector(body: &[u8]) -> Vec<u8> {
    assert!(body.len() <= 510);
    let mut sector = vec![0u8; 512];
    sector[..body.len()].copy_from_slice(body);
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

#[test]
fn mbr_lands_at_7c00_with_the_image_bytes() {
    let mut body = vec![0xFA, 0xF4]; // cli; hlt
    body.extend_from_slice(b"ember boot fixture");
    let sector = boot_sector(&body);

    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.set_disk_image(sector.clone()).unwrap();
    m.reset();

    // The whole sector is in place before the first instruction.
    assert_eq!(m.read_physical_bytes(0x7C00, 512), sector);
    assert_eq!(m.read_physical_bytes(0x7DFE, 2), vec![0x55, 0xAA]);
    assert_eq!(m.cpu().segments.cs.selector, 0);
    assert_eq!(m.cpu().rip(), 0x7C00);
    assert_eq!(m.cpu().read_gpr16(2) & 0xFF, 0x80, "DL names the boot drive");

    // One CLI clears IF; the HLT ends the slice.
    match m.run_slice(16) {
        RunExit::Halted { executed } => assert_eq!(executed, 2),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert!(!m.cpu().flag(RFlags::IF));
}

#[test]
fn machine_without_media_halts_immediately() {
    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.reset();
    assert!(matches!(m.run_slice(16), RunExit::Halted { .. }));
}
