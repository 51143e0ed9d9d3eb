use ember_machine::{Machine, MachineConfig, RunExit};
use pretty_assertions::assert_eq;

/// Boot sector: blocking INT 16h read, store AX at 0x0500, halt.
fn int16_boot_sector(store_addr: u16) -> Vec<u8> {
    let mut code: Vec<u8> = Vec::new();
    code.push(0xFA); // cli
    code.extend_from_slice(&[0x31, 0xC0]); // xor ax, ax
    code.extend_from_slice(&[0x8E, 0xD8]); // mov ds, ax
    code.extend_from_slice(&[0xB4, 0x00]); // mov ah, 0
    code.extend_from_slice(&[0xCD, 0x16]); // int 0x16
    code.push(0xA3); // mov [imm16], ax
    code.extend_from_slice(&store_addr.to_le_bytes());
    code.push(0xF4); // hlt

    let mut sector = vec![0u8; 512];
    sector[..code.len()].copy_from_slice(&code);
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

#[test]
fn injected_key_satisfies_a_blocking_int16_read() {
    const STORE: u64 = 0x0500;
    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.set_disk_image(int16_boot_sector(STORE as u16)).unwrap();
    m.reset();

    // No key yet: the guest spins on the re-armed INT 16h.
    match m.run_slice(500) {
        RunExit::Completed { executed } => assert_eq!(executed, 500),
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(m.read_physical_bytes(STORE, 2), vec![0, 0]);

    // Inject 'A' (scan 0x1E): the wait completes and the guest halts.
    m.inject_key(0x1E, 0x41);
    match m.run_slice(10_000) {
        RunExit::Halted { .. } => {}
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(m.read_physical_bytes(STORE, 2), vec![0x41, 0x1E]);
}

#[test]
fn int16_wait_tracepoint_fires_when_armed() {
    let mut config = MachineConfig::default();
    config.debug.stop_on_int16_wait = true;

    let mut m = Machine::new(config).unwrap();
    m.set_disk_image(int16_boot_sector(0x500)).unwrap();
    m.reset();

    match m.run_slice(10_000) {
        RunExit::DebugStop { trigger, .. } => {
            assert_eq!(trigger, ember_machine::DebugTrigger::Int16Wait);
        }
        other => panic!("unexpected exit: {other:?}"),
    }
}
