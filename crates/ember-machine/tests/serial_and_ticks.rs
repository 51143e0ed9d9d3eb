use ember_machine::{Machine, MachineConfig, RunExit};
use ember_pc_constants::{BDA_TICK_COUNT_ADDR, TICKS_PER_DAY};
use pretty_assertions::assert_eq;

fn boot_sector(code: &[u8]) -> Vec<u8> {
    let mut sector = vec![0u8; 512];
    sector[..code.len()].copy_from_slice(code);
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

#[test]
fn guest_serial_bytes_are_captured() {
    // mov dx, 0x3F8; mov al, 'S'; out dx, al; mov al, '!'; out dx, al; hlt
    let code = [
        0xBA, 0xF8, 0x03, 0xB0, b'S', 0xEE, 0xB0, b'!', 0xEE, 0xF4,
    ];
    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.set_disk_image(boot_sector(&code)).unwrap();
    m.reset();

    match m.run_slice(100) {
        RunExit::Halted { .. } => {}
        other => panic!("unexpected exit: {other:?}"),
    }
    assert_eq!(m.take_serial_output(), vec![b'S', b'!']);
    assert!(m.take_serial_output().is_empty());
}

fn read_ticks(m: &mut Machine) -> u32 {
    let bytes = m.read_physical_bytes(BDA_TICK_COUNT_ADDR, 4);
    u32::from_le_bytes(bytes.try_into().unwrap())
}

#[test]
fn machine_tick_advances_the_bda_counter_deterministically() {
    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.set_disk_image(boot_sector(&[0xFA, 0xF4])).unwrap();
    m.reset();

    let start = read_ticks(&mut m);
    for seconds in 1u32..=5 {
        m.tick(1_000_000_000);
        // 1193182 / 65536 ≈ 18.2 ticks per second, with carry.
        let expected = start + (u64::from(seconds) * 1_193_182 / 65_536) as u32;
        assert_eq!(read_ticks(&mut m), expected, "after {seconds}s");
    }
}

#[test]
fn midnight_wrap_sets_the_rollover_flag() {
    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.set_disk_image(boot_sector(&[0xFA, 0xF4])).unwrap();
    m.reset();

    m.write_physical_bytes(BDA_TICK_COUNT_ADDR, &(TICKS_PER_DAY - 2).to_le_bytes());
    m.tick(200_000_000); // ~3.6 ticks

    let ticks = read_ticks(&mut m);
    assert!(ticks < 4, "counter wrapped, got {ticks}");
    assert_eq!(
        m.read_physical_bytes(ember_pc_constants::BDA_MIDNIGHT_FLAG_ADDR, 1),
        vec![1]
    );
}

#[test]
fn video_mode_tracepoint() {
    // mov ax, 0x0013; int 0x10; hlt
    let code = [0xB8, 0x13, 0x00, 0xCD, 0x10, 0xF4];
    let mut config = MachineConfig::default();
    config.debug.stop_on_set_video_mode = true;

    let mut m = Machine::new(config).unwrap();
    m.set_disk_image(boot_sector(&code)).unwrap();
    m.reset();

    match m.run_slice(100) {
        RunExit::DebugStop { trigger, snapshot, .. } => {
            assert_eq!(trigger, ember_machine::DebugTrigger::SetVideoMode(0x13));
            assert!(snapshot.contains("cs="));
        }
        other => panic!("unexpected exit: {other:?}"),
    }
}

#[test]
fn int10_teletype_reaches_the_text_buffer() {
    // mov ax, 0x0E48 ('H'); int 0x10; mov al, 'i'; int 0x10; hlt
    let code = [
        0xB8, 0x48, 0x0E, 0xCD, 0x10, 0xB0, b'i', 0xCD, 0x10, 0xF4,
    ];
    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.set_disk_image(boot_sector(&code)).unwrap();
    m.reset();

    match m.run_slice(100) {
        RunExit::Halted { .. } => {}
        other => panic!("unexpected exit: {other:?}"),
    }
    let screen = m.text_screen();
    assert_eq!(screen[0], "Hi");
}
