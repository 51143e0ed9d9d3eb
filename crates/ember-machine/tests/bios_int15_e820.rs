use ember_machine::{Machine, MachineConfig, RunExit};
use pretty_assertions::assert_eq;

fn run_until_halt(m: &mut Machine) {
    for _ in 0..100 {
        match m.run_slice(10_000) {
            RunExit::Halted { .. } => return,
            RunExit::Completed { .. } => continue,
            other => panic!("unexpected exit: {other:?}"),
        }
    }
    panic!("guest did not halt");
}

/// Boot sector: one E820 call with EBX=0 into 0000:1000, then halt.
fn e820_boot_sector() -> Vec<u8> {
    let mut code: Vec<u8> = Vec::new();
    code.extend_from_slice(&[0x31, 0xC0]); // xor ax, ax
    code.extend_from_slice(&[0x8E, 0xC0]); // mov es, ax
    code.extend_from_slice(&[0xBF, 0x00, 0x10]); // mov di, 0x1000
    code.extend_from_slice(&[0x66, 0x31, 0xDB]); // xor ebx, ebx
    code.extend_from_slice(&[0x66, 0xB8, 0x20, 0xE8, 0x00, 0x00]); // mov eax, 0xE820
    code.extend_from_slice(&[0x66, 0xB9, 0x14, 0x00, 0x00, 0x00]); // mov ecx, 20
    code.extend_from_slice(&[0x66, 0xBA, 0x50, 0x41, 0x4D, 0x53]); // mov edx, 'SMAP'
    code.extend_from_slice(&[0xCD, 0x15]); // int 0x15
    code.push(0xF4); // hlt

    let mut sector = vec![0u8; 512];
    sector[..code.len()].copy_from_slice(&code);
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

#[test]
fn first_e820_call_reports_the_usable_region() {
    let mut m = Machine::new(MachineConfig {
        ram_size_bytes: 1024 * 1024 * 1024,
        ..MachineConfig::default()
    })
    .unwrap();
    m.set_disk_image(e820_boot_sector()).unwrap();
    m.reset();
    run_until_halt(&mut m);

    // {base 0, length 1 GiB, type 1} and a continuation of 1.
    let entry = m.read_physical_bytes(0x1000, 20);
    assert_eq!(
        entry,
        vec![
            0, 0, 0, 0, 0, 0, 0, 0, // base
            0, 0, 0, 0x40, 0, 0, 0, 0, // length 0x40000000
            1, 0, 0, 0, // type usable
        ]
    );
    assert_eq!(m.cpu().read_gpr32(3), 1, "EBX continuation");
    assert_eq!(m.cpu().read_gpr32(0), 0x534D_4150, "EAX = 'SMAP'");
}
