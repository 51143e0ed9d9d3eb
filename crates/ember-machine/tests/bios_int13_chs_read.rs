use ember_cpu_core::flags::RFlags;
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

/// Boot sector: read CHS (0,0,2) for one sector to 0000:8000, then halt.
fn chs_read_boot_sector() -> Vec<u8> {
    let mut code: Vec<u8> = Vec::new();
    code.extend_from_slice(&[0x31, 0xC0]); // xor ax, ax
    code.extend_from_slice(&[0x8E, 0xC0]); // mov es, ax
    code.extend_from_slice(&[0xBB, 0x00, 0x80]); // mov bx, 0x8000
    code.extend_from_slice(&[0xB8, 0x01, 0x02]); // mov ax, 0x0201
    code.extend_from_slice(&[0xB9, 0x02, 0x00]); // mov cx, 0x0002
    code.extend_from_slice(&[0xBA, 0x80, 0x00]); // mov dx, 0x0080
    code.extend_from_slice(&[0xCD, 0x13]); // int 0x13
    code.push(0xF4); // hlt

    let mut sector = vec![0u8; 512];
    sector[..code.len()].copy_from_slice(&code);
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

#[test]
fn chs_read_places_lba1_at_the_buffer() {
    let mut image = chs_read_boot_sector();
    // LBA 1: a recognisable pattern.
    let mut second = vec![0u8; 512];
    for (i, b) in second.iter_mut().enumerate() {
        *b = (i % 253) as u8;
    }
    image.extend_from_slice(&second);

    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.set_disk_image(image.clone()).unwrap();
    m.reset();
    run_until_halt(&mut m);

    assert_eq!(m.read_physical_bytes(0x8000, 512), image[512..1024].to_vec());
    // AH=0 (success), AL=1 (sectors transferred), CF clear.
    assert_eq!(m.cpu().read_gpr16(0), 0x0001);
    assert!(!m.cpu().flag(RFlags::CF));
}
