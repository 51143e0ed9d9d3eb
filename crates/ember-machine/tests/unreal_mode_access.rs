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

/// The classic unreal-mode dance: enable A20, load a flat data selector
/// under CR0.PE, drop back to real mode, then write above 1 MiB.
fn unreal_boot_sector() -> Vec<u8> {
    let mut code: Vec<u8> = Vec::new();
    // Enable A20 through port 0x92.
    code.extend_from_slice(&[0xE4, 0x92]); // in al, 0x92
    code.extend_from_slice(&[0x0C, 0x02]); // or al, 2
    code.extend_from_slice(&[0xE6, 0x92]); // out 0x92, al

    code.push(0xFA); // cli
    // lgdt [0x7C40] (the GDT descriptor blob lives inside the sector).
    code.extend_from_slice(&[0x0F, 0x01, 0x16, 0x40, 0x7C]);
    code.extend_from_slice(&[0x0F, 0x20, 0xC0]); // mov eax, cr0
    code.extend_from_slice(&[0x0C, 0x01]); // or al, 1
    code.extend_from_slice(&[0x0F, 0x22, 0xC0]); // mov cr0, eax
    code.extend_from_slice(&[0xBB, 0x08, 0x00]); // mov bx, 0x08
    code.extend_from_slice(&[0x8E, 0xDB]); // mov ds, bx
    code.extend_from_slice(&[0x24, 0xFE]); // and al, 0xFE
    code.extend_from_slice(&[0x0F, 0x22, 0xC0]); // mov cr0, eax

    // mov dword [0x00100000], 0xCAFEBABE (addr32 + op32).
    code.extend_from_slice(&[
        0x67, 0x66, 0xC7, 0x05, 0x00, 0x00, 0x10, 0x00, 0xBE, 0xBA, 0xFE, 0xCA,
    ]);
    code.push(0xF4); // hlt

    let mut sector = vec![0u8; 512];
    sector[..code.len()].copy_from_slice(&code);

    // GDT at 0x7C48: null + flat 4 GiB data; descriptor operand at 0x7C40.
    let gdt_off = 0x48;
    sector[0x40..0x42].copy_from_slice(&0x17u16.to_le_bytes());
    sector[0x42..0x46].copy_from_slice(&(0x7C00u32 + gdt_off as u32).to_le_bytes());
    sector[gdt_off + 8..gdt_off + 16]
        .copy_from_slice(&0x00CF_9200_0000_FFFFu64.to_le_bytes());

    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

#[test]
fn unreal_mode_write_reaches_past_one_megabyte() {
    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.set_disk_image(unreal_boot_sector()).unwrap();
    m.reset();
    run_until_halt(&mut m);

    // With A20 on, the write landed at physical 0x100000, not 0x0.
    assert_eq!(
        m.read_physical_bytes(0x10_0000, 4),
        0xCAFE_BABEu32.to_le_bytes().to_vec()
    );
    assert_ne!(
        m.read_physical_bytes(0x0, 4),
        0xCAFE_BABEu32.to_le_bytes().to_vec()
    );
}

#[test]
fn a20_disabled_wraps_the_same_write() {
    // Same program without the port 0x92 enable: the write wraps to 0.
    let mut sector = unreal_boot_sector();
    // Replace the three A20 instructions with NOPs.
    for b in sector.iter_mut().take(6) {
        *b = 0x90;
    }

    let mut m = Machine::new(MachineConfig::default()).unwrap();
    m.set_disk_image(sector).unwrap();
    m.reset();
    run_until_halt(&mut m);

    assert_eq!(
        m.read_physical_bytes(0x0, 4),
        0xCAFE_BABEu32.to_le_bytes().to_vec()
    );
}
