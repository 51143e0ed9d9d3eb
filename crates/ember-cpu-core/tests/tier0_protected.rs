mod common;

use common::TestMemory;

use ember_cpu_core::flags::RFlags;
use ember_cpu_core::interp::tier0::exec;
use ember_cpu_core::segments::RawDescriptor;
use ember_cpu_core::state::{CpuMode, CpuState, SegReg, CR0_PE, RAX, RBX};
use ember_cpu_core::PagingBus;
use ember_mmu::MemoryBus as _;

const FLAT_CODE32: u64 = 0x00CF_9A00_0000_FFFF;
const FLAT_DATA32: u64 = 0x00CF_9200_0000_FFFF;

fn write_gdt(mem: &mut TestMemory, base: u64, descriptors: &[u64]) {
    for (i, d) in descriptors.iter().enumerate() {
        mem.write_u64(base + i as u64 * 8, *d);
    }
}

fn tss_descriptor(base: u64, limit: u16) -> u64 {
    // Available 32-bit TSS, present, DPL 0, byte granular.
    (limit as u64 & 0xFFFF)
        | (base & 0xFF_FFFF) << 16
        | 0x89u64 << 40
        | (base >> 24 & 0xFF) << 56
}

#[test]
fn protected_mode_entry_and_unreal_access() {
    let mut mem = TestMemory::new(0x110000);

    // GDT: null, flat 4 GiB data.
    write_gdt(&mut mem, 0x7C38, &[0, FLAT_DATA32]);
    // GDTR operand: limit, base32.
    mem.write_u16(0x7C30, 0x17);
    mem.write_u32(0x7C32, 0x7C38);

    let code: &[u8] = &[
        0x0F, 0x01, 0x16, 0x30, 0x7C, // lgdt [0x7C30]
        0x0F, 0x20, 0xC0, // mov eax, cr0
        0x0C, 0x01, // or al, 1
        0x0F, 0x22, 0xC0, // mov cr0, eax
        0xBB, 0x08, 0x00, // mov bx, 0x08
        0x8E, 0xDB, // mov ds, bx
        0x24, 0xFE, // and al, 0xFE
        0x0F, 0x22, 0xC0, // mov cr0, eax (back to real)
        // mov dword [0x00100000], 0x12345678 (addr32 + op32 in real mode)
        0x67, 0x66, 0xC7, 0x05, 0x00, 0x00, 0x10, 0x00, 0x78, 0x56, 0x34, 0x12,
        0xF4, // hlt
    ];
    mem.load(0x7C00, code);

    let mut state = CpuState::new(CpuMode::Real);
    state.load_segment_real(SegReg::Cs, 0);
    state.load_segment_real(SegReg::Ss, 0);
    state.set_rip(0x7C00);
    state.set_rsp(0x7000);
    let mut bus = PagingBus::new(mem);

    for _ in 0..10 {
        exec::step(&mut state, &mut bus).unwrap();
    }
    assert!(state.halted);
    assert_eq!(state.mode(), CpuMode::Real);

    // The unreal DS cache kept its 4 GiB limit across PE=0, so the write
    // reached beyond 1 MiB.
    assert_eq!(state.segments.ds.cache.limit, 0xFFFF_FFFF);
    assert_eq!(bus.physical_mut().read_u32(0x10_0000), 0x1234_5678);
}

#[test]
fn interrupt_gate_clears_if_and_iret_restores() {
    let mut mem = TestMemory::new(0x20000);

    write_gdt(&mut mem, 0x100, &[0, FLAT_CODE32, FLAT_DATA32]);

    // IDT[0x40]: 32-bit interrupt gate -> 0x08:0x6000.
    let gate: u64 = 0x6000 | (0x08u64 << 16) | (0x8Eu64 << 40);
    mem.write_u64(0x800 + 0x40 * 8, gate);

    // int 0x40; hlt at 0x5000 / handler: inc eax; iret at 0x6000.
    mem.load(0x5000, &[0xCD, 0x40, 0xF4]);
    mem.load(0x6000, &[0x40, 0xCF]);

    let mut state = CpuState::new(CpuMode::Protected);
    state.gdtr.base = 0x100;
    state.gdtr.limit = 0x1F;
    state.idtr.base = 0x800;
    state.idtr.limit = 0x7FF;
    state.write_code_segment(0x08, RawDescriptor { raw: FLAT_CODE32 }.to_cache());
    state.segments.ss.selector = 0x10;
    state.segments.ss.cache = RawDescriptor { raw: FLAT_DATA32 }.to_cache();
    state.set_rip(0x5000);
    state.set_rsp(0x9000);
    state.set_flag(RFlags::IF, true);

    let mut bus = PagingBus::new(mem);

    exec::step(&mut state, &mut bus).unwrap(); // int 0x40
    assert_eq!(state.rip(), 0x6000);
    assert!(!state.flag(RFlags::IF));

    exec::step(&mut state, &mut bus).unwrap(); // inc eax
    exec::step(&mut state, &mut bus).unwrap(); // iret
    assert_eq!(state.rip(), 0x5002);
    assert!(state.flag(RFlags::IF));
    assert_eq!(state.read_gpr32(RAX), 1);
    assert_eq!(state.rsp(), 0x9000);
}

#[test]
fn task_switch_round_trip_preserves_registers() {
    let mut mem = TestMemory::new(0x20000);

    let tss_a = 0x4000u64;
    let tss_b = 0x4800u64;

    write_gdt(
        &mut mem,
        0x100,
        &[
            0,
            FLAT_CODE32,                 // 0x08
            FLAT_DATA32,                 // 0x10
            tss_descriptor(tss_a, 0x67), // 0x18
            tss_descriptor(tss_b, 0x67), // 0x20
        ],
    );

    // Task B context: executes hlt at 0x6800 with its own registers.
    mem.write_u32(tss_b + 0x1C, 0); // CR3
    mem.write_u32(tss_b + 0x20, 0x6800); // EIP
    mem.write_u32(tss_b + 0x24, 0x2); // EFLAGS
    mem.write_u32(tss_b + 0x28, 0xB000_0001); // EAX
    mem.write_u32(tss_b + 0x38, 0x7000); // ESP
    for (i, sel) in [0x10u32, 0x08, 0x10, 0x10, 0x10, 0x10].iter().enumerate() {
        mem.write_u32(tss_b + 0x48 + i as u64 * 4, *sel);
    }
    // jmp far 0x18:0 (back to task A), 32-bit ptr16:32 encoding.
    mem.load(0x6800, &[0xEA, 0x00, 0x00, 0x00, 0x00, 0x18, 0x00]);

    // Code for task A: jmp far 0x20:0 switches to task B.
    mem.load(0x5000, &[0xEA, 0x00, 0x00, 0x00, 0x00, 0x20, 0x00, 0xF4]);

    let mut state = CpuState::new(CpuMode::Protected);
    state.gdtr.base = 0x100;
    state.gdtr.limit = 0x27;
    state.write_code_segment(0x08, RawDescriptor { raw: FLAT_CODE32 }.to_cache());
    state.segments.ss.selector = 0x10;
    state.segments.ss.cache = RawDescriptor { raw: FLAT_DATA32 }.to_cache();
    state.tr.selector = 0x18;
    state.tr.base = tss_a;
    state.tr.limit = 0x67;
    state.set_rip(0x5000);
    state.set_rsp(0x8000);
    state.write_gpr32(RAX, 0xA000_0007);
    state.write_gpr32(RBX, 0x0BAD_CAFE);

    // Mark task A busy, as hardware would have at dispatch.
    let access = mem.read_u8(0x100 + 0x18 + 5);
    mem.write_u8(0x100 + 0x18 + 5, access | 0x02);

    let mut bus = PagingBus::new(mem);

    // A -> B.
    exec::step(&mut state, &mut bus).unwrap();
    assert_eq!(state.tr.selector, 0x20);
    assert_eq!(state.rip(), 0x6800);
    assert_eq!(state.read_gpr32(RAX), 0xB000_0001);
    assert_eq!(state.rsp(), 0x7000);

    // B -> A: everything task A had is back.
    exec::step(&mut state, &mut bus).unwrap();
    assert_eq!(state.tr.selector, 0x18);
    assert_eq!(state.rip(), 0x5007);
    assert_eq!(state.read_gpr32(RAX), 0xA000_0007);
    assert_eq!(state.read_gpr32(RBX), 0x0BAD_CAFE);
    assert_eq!(state.rsp(), 0x8000);

    // The hlt after the far jump still executes in task A.
    exec::step(&mut state, &mut bus).unwrap();
    assert!(state.halted);
}

#[test]
fn data_segment_load_checks_dpl() {
    let mut mem = TestMemory::new(0x10000);
    // DPL 0 data descriptor.
    write_gdt(&mut mem, 0x100, &[0, FLAT_CODE32, FLAT_DATA32]);
    mem.load(0x5000, &[0x8E, 0xC3]); // mov es, bx

    let mut state = CpuState::new(CpuMode::Protected);
    state.gdtr.base = 0x100;
    state.gdtr.limit = 0x1F;
    let mut cs = RawDescriptor { raw: FLAT_CODE32 }.to_cache();
    cs.dpl = 3;
    state.write_code_segment(0x08 | 3, cs);
    state.set_rip(0x5000);
    state.write_gpr16(RBX, 0x10 | 3); // RPL 3 selector for a DPL 0 segment

    let mut bus = PagingBus::new(mem);
    let err = exec::step(&mut state, &mut bus).unwrap_err();
    assert_eq!(
        err,
        ember_cpu_core::Exception::GeneralProtection { selector: 0x13 }
    );
}

#[test]
fn mode_transition_updates_code_width() {
    let mut state = CpuState::new(CpuMode::Real);
    assert_eq!(state.code_bits(), 16);

    state.write_cr0(CR0_PE);
    assert_eq!(state.mode(), CpuMode::Protected);
    // Until CS is reloaded the 16-bit default persists.
    assert_eq!(state.code_bits(), 16);

    state.write_code_segment(0x08, RawDescriptor { raw: FLAT_CODE32 }.to_cache());
    assert_eq!(state.code_bits(), 32);
}
