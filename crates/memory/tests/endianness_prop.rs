#![cfg(not(target_arch = "wasm32"))]

use memory::{GuestRam, MemoryBus};
use proptest::prelude::*;

proptest! {
    #[test]
    fn u16_roundtrip(addr in 0u64..0xFF0, value: u16) {
        let mut ram = GuestRam::new(0x1000);
        ram.write_u16(addr, value);
        prop_assert_eq!(ram.read_u16(addr), value);
        prop_assert_eq!(ram.read_u8(addr), value as u8);
        prop_assert_eq!(ram.read_u8(addr + 1), (value >> 8) as u8);
    }

    #[test]
    fn u32_roundtrip(addr in 0u64..0xFF0, value: u32) {
        let mut ram = GuestRam::new(0x1000);
        ram.write_u32(addr, value);
        prop_assert_eq!(ram.read_u32(addr), value);
    }

    #[test]
    fn u64_roundtrip(addr in 0u64..0xFF0, value: u64) {
        let mut ram = GuestRam::new(0x1000);
        ram.write_u64(addr, value);
        prop_assert_eq!(ram.read_u64(addr), value);
        prop_assert_eq!(ram.read_u32(addr), value as u32);
        prop_assert_eq!(ram.read_u32(addr + 4), (value >> 32) as u32);
    }

    #[test]
    fn bulk_write_matches_byte_writes(addr in 0u64..0xF00, bytes in proptest::collection::vec(any::<u8>(), 1..64)) {
        let mut a = GuestRam::new(0x1000);
        let mut b = GuestRam::new(0x1000);
        a.write_bytes(addr, &bytes);
        for (i, byte) in bytes.iter().enumerate() {
            b.write_u8(addr + i as u64, *byte);
        }
        prop_assert_eq!(a.as_slice(), b.as_slice());
    }
}
