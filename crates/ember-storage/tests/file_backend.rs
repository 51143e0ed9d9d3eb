#![cfg(not(target_arch = "wasm32"))]

use ember_storage::{DiskError, FileBackend, RawDisk, StorageBackend, VirtualDisk, SECTOR_SIZE};

#[test]
fn file_backed_disk_round_trips_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk.img");

    {
        let backend = FileBackend::create(&path, 16 * SECTOR_SIZE as u64).unwrap();
        let mut disk = RawDisk::open(backend).unwrap();
        let mut sector = vec![0u8; SECTOR_SIZE];
        sector[..5].copy_from_slice(b"EMBER");
        disk.write_sectors(3, &sector).unwrap();
        disk.flush().unwrap();
    }

    let backend = FileBackend::open(&path, false).unwrap();
    let mut disk = RawDisk::open(backend).unwrap();
    assert_eq!(disk.capacity_bytes(), 16 * SECTOR_SIZE as u64);

    let mut back = vec![0u8; SECTOR_SIZE];
    disk.read_sectors(3, &mut back).unwrap();
    assert_eq!(&back[..5], b"EMBER");
}

#[test]
fn read_only_open_refuses_writes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ro.img");
    FileBackend::create(&path, 1024).unwrap();

    let mut backend = FileBackend::open(&path, true).unwrap();
    assert!(backend.is_read_only());
    assert!(matches!(
        backend.write_at(0, b"nope"),
        Err(DiskError::ReadOnly)
    ));
}
