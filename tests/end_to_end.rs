//! End-to-end archive scenarios, exercised against the public `Archive` API
//! the way a caller would use it (temp-file-backed, no internals reached
//! into directly). Mirrors the literal scenarios walked through in DESIGN.md.

use std::sync::Arc;
use std::thread;

use vefs::device::OpenMode as DeviceOpenMode;
use vefs::vfs::OpenMode as FileOpenMode;
use vefs::{Archive, Aes256GcmProvider, ErrorKind};

const PRK: [u8; 32] = [0xA5u8; 32];

fn archive_path() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("archive.vefs");
    (dir, path)
}

#[test]
fn create_write_commit_reopen_round_trips() {
    let (_dir, path) = archive_path();
    {
        let archive = Archive::open(&path, &PRK, DeviceOpenMode::Create).unwrap();
        let handle = archive.open_file("a/b", FileOpenMode::Create).unwrap();
        let data: Vec<u8> = (1..=10).collect();
        handle.write(&data, 0).unwrap();
        archive.close_file(handle).unwrap();
        archive.commit().unwrap();
    }

    let archive = Archive::open(&path, &PRK, DeviceOpenMode::Open).unwrap();
    let handle = archive.open_file("a/b", FileOpenMode::Open).unwrap();
    let mut out = vec![0u8; 10];
    handle.read(&mut out, 0).unwrap();
    assert_eq!(out, (1u8..=10).collect::<Vec<_>>());
}

#[test]
fn writing_past_one_leaf_expands_to_two_leaves() {
    let (_dir, path) = archive_path();
    let archive = Archive::open(&path, &PRK, DeviceOpenMode::Create).unwrap();
    let handle = archive.open_file("big", FileOpenMode::Create).unwrap();

    let data = vec![b'B'; vefs::device::PAYLOAD_SIZE + 1];
    handle.write(&data, 0).unwrap();
    archive.close_file(handle).unwrap();
    archive.commit().unwrap();

    let descriptor = archive.query("big").unwrap();
    assert_eq!(descriptor.tree_depth, 1);
    assert_eq!(descriptor.size, data.len() as u64);
}

#[test]
fn wrong_prk_is_rejected() {
    let (_dir, path) = archive_path();
    {
        let archive = Archive::open(&path, &PRK, DeviceOpenMode::Create).unwrap();
        let handle = archive.open_file("a/b", FileOpenMode::Create).unwrap();
        handle.write(&[1, 2, 3], 0).unwrap();
        archive.close_file(handle).unwrap();
        archive.commit().unwrap();
    }

    let wrong_prk = [0x00u8; 32];
    let err = match Archive::open(&path, &wrong_prk, DeviceOpenMode::Open) {
        Err(e) => e,
        Ok(_) => panic!("expected wrong_user_prk"),
    };
    assert_eq!(err.kind(), ErrorKind::WrongUserPrk);
}

#[test]
fn corruption_is_detected_and_purgeable() {
    let (_dir, path) = archive_path();
    {
        let archive = Archive::open(&path, &PRK, DeviceOpenMode::Create).unwrap();
        let handle = archive.open_file("a/b", FileOpenMode::Create).unwrap();
        handle.write(&[1, 2, 3, 4, 5], 0).unwrap();
        archive.close_file(handle).unwrap();
        archive.commit().unwrap();
    }

    // flip a byte directly in sector 1's payload region, on disk.
    {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(vefs::device::SECTOR_SIZE as u64 + 4)).unwrap();
        file.write_all(&[0xFF]).unwrap();
    }

    let archive = Archive::open(&path, &PRK, DeviceOpenMode::Open).unwrap();
    let handle = archive.open_file("a/b", FileOpenMode::Open).unwrap();
    let mut out = vec![0u8; 5];
    let err = match handle.read(&mut out, 0) {
        Err(e) => e,
        Ok(_) => panic!("expected tag_mismatch"),
    };
    assert_eq!(err.kind(), ErrorKind::TagMismatch);
    drop(handle);
    drop(archive);

    Archive::purge_corruption(&path, &PRK, Arc::new(Aes256GcmProvider)).unwrap();

    let archive = Archive::open(&path, &PRK, DeviceOpenMode::Open).unwrap();
    let err = match archive.query("a/b") {
        Err(e) => e,
        Ok(_) => panic!("expected no_such_file after purge"),
    };
    assert_eq!(err.kind(), ErrorKind::NoSuchFile);
}

#[test]
fn truncate_releases_sectors_to_the_free_list() {
    let (_dir, path) = archive_path();
    let archive = Archive::open(&path, &PRK, DeviceOpenMode::Create).unwrap();
    let handle = archive.open_file("c", FileOpenMode::Create).unwrap();

    let big = vec![0x5Au8; 1024 * 1024];
    handle.write(&big, 0).unwrap();
    archive.close_file(handle).unwrap();
    archive.commit().unwrap();

    let handle = archive.open_file("c", FileOpenMode::Open).unwrap();
    handle.truncate(100).unwrap();
    archive.close_file(handle).unwrap();
    archive.commit().unwrap();

    let archive = Archive::open(&path, &PRK, DeviceOpenMode::Open).unwrap();
    let descriptor = archive.query("c").unwrap();
    assert_eq!(descriptor.size, 100);
    assert_eq!(descriptor.tree_depth, 0);
}

#[test]
fn concurrent_non_overlapping_writers_do_not_interfere() {
    let (_dir, path) = archive_path();
    let archive = Arc::new(Archive::open(&path, &PRK, DeviceOpenMode::Create).unwrap());
    let x = archive.open_file("x", FileOpenMode::Create).unwrap();
    let y = archive.open_file("y", FileOpenMode::Create).unwrap();

    let iterations = 1000usize;
    let x_handle = thread::spawn(move || {
        for i in 0..iterations {
            let byte = (i % 256) as u8;
            x.write(&[byte], i as u64).unwrap();
        }
        x
    });
    let y_handle = thread::spawn(move || {
        for i in 0..iterations {
            let byte = ((i + 1) % 256) as u8;
            y.write(&[byte], i as u64).unwrap();
        }
        y
    });

    let x = x_handle.join().unwrap();
    let y = y_handle.join().unwrap();

    let mut x_out = vec![0u8; iterations];
    x.read(&mut x_out, 0).unwrap();
    for (i, b) in x_out.iter().enumerate() {
        assert_eq!(*b, (i % 256) as u8);
    }

    let mut y_out = vec![0u8; iterations];
    y.read(&mut y_out, 0).unwrap();
    for (i, b) in y_out.iter().enumerate() {
        assert_eq!(*b, ((i + 1) % 256) as u8);
    }

    archive.close_file(x).unwrap();
    archive.close_file(y).unwrap();
    archive.commit().unwrap();
}
