//! Tests for size limit and resource error reporting

use mmap_buffer::{ErrorClass, MmapBuffer, MmapBufferError, StorageOption};

#[test]
fn test_overflowing_capacity_is_an_error() {
    let result = MmapBuffer::<u64>::with_capacity(usize::MAX, StorageOption::InMemory);
    match result {
        Err(err @ MmapBufferError::CapacityOverflow { .. }) => {
            assert_eq!(err.class(), ErrorClass::OutOfMemory);
        }
        other => panic!("Expected CapacityOverflow, got {other:?}"),
    }
}

#[test]
fn test_overflowing_reserve_leaves_buffer_intact() {
    let mut buf = MmapBuffer::from_slice(&[1u32, 2, 3], StorageOption::InMemory).expect("from");
    let cap = buf.capacity();
    let err = buf.reserve(usize::MAX / 2).expect_err("reserve must fail");
    assert_eq!(err.class(), ErrorClass::OutOfMemory);
    assert_eq!(buf.capacity(), cap);
    assert_eq!(buf.as_slice(), &[1, 2, 3]);

    // Still usable afterwards.
    buf.push(4).expect("push");
    assert_eq!(buf.as_slice(), &[1, 2, 3, 4]);
}

#[test]
fn test_overflowing_replacement_count_is_an_error() {
    let mut buf = MmapBuffer::from_slice(&[1usize, 2, 3], StorageOption::InMemory).expect("from");
    let cap = buf.capacity();
    let err = buf
        .replace_subrange(0..0, 0..usize::MAX)
        .expect_err("replacement length overflows");
    assert!(matches!(err, MmapBufferError::CapacityOverflow { capacity: usize::MAX, .. }));
    assert_eq!(err.class(), ErrorClass::OutOfMemory);
    assert_eq!(buf.capacity(), cap);
    assert_eq!(buf.as_slice(), &[1, 2, 3]);

    // A shared region takes the copying path; the alias must survive too.
    let alias = buf.clone();
    let err = buf
        .replace_subrange(1..2, 0..usize::MAX)
        .expect_err("replacement length overflows");
    assert!(matches!(err, MmapBufferError::CapacityOverflow { .. }));
    assert_eq!(buf.as_slice(), &[1, 2, 3]);
    assert_eq!(alias.as_slice(), &[1, 2, 3]);
    assert!(buf.shares_storage_with(&alias));
}

#[test]
fn test_unmappable_replacement_leaves_buffer_intact() {
    let mut buf = MmapBuffer::from_slice(&[7usize, 8], StorageOption::InMemory).expect("from");
    let err = buf
        .replace_subrange(2.., 0..usize::MAX / 2)
        .expect_err("replacement cannot be mapped");
    assert_eq!(err.class(), ErrorClass::OutOfMemory);
    assert_eq!(buf.as_slice(), &[7, 8]);

    buf.replace_subrange(1..2, [9, 10]).expect("small replacement");
    assert_eq!(buf.as_slice(), &[7, 9, 10]);
}

#[test]
fn test_missing_spill_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("nope");
    let result = MmapBuffer::<u8>::with_capacity(1, StorageOption::file_backed_in(&missing));
    match result {
        Err(err @ MmapBufferError::FileCreateFailed { .. }) => {
            assert_eq!(err.class(), ErrorClass::Io);
            assert!(err.to_string().contains("nope"));
        }
        other => panic!("Expected FileCreateFailed, got {other:?}"),
    }
}

#[test]
fn test_empty_file_backed_buffer_needs_no_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("later");
    let mut buf = MmapBuffer::<u8>::new_in(StorageOption::file_backed_in(&missing));
    assert!(buf.push(1).is_err());
    assert!(buf.is_empty());

    std::fs::create_dir(&missing).expect("mkdir");
    buf.push(1).expect("push");
    assert_eq!(buf.as_slice(), &[1]);
}

#[test]
#[should_panic(expected = "zero-sized")]
fn test_zero_sized_elements_panic() {
    let _ = MmapBuffer::<()>::new();
}
