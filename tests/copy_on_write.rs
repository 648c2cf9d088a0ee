//! Copy-on-write isolation across every kind of mutation.

use mmap_buffer::{MmapBuffer, StorageOption};

type Mutation = fn(&mut MmapBuffer<u32>);

fn mutations() -> [(&'static str, Mutation); 11] {
    [
        ("push", |b: &mut MmapBuffer<u32>| b.push(99).expect("push")),
        ("set", |b: &mut MmapBuffer<u32>| b.set(0, 99).expect("set")),
        ("replace_subrange", |b: &mut MmapBuffer<u32>| {
            b.replace_subrange(1..3, [7, 7, 7, 7]).expect("replace")
        }),
        ("remove_all keep", |b: &mut MmapBuffer<u32>| b.remove_all(true).expect("remove_all")),
        ("remove_all release", |b: &mut MmapBuffer<u32>| {
            b.remove_all(false).expect("remove_all")
        }),
        ("insert", |b: &mut MmapBuffer<u32>| b.insert(0, 5).expect("insert")),
        ("remove", |b: &mut MmapBuffer<u32>| {
            b.remove(1).expect("remove");
        }),
        ("truncate", |b: &mut MmapBuffer<u32>| b.truncate(1).expect("truncate")),
        ("reserve", |b: &mut MmapBuffer<u32>| b.reserve(1 << 20).expect("reserve")),
        ("extend", |b: &mut MmapBuffer<u32>| b.extend_from_iter(100..200).expect("extend")),
        ("mutable view", |b: &mut MmapBuffer<u32>| {
            b.with_unsafe_mutable_buffer(|s| s.fill(0)).expect("view")
        }),
    ]
}

fn check_isolation(storage: StorageOption) {
    let original: Vec<u32> = (0..64).collect();
    for (name, mutate) in mutations() {
        let a = MmapBuffer::from_slice(&original, storage.clone()).expect("from");
        let mut b = a.clone();
        mutate(&mut b);
        assert_eq!(a.as_slice(), original.as_slice(), "mutation `{name}` leaked");
        assert!(!a.shares_storage_with(&b), "mutation `{name}` kept sharing");
    }
}

#[test]
fn in_memory_clones_are_isolated() {
    check_isolation(StorageOption::InMemory);
}

#[test]
fn file_backed_clones_are_isolated() {
    let dir = tempfile::tempdir().expect("tempdir");
    check_isolation(StorageOption::file_backed_in(dir.path()));
}

#[test]
fn original_mutation_leaves_clone_alone() {
    let mut a = MmapBuffer::from_slice(&[1u8, 2, 3], StorageOption::InMemory).expect("from");
    let b = a.clone();
    a.set(0, 0).expect("set");
    a.push(4).expect("push");
    assert_eq!(b.as_slice(), &[1, 2, 3]);
    assert_eq!(a.as_slice(), &[0, 2, 3, 4]);
}

#[test]
fn unique_buffer_mutates_in_place() {
    let mut a = MmapBuffer::<u8>::with_capacity(100, StorageOption::InMemory).expect("cap");
    a.extend_from_slice(&[1, 2, 3]).expect("extend");
    let base = a.as_ptr();
    a.replace_subrange(0..1, [9, 9]).expect("replace");
    a.set(1, 8).expect("set");
    a.remove_all(true).expect("remove_all");
    a.push(1).expect("push");
    assert_eq!(a.as_ptr(), base);
}

#[test]
fn chain_of_clones() {
    let a = MmapBuffer::from_slice(&[1u32], StorageOption::InMemory).expect("from");
    let b = a.clone();
    let mut c = b.clone();
    c.push(2).expect("push");
    assert!(a.shares_storage_with(&b));
    assert!(!b.shares_storage_with(&c));
    assert_eq!(a, b);
    assert_ne!(b, c);
}
