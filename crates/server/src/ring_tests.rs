// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn empty_snapshot() {
    let ring = Scrollback::new(16);
    assert!(ring.snapshot().is_empty());
    assert!(ring.is_empty());
    assert_eq!(ring.total_written(), 0);
}

#[test]
fn sequential_appends() {
    let mut ring = Scrollback::new(16);
    ring.append(b"hello");
    ring.append(b" world");

    assert_eq!(ring.snapshot(), b"hello world");
    assert_eq!(ring.len(), 11);
    assert_eq!(ring.total_written(), 11);
}

#[test]
fn overflow_trims_from_head() {
    let mut ring = Scrollback::new(8);
    ring.append(b"abcdef"); // write_pos=6
    ring.append(b"ghij"); // wraps, write_pos=2

    assert_eq!(ring.snapshot(), b"cdefghij");
    assert_eq!(ring.len(), 8);
    assert_eq!(ring.total_written(), 10);
}

#[test]
fn oversized_append_keeps_exact_tail() {
    let mut ring = Scrollback::new(4);
    ring.append(b"abcdefghij");
    assert_eq!(ring.snapshot(), b"ghij");
    assert_eq!(ring.total_written(), 10);
}

#[test]
fn exact_capacity_append() {
    let mut ring = Scrollback::new(4);
    ring.append(b"abcd");
    assert_eq!(ring.snapshot(), b"abcd");
}

#[test]
fn clear_empties_but_keeps_counter() {
    let mut ring = Scrollback::new(8);
    ring.append(b"abcdef");
    ring.clear();

    assert!(ring.snapshot().is_empty());
    assert_eq!(ring.total_written(), 6);

    // Writes after clear start fresh.
    ring.append(b"xy");
    assert_eq!(ring.snapshot(), b"xy");
}

#[test]
fn zero_capacity_is_inert() {
    let mut ring = Scrollback::new(0);
    ring.append(b"abc");
    assert!(ring.snapshot().is_empty());
    assert_eq!(ring.total_written(), 3);
}

#[test]
fn snapshot_is_last_cap_bytes_of_long_stream() {
    let mut ring = Scrollback::new(64);
    let mut stream = Vec::new();
    for i in 0u32..100 {
        let chunk = format!("chunk-{i};");
        stream.extend_from_slice(chunk.as_bytes());
        ring.append(chunk.as_bytes());
    }
    let expected = &stream[stream.len() - 64..];
    assert_eq!(ring.snapshot(), expected);
}

proptest::proptest! {
    /// For any chunking of any stream, the snapshot is exactly the stream's
    /// last `cap` bytes.
    #[test]
    fn snapshot_is_always_the_tail(
        chunks in proptest::collection::vec(
            proptest::collection::vec(proptest::prelude::any::<u8>(), 0..48),
            0..24,
        ),
    ) {
        let mut ring = Scrollback::new(32);
        let mut stream = Vec::new();
        for chunk in &chunks {
            ring.append(chunk);
            stream.extend_from_slice(chunk);
        }
        let tail = stream.len().min(32);
        proptest::prop_assert_eq!(ring.snapshot(), &stream[stream.len() - tail..]);
    }
}
