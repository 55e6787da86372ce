//! Property-based coverage for the shadow write buffer's duplicate-write
//! tolerant compare (SPEC_FULL.md §8: "duplicate-write tolerance" and
//! "determinism of reads across phases"). Random interleavings of writes
//! to a small address space are checked against a trivial reference model
//! that just applies every write in order and takes the final value.

use std::collections::HashMap;

use proptest::prelude::*;
use sei_core::shadow::{compare_heap, ShadowBuffer, WriteThroughBuffer};

/// A sequence of writes `(address, byte)` to a four-slot address space,
/// replayed by a phase to build both its shadow log and its reference
/// final memory state.
fn apply(writes: &[(u8, u8)]) -> (WriteThroughBuffer, HashMap<u8, u8>) {
    let mut buf = WriteThroughBuffer::new(writes.len().max(1), true);
    let mut mem: HashMap<u8, u8> = HashMap::new();
    for &(addr, value) in writes {
        let old = mem.get(&addr).copied().unwrap_or(0);
        mem.insert(addr, value);
        buf.record(addr as usize, &[old], &[value]).unwrap();
    }
    (buf, mem)
}

proptest! {
    /// Two phases that apply *different* write sequences but land on the
    /// same final memory state for every address always compare clean —
    /// the hallmark of duplicate-write tolerance.
    #[test]
    fn phases_agreeing_on_final_state_always_compare_clean(
        a in proptest::collection::vec((0u8..4, 0u8..8), 0..12),
        b in proptest::collection::vec((0u8..4, 0u8..8), 0..12),
    ) {
        let (buf_a, final_a) = apply(&a);
        let (buf_b, final_b) = apply(&b);
        prop_assume!(final_a == final_b);
        prop_assert!(compare_heap(&[buf_a.entries(), buf_b.entries()], 10_000).is_ok());
    }

    /// If the two phases' final memory states genuinely differ at some
    /// address, the compare must reject it — duplicate-write tolerance
    /// never hides a real disagreement.
    #[test]
    fn phases_disagreeing_on_final_state_never_compare_clean(
        a in proptest::collection::vec((0u8..4, 0u8..8), 1..12),
        b in proptest::collection::vec((0u8..4, 0u8..8), 1..12),
    ) {
        let (buf_a, final_a) = apply(&a);
        let (buf_b, final_b) = apply(&b);
        prop_assume!(final_a != final_b || buf_a.entries().len() != buf_b.entries().len());
        if final_a != final_b {
            prop_assert!(compare_heap(&[buf_a.entries(), buf_b.entries()], 10_000).is_err());
        }
    }

    /// A phase compared against an identical copy of itself always agrees,
    /// regardless of how many duplicate writes it contains.
    #[test]
    fn a_phase_always_agrees_with_an_identical_copy(
        writes in proptest::collection::vec((0u8..4, 0u8..8), 0..16),
    ) {
        let (buf_a, _) = apply(&writes);
        let (buf_b, _) = apply(&writes);
        prop_assert!(compare_heap(&[buf_a.entries(), buf_b.entries()], 10_000).is_ok());
    }
}
