//! Input buffer: CRC-verified message delivery into a transaction.
//!
//! `prepare` hands a message's bytes to the transaction once per phase.
//! Phase 0's bytes are taken as ground truth (their CRC is recorded as
//! `crc_on_entry`); what every later phase's bytes must agree with then
//! depends on the message's [`Mode`], per SPEC_FULL.md §4.5's data model:
//!
//! - [`Mode::ReadOnly`]: the message must never change. Every phase is
//!   checked against the fixed `crc_on_entry` recorded at phase 0, for the
//!   whole transaction.
//! - [`Mode::ReadWrite`]: the message is allowed to be mutated in place by
//!   the transaction body. Each phase is checked against `crc_if_mutated`,
//!   a snapshot re-taken (by re-reading the message's live bytes, not
//!   trusting a stale copy) at every phase-switch boundary — so the
//!   baseline a later phase is compared against is "whatever the
//!   immediately preceding phase left the message as," not the untouched
//!   entry bytes.
//!
//! A zero-length (or absent) message is always accepted — there is nothing
//! to disagree about — which is what lets callers uniformly route both
//! "a message arrived" and "no message this round" through the same path.

use crate::crc::crc32;
use crate::engine::Memory;
use crate::error::SeiError;

/// Whether an input message may be mutated in place during the
/// transaction it was handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The message must be bit-identical at every phase and at commit.
    ReadOnly,
    /// The message may be mutated; every phase must reproduce the same
    /// mutation as the phase before it.
    ReadWrite,
}

#[derive(Debug, Clone, Copy)]
struct Record {
    addr: Option<usize>,
    size: usize,
    mode: Mode,
    crc_on_entry: u32,
    crc_if_mutated: Option<u32>,
}

/// Per-transaction input message ledger.
#[derive(Debug, Default)]
pub struct InputBuffer {
    phase: usize,
    cursor: usize,
    recorded: Vec<Record>,
    capacity: usize,
    allow_realloc: bool,
}

impl InputBuffer {
    /// Creates an input buffer with the given initial per-transaction
    /// message capacity.
    #[must_use]
    pub fn new(capacity: usize, allow_realloc: bool) -> Self {
        Self {
            phase: 0,
            cursor: 0,
            recorded: Vec::with_capacity(capacity),
            capacity,
            allow_realloc,
        }
    }

    /// Hands `data` to the transaction as the next input message for the
    /// current phase, read from `addr` (`None` for the null-message case).
    /// An empty slice is always accepted: its CRC is deterministic and so
    /// trivially agrees across phases regardless of `mode`.
    ///
    /// # Errors
    ///
    /// On phase 0: [`SeiError::CapacityExceeded`] if growth is disabled
    /// and the message ledger is full.
    ///
    /// On later phases: [`SeiError::InputTampered`] if this phase's bytes
    /// checksum differently than the expected baseline for this message's
    /// [`Mode`] (phase 0's entry CRC for [`Mode::ReadOnly`], the previous
    /// phase's snapshot for [`Mode::ReadWrite`]), or
    /// [`SeiError::InputCorrupted`] if this phase is preparing more
    /// messages than phase 0 did.
    pub fn prepare(&mut self, addr: Option<usize>, data: &[u8], mode: Mode) -> Result<(), SeiError> {
        let crc = crc32(data);
        if self.phase == 0 {
            if !self.allow_realloc && self.recorded.len() >= self.capacity {
                return Err(SeiError::CapacityExceeded {
                    component: "input buffer",
                    limit: self.capacity,
                });
            }
            self.recorded.push(Record {
                addr,
                size: data.len(),
                mode,
                crc_on_entry: crc,
                crc_if_mutated: None,
            });
            self.cursor += 1;
            return Ok(());
        }
        let Some(rec) = self.recorded.get(self.cursor) else {
            return Err(SeiError::InputCorrupted {
                expected: 0,
                actual: crc,
            });
        };
        let expected = match rec.mode {
            Mode::ReadOnly => rec.crc_on_entry,
            Mode::ReadWrite => rec.crc_if_mutated.unwrap_or(rec.crc_on_entry),
        };
        if crc != expected {
            return Err(SeiError::InputTampered);
        }
        self.cursor += 1;
        Ok(())
    }

    /// Convenience for the null-message case: equivalent to
    /// `prepare(None, &[], mode)`.
    ///
    /// # Errors
    ///
    /// Same as [`InputBuffer::prepare`].
    pub fn prepare_nm(&mut self, mode: Mode) -> Result<(), SeiError> {
        self.prepare(None, &[], mode)
    }

    /// Advances to the next phase, resetting the per-phase message cursor.
    /// For every [`Mode::ReadWrite`] message with a known address, re-reads
    /// its current bytes through `memory` and re-snapshots `crc_if_mutated`
    /// — the baseline the next phase's [`InputBuffer::prepare`] call is
    /// checked against, in place of the frozen entry CRC.
    pub fn switch<M: Memory>(&mut self, memory: &mut M) {
        for rec in &mut self.recorded {
            if rec.mode == Mode::ReadWrite {
                if let Some(addr) = rec.addr {
                    let bytes = memory.read(addr, rec.size);
                    rec.crc_if_mutated = Some(crc32(&bytes));
                }
            }
        }
        self.phase += 1;
        self.cursor = 0;
    }

    /// Verifies every phase prepared exactly as many messages as phase 0
    /// did, then resets the buffer for the next transaction.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::InputCorrupted`] if the final phase's cursor
    /// does not equal the number of messages phase 0 recorded.
    pub fn correct(&mut self) -> Result<(), SeiError> {
        if self.cursor != self.recorded.len() {
            return Err(SeiError::InputCorrupted {
                expected: self.recorded.len() as u32,
                actual: self.cursor as u32,
            });
        }
        self.recorded.clear();
        self.cursor = 0;
        self.phase = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeMemory(HashMap<usize, Vec<u8>>);

    impl Memory for FakeMemory {
        fn read(&mut self, addr: usize, len: usize) -> Vec<u8> {
            self.0.get(&addr).cloned().unwrap_or_else(|| vec![0; len])
        }
        fn write(&mut self, addr: usize, bytes: &[u8]) {
            self.0.insert(addr, bytes.to_vec());
        }
    }

    #[test]
    fn identical_bytes_across_phases_are_accepted_read_only() {
        let mut ibuf = InputBuffer::new(4, true);
        let mut mem = FakeMemory(HashMap::new());
        ibuf.prepare(None, b"hello", Mode::ReadOnly).unwrap();
        ibuf.switch(&mut mem);
        ibuf.prepare(None, b"hello", Mode::ReadOnly).unwrap();
        ibuf.correct().unwrap();
    }

    #[test]
    fn differing_bytes_across_phases_are_tampered_read_only() {
        let mut ibuf = InputBuffer::new(4, true);
        let mut mem = FakeMemory(HashMap::new());
        ibuf.prepare(None, b"hello", Mode::ReadOnly).unwrap();
        ibuf.switch(&mut mem);
        assert!(matches!(
            ibuf.prepare(None, b"world", Mode::ReadOnly),
            Err(SeiError::InputTampered)
        ));
    }

    #[test]
    fn null_message_is_always_accepted() {
        let mut ibuf = InputBuffer::new(4, true);
        let mut mem = FakeMemory(HashMap::new());
        ibuf.prepare_nm(Mode::ReadOnly).unwrap();
        ibuf.switch(&mut mem);
        ibuf.prepare_nm(Mode::ReadOnly).unwrap();
        ibuf.correct().unwrap();
    }

    #[test]
    fn extra_message_on_replay_phase_is_corrupted() {
        let mut ibuf = InputBuffer::new(4, true);
        let mut mem = FakeMemory(HashMap::new());
        ibuf.prepare(None, b"a", Mode::ReadOnly).unwrap();
        ibuf.switch(&mut mem);
        ibuf.prepare(None, b"a", Mode::ReadOnly).unwrap();
        assert!(matches!(
            ibuf.prepare(None, b"b", Mode::ReadOnly),
            Err(SeiError::InputCorrupted { .. })
        ));
    }

    #[test]
    fn unfinished_replay_fails_correct() {
        let mut ibuf = InputBuffer::new(4, true);
        let mut mem = FakeMemory(HashMap::new());
        ibuf.prepare(None, b"a", Mode::ReadOnly).unwrap();
        ibuf.prepare(None, b"b", Mode::ReadOnly).unwrap();
        ibuf.switch(&mut mem);
        ibuf.prepare(None, b"a", Mode::ReadOnly).unwrap();
        assert!(matches!(ibuf.correct(), Err(SeiError::InputCorrupted { .. })));
    }

    #[test]
    fn read_write_message_tolerates_a_consistent_in_place_mutation() {
        // The transaction body mutates the message bytes at `addr` during
        // phase 0, after prepare() was called with the entry bytes. By the
        // time `switch` runs, the buffer's live bytes already reflect that
        // mutation; every later phase is expected to reproduce it exactly.
        let mut ibuf = InputBuffer::new(4, true);
        let mut mem = FakeMemory(HashMap::new());
        mem.write(0x40, b"hello");

        ibuf.prepare(Some(0x40), b"hello", Mode::ReadWrite).unwrap();
        mem.write(0x40, b"HELLO"); // in-place mutation during phase 0
        ibuf.switch(&mut mem); // snapshots crc_if_mutated from the mutated bytes

        ibuf.prepare(Some(0x40), b"HELLO", Mode::ReadWrite).unwrap();
        ibuf.correct().unwrap();
    }

    #[test]
    fn read_write_message_rejects_a_phase_that_fails_to_reproduce_the_mutation() {
        let mut ibuf = InputBuffer::new(4, true);
        let mut mem = FakeMemory(HashMap::new());
        mem.write(0x40, b"hello");

        ibuf.prepare(Some(0x40), b"hello", Mode::ReadWrite).unwrap();
        mem.write(0x40, b"HELLO");
        ibuf.switch(&mut mem);

        // this phase never performed the mutation: still "hello".
        assert!(matches!(
            ibuf.prepare(Some(0x40), b"hello", Mode::ReadWrite),
            Err(SeiError::InputTampered)
        ));
    }

    #[test]
    fn read_only_message_rejects_any_mutation_even_though_read_write_would_tolerate_it() {
        let mut ibuf = InputBuffer::new(4, true);
        let mut mem = FakeMemory(HashMap::new());
        mem.write(0x40, b"hello");

        ibuf.prepare(Some(0x40), b"hello", Mode::ReadOnly).unwrap();
        mem.write(0x40, b"HELLO");
        ibuf.switch(&mut mem);

        assert!(matches!(
            ibuf.prepare(Some(0x40), b"HELLO", Mode::ReadOnly),
            Err(SeiError::InputTampered)
        ));
    }
}
