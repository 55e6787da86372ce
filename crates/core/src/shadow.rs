//! Shadow write buffer — the heart of the system.
//!
//! Every write a transaction makes inside a phase is shadowed: the value
//! that was there before (`old`) and the value being written (`new`) are
//! recorded alongside the address, in addition to the real write going
//! through immediately (write-through, the primary flavour here). At
//! commit, every phase's shadow log is compared; if every phase wrote the
//! same sequence of `(addr, new)` pairs, the redundant executions agree and
//! the transaction is safe to publish. If a phase's recorded value at some
//! position disagrees, the compare does not immediately call it
//! corruption: it first checks whether a *later* entry in that same
//! phase's log wrote the same address again. If so, the apparent
//! divergence is just a legitimate overwrite the simple positional compare
//! doesn't know about, not silent data corruption. Only a disagreement with
//! no such explanation is treated as genuine divergence.
//!
//! A write-back flavour is also provided behind the `cow-write-back`
//! feature: writes are buffered and only applied to memory at commit
//! instead of immediately. It shares the same comparison logic but is the
//! less-exercised of the two (see the crate's design notes).

use crate::error::SeiError;

/// One recorded write: an address, the value there before the write, and
/// the value written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowEntry {
    /// Address written, as an opaque integer key (the owning allocation's
    /// identity, not necessarily a dereferenceable pointer in this crate —
    /// the ABI crate is the one that turns this into a raw pointer).
    pub addr: usize,
    /// Bytes present at `addr` immediately before this write.
    pub old: Vec<u8>,
    /// Bytes written to `addr`.
    pub new: Vec<u8>,
}

/// Common contract for both shadow-buffer flavours.
pub trait ShadowBuffer: std::fmt::Debug {
    /// Records a write of `new` to `addr`, where `old` is the value that
    /// was there immediately before.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::CapacityExceeded`] if growth is disabled and the
    /// buffer is already at its configured capacity.
    fn record(&mut self, addr: usize, old: &[u8], new: &[u8]) -> Result<(), SeiError>;

    /// The entries recorded so far this phase, in write order.
    fn entries(&self) -> &[ShadowEntry];

    /// Clears the buffer for the next transaction.
    fn clean(&mut self);

    /// True if this flavour applies writes immediately (write-through) as
    /// opposed to deferring them to commit (write-back).
    fn is_write_through(&self) -> bool;
}

/// Write-through (append-only) shadow buffer: the primary flavour. Writes
/// are expected to have already been applied to memory by the caller by
/// the time [`WriteThroughBuffer::record`] is called; the buffer exists
/// purely to support the commit-time compare and rollback.
#[derive(Debug, Default)]
pub struct WriteThroughBuffer {
    entries: Vec<ShadowEntry>,
    capacity: usize,
    allow_realloc: bool,
}

impl WriteThroughBuffer {
    /// Creates a write-through buffer with the given initial capacity.
    #[must_use]
    pub fn new(capacity: usize, allow_realloc: bool) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            allow_realloc,
        }
    }
}

impl ShadowBuffer for WriteThroughBuffer {
    fn record(&mut self, addr: usize, old: &[u8], new: &[u8]) -> Result<(), SeiError> {
        if !self.allow_realloc && self.entries.len() >= self.capacity {
            return Err(SeiError::CapacityExceeded {
                component: "shadow write buffer",
                limit: self.capacity,
            });
        }
        self.entries.push(ShadowEntry {
            addr,
            old: old.to_vec(),
            new: new.to_vec(),
        });
        Ok(())
    }

    fn entries(&self) -> &[ShadowEntry] {
        &self.entries
    }

    fn clean(&mut self) {
        self.entries.clear();
    }

    fn is_write_through(&self) -> bool {
        true
    }
}

/// Write-back shadow buffer: writes are buffered, not applied, until
/// [`WriteBackBuffer::pending`] is drained by the caller at commit.
/// Experimental — see the crate's design notes. Enabled with the
/// `cow-write-back` feature.
#[cfg(feature = "cow-write-back")]
#[derive(Debug, Default)]
pub struct WriteBackBuffer {
    entries: Vec<ShadowEntry>,
    capacity: usize,
    allow_realloc: bool,
}

#[cfg(feature = "cow-write-back")]
impl WriteBackBuffer {
    /// Creates a write-back buffer with the given initial capacity.
    #[must_use]
    pub fn new(capacity: usize, allow_realloc: bool) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            allow_realloc,
        }
    }

    /// Entries not yet applied to memory, in write order. The caller drains
    /// these at commit, applying `new` to `addr` for each.
    #[must_use]
    pub fn pending(&self) -> &[ShadowEntry] {
        &self.entries
    }
}

#[cfg(feature = "cow-write-back")]
impl ShadowBuffer for WriteBackBuffer {
    fn record(&mut self, addr: usize, old: &[u8], new: &[u8]) -> Result<(), SeiError> {
        if !self.allow_realloc && self.entries.len() >= self.capacity {
            return Err(SeiError::CapacityExceeded {
                component: "shadow write buffer (write-back)",
                limit: self.capacity,
            });
        }
        self.entries.push(ShadowEntry {
            addr,
            old: old.to_vec(),
            new: new.to_vec(),
        });
        Ok(())
    }

    fn entries(&self) -> &[ShadowEntry] {
        &self.entries
    }

    fn clean(&mut self) {
        self.entries.clear();
    }

    fn is_write_through(&self) -> bool {
        false
    }
}

/// Restores `old` values for every entry, in reverse write order, via
/// `write`. Used both for genuine rollback (the transaction diverged and
/// must retry from a clean slate) and, in write-through mode, to undo a
/// finished phase's writes so the next phase starts from the same memory
/// state it did.
pub fn restore(entries: &[ShadowEntry], mut write: impl FnMut(usize, &[u8])) {
    for entry in entries.iter().rev() {
        write(entry.addr, &entry.old);
    }
}

/// Commit-time comparison across every phase's shadow log, tolerant of
/// duplicate writes: a position where one phase's recorded `(addr, new)`
/// disagrees with phase 0's is only divergence if no *later* entry in that
/// same phase's log writes the same address again.
///
/// # Errors
///
/// Returns [`SeiError::MemoryDiverged`] if phases recorded a different
/// number of writes, or a write with no duplicate-write explanation
/// disagrees with phase 0. Returns [`SeiError::CapacityExceeded`] if the
/// number of tolerated conflicts exceeds `max_conflicts` (a scan budget,
/// not a correctness bound — beyond it we stop trusting the tolerance
/// heuristic and report it as capacity exhaustion rather than silently
/// keep scanning).
pub fn compare_heap(phases: &[&[ShadowEntry]], max_conflicts: usize) -> Result<(), SeiError> {
    let Some((reference, rest)) = phases.split_first() else {
        return Ok(());
    };
    let mut conflicts = 0usize;
    for phase in rest {
        if phase.len() != reference.len() {
            return Err(SeiError::MemoryDiverged {
                addr: reference.len().min(phase.len()),
            });
        }
        for (i, (r, p)) in reference.iter().zip(phase.iter()).enumerate() {
            if r.addr == p.addr && r.new == p.new {
                continue;
            }
            let explained_by_duplicate = phase[i + 1..].iter().any(|later| later.addr == r.addr);
            if !explained_by_duplicate {
                return Err(SeiError::MemoryDiverged { addr: r.addr });
            }
            conflicts += 1;
            if conflicts > max_conflicts {
                return Err(SeiError::CapacityExceeded {
                    component: "shadow buffer conflict scan",
                    limit: max_conflicts,
                });
            }
        }
    }
    Ok(())
}

/// Non-destructive variant of [`compare_heap`] used by the CPU-isolation
/// retry path: reports whether the phases agree without requiring the
/// caller to have already cleared anything, and without mutating state.
#[must_use]
pub fn try_compare_heap(phases: &[&[ShadowEntry]], max_conflicts: usize) -> bool {
    compare_heap(phases, max_conflicts).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_writes_across_phases_compare_clean() {
        let mut a = WriteThroughBuffer::new(4, true);
        let mut b = WriteThroughBuffer::new(4, true);
        a.record(0x10, &[0], &[1]).unwrap();
        b.record(0x10, &[0], &[1]).unwrap();
        compare_heap(&[a.entries(), b.entries()], 100).unwrap();
    }

    #[test]
    fn genuine_divergence_is_detected() {
        let mut a = WriteThroughBuffer::new(4, true);
        let mut b = WriteThroughBuffer::new(4, true);
        a.record(0x10, &[0], &[1]).unwrap();
        b.record(0x10, &[0], &[2]).unwrap();
        assert!(matches!(
            compare_heap(&[a.entries(), b.entries()], 100),
            Err(SeiError::MemoryDiverged { .. })
        ));
    }

    #[test]
    fn duplicate_write_in_one_phase_is_tolerated() {
        // phase 0 writes 0x10 twice, settling on value 1 both times.
        let mut reference = WriteThroughBuffer::new(4, true);
        reference.record(0x10, &[0], &[1]).unwrap();
        reference.record(0x10, &[1], &[1]).unwrap();

        // phase 1 writes 0x10 twice too, but passes through an
        // intermediate value of 5 before settling on 1. Position 0
        // disagrees (5 vs 1) but position 1 (a later write to the same
        // address) shows it was legitimately overwritten, not corrupted.
        let mut replay = WriteThroughBuffer::new(4, true);
        replay.record(0x10, &[0], &[5]).unwrap();
        replay.record(0x10, &[5], &[1]).unwrap();

        compare_heap(&[reference.entries(), replay.entries()], 100).unwrap();
    }

    #[test]
    fn restore_writes_old_values_in_reverse_order() {
        let mut buf = WriteThroughBuffer::new(4, true);
        buf.record(0x10, &[0], &[1]).unwrap();
        buf.record(0x10, &[1], &[2]).unwrap();
        let mut order = Vec::new();
        restore(buf.entries(), |addr, old| order.push((addr, old.to_vec())));
        assert_eq!(order, vec![(0x10, vec![1]), (0x10, vec![0])]);
    }

    #[test]
    fn mismatched_entry_counts_diverge() {
        let mut a = WriteThroughBuffer::new(4, true);
        let b = WriteThroughBuffer::new(4, true);
        a.record(0x10, &[0], &[1]).unwrap();
        assert!(matches!(
            compare_heap(&[a.entries(), b.entries()], 100),
            Err(SeiError::MemoryDiverged { .. })
        ));
    }
}
