//! Trash bin: deferred frees.
//!
//! A transactional `free` cannot release memory immediately — the pointer
//! might still be read by a later, divergent phase, and a rolled-back
//! transaction must not have actually freed anything. Instead each phase
//! records the address it would have freed; at commit, every phase's list
//! is compared for length and pointer-identity at each index, and only then
//! is each address freed exactly once.

use crate::error::SeiError;

/// Per-phase list of addresses deferred for freeing.
#[derive(Debug, Default)]
pub struct TrashBin {
    phases: Vec<Vec<usize>>,
    capacity: usize,
    allow_realloc: bool,
}

impl TrashBin {
    /// Creates a trash bin for `phase_count` phases with the given initial
    /// per-phase capacity.
    #[must_use]
    pub fn new(phase_count: usize, capacity: usize, allow_realloc: bool) -> Self {
        Self {
            phases: (0..phase_count).map(|_| Vec::with_capacity(capacity)).collect(),
            capacity,
            allow_realloc,
        }
    }

    /// Records `addr` as deferred for freeing in phase `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::CapacityExceeded`] if growth is disabled and the
    /// phase's list is already at its initial capacity.
    pub fn add(&mut self, phase: usize, addr: usize) -> Result<(), SeiError> {
        let list = &mut self.phases[phase];
        if !self.allow_realloc && list.len() >= self.capacity {
            return Err(SeiError::CapacityExceeded {
                component: "trash bin",
                limit: self.capacity,
            });
        }
        list.push(addr);
        Ok(())
    }

    /// Verifies every phase recorded the same sequence of addresses, then
    /// returns that sequence for the caller to actually free (once each).
    /// Clears all phase lists on success.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::AllocationMismatch`] if phases disagree on how
    /// many addresses were deferred, or on the address at some index.
    pub fn flush(&mut self) -> Result<Vec<usize>, SeiError> {
        let Some((first, rest)) = self.phases.split_first() else {
            return Ok(Vec::new());
        };
        for other in rest {
            if other.len() != first.len() {
                return Err(SeiError::AllocationMismatch { index: first.len().min(other.len()) });
            }
            for (i, (a, b)) in first.iter().zip(other.iter()).enumerate() {
                if a != b {
                    return Err(SeiError::AllocationMismatch { index: i });
                }
            }
        }
        let result = first.clone();
        for list in &mut self.phases {
            list.clear();
        }
        Ok(result)
    }

    /// Clears all phase lists without verifying or returning anything.
    /// Used on rollback: the transaction is retried, and whatever would
    /// have been freed stays allocated for the retry.
    pub fn clear(&mut self) {
        for list in &mut self.phases {
            list.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_phases_flush_the_shared_sequence() {
        let mut bin = TrashBin::new(2, 4, true);
        bin.add(0, 0x1000).unwrap();
        bin.add(0, 0x2000).unwrap();
        bin.add(1, 0x1000).unwrap();
        bin.add(1, 0x2000).unwrap();
        assert_eq!(bin.flush().unwrap(), vec![0x1000, 0x2000]);
    }

    #[test]
    fn diverging_address_is_a_mismatch() {
        let mut bin = TrashBin::new(2, 4, true);
        bin.add(0, 0x1000).unwrap();
        bin.add(1, 0x1001).unwrap();
        assert!(matches!(bin.flush(), Err(SeiError::AllocationMismatch { index: 0 })));
    }

    #[test]
    fn diverging_count_is_a_mismatch() {
        let mut bin = TrashBin::new(2, 4, true);
        bin.add(0, 0x1000).unwrap();
        bin.add(0, 0x2000).unwrap();
        bin.add(1, 0x1000).unwrap();
        assert!(matches!(bin.flush(), Err(SeiError::AllocationMismatch { .. })));
    }

    #[test]
    fn clear_discards_without_checking() {
        let mut bin = TrashBin::new(2, 4, true);
        bin.add(0, 0x1000).unwrap();
        bin.clear();
        assert_eq!(bin.flush().unwrap(), Vec::<usize>::new());
    }

    #[test]
    fn capacity_exceeded_without_realloc() {
        let mut bin = TrashBin::new(1, 1, false);
        bin.add(0, 0x1000).unwrap();
        assert!(matches!(bin.add(0, 0x2000), Err(SeiError::CapacityExceeded { .. })));
    }
}
