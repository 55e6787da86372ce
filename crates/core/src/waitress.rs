//! Waitress: deferred external calls.
//!
//! A transaction that needs to make a real, effectful system call (send a
//! packet, close a socket) can't just run it redundantly — the outside
//! world has no concept of "redundant phase" and would see the effect N
//! times. Instead each phase records the call it *would* make (a tag
//! identifying the function, plus its argument values); at commit, the
//! waitress checks every phase recorded the same sequence of calls with
//! the same arguments, and only then actually executes phase 0's calls,
//! in order, exactly once.

use crate::error::SeiError;

/// One recorded deferred call: an opaque function identity and its
/// argument values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitressItem {
    /// Identifies which function this call is for (e.g. a function pointer
    /// cast to `usize`, or a small enum discriminant).
    pub tag: usize,
    /// Argument values, in call order.
    pub args: Vec<u64>,
}

/// Per-phase deferred-call ledger.
#[derive(Debug)]
pub struct Waitress {
    phases: Vec<Vec<WaitressItem>>,
    max_args: usize,
    capacity: usize,
    allow_realloc: bool,
}

impl Waitress {
    /// Creates a waitress for `phase_count` phases.
    #[must_use]
    pub fn new(phase_count: usize, capacity: usize, max_args: usize, allow_realloc: bool) -> Self {
        Self {
            phases: (0..phase_count).map(|_| Vec::with_capacity(capacity)).collect(),
            max_args,
            capacity,
            allow_realloc,
        }
    }

    /// Records a deferred call for `phase`.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::CapacityExceeded`] if `args.len()` exceeds the
    /// configured maximum, or growth is disabled and the phase's ledger is
    /// full.
    pub fn add(&mut self, phase: usize, tag: usize, args: Vec<u64>) -> Result<(), SeiError> {
        if args.len() > self.max_args {
            return Err(SeiError::CapacityExceeded {
                component: "waitress call arguments",
                limit: self.max_args,
            });
        }
        let list = &mut self.phases[phase];
        if !self.allow_realloc && list.len() >= self.capacity {
            return Err(SeiError::CapacityExceeded {
                component: "waitress",
                limit: self.capacity,
            });
        }
        list.push(WaitressItem { tag, args });
        Ok(())
    }

    /// Verifies every phase recorded the exact same sequence of calls.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::SyscallMismatch`] at the first index where
    /// phases disagree on count, function tag, or argument values.
    pub fn can_flush(&self) -> Result<(), SeiError> {
        let Some((first, rest)) = self.phases.split_first() else {
            return Ok(());
        };
        for other in rest {
            if other.len() != first.len() {
                return Err(SeiError::SyscallMismatch {
                    index: first.len().min(other.len()),
                });
            }
            for (i, (a, b)) in first.iter().zip(other.iter()).enumerate() {
                if a != b {
                    return Err(SeiError::SyscallMismatch { index: i });
                }
            }
        }
        Ok(())
    }

    /// Verifies every phase agrees (via [`Waitress::can_flush`]), then
    /// invokes `exec` once per deferred call using phase 0's arguments, in
    /// insertion order, and clears all phase ledgers.
    ///
    /// # Errors
    ///
    /// Propagates [`SeiError::SyscallMismatch`] from [`Waitress::can_flush`]
    /// without executing anything.
    pub fn flush(&mut self, mut exec: impl FnMut(usize, &[u64])) -> Result<(), SeiError> {
        self.can_flush()?;
        for item in &self.phases[0] {
            exec(item.tag, &item.args);
        }
        self.reset();
        Ok(())
    }

    /// Clears every phase's ledger without executing or verifying
    /// anything. Used on rollback.
    pub fn reset(&mut self) {
        for list in &mut self.phases {
            list.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_calls_flush_phase_zero_args_once() {
        let mut wts = Waitress::new(2, 4, 8, true);
        wts.add(0, 1, vec![10, 20]).unwrap();
        wts.add(1, 1, vec![10, 20]).unwrap();
        let mut executed = Vec::new();
        wts.flush(|tag, args| executed.push((tag, args.to_vec()))).unwrap();
        assert_eq!(executed, vec![(1, vec![10, 20])]);
    }

    #[test]
    fn differing_args_are_a_mismatch() {
        let mut wts = Waitress::new(2, 4, 8, true);
        wts.add(0, 1, vec![10]).unwrap();
        wts.add(1, 1, vec![11]).unwrap();
        assert!(matches!(wts.can_flush(), Err(SeiError::SyscallMismatch { .. })));
    }

    #[test]
    fn differing_tags_are_a_mismatch() {
        let mut wts = Waitress::new(2, 4, 8, true);
        wts.add(0, 1, vec![10]).unwrap();
        wts.add(1, 2, vec![10]).unwrap();
        assert!(matches!(wts.can_flush(), Err(SeiError::SyscallMismatch { .. })));
    }

    #[test]
    fn too_many_args_is_capacity_exceeded() {
        let mut wts = Waitress::new(2, 4, 2, true);
        assert!(matches!(
            wts.add(0, 1, vec![1, 2, 3]),
            Err(SeiError::CapacityExceeded { .. })
        ));
    }

    #[test]
    fn reset_drops_unflushed_calls() {
        let mut wts = Waitress::new(2, 4, 8, true);
        wts.add(0, 1, vec![1]).unwrap();
        wts.reset();
        let mut executed = Vec::new();
        wts.flush(|tag, args| executed.push((tag, args.to_vec()))).unwrap();
        assert!(executed.is_empty());
    }
}
