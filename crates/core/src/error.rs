//! Error taxonomy for the transactional memory runtime.
//!
//! Every fallible operation in this crate returns a [`SeiError`]. The
//! variants mirror the failure modes a redundant, commit-checked execution
//! engine can hit: corrupted or tampered input framing, divergence between
//! redundant phases (in memory, in emitted output, or in control flow),
//! allocator/syscall replay mismatches, and the two process-fatal
//! conditions (capacity exhaustion with growth disabled, and core
//! exhaustion under CPU isolation).

use thiserror::Error;

/// The single error type returned by fallible runtime operations.
#[derive(Debug, Error)]
pub enum SeiError {
    /// The input buffer's CRC did not match the framed length/content.
    #[error("input message corrupted: expected crc {expected:08x}, got {actual:08x}")]
    InputCorrupted {
        /// CRC recorded in the frame.
        expected: u32,
        /// CRC recomputed over the received bytes.
        actual: u32,
    },

    /// Two redundant phases read different bytes for what should be the
    /// same input message.
    #[error("input message tampered with between phases")]
    InputTampered,

    /// The per-phase output queues disagree on size, completion state, or
    /// checksum for a message that should be identical across phases.
    #[error("output diverged across phases at queue index {index}")]
    OutputDiverged {
        /// Index into the output queue where the mismatch was detected.
        index: usize,
    },

    /// The shadow write buffer compare at commit time found a memory value
    /// that disagrees with every redundant phase and cannot be explained by
    /// a later duplicate write.
    #[error("memory diverged at address {addr:#x}: phases disagree and no duplicate write explains it")]
    MemoryDiverged {
        /// Address of the divergent shadow entry.
        addr: usize,
    },

    /// A control-flow counter was observed in the wrong state (set more
    /// than once without an intervening reset, or never set at all).
    #[error("control-flow violation: {detail}")]
    ControlFlowViolated {
        /// Human-readable detail of which gate failed.
        detail: &'static str,
    },

    /// The traversal allocator's replay phases recorded a different number
    /// of allocations, or a different size at the same index, than phase 0.
    #[error("allocator replay mismatch at index {index}")]
    AllocationMismatch {
        /// Index into the allocation record where the mismatch occurred.
        index: usize,
    },

    /// The waitress's pre-flush check found a deferred syscall whose
    /// function pointer, argument count, or argument values disagree across
    /// phases.
    #[error("syscall replay mismatch at waitress slot {index}")]
    SyscallMismatch {
        /// Index into the waitress queue where the mismatch occurred.
        index: usize,
    },

    /// A bounded buffer (output queue, waitress, trash bin, allocator
    /// record) ran out of room and growth is disabled for this build.
    #[error("capacity exceeded in {component} (limit {limit})")]
    CapacityExceeded {
        /// Name of the component that ran out of room.
        component: &'static str,
        /// The configured limit that was hit.
        limit: usize,
    },

    /// CPU isolation blacklisted every available core; the process cannot
    /// continue safely and must exit.
    #[error("all {total} cores have been blacklisted")]
    CoresExhausted {
        /// Total number of cores originally available.
        total: usize,
    },
}

impl SeiError {
    /// The process exit code this error maps to, per the runtime's exit
    /// code contract. Divergence and corruption errors are recoverable via
    /// rollback and do not have an associated exit code (`None`); only the
    /// two unrecoverable conditions do.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CapacityExceeded { .. } => Some(2),
            Self::CoresExhausted { .. } => Some(3),
            _ => None,
        }
    }

    /// True if this error indicates a divergence that should trigger
    /// rollback-and-retry (under CPU isolation) rather than a hard failure.
    ///
    /// Per the runtime's error policy, only a commit-time disagreement in
    /// shared memory or emitted output is ambiguous enough between "real
    /// corruption" and "a transient fault on this core" to be worth retrying
    /// on a different core. Every other kind — tampered input, a
    /// control-flow, allocator, or syscall-replay mismatch, capacity
    /// exhaustion — indicates a bug or a configuration limit that migrating
    /// cores cannot fix, and is always fatal.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::OutputDiverged { .. } | Self::MemoryDiverged { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_and_output_divergence_are_recoverable() {
        assert!(SeiError::MemoryDiverged { addr: 0 }.is_recoverable());
        assert!(SeiError::OutputDiverged { index: 0 }.is_recoverable());
    }

    #[test]
    fn tampering_and_replay_mismatches_are_fatal_not_recoverable() {
        assert!(!SeiError::InputTampered.is_recoverable());
        assert!(!SeiError::ControlFlowViolated { detail: "x" }.is_recoverable());
        assert!(!SeiError::AllocationMismatch { index: 0 }.is_recoverable());
        assert!(!SeiError::SyscallMismatch { index: 0 }.is_recoverable());
        assert!(!SeiError::InputCorrupted { expected: 1, actual: 2 }.is_recoverable());
    }

    #[test]
    fn only_capacity_and_core_exhaustion_carry_exit_codes() {
        assert_eq!(SeiError::CapacityExceeded { component: "x", limit: 1 }.exit_code(), Some(2));
        assert_eq!(SeiError::CoresExhausted { total: 1 }.exit_code(), Some(3));
        assert_eq!(SeiError::MemoryDiverged { addr: 0 }.exit_code(), None);
    }
}
