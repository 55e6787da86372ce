//! Output buffer: messages a transaction wants to emit, held back until
//! every redundant phase agrees they should be emitted.
//!
//! Each phase appends bytes into its own queue; `done` finalizes the
//! current message (freezing its CRC); `close` rotates which queue
//! subsequent `append`/`done` calls target, one rotation per phase
//! boundary, mirroring [`crate::talloc::TraversalAllocator::switch`]'s
//! phase bookkeeping. At commit, `pop` compares the oldest completed
//! message across every queue — size, completion, and CRC must all agree
//! — and only then is phase 0's copy handed to the caller to actually
//! transmit.

use std::collections::VecDeque;

use crate::crc::Crc32;
use crate::error::SeiError;

#[derive(Debug, Default, Clone)]
struct InProgress {
    bytes: Vec<u8>,
    crc: Crc32,
}

#[derive(Debug, Clone)]
struct Completed {
    bytes: Vec<u8>,
    crc: u32,
}

#[derive(Debug, Default)]
struct Queue {
    ring: VecDeque<Completed>,
    current: InProgress,
}

/// Per-transaction, per-phase output message ledger.
#[derive(Debug)]
pub struct OutputBuffer {
    queues: Vec<Queue>,
    active: usize,
    depth: usize,
    max_msgs: usize,
}

impl OutputBuffer {
    /// Creates an output buffer with one queue per phase.
    #[must_use]
    pub fn new(phase_count: usize, depth: usize, max_msgs: usize) -> Self {
        Self {
            queues: (0..phase_count).map(|_| Queue::default()).collect(),
            active: 0,
            depth,
            max_msgs,
        }
    }

    /// Appends `data` to the message currently under construction in the
    /// active phase's queue.
    pub fn append(&mut self, data: &[u8]) {
        let q = &mut self.queues[self.active];
        q.current.bytes.extend_from_slice(data);
        q.current.crc.append(data);
    }

    /// Finalizes the in-progress message in the active queue, pushing it
    /// onto that queue's completed ring.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::CapacityExceeded`] if the active queue's
    /// completed ring is already at its configured depth, or the process
    /// total would exceed `max_msgs`.
    pub fn done(&mut self) -> Result<(), SeiError> {
        let total_in_flight: usize = self.queues.iter().map(|q| q.ring.len()).sum();
        if total_in_flight >= self.max_msgs {
            return Err(SeiError::CapacityExceeded {
                component: "output buffer (total in-flight)",
                limit: self.max_msgs,
            });
        }
        let q = &mut self.queues[self.active];
        if q.ring.len() >= self.depth {
            return Err(SeiError::CapacityExceeded {
                component: "output buffer queue",
                limit: self.depth,
            });
        }
        let finished = std::mem::take(&mut q.current);
        q.ring.push_back(Completed {
            bytes: finished.bytes,
            crc: finished.crc.close(),
        });
        Ok(())
    }

    /// Rotates which queue subsequent `append`/`done` calls target. Called
    /// once per phase boundary.
    pub fn close(&mut self) {
        self.active = (self.active + 1) % self.queues.len();
    }

    /// Compares the oldest completed message across every phase's queue
    /// and, if they all agree, pops it from every queue and returns phase
    /// 0's copy for the caller to actually transmit.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::OutputDiverged`] if any queue is missing a
    /// message the others have, or its size/CRC disagrees.
    pub fn pop(&mut self) -> Result<Option<Vec<u8>>, SeiError> {
        let fronts: Vec<Option<&Completed>> = self.queues.iter().map(|q| q.ring.front()).collect();
        if fronts.iter().all(Option::is_none) {
            return Ok(None);
        }
        if fronts.iter().any(Option::is_none) {
            return Err(SeiError::OutputDiverged { index: 0 });
        }
        let first = fronts[0].expect("checked non-none above");
        for other in &fronts[1..] {
            let other = other.expect("checked non-none above");
            if other.crc != first.crc || other.bytes.len() != first.bytes.len() {
                return Err(SeiError::OutputDiverged { index: 0 });
            }
        }
        let result = first.bytes.clone();
        for q in &mut self.queues {
            q.ring.pop_front();
        }
        Ok(Some(result))
    }

    /// Number of completed messages still queued in phase 0's queue,
    /// awaiting a matching `pop`.
    #[must_use]
    pub fn size(&self) -> usize {
        self.queues[0].ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_message(obuf: &mut OutputBuffer, bytes: &[u8]) {
        obuf.append(bytes);
        obuf.done().unwrap();
    }

    #[test]
    fn matching_messages_across_phases_pop_cleanly() {
        let mut obuf = OutputBuffer::new(2, 4, 100);
        push_message(&mut obuf, b"hi");
        obuf.close();
        push_message(&mut obuf, b"hi");
        obuf.close();
        assert_eq!(obuf.pop().unwrap(), Some(b"hi".to_vec()));
        assert_eq!(obuf.pop().unwrap(), None);
    }

    #[test]
    fn diverging_message_across_phases_is_rejected() {
        let mut obuf = OutputBuffer::new(2, 4, 100);
        push_message(&mut obuf, b"hi");
        obuf.close();
        push_message(&mut obuf, b"bye");
        obuf.close();
        assert!(matches!(obuf.pop(), Err(SeiError::OutputDiverged { .. })));
    }

    #[test]
    fn missing_message_in_one_queue_is_rejected() {
        let mut obuf = OutputBuffer::new(2, 4, 100);
        push_message(&mut obuf, b"hi");
        obuf.close();
        obuf.close();
        assert!(matches!(obuf.pop(), Err(SeiError::OutputDiverged { .. })));
    }

    #[test]
    fn queue_depth_is_enforced() {
        let mut obuf = OutputBuffer::new(1, 1, 100);
        push_message(&mut obuf, b"a");
        obuf.append(b"b");
        assert!(matches!(obuf.done(), Err(SeiError::CapacityExceeded { .. })));
    }
}
