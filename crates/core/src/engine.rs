//! The phase engine: orchestrates begin/switch/commit across N redundant
//! phases, owns every other component, and drives rollback-and-retry.
//!
//! The primary entry point, [`Engine::run`], is an "outer dispatching
//! loop": it calls the caller's closure once per phase instead of
//! snapshotting and restoring a raw CPU context to re-enter the same call
//! site. This is an explicitly sanctioned equivalent for idiomatic Rust —
//! a closure already captures everything a raw context switch would need
//! to restore. The lower-level, C-ABI-facing re-entry mechanism (for
//! instrumented code that cannot be expressed as a Rust closure) lives in
//! the separate ABI crate.
//!
//! Effects that must only ever happen once — freeing a deferred pointer,
//! issuing a deferred syscall — are deliberately *not* performed by this
//! crate. `commit` verifies they agree across every phase and hands the
//! agreed list back through [`Engine::take_freed`] / [`Engine::take_calls`],
//! for the caller (the ABI crate, which owns the real pointers and the real
//! libc symbols) to actually carry out. Emitted output works the same way
//! through [`Engine::output_next`]: this crate never transmits anything.

use std::collections::VecDeque;

use tracing::{debug, error, trace, warn};

use crate::buffers::{InputBuffer, Mode, OutputBuffer};
use crate::cf::CfCounter;
use crate::config::Config;
use crate::cpu::CpuIsolation;
use crate::crc;
use crate::error::SeiError;
use crate::shadow::{self, ShadowBuffer, ShadowEntry, WriteThroughBuffer};
use crate::stash::{Handle, Stash};
use crate::talloc::TraversalAllocator;
use crate::trash::TrashBin;
use crate::waitress::{Waitress, WaitressItem};

/// A phase number in `-1..N-1`. `-1` means "outside any transaction".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Phase(i8);

impl Phase {
    /// The sentinel value for "not currently inside a transaction".
    pub const OUTSIDE: Phase = Phase(-1);

    /// The underlying phase index, or `None` if [`Phase::OUTSIDE`].
    #[must_use]
    pub fn index(self) -> Option<usize> {
        (self.0 >= 0).then_some(self.0 as usize)
    }
}

/// A completed, cross-phase-verified output message, ready to transmit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMessage {
    /// The message bytes every phase agreed on.
    pub bytes: Vec<u8>,
    /// `compute(bytes)`, the CRC32C to prefix the wire frame with.
    pub crc: u32,
}

/// A caller-provided view of the memory a transaction reads and writes.
/// The engine never dereferences raw pointers itself — that is the ABI
/// crate's job at the FFI boundary — it only asks this trait to read the
/// bytes at an address before a write (so they can be shadowed) and to
/// write new bytes after recording them.
pub trait Memory {
    /// Reads `len` bytes at `addr`.
    fn read(&mut self, addr: usize, len: usize) -> Vec<u8>;
    /// Writes `bytes` to `addr`.
    fn write(&mut self, addr: usize, bytes: &[u8]);
}

/// Per-phase handle a transaction body uses to perform shadowed
/// operations. Borrowed from the [`Engine`] for the duration of one phase
/// call inside [`Engine::run`].
pub struct Transaction<'a, M: Memory> {
    engine: &'a mut Engine,
    memory: &'a mut M,
    phase: usize,
}

impl<'a, M: Memory> Transaction<'a, M> {
    /// The phase number this body invocation is executing as (`0..N`).
    #[must_use]
    pub fn phase(&self) -> usize {
        self.phase
    }

    /// Performs a shadowed write: reads the current bytes at `addr` (so
    /// they can be restored on rollback or replay), writes `new` through
    /// to memory immediately, and records both in this phase's shadow
    /// buffer.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::CapacityExceeded`] if the shadow buffer is full
    /// and growth is disabled.
    pub fn write(&mut self, addr: usize, new: &[u8]) -> Result<(), SeiError> {
        let old = self.memory.read(addr, new.len());
        self.memory.write(addr, new);
        self.engine.shadow[self.phase].record(addr, &old, new)
    }

    /// Reads `len` bytes at `addr` without shadowing anything. Read-only;
    /// a transaction body that wants to read-modify-write should read
    /// first, then pass the computed value to [`Transaction::write`] (the
    /// write side is what gets shadowed and compared at commit, not the
    /// read).
    pub fn read(&mut self, addr: usize, len: usize) -> Vec<u8> {
        self.memory.read(addr, len)
    }

    /// Traversal-allocates `len` bytes at (or, on replay phases, in place
    /// of) `addr`. The caller performs the real allocation on phase 0 and
    /// passes its address in; on replay phases the caller should still
    /// perform (and then immediately free) a throwaway allocation of the
    /// same size, using the address this method returns instead.
    ///
    /// # Errors
    ///
    /// See [`TraversalAllocator::alloc`].
    pub fn alloc(&mut self, addr: usize, len: usize) -> Result<usize, SeiError> {
        self.engine.talloc.alloc(addr, len)
    }

    /// Defers a free of `addr` to commit time. The address is only
    /// actually freed once every phase's trash bin agrees; see
    /// [`Engine::take_freed`].
    ///
    /// # Errors
    ///
    /// See [`TrashBin::add`].
    pub fn free(&mut self, addr: usize) -> Result<(), SeiError> {
        self.engine.tbin.add(self.phase, addr)
    }

    /// Hands an input message's bytes, read from `addr` (`None` for the
    /// null-message case), to the transaction for this phase under `mode`.
    /// Cross-phase tampering — this phase's bytes disagreeing with the
    /// baseline [`Mode`] establishes — is caught here; validating the
    /// message against its wire-frame CRC happens once, before `begin`, via
    /// [`Engine::verify_input`].
    ///
    /// # Errors
    ///
    /// See [`InputBuffer::prepare`].
    pub fn input(&mut self, addr: Option<usize>, data: &[u8], mode: Mode) -> Result<(), SeiError> {
        self.engine.ibuf.prepare(addr, data, mode)
    }

    /// Appends bytes to the output message under construction on the
    /// default stream (handle `0`).
    pub fn output_append(&mut self, data: &[u8]) {
        self.engine.obuf.append(data);
    }

    /// Finalizes the output message under construction on the default
    /// stream.
    ///
    /// # Errors
    ///
    /// See [`OutputBuffer::done`].
    pub fn output_done(&mut self) -> Result<(), SeiError> {
        self.engine.obuf.done()
    }

    /// Appends bytes to the output message under construction on `handle`'s
    /// stream (see [`Transaction::shift`]).
    ///
    /// # Panics
    ///
    /// Panics if `handle` was not obtained from this engine's
    /// [`Transaction::shift`].
    pub fn output_append_on(&mut self, handle: Handle, data: &[u8]) {
        self.engine
            .stash
            .get_mut(handle)
            .expect("handle must come from this engine's shift()")
            .append(data);
    }

    /// Finalizes the in-progress message on `handle`'s stream.
    ///
    /// # Errors
    ///
    /// See [`OutputBuffer::done`].
    ///
    /// # Panics
    ///
    /// Panics if `handle` was not obtained from this engine's
    /// [`Transaction::shift`].
    pub fn output_done_on(&mut self, handle: Handle) -> Result<(), SeiError> {
        self.engine
            .stash
            .get_mut(handle)
            .expect("handle must come from this engine's shift()")
            .done()
    }

    /// Allocates a new, stable output-stream handle (see [`crate::stash`]).
    /// Handle identity is monotonic and stable for the engine's lifetime,
    /// not scoped to one transaction.
    pub fn shift(&mut self, depth: usize, max_msgs: usize) -> Handle {
        let obuf = OutputBuffer::new(self.engine.redundancy as usize, depth, max_msgs);
        self.engine.stash.add(obuf)
    }

    /// Defers a syscall-shaped external call to commit time. The call is
    /// only actually issued once every phase agrees on its tag and
    /// arguments; see [`Engine::take_calls`].
    ///
    /// # Errors
    ///
    /// See [`Waitress::add`].
    pub fn defer_call(&mut self, tag: usize, args: Vec<u64>) -> Result<(), SeiError> {
        self.engine.waitress.add(self.phase, tag, args)
    }
}

/// Owns every runtime component and drives the begin/switch/commit
/// lifecycle across `N` redundant phases.
pub struct Engine {
    config: Config,
    redundancy: u8,
    phase: Phase,
    cf: Vec<CfCounter>,
    shadow: Vec<WriteThroughBuffer>,
    talloc: TraversalAllocator,
    tbin: TrashBin,
    ibuf: InputBuffer,
    obuf: OutputBuffer,
    waitress: Waitress,
    stash: Stash<OutputBuffer>,
    isolation: Option<CpuIsolation>,
    max_retries: usize,
    pending_frees: Vec<usize>,
    pending_calls: Vec<WaitressItem>,
    pending_output: VecDeque<OutputMessage>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("redundancy", &self.redundancy)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine from `config`, with no CPU isolation registry
    /// (a commit-time divergence is always fatal — there is no spare core
    /// to migrate to).
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_isolation(config, None)
    }

    /// Creates an engine from `config` with CPU isolation backed by
    /// `num_cores` cores: a commit-time divergence rolls back, blacklists
    /// the core the attempt ran on, migrates, and retries.
    #[must_use]
    pub fn with_cpu_isolation(config: Config, num_cores: usize) -> Self {
        Self::with_isolation(config, Some(CpuIsolation::new(num_cores)))
    }

    fn with_isolation(config: Config, isolation: Option<CpuIsolation>) -> Self {
        let n = config.redundancy as usize;
        Self {
            redundancy: config.redundancy,
            phase: Phase::OUTSIDE,
            cf: vec![CfCounter::default(); n],
            shadow: (0..n)
                .map(|_| WriteThroughBuffer::new(config.cow_size, config.allow_realloc))
                .collect(),
            talloc: TraversalAllocator::new(config.talloc_max_allocs, config.allow_realloc),
            tbin: TrashBin::new(n, config.tbin_size, config.allow_realloc),
            ibuf: InputBuffer::new(config.obuf_size, config.allow_realloc),
            obuf: OutputBuffer::new(n, config.obuf_size, config.obuf_max_msgs),
            waitress: Waitress::new(n, config.sc_max_calls, config.wts_max_arg, config.allow_realloc),
            stash: Stash::with_capacity(4),
            isolation,
            max_retries: 8,
            pending_frees: Vec::new(),
            pending_calls: Vec::new(),
            pending_output: VecDeque::new(),
            config,
        }
    }

    /// Number of redundant phases this engine executes per transaction.
    #[must_use]
    pub fn redundancy(&self) -> usize {
        self.redundancy as usize
    }

    /// Validates `data` against a wire-frame CRC32C prefix before a
    /// transaction begins. Returns `false` (reject; caller discards the
    /// message, transaction never starts) on mismatch. The empty-message
    /// case is always accepted.
    #[must_use]
    pub fn verify_input(data: &[u8], crc: u32) -> bool {
        crc::verify_frame(data, crc)
    }

    /// Takes every address this transaction's trash bin agreed to free
    /// across all phases, since the last call. The caller must free each
    /// address exactly once (this crate never touches raw pointers).
    pub fn take_freed(&mut self) -> Vec<usize> {
        std::mem::take(&mut self.pending_frees)
    }

    /// Takes every deferred call this transaction's waitress agreed on
    /// across all phases, since the last call, in insertion order. The
    /// caller must issue each exactly once, using the recorded arguments
    /// (this crate never touches libc or the network).
    pub fn take_calls(&mut self) -> Vec<WaitressItem> {
        std::mem::take(&mut self.pending_calls)
    }

    /// Pops the oldest cross-phase-verified output message ready to
    /// transmit, if any, from the default stream. Analogous to the spec's
    /// `output_next`, called by the caller after commit.
    pub fn output_next(&mut self) -> Option<OutputMessage> {
        self.pending_output.pop_front()
    }

    /// Number of completed, not-yet-retrieved output messages.
    #[must_use]
    pub fn output_pending(&self) -> usize {
        self.pending_output.len()
    }

    /// Runs `body` redundantly across all `N` phases, comparing shadow
    /// buffers, control-flow counters, input/output framing, and deferred
    /// allocations/calls at commit. On a commit-time divergence
    /// ([`SeiError::MemoryDiverged`] or [`SeiError::OutputDiverged`]),
    /// rolls every phase's writes back; if CPU isolation is configured it
    /// then blacklists the core the attempt ran on, migrates, and retries
    /// (up to a bounded number of attempts), otherwise the rolled-back
    /// error is returned immediately. Every other error kind is always
    /// fatal, returned without a retry.
    ///
    /// Returns the last phase's result once commit succeeds.
    ///
    /// # Errors
    ///
    /// Returns the triggering [`SeiError`] if retries are exhausted or the
    /// error is not recoverable.
    pub fn run<M, F, R>(&mut self, memory: &mut M, body: F) -> Result<R, SeiError>
    where
        M: Memory,
        F: FnMut(&mut Transaction<'_, M>) -> R,
    {
        self.run_monitored(memory, body, || None)
    }

    /// As [`Engine::run`], but also polls `fault` after every phase body
    /// invocation, before that phase's writes are trusted. If `fault`
    /// returns `Some(addr)`, the in-progress attempt is abandoned
    /// immediately as a [`SeiError::MemoryDiverged`] at `addr`, without
    /// reaching commit — the hook the ABI crate's `SIGSEGV` handler uses
    /// to fold a hardware fault mid-phase into the same rollback-and-retry
    /// path as a detected memory mismatch. A fault reported only after a
    /// phase has already committed cleanly cannot be recovered by rollback
    /// (there is nothing left to undo) and is out of scope for this hook.
    ///
    /// # Errors
    ///
    /// See [`Engine::run`].
    pub fn run_monitored<M, F, R>(
        &mut self,
        memory: &mut M,
        mut body: F,
        mut fault: impl FnMut() -> Option<usize>,
    ) -> Result<R, SeiError>
    where
        M: Memory,
        F: FnMut(&mut Transaction<'_, M>) -> R,
    {
        let span = tracing::info_span!("transaction", redundancy = self.redundancy);
        let _enter = span.enter();

        for attempt in 0..self.max_retries {
            trace!(attempt, "beginning transaction attempt");
            let outcome = self.attempt(memory, &mut body, &mut fault);
            match outcome {
                Ok(result) => {
                    debug!(attempt, "transaction committed");
                    return Ok(result);
                }
                Err(err) if err.is_recoverable() => {
                    warn!(attempt, error = %err, "transaction diverged, rolling back");
                    self.rollback(memory);
                    let Some(isolation) = &self.isolation else {
                        return Err(err);
                    };
                    let core = current_core();
                    isolation.blacklist(core)?;
                    let next = isolation.next_available(core)?;
                    isolation.migrate_current_thread(next)?;
                }
                Err(err) => {
                    error!(error = %err, "unrecoverable transaction error");
                    return Err(err);
                }
            }
        }
        Err(SeiError::ControlFlowViolated {
            detail: "exceeded maximum rollback-and-retry attempts",
        })
    }

    /// Begins manual phase stepping, for callers that cannot express their
    /// critical region as a single Rust closure — the ABI crate's
    /// `beginTransaction`/`commitTransaction` surface, bracketing arbitrary
    /// compiled code with `sigsetjmp`/`siglongjmp` instead. Resets
    /// control-flow counters and returns phase `0`. Must be paired with
    /// repeated calls to [`Engine::end_phase_manual`] until it returns
    /// `Ok(None)`.
    pub fn begin_manual(&mut self) -> usize {
        for c in &mut self.cf {
            c.reset();
        }
        self.phase = Phase(0);
        0
    }

    /// The phase currently in progress, or `None` outside a transaction.
    #[must_use]
    pub fn current_phase(&self) -> Option<usize> {
        self.phase.index()
    }

    /// Borrows a [`Transaction`] for the phase currently in progress.
    ///
    /// # Panics
    ///
    /// Panics if called outside a [`Engine::begin_manual`] /
    /// [`Engine::end_phase_manual`] bracket.
    pub fn transaction<'a, M: Memory>(&'a mut self, memory: &'a mut M) -> Transaction<'a, M> {
        let phase = self
            .phase
            .index()
            .expect("transaction() called outside a begin_manual/end_phase_manual bracket");
        Transaction { engine: self, memory, phase }
    }

    /// Ends the phase currently in progress. If more phases remain,
    /// advances to the next one (mirroring the per-boundary work
    /// [`Engine::run`] does internally between phases) and returns its
    /// index. If this was the last phase, attempts commit and returns
    /// `None`.
    ///
    /// # Errors
    ///
    /// Propagates commit-time verification failures exactly as
    /// [`Engine::run`] does. Unlike `run`, there is no closure here to
    /// simply call again on a recoverable error — the caller drives
    /// rollback-and-retry itself via [`Engine::rollback_manual`].
    pub fn end_phase_manual<M: Memory>(&mut self, memory: &mut M) -> Result<Option<usize>, SeiError> {
        let p = self.phase.index().expect("end_phase_manual called outside a transaction");
        let n = self.redundancy as usize;
        if p + 1 < n {
            self.switch(memory);
            self.phase = Phase((p + 1) as i8);
            Ok(Some(p + 1))
        } else {
            self.commit()?;
            self.phase = Phase::OUTSIDE;
            Ok(None)
        }
    }

    /// Rolls back every phase's writes, as [`Engine::run`] does internally
    /// on a recoverable divergence, and — if CPU isolation is configured —
    /// blacklists the current core and migrates before returning the phase
    /// to restart at (always `0`). Without isolation, or once isolation
    /// itself reports exhaustion, returns the triggering error for the
    /// caller to treat as fatal.
    ///
    /// # Errors
    ///
    /// Returns `err` unchanged if it is not recoverable or no CPU
    /// isolation is configured; returns [`SeiError::CoresExhausted`] if
    /// isolation has no core left to migrate to.
    pub fn rollback_manual<M: Memory>(&mut self, memory: &mut M, err: SeiError) -> Result<usize, SeiError> {
        self.rollback(memory);
        if !err.is_recoverable() {
            return Err(err);
        }
        let Some(isolation) = &self.isolation else {
            return Err(err);
        };
        let core = current_core();
        isolation.blacklist(core)?;
        let next = isolation.next_available(core)?;
        isolation.migrate_current_thread(next)?;
        Ok(self.begin_manual())
    }

    fn attempt<M, F, R>(
        &mut self,
        memory: &mut M,
        body: &mut F,
        fault: &mut impl FnMut() -> Option<usize>,
    ) -> Result<R, SeiError>
    where
        M: Memory,
        F: FnMut(&mut Transaction<'_, M>) -> R,
    {
        for c in &mut self.cf {
            c.reset();
        }
        self.phase = Phase(0);

        let n = self.redundancy as usize;
        let mut result = None;
        for p in 0..n {
            if p > 0 {
                self.switch(memory);
            }
            self.phase = Phase(p as i8);
            let mut txn = Transaction {
                engine: self,
                memory,
                phase: p,
            };
            result = Some(body(&mut txn));
            if let Some(addr) = fault() {
                return Err(SeiError::MemoryDiverged { addr });
            }
        }
        self.commit()?;
        self.phase = Phase::OUTSIDE;
        Ok(result.expect("redundancy is always >= 1"))
    }

    fn switch<M: Memory>(&mut self, memory: &mut M) {
        let leaving = self.phase.index().expect("switch only called inside a transaction");
        self.talloc.switch();
        self.ibuf.switch(memory);
        self.obuf.close();
        for buf in self.stash.iter_mut() {
            buf.close();
        }
        // Write-through replay prep: undo the phase we just left so the
        // next phase starts from the same memory state it did.
        let entries: Vec<ShadowEntry> = self.shadow[leaving].entries().to_vec();
        shadow::restore(&entries, |addr, old| memory.write(addr, old));
        self.cf[leaving].alog();
        // amog() failing here means this phase boundary was crossed more
        // than once, which cannot happen through this loop's own control
        // flow — it indicates the engine itself was reentered incorrectly.
        self.cf[leaving].amog().expect("phase switch entered twice");
    }

    fn commit(&mut self) -> Result<(), SeiError> {
        let last = self.redundancy as usize - 1;
        self.cf[last].amog()?;
        self.cf[last].alog();
        for c in &self.cf {
            c.check()?;
        }

        let phase_entries: Vec<&[ShadowEntry]> = self.shadow.iter().map(ShadowBuffer::entries).collect();
        shadow::compare_heap(&phase_entries, self.config.abuf_max_conflicts)?;

        self.waitress.flush(|tag, args| {
            self.pending_calls.push(WaitressItem {
                tag,
                args: args.to_vec(),
            });
        })?;
        self.pending_frees.extend(self.tbin.flush()?);
        self.talloc.clean()?;
        self.ibuf.correct()?;

        self.obuf.close();
        while let Some(bytes) = self.obuf.pop()? {
            let crc = crc::crc32(&bytes);
            self.pending_output.push_back(OutputMessage { bytes, crc });
        }
        for buf in self.stash.iter_mut() {
            buf.close();
            while let Some(bytes) = buf.pop()? {
                let crc = crc::crc32(&bytes);
                self.pending_output.push_back(OutputMessage { bytes, crc });
            }
        }

        for buf in &mut self.shadow {
            buf.clean();
        }
        Ok(())
    }

    fn rollback<M: Memory>(&mut self, memory: &mut M) {
        for buf in &mut self.shadow {
            let entries = buf.entries().to_vec();
            shadow::restore(&entries, |addr, old| memory.write(addr, old));
            buf.clean();
        }
        self.tbin.clear();
        self.waitress.reset();
        self.phase = Phase::OUTSIDE;
    }
}

fn current_core() -> usize {
    // SAFETY: sched_getcpu has no preconditions; a negative return (no
    // affinity info available) is mapped to core 0.
    let cpu = unsafe { libc::sched_getcpu() };
    if cpu >= 0 { cpu as usize } else { 0 }
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
    fn a_clean_transaction_commits_and_persists_writes() {
        let mut engine = Engine::new(Config { redundancy: 2, ..Config::default() });
        let mut mem = FakeMemory(HashMap::new());
        let result = engine
            .run(&mut mem, |txn| {
                txn.write(0x10, &[42]).unwrap();
                txn.phase()
            })
            .unwrap();
        assert_eq!(result, 1); // last phase index for redundancy=2
        assert_eq!(mem.0.get(&0x10), Some(&vec![42]));
    }

    #[test]
    fn matching_input_and_output_round_trip() {
        let mut engine = Engine::new(Config { redundancy: 3, ..Config::default() });
        let mut mem = FakeMemory(HashMap::new());
        engine
            .run(&mut mem, |txn| {
                txn.input(None, b"ping", Mode::ReadOnly).unwrap();
                txn.output_append(b"pong");
                txn.output_done().unwrap();
            })
            .unwrap();
        let msg = engine.output_next().expect("one completed message");
        assert_eq!(msg.bytes, b"pong");
        assert_eq!(msg.crc, crc::crc32(b"pong"));
        assert!(engine.output_next().is_none());
    }

    #[test]
    fn deferred_free_is_recorded_per_phase_and_flushed_once() {
        let mut engine = Engine::new(Config { redundancy: 2, ..Config::default() });
        let mut mem = FakeMemory(HashMap::new());
        engine
            .run(&mut mem, |txn| {
                txn.free(0x20).unwrap();
            })
            .unwrap();
        assert_eq!(engine.take_freed(), vec![0x20]);
    }

    #[test]
    fn deferred_call_executes_exactly_once_with_phase_zero_args() {
        let mut engine = Engine::new(Config { redundancy: 2, ..Config::default() });
        let mut mem = FakeMemory(HashMap::new());
        engine
            .run(&mut mem, |txn| {
                txn.defer_call(7, vec![1, 2, 3]).unwrap();
            })
            .unwrap();
        let calls = engine.take_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].tag, 7);
        assert_eq!(calls[0].args, vec![1, 2, 3]);
    }

    #[test]
    fn counter_increment_scenario_matches_spec_example() {
        let mut engine = Engine::new(Config { redundancy: 2, ..Config::default() });
        let mut mem = FakeMemory(HashMap::new());
        mem.write(0x100, &7u32.to_le_bytes());

        assert!(Engine::verify_input(b"hello", crc::crc32(b"hello")));

        engine
            .run(&mut mem, |txn| {
                txn.input(None, b"hello", Mode::ReadOnly).unwrap();
                let current = u32::from_le_bytes(txn.read(0x100, 4).try_into().unwrap());
                let next = current + 5;
                txn.write(0x100, &next.to_le_bytes()).unwrap();
                txn.output_append(format!("counter={next}\n").as_bytes());
                txn.output_done().unwrap();
            })
            .unwrap();

        assert_eq!(u32::from_le_bytes(mem.0[&0x100].clone().try_into().unwrap()), 12);
        let msg = engine.output_next().unwrap();
        assert_eq!(msg.bytes, b"counter=12\n");
        assert_eq!(msg.crc, crc::crc32(b"counter=12\n"));
    }

    #[test]
    fn corrupted_input_is_rejected_before_begin() {
        let good = b"hello";
        let crc = crc::crc32(good);
        let flipped = crc ^ 1;
        assert!(!Engine::verify_input(good, flipped));
    }

    #[test]
    fn divergence_without_cpu_isolation_is_fatal_not_retried() {
        let mut engine = Engine::new(Config { redundancy: 2, ..Config::default() });
        let mut mem = FakeMemory(HashMap::new());
        let mut calls = 0;
        let err = engine
            .run(&mut mem, |txn| {
                calls += 1;
                // phase 0 writes 1, phase 1 writes 2: genuine divergence.
                txn.write(0x10, &[txn.phase() as u8 + 1]).unwrap();
            })
            .unwrap_err();
        assert!(matches!(err, SeiError::MemoryDiverged { .. }));
        assert_eq!(calls, 2, "no isolation configured, so no retry attempt");
    }

    #[test]
    fn divergence_with_cpu_isolation_rolls_back_migrates_and_retries() {
        let mut engine = Engine::with_cpu_isolation(Config { redundancy: 2, ..Config::default() }, 4);
        let mut mem = FakeMemory(HashMap::new());
        mem.write(0x10, &[0x12]);
        let mut attempts = 0;
        let result = engine.run(&mut mem, |txn| {
            attempts += 1;
            if attempts == 1 {
                // first attempt: force a genuine divergence.
                txn.write(0x10, &[txn.phase() as u8 + 1]).unwrap();
            } else {
                // retried attempt: every phase agrees.
                txn.write(0x10, &[0x34]).unwrap();
            }
        });
        assert!(result.is_ok());
        assert_eq!(mem.0.get(&0x10), Some(&vec![0x34]));
        assert!(attempts > 2, "expected at least one retried attempt on top of the two phases");
    }

    #[test]
    fn run_monitored_folds_a_reported_fault_into_memory_diverged() {
        let mut engine = Engine::new(Config { redundancy: 2, ..Config::default() });
        let mut mem = FakeMemory(HashMap::new());
        let err = engine
            .run_monitored(&mut mem, |txn| txn.phase(), || Some(0xBAD))
            .unwrap_err();
        assert!(matches!(err, SeiError::MemoryDiverged { addr: 0xBAD }));
    }

    #[test]
    fn manual_stepping_matches_the_closure_driven_outcome() {
        let mut engine = Engine::new(Config { redundancy: 3, ..Config::default() });
        let mut mem = FakeMemory(HashMap::new());

        let mut phase = engine.begin_manual();
        loop {
            {
                let mut txn = engine.transaction(&mut mem);
                assert_eq!(txn.phase(), phase);
                txn.write(0x50, &[9]).unwrap();
            }
            match engine.end_phase_manual(&mut mem).unwrap() {
                Some(next) => phase = next,
                None => break,
            }
        }
        assert_eq!(mem.0.get(&0x50), Some(&vec![9]));
        assert!(engine.current_phase().is_none());
    }

    #[test]
    fn manual_rollback_without_isolation_propagates_the_error() {
        let mut engine = Engine::new(Config { redundancy: 2, ..Config::default() });
        let mut mem = FakeMemory(HashMap::new());

        let mut phase = engine.begin_manual();
        let err = loop {
            {
                let mut txn = engine.transaction(&mut mem);
                txn.write(0x60, &[txn.phase() as u8]).unwrap();
            }
            match engine.end_phase_manual(&mut mem) {
                Ok(Some(next)) => phase = next,
                Ok(None) => unreachable!("phases disagree, commit must fail"),
                Err(e) => break e,
            }
        };
        let _ = phase;
        assert!(matches!(
            engine.rollback_manual(&mut mem, err),
            Err(SeiError::MemoryDiverged { .. })
        ));
    }
}
