//! `beginTransaction`/`commitTransaction`: the re-entry point instrumented
//! application code calls directly.
//!
//! Unlike [`sei_core::Engine::run`], which drives all `N` phases through one
//! Rust closure, these two `extern "C"` functions must work for application
//! code that isn't a closure at all — ordinary compiled functions that call
//! `beginTransaction()` once near the top of a critical region and
//! `commitTransaction()` once near the bottom, with arbitrary straight-line
//! code in between that this crate never sees as a value. [`crate::reentry`]
//! supplies the `sigsetjmp`/`siglongjmp` pair that makes the region between
//! the two calls run again for each phase; [`sei_core::Engine::begin_manual`]
//! / [`sei_core::Engine::end_phase_manual`] / [`sei_core::Engine::rollback_manual`]
//! supply the manual, non-closure-driven stepping through those phases.
//!
//! # A documented, deliberate piece of undefined behaviour
//!
//! `commitTransaction()` calls [`reentry::siglongjmp`] back into
//! `beginTransaction()`'s stack frame *after that call has already
//! returned* to let the caller's code run. The C standard treats jumping
//! into a frame whose function has returned as undefined behaviour; this
//! works in practice on every target this runtime builds for because
//! nothing reuses that stack region between the two calls (no deeper call
//! happens that would overwrite it) and the jump target is a fixed program
//! counter inside `beginTransaction`, not a reference to anything the
//! now-popped frame owned. This is the same trade a compiler-inserted TM
//! pass accepts; it is noted here rather than hidden.

use std::cell::RefCell;
use std::sync::Once;

use sei_core::{Config, Engine, SeiError};

use crate::memory::ProcessMemory;
use crate::reentry::{self, JmpBuf};

thread_local! {
    static ENGINE: RefCell<Option<Engine>> = const { RefCell::new(None) };
    static JUMP: RefCell<Option<JmpBuf>> = const { RefCell::new(None) };
    static RETRIES: RefCell<u32> = const { RefCell::new(0) };
}

/// Rollback-and-retry attempts a thread makes before giving up and
/// reporting a hard failure, mirroring [`sei_core::Engine`]'s own default.
const MAX_RETRIES: u32 = 8;

static PROTECTION: Once = Once::new();
static LOGGING: Once = Once::new();

fn ensure_protection_installed() {
    PROTECTION.call_once(|| {
        if let Err(e) = sei_core::protection::install() {
            tracing::warn!(error = %e, "failed to install SIGSEGV handler; HEAP_PROTECT faults will crash the process");
        }
    });
}

/// Installs a `tracing-subscriber` formatting layer, honoring `RUST_LOG`
/// (`SEI_LOG_FILTER` falls back to it) for per-module verbosity, the same
/// env-filter convention the teacher workspace's own binaries use. Safe to
/// call more than once or from more than one thread; only the first call
/// takes effect. An application linking this shim that already installed
/// its own global subscriber is unaffected — `try_init` silently no-ops
/// rather than panicking on the second installation attempt.
fn ensure_logging_installed() {
    LOGGING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_env("SEI_LOG_FILTER")
            .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}

/// Runs `f` against this thread's [`Engine`], lazily constructed from
/// [`Config::from_env`] on first use.
pub fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> R {
    ENGINE.with(|cell| {
        let mut slot = cell.borrow_mut();
        let engine = slot.get_or_insert_with(|| Engine::new(Config::from_env()));
        f(engine)
    })
}

/// Begins a transaction, returning the phase number (`0..N`) the caller
/// should now execute its critical region as. Every call after the first
/// one for this transaction is the result of [`commit_transaction`] jumping
/// back here; the caller cannot distinguish a first call from a replay and
/// should not try to.
///
/// # Safety
///
/// Must be paired with exactly one later call to [`commit_transaction`] on
/// the same thread, with no intervening call that itself begins a nested
/// transaction, before this stack frame's caller returns.
#[no_mangle]
pub extern "C" fn begin_transaction() -> i32 {
    ensure_logging_installed();
    ensure_protection_installed();
    RETRIES.with(|r| *r.borrow_mut() = 0);

    let mut buf = JmpBuf::new();
    // SAFETY: `buf` is captured here and immediately handed to the
    // thread-local for `commit_transaction` to jump back through; see the
    // module-level note on the lifetime this relies on.
    let rc = unsafe { reentry::sigsetjmp(&mut buf, false) };
    JUMP.with(|cell| *cell.borrow_mut() = Some(buf));

    let phase = if rc == 0 {
        with_engine(Engine::begin_manual)
    } else {
        (rc - 1) as usize
    };
    phase as i32
}

/// Ends the phase just run. If more phases remain, jumps back to the
/// matching `beginTransaction()` call site so the caller's region runs
/// again (never returns in that case). Once every phase has run, attempts
/// commit: on success, returns `0` and control passes to the caller's code
/// after the transaction. On a recoverable divergence, rolls back and
/// either jumps back to phase `0` for a retry or, if retries are exhausted
/// or isolation cannot help, returns a negative error code.
#[no_mangle]
pub extern "C" fn commit_transaction() -> i32 {
    let mut mem = ProcessMemory;

    if let Some(addr) = sei_core::protection::take_fault() {
        return handle_divergence(&mut mem, SeiError::MemoryDiverged { addr });
    }

    let outcome = with_engine(|engine| engine.end_phase_manual(&mut mem));
    match outcome {
        Ok(Some(next_phase)) => jump_to_phase(next_phase),
        Ok(None) => {
            crate::alloc::drain_pending_frees();
            crate::syscalls::drain_pending_calls();
            crate::locks::release_two_phase_locks();
            transmit_pending_output();
            0
        }
        Err(err) => handle_divergence(&mut mem, err),
    }
}

fn handle_divergence(mem: &mut ProcessMemory, err: SeiError) -> i32 {
    crate::locks::release_two_phase_locks();
    let exhausted = RETRIES.with(|r| {
        let mut retries = r.borrow_mut();
        *retries += 1;
        *retries > MAX_RETRIES
    });
    if exhausted {
        tracing::error!(error = %err, "exceeded maximum rollback-and-retry attempts");
        return -1;
    }
    match with_engine(|engine| engine.rollback_manual(mem, err)) {
        Ok(phase) => jump_to_phase(phase),
        Err(_) => -1,
    }
}

/// Writes every cross-phase-verified output message to the default sink
/// (standard output, framed as `len` + `crc` + bytes), draining
/// [`sei_core::Engine::output_next`]. A real deployment would swap this for
/// whatever transport the application actually uses; this runtime only
/// guarantees the bytes reaching here agreed across every phase.
fn transmit_pending_output() {
    while let Some(msg) = with_engine(sei_core::Engine::output_next) {
        let len = (msg.bytes.len() as u32).to_le_bytes();
        let crc = msg.crc.to_le_bytes();
        // SAFETY: fd 1 (stdout) is always open; writing a bounded,
        // already-owned buffer has no other preconditions.
        unsafe {
            libc::write(1, len.as_ptr().cast(), len.len());
            libc::write(1, crc.as_ptr().cast(), crc.len());
            libc::write(1, msg.bytes.as_ptr().cast(), msg.bytes.len());
        }
    }
}

fn jump_to_phase(phase: usize) -> ! {
    JUMP.with(|cell| {
        let mut slot = cell.borrow_mut();
        let buf = slot.as_mut().expect("commit_transaction called without a matching begin_transaction");
        // SAFETY: `buf` was populated by this thread's `begin_transaction`
        // call, whose frame is still logically reachable — see the
        // module-level note.
        unsafe { reentry::siglongjmp(buf, (phase + 1) as i32) }
    })
}
