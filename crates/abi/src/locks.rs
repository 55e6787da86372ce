//! `pthread_mutex` wrapping.
//!
//! Locking is the one place this runtime's redundant phases touch state
//! that is neither memory it shadows nor an external effect it can defer to
//! commit wholesale: the lock itself lives in the process, outside any
//! phase's buffer, and naively locking/unlocking on every phase would let
//! phases serialize against each other for no reason (they run on one
//! thread, sequentially, by construction — SPEC_FULL §5). Three strategies
//! are implemented, record-replay as the default:
//!
//! - **Record-replay** (default): phase 0 actually locks/unlocks; replay
//!   phases trust that outcome and skip the real call, mirroring the
//!   traversal allocator.
//! - **Two-phase locking**: every phase actually locks and holds until
//!   commit, when every held lock is released together — for callers that
//!   need the mutex held across the entire retry sequence, not just one
//!   phase.
//! - **Mini-traversal**: like record-replay, but cross-checks that every
//!   phase requests the same sequence of lock addresses phase 0 did,
//!   catching a divergent code path that takes a different lock.

use std::cell::RefCell;

use crate::transaction::with_engine;

/// Which strategy [`lock`]/[`unlock`] use for the calling thread's current
/// transaction. Set with [`set_lock_strategy`]; defaults to
/// [`LockStrategy::RecordReplay`].
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStrategy {
    /// Phase 0 locks/unlocks for real; replay phases trust it.
    RecordReplay,
    /// Every phase locks for real; held until commit, released together.
    TwoPhase,
    /// Like record-replay, but cross-checks lock order across phases.
    MiniTraversal,
}

thread_local! {
    static STRATEGY: RefCell<LockStrategy> = const { RefCell::new(LockStrategy::RecordReplay) };
    static HELD: RefCell<Vec<usize>> = RefCell::new(Vec::new());
    static ORDER: RefCell<Vec<usize>> = RefCell::new(Vec::new());
    static ORDER_CURSOR: RefCell<usize> = const { RefCell::new(0) };
}

/// Sets the locking strategy every [`lock`]/[`unlock`] call on this thread
/// uses from now on.
#[no_mangle]
pub extern "C" fn set_lock_strategy(strategy: LockStrategy) {
    STRATEGY.with(|s| *s.borrow_mut() = strategy);
}

/// Locks `mutex`, applying the calling thread's configured
/// [`LockStrategy`]. Returns the real `pthread_mutex_lock` error code (`0`
/// on success), or `0` without calling libc at all when the strategy
/// decides this call should be skipped.
///
/// # Safety
///
/// `mutex` must be a valid, initialized `pthread_mutex_t*`.
#[no_mangle]
pub unsafe extern "C" fn lock(mutex: *mut libc::pthread_mutex_t) -> i32 {
    let addr = mutex as usize;
    let phase = with_engine(sei_core::Engine::current_phase).unwrap_or(0);

    match STRATEGY.with(|s| *s.borrow()) {
        LockStrategy::RecordReplay => {
            if phase == 0 {
                libc::pthread_mutex_lock(mutex)
            } else {
                0
            }
        }
        LockStrategy::TwoPhase => {
            let rc = libc::pthread_mutex_lock(mutex);
            if rc == 0 {
                HELD.with(|h| h.borrow_mut().push(addr));
            }
            rc
        }
        LockStrategy::MiniTraversal => {
            if phase == 0 {
                ORDER.with(|o| o.borrow_mut().push(addr));
                libc::pthread_mutex_lock(mutex)
            } else {
                let matches = ORDER_CURSOR.with(|c| {
                    let mut cursor = c.borrow_mut();
                    let ok = ORDER.with(|o| o.borrow().get(*cursor) == Some(&addr));
                    *cursor += 1;
                    ok
                });
                if !matches {
                    tracing::error!(addr, phase, "lock order diverged under mini-traversal strategy");
                }
                0
            }
        }
    }
}

/// Unlocks `mutex`, applying the calling thread's configured strategy: a
/// no-op except on phase 0 under record-replay/mini-traversal, or deferred
/// until [`release_two_phase_locks`] under two-phase locking.
///
/// # Safety
///
/// `mutex` must be the same, still-valid `pthread_mutex_t*` most recently
/// locked through [`lock`].
#[no_mangle]
pub unsafe extern "C" fn unlock(mutex: *mut libc::pthread_mutex_t) -> i32 {
    let phase = with_engine(sei_core::Engine::current_phase).unwrap_or(0);
    match STRATEGY.with(|s| *s.borrow()) {
        LockStrategy::TwoPhase => 0,
        _ if phase == 0 => libc::pthread_mutex_unlock(mutex),
        _ => 0,
    }
}

/// Releases every lock accumulated under [`LockStrategy::TwoPhase`] since
/// the last call, and resets the mini-traversal order log. Called once a
/// transaction finishes (commit or final rollback) — see
/// [`crate::transaction::commit_transaction`].
pub fn release_two_phase_locks() {
    HELD.with(|h| {
        for addr in h.borrow_mut().drain(..) {
            // SAFETY: `addr` was locked by this same thread via `lock`
            // above and has not been unlocked since.
            unsafe { libc::pthread_mutex_unlock(addr as *mut libc::pthread_mutex_t) };
        }
    });
    ORDER.with(|o| o.borrow_mut().clear());
    ORDER_CURSOR.with(|c| *c.borrow_mut() = 0);
}
