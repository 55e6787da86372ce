//! Real `malloc`/`free`/`calloc` through the heap arena, the traversal
//! allocator, and the trash bin.
//!
//! `malloc` performs the real allocation from [`sei_core::arena::Arena`]
//! every phase, but only phase 0's address is kept: [`sei_core::Transaction::alloc`]
//! resolves every later phase back to that same address, and the throwaway
//! allocation a replay phase made along the way is freed immediately rather
//! than kept. `free` defers to the trash bin and is only actually performed
//! once every phase agrees, via [`drain_pending_frees`]. `calloc` is
//! rejected outright (see below) rather than silently allocating
//! zero-filled memory through a path that can't honor its guarantee.

use std::cell::RefCell;
use std::collections::HashMap;

use sei_core::Config;

use crate::memory::ProcessMemory;
use crate::transaction::with_engine;

thread_local! {
    static ARENA: RefCell<sei_core::arena::Arena> =
        RefCell::new(sei_core::arena::Arena::new(Config::from_env().heap_arena_size));
    static SIZES: RefCell<HashMap<usize, usize>> = RefCell::new(HashMap::new());
}

/// Allocates `len` bytes. Outside a transaction, this is a direct pass
/// through to the arena. Inside one, the address returned is resolved
/// through the traversal allocator: identical on every phase, even though
/// each phase performed its own real allocation to get there.
#[no_mangle]
pub extern "C" fn malloc(len: usize) -> *mut u8 {
    if len == 0 {
        return std::ptr::null_mut();
    }
    let phase = with_engine(sei_core::Engine::current_phase);
    let Ok(raw_ptr) = ARENA.with(|a| a.borrow_mut().allocate(len)) else {
        return std::ptr::null_mut();
    };

    let Some(_) = phase else {
        SIZES.with(|s| s.borrow_mut().insert(raw_ptr as usize, len));
        return raw_ptr;
    };

    let mut mem = ProcessMemory;
    let resolved = with_engine(|engine| engine.transaction(&mut mem).alloc(raw_ptr as usize, len));
    match resolved {
        Ok(addr) => {
            if addr != raw_ptr as usize {
                // SAFETY: `raw_ptr` was just allocated above with this
                // exact `len` and has not been published to any caller —
                // a replay phase's throwaway allocation, per
                // `Transaction::alloc`'s contract.
                unsafe { ARENA.with(|a| a.borrow_mut().deallocate(raw_ptr, len)) };
            }
            SIZES.with(|s| s.borrow_mut().insert(addr, len));
            addr as *mut u8
        }
        Err(e) => {
            tracing::error!(error = %e, "traversal allocator replay mismatch");
            // SAFETY: see above.
            unsafe { ARENA.with(|a| a.borrow_mut().deallocate(raw_ptr, len)) };
            std::ptr::null_mut()
        }
    }
}

/// Rejected: `calloc`'s zero-guarantee cannot be honored through the
/// traversal allocator's record/replay path (a replay phase's "allocation"
/// is really a throwaway freed immediately, so there is nothing to zero
/// that the caller could observe consistently across phases). Returns
/// null rather than a silent, possibly-uninitialized answer.
#[no_mangle]
pub extern "C" fn calloc(_count: usize, _size: usize) -> *mut u8 {
    tracing::error!(
        "calloc is not supported inside this runtime's transactions; returning null rather than a zero-guarantee it cannot honor"
    );
    std::ptr::null_mut()
}

/// Frees `ptr`. Outside a transaction, this is immediate. Inside one, the
/// free is deferred to the trash bin and only actually performed once
/// every phase agrees — see [`drain_pending_frees`].
#[no_mangle]
pub extern "C" fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let addr = ptr as usize;
    match with_engine(sei_core::Engine::current_phase) {
        None => deallocate_now(addr),
        Some(_) => {
            let mut mem = ProcessMemory;
            with_engine(|engine| engine.transaction(&mut mem).free(addr))
                .expect("trash bin capacity exceeded");
        }
    }
}

fn deallocate_now(addr: usize) {
    if let Some(len) = SIZES.with(|s| s.borrow_mut().remove(&addr)) {
        // SAFETY: `addr` was returned by a prior `malloc` call of exactly
        // `len` bytes, tracked in `SIZES`, and is being freed exactly once.
        unsafe { ARENA.with(|a| a.borrow_mut().deallocate(addr as *mut u8, len)) };
    }
}

/// Actually frees every address the engine's trash bin agreed on at the
/// most recent commit. Called by
/// [`crate::transaction::commit_transaction`] after a successful commit.
pub fn drain_pending_frees() {
    for addr in with_engine(sei_core::Engine::take_freed) {
        deallocate_now(addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_outside_a_transaction_round_trips_through_free() {
        let ptr = malloc(32);
        assert!(!ptr.is_null());
        free(ptr);
    }

    #[test]
    fn calloc_always_returns_null() {
        assert!(calloc(4, 8).is_null());
    }
}
