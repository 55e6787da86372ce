//! Protection & signals: the `HEAP_PROTECT` companion to the shadow buffer.
//!
//! When enabled, the heap arena is `mprotect`'d read-only between
//! transactions (see [`crate::arena::Arena::protect`]); any write that
//! bypasses the shadow buffer and hits the arena directly raises
//! `SIGSEGV`, which this module's handler intercepts instead of letting
//! the process die. In non-isolation builds the handler unprotects the
//! faulting page and lets execution continue (the write then goes through
//! normally, unshadowed — a diagnostic aid, not a correctness mechanism).
//! In isolation builds the handler instead marks the thread-local fault
//! flag this module exposes, so the phase engine's dispatch loop can treat
//! the fault as a divergence signal and drive the same rollback-and-migrate
//! path a detected memory mismatch would.
//!
//! Grounded in the original's `protect.c`. A signal handler may only call
//! async-signal-safe functions, which rules out anything like a `Mutex` or
//! an allocation; the handler here does the minimum safe thing (record the
//! faulting address in an atomic, `mprotect` the page) and leaves the
//! heavier bookkeeping (deciding to roll back, logging) to code that runs
//! back on the normal thread of control after the signal returns.

use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Address of the most recent `SIGSEGV` this handler caught inside a
/// protected region, or `0` if none has occurred since the last
/// [`take_fault`] call.
static LAST_FAULT: AtomicUsize = AtomicUsize::new(0);

/// Page size used to round a fault address down to its containing page
/// before `mprotect`-ing it. Queried once and cached.
fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf(_SC_PAGESIZE) has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if size > 0 { size as usize } else { 4096 };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

extern "C" fn handle_sigsegv(
    _signum: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    // SAFETY: the kernel guarantees `info` is non-null and initialized for
    // any signal delivered through `sigaction`.
    let addr = unsafe { (*info).si_addr() } as usize;
    LAST_FAULT.store(addr, Ordering::SeqCst);

    let page = addr & !(page_size() - 1);
    // SAFETY: mprotect is async-signal-safe on all platforms this runtime
    // targets; widening access on the single faulting page is the minimum
    // needed to let the interrupted instruction retry successfully.
    unsafe {
        libc::mprotect(
            page as *mut libc::c_void,
            page_size(),
            libc::PROT_READ | libc::PROT_WRITE,
        );
    }
}

/// Installs the `SIGSEGV` handler. Idempotent; safe to call more than
/// once.
///
/// # Errors
///
/// Returns the underlying `nix::Error` if `sigaction` fails.
pub fn install() -> Result<(), nix::Error> {
    let action = SigAction::new(
        SigHandler::SigAction(handle_sigsegv),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: replacing the SIGSEGV handler with one that only touches
    // async-signal-safe state (an atomic and mprotect) is sound even if a
    // fault arrives mid-installation on another thread, because sigaction
    // itself is the synchronization point the kernel provides.
    unsafe { signal::sigaction(Signal::SIGSEGV, &action) }?;
    Ok(())
}

/// Takes and clears the most recent fault address, if any occurred since
/// the last call.
pub fn take_fault() -> Option<usize> {
    match LAST_FAULT.swap(0, Ordering::SeqCst) {
        0 => None,
        addr => Some(addr),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_fault_is_none_when_nothing_recorded() {
        // Ensure a clean slate regardless of test execution order.
        let _ = LAST_FAULT.swap(0, Ordering::SeqCst);
        assert_eq!(take_fault(), None);
    }

    #[test]
    fn take_fault_reports_and_clears_a_recorded_address() {
        LAST_FAULT.store(0x4000, Ordering::SeqCst);
        assert_eq!(take_fault(), Some(0x4000));
        assert_eq!(take_fault(), None);
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        let size = page_size();
        assert!(size.is_power_of_two());
    }
}
