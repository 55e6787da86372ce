//! `sigsetjmp`/`siglongjmp`-based re-entry into a `beginTransaction()` call
//! site.
//!
//! [`sei_core::Engine::run`] drives all `N` phases by calling a Rust
//! closure once per phase — a fine fit when the critical region is
//! expressible as a closure. Compiler-inserted instrumentation in
//! arbitrary application code is not: the region between a
//! `beginTransaction()` call and its matching `commitTransaction()` call is
//! just whatever machine code follows in the caller's own stack frame.
//! Making that frame run again for the next phase means restoring the CPU
//! and stack-pointer context `beginTransaction()` captured the first time
//! through — exactly what `sigsetjmp`/`siglongjmp` are for.
//!
//! `glibc`'s `sigjmp_buf` is an opaque, platform-sized blob; the `libc`
//! crate deliberately does not expose `setjmp` family functions (restoring
//! a stack frame from arbitrary Rust code is unsound in the general case),
//! so this module declares the symbols itself and confines their use to
//! the narrow, documented pattern [`transaction`] drives.

use std::os::raw::c_int;

/// Large enough for every `sigjmp_buf` layout on the targets this runtime
/// supports (`glibc` x86_64's is under 200 bytes; this leaves headroom).
const JMP_BUF_BYTES: usize = 256;

/// Opaque save slot for a `sigsetjmp`/`siglongjmp` round trip.
#[repr(C, align(16))]
pub struct JmpBuf([u8; JMP_BUF_BYTES]);

impl JmpBuf {
    /// A zeroed, not-yet-captured buffer.
    #[must_use]
    pub fn new() -> Self {
        Self([0u8; JMP_BUF_BYTES])
    }
}

impl Default for JmpBuf {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: these are libc's real `sigsetjmp`/`siglongjmp` (the former
// usually a macro around `__sigsetjmp`, which `glibc` also exports under
// the plain name for non-optimized callers). The signatures match the C
// declarations exactly; `JmpBuf`'s backing array is large enough for the
// real `sigjmp_buf` on every target this runtime builds for.
extern "C" {
    #[link_name = "sigsetjmp"]
    fn sigsetjmp_raw(env: *mut JmpBuf, savesigs: c_int) -> c_int;
    #[link_name = "siglongjmp"]
    fn siglongjmp_raw(env: *mut JmpBuf, val: c_int) -> !;
}

/// Captures the calling context into `buf`. Returns `0` on the direct
/// call; returns whatever non-zero value a later [`siglongjmp`] passed on
/// every re-entry.
///
/// # Safety
///
/// `buf` must outlive every [`siglongjmp`] call that targets it, and must
/// not be jumped into from a stack frame that has already returned (the
/// frame that called `sigsetjmp` must still be live).
pub unsafe fn sigsetjmp(buf: &mut JmpBuf, save_sigmask: bool) -> i32 {
    sigsetjmp_raw(buf, i32::from(save_sigmask))
}

/// Restores the context captured in `buf`, making its `sigsetjmp` call
/// return `val` (coerced to at least `1`, matching `siglongjmp`'s contract
/// that `0` always becomes `1`). Never returns.
///
/// # Safety
///
/// `buf` must have been populated by a prior [`sigsetjmp`] call whose
/// stack frame is still live.
pub unsafe fn siglongjmp(buf: &mut JmpBuf, val: i32) -> ! {
    siglongjmp_raw(buf, val.max(1))
}
