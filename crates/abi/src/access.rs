//! Typed read/write entry points and the `memcpyRtWt`/`memmoveRtWt`/
//! `memsetW` bulk operations.
//!
//! One pair of `extern "C"` functions per access width (`1`, `2`, `4`, `8`,
//! `16` bytes), matching the widths a compiler's instrumentation pass
//! actually emits for scalar loads/stores. Reads are never shadowed — only
//! a write needs a before/after pair for the commit-time compare — but a
//! write is only shadowed when [`crate::stack::IgnoreList::should_shadow`]
//! says the address is worth tracking; a write to the current frame's own
//! stack slots, or to an address an application explicitly opted out via
//! [`ignore_address`], goes straight to memory.

use std::cell::RefCell;

use sei_core::Memory;

use crate::memory::ProcessMemory;
use crate::stack::IgnoreList;
use crate::transaction::with_engine;

thread_local! {
    static IGNORED: RefCell<IgnoreList> = RefCell::new(IgnoreList::new());
}

/// Opts `addr` out of shadow tracking for the calling thread, regardless of
/// whether it happens to be a stack address.
#[no_mangle]
pub extern "C" fn ignore_address(addr: usize) {
    IGNORED.with(|l| l.borrow_mut().add(addr));
}

fn should_shadow(addr: usize) -> bool {
    IGNORED.with(|l| l.borrow().should_shadow(addr))
}

macro_rules! typed_access {
    ($read_fn:ident, $write_fn:ident, $ty:ty, $len:literal) => {
        /// Reads a
        #[doc = stringify!($len)]
        /// -byte value at `addr`, unshadowed.
        #[no_mangle]
        pub extern "C" fn $read_fn(addr: usize) -> $ty {
            let mut mem = ProcessMemory;
            let bytes = with_engine(|engine| engine.transaction(&mut mem).read(addr, $len));
            <$ty>::from_le_bytes(bytes.try_into().expect("typed read returns exactly len bytes"))
        }

        /// Writes a
        #[doc = stringify!($len)]
        /// -byte value to `addr`, shadowed unless the address is a stack
        /// slot or has been passed to [`ignore_address`].
        #[no_mangle]
        pub extern "C" fn $write_fn(addr: usize, value: $ty) {
            let bytes = value.to_le_bytes();
            if should_shadow(addr) {
                with_engine(|engine| {
                    let mut mem = ProcessMemory;
                    engine
                        .transaction(&mut mem)
                        .write(addr, &bytes)
                        .expect("shadow buffer capacity exceeded");
                });
            } else {
                ProcessMemory.write(addr, &bytes);
            }
        }
    };
}

typed_access!(read1, write1, u8, 1);
typed_access!(read2, write2, u16, 2);
typed_access!(read4, write4, u32, 4);
typed_access!(read8, write8, u64, 8);
typed_access!(read16, write16, u128, 16);

/// Shadowed `memcpy`: copies `len` bytes from `src` to `dst`. Source and
/// destination must not overlap; use [`memmove_rtwt`] when they might.
///
/// # Safety
///
/// `src` must be valid to read for `len` bytes and `dst` valid to write for
/// `len` bytes, per the same contract as libc's `memcpy`.
#[no_mangle]
pub unsafe extern "C" fn memcpy_rtwt(dst: usize, src: usize, len: usize) {
    let data = ProcessMemory.read(src, len);
    write_shadowed_range(dst, &data);
}

/// Shadowed `memmove`: copies `len` bytes from `src` to `dst`, correct even
/// when the ranges overlap (the source is read into a temporary buffer
/// before any destination bytes are touched).
///
/// # Safety
///
/// `src` must be valid to read for `len` bytes and `dst` valid to write for
/// `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn memmove_rtwt(dst: usize, src: usize, len: usize) {
    let data = ProcessMemory.read(src, len);
    write_shadowed_range(dst, &data);
}

/// Shadowed `memset`: fills `len` bytes at `dst` with `value`.
///
/// # Safety
///
/// `dst` must be valid to write for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn memset_w(dst: usize, value: u8, len: usize) {
    let data = vec![value; len];
    write_shadowed_range(dst, &data);
}

fn write_shadowed_range(addr: usize, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    if should_shadow(addr) {
        with_engine(|engine| {
            let mut mem = ProcessMemory;
            engine
                .transaction(&mut mem)
                .write(addr, data)
                .expect("shadow buffer capacity exceeded");
        });
    } else {
        ProcessMemory.write(addr, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_address_is_not_shadowed() {
        ignore_address(0xABCD);
        assert!(!should_shadow(0xABCD));
    }
}
