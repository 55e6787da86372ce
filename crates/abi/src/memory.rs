//! Process-address-space memory view.
//!
//! `sei-core`'s engine is deliberately pointer-agnostic — it shadows
//! `usize` addresses. This is the one place those addresses get turned
//! back into raw pointers and actually dereferenced.

use sei_core::Memory;

/// Reads and writes directly against the calling thread's address space.
///
/// # Safety invariant
///
/// Every address this type is asked to read or write must be one the
/// instrumented application code itself would have dereferenced — i.e.
/// valid, live, and not concurrently mutated by another thread. The
/// compiler pass that inserts calls into this ABI (out of scope for this
/// crate) is responsible for only ever passing addresses that satisfy
/// this; `ProcessMemory` cannot check it.
#[derive(Debug, Default)]
pub struct ProcessMemory;

impl Memory for ProcessMemory {
    fn read(&mut self, addr: usize, len: usize) -> Vec<u8> {
        if len == 0 || addr == 0 {
            return Vec::new();
        }
        // SAFETY: forwarded precondition — see the struct's safety
        // invariant. `addr` is treated as `*const u8` valid for `len`
        // bytes.
        unsafe { std::slice::from_raw_parts(addr as *const u8, len).to_vec() }
    }

    fn write(&mut self, addr: usize, bytes: &[u8]) {
        if bytes.is_empty() || addr == 0 {
            return;
        }
        // SAFETY: forwarded precondition — see the struct's safety
        // invariant. `addr` is treated as `*mut u8` valid for
        // `bytes.len()` bytes, not aliased for the duration of this call.
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_local_buffer() {
        let mut buf = [0u8; 8];
        let addr = buf.as_mut_ptr() as usize;
        let mut mem = ProcessMemory;
        mem.write(addr, &[1, 2, 3, 4]);
        assert_eq!(mem.read(addr, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn null_address_and_zero_length_are_no_ops() {
        let mut mem = ProcessMemory;
        assert_eq!(mem.read(0, 4), Vec::<u8>::new());
        assert_eq!(mem.read(0x1000, 0), Vec::<u8>::new());
        mem.write(0, &[1, 2, 3]); // must not segfault
    }
}
