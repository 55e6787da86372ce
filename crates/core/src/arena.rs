//! Heap arena: the memory region the shadow write buffer and traversal
//! allocator operate over.
//!
//! Grounded in the teacher's `DramBuffer` (`mmap`-backed, raw pointer
//! access, explicit `Drop`/`munmap`). When [`Config::heap_arena_size`] is
//! zero the arena is pass-through: allocation requests go straight to the
//! system allocator and there is no dedicated backing region to protect.
//! When it is non-zero, the arena reserves one contiguous `mmap` region and
//! hands out power-of-two size-classed chunks from it, which is what makes
//! [`Arena::protect`]/[`Arena::unprotect`] (the `HEAP_PROTECT` page-level
//! write-tracking companion to the shadow buffer) meaningful.
//!
//! [`Config::heap_arena_size`]: crate::config::Config::heap_arena_size

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::SeiError;

/// Smallest size class the arena hands out, in bytes.
const MIN_CLASS: usize = 16;

fn size_class(requested: usize) -> usize {
    requested.max(MIN_CLASS).next_power_of_two()
}

/// A contiguous, `mmap`-backed memory region with size-classed free lists,
/// or a pass-through wrapper over the system allocator when `size == 0`.
pub struct Arena {
    base: Option<NonNull<u8>>,
    size: usize,
    cursor: usize,
    free_lists: Vec<Vec<usize>>, // indexed by log2(size_class)
    protected: bool,
}

// SAFETY: the arena owns its mmap region exclusively and all access is
// mediated through `&mut self`; there is no shared mutable aliasing.
unsafe impl Send for Arena {}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("size", &self.size)
            .field("cursor", &self.cursor)
            .field("protected", &self.protected)
            .finish()
    }
}

impl Arena {
    /// Creates a new arena. `size == 0` selects pass-through mode.
    ///
    /// # Panics
    ///
    /// Panics if `size > 0` and the underlying `mmap` call fails; this
    /// mirrors the teacher's `DramBuffer::new`, which treats arena setup
    /// failure as unrecoverable process startup failure rather than a
    /// `Result`.
    #[must_use]
    pub fn new(size: usize) -> Self {
        if size == 0 {
            return Self {
                base: None,
                size: 0,
                cursor: 0,
                free_lists: Vec::new(),
                protected: false,
            };
        }

        // SAFETY: `libc::mmap` with MAP_ANONYMOUS and a null address hint
        // asks the kernel to choose the mapping; the returned pointer is
        // valid for `size` bytes until `munmap` in `Drop`.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert!(
            ptr != libc::MAP_FAILED,
            "failed to mmap heap arena of size {size}"
        );
        Self {
            // SAFETY: checked non-null via the MAP_FAILED comparison above.
            base: Some(unsafe { NonNull::new_unchecked(ptr.cast()) }),
            size,
            cursor: 0,
            free_lists: vec![Vec::new(); usize::BITS as usize],
            protected: false,
        }
    }

    /// True if this arena is pass-through (no backing `mmap` region).
    #[must_use]
    pub fn is_pass_through(&self) -> bool {
        self.base.is_none()
    }

    /// Arena capacity in bytes (`0` for pass-through).
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocates `len` bytes, rounded up to the nearest power-of-two size
    /// class, returning a pointer valid for reads/writes of `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SeiError::CapacityExceeded`] if the arena is backed and has
    /// no room left for the requested size class.
    pub fn allocate(&mut self, len: usize) -> Result<*mut u8, SeiError> {
        let Some(base) = self.base else {
            // SAFETY: layout is non-zero-sized and alignment is a power of two.
            let layout = Layout::from_size_align(len.max(1), 8).expect("valid layout");
            let ptr = unsafe { alloc::alloc(layout) };
            assert!(!ptr.is_null(), "system allocator returned null");
            return Ok(ptr);
        };

        let class = size_class(len);
        let class_idx = class.trailing_zeros() as usize;
        if let Some(offset) = self.free_lists[class_idx].pop() {
            // SAFETY: `offset` was previously handed out from this same
            // region and is within bounds by construction.
            return Ok(unsafe { base.as_ptr().add(offset) });
        }

        if self.cursor + class > self.size {
            return Err(SeiError::CapacityExceeded {
                component: "heap arena",
                limit: self.size,
            });
        }
        let offset = self.cursor;
        self.cursor += class;
        // SAFETY: offset + class <= self.size, checked above.
        Ok(unsafe { base.as_ptr().add(offset) })
    }

    /// Releases a pointer previously returned by [`Arena::allocate`] back
    /// to its size class's free list. No-op (drops to the system
    /// allocator) when pass-through.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a previous `allocate(len)` call on
    /// this same arena with the same `len`, and must not be freed twice.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8, len: usize) {
        let Some(base) = self.base else {
            let layout = Layout::from_size_align(len.max(1), 8).expect("valid layout");
            // SAFETY: forwarded precondition from the caller.
            unsafe { alloc::dealloc(ptr, layout) };
            return;
        };
        let class = size_class(len);
        let class_idx = class.trailing_zeros() as usize;
        // SAFETY: forwarded precondition — ptr lies within this region.
        let offset = unsafe { ptr.offset_from(base.as_ptr()) } as usize;
        self.free_lists[class_idx].push(offset);
    }

    /// Marks the backing region read-only, if backed. Writes by
    /// instrumented code between transactions should go through the
    /// shadow buffer, not bypass it via a stray unshadowed store; this is
    /// the belt-and-suspenders `HEAP_PROTECT` companion check.
    ///
    /// # Panics
    ///
    /// Panics if `mprotect` fails (e.g. unsupported page alignment).
    pub fn protect(&mut self) {
        if let Some(base) = self.base {
            // SAFETY: base/size describe the exact mmap'd region.
            let rc = unsafe { libc::mprotect(base.as_ptr().cast(), self.size, libc::PROT_READ) };
            assert_eq!(rc, 0, "mprotect(PROT_READ) failed on heap arena");
            self.protected = true;
        }
    }

    /// Restores read-write access to the backing region, if backed.
    ///
    /// # Panics
    ///
    /// Panics if `mprotect` fails.
    pub fn unprotect(&mut self) {
        if let Some(base) = self.base {
            // SAFETY: base/size describe the exact mmap'd region.
            let rc = unsafe {
                libc::mprotect(
                    base.as_ptr().cast(),
                    self.size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            assert_eq!(rc, 0, "mprotect(PROT_READ|PROT_WRITE) failed on heap arena");
            self.protected = false;
        }
    }

    /// Whether the region is currently in the protected (read-only) state.
    #[must_use]
    pub fn is_protected(&self) -> bool {
        self.protected
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            // SAFETY: base/size describe exactly the region mmap'd in `new`.
            unsafe {
                libc::munmap(base.as_ptr().cast(), self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pass_through_allocates_and_frees() {
        let mut arena = Arena::new(0);
        assert!(arena.is_pass_through());
        let ptr = arena.allocate(64).unwrap();
        assert!(!ptr.is_null());
        // SAFETY: just allocated with len 64, freed once.
        unsafe { arena.deallocate(ptr, 64) };
    }

    #[test]
    fn backed_arena_allocates_within_bounds() {
        let mut arena = Arena::new(4096);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(100).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn backed_arena_reports_capacity_exceeded() {
        let mut arena = Arena::new(128);
        let err = arena.allocate(256).unwrap_err();
        assert!(matches!(err, SeiError::CapacityExceeded { .. }));
    }

    #[test]
    fn freed_chunk_is_reused_from_free_list() {
        let mut arena = Arena::new(4096);
        let a = arena.allocate(64).unwrap();
        // SAFETY: just allocated, freed once.
        unsafe { arena.deallocate(a, 64) };
        let b = arena.allocate(64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn protect_then_unprotect_round_trips() {
        let mut arena = Arena::new(4096);
        arena.protect();
        assert!(arena.is_protected());
        arena.unprotect();
        assert!(!arena.is_protected());
    }
}
