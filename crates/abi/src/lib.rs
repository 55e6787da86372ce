//! `sei-abi`: the C ABI shim application code compiled against the SEI
//! transactional memory runtime links against.
//!
//! `sei-core` verifies; this crate executes. Every raw pointer, every real
//! `malloc`/`free`, every socket file descriptor, every signal handler
//! installation lives here — `sei-core` only ever sees opaque `usize`
//! addresses and hands back agreed-upon lists of effects for this crate to
//! actually carry out (see [`sei_core::Engine::take_freed`],
//! [`sei_core::Engine::take_calls`], [`sei_core::Engine::output_next`]).
//!
//! One [`Engine`](sei_core::Engine) per thread, stored in a thread-local
//! ([`transaction::with_engine`]): the runtime's concurrency model is
//! per-thread cooperative scheduling (SPEC_FULL §5), so there is no
//! cross-thread sharing to synchronize here beyond CPU isolation, which
//! `sei-core` already guards internally.

#![warn(missing_docs)]

/// Real `malloc`/`free`/`calloc` through the traversal allocator and trash
/// bin.
pub mod alloc;
/// The process-address-space [`sei_core::Memory`] implementation.
pub mod memory;
/// `pthread_mutex` wrapping: record-replay, two-phase-locking, and
/// mini-traversal lock patterns.
pub mod locks;
/// `sigsetjmp`/`siglongjmp`-based re-entry into a `beginTransaction()` call
/// site.
pub mod reentry;
/// Stack-range filtering and the shadow-ignore address list.
pub mod stack;
/// Syscall wrapping: record-replay for idempotent calls, waitress-deferred
/// for effectful ones.
pub mod syscalls;
/// Typed read/write entry points and the `memcpyRtWt`/`memmoveRtWt`/
/// `memsetW` bulk operations.
pub mod access;
/// `beginTransaction`/`commitTransaction` and the per-thread engine.
pub mod transaction;

pub use memory::ProcessMemory;
pub use transaction::{begin_transaction, commit_transaction};
