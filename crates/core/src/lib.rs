//! `sei-core`: the transactional execution engine for a soft-error-immune
//! (SEI) runtime.
//!
//! Application code compiled against the companion ABI crate redirects every
//! heap load and store through this engine's hooks. A marked region runs `N`
//! times redundantly (configurable `2..=10`, Dual Modular Redundancy by
//! default); each run's effect on shared memory is shadowed into a per-phase
//! buffer, the buffers are compared at commit, and only an agreeing result is
//! published. Divergence is recovered by rolling back, blacklisting the CPU
//! core the attempt ran on, migrating the thread, and retrying.
//!
//! This crate owns the pieces where the real design lives: the phase
//! scheduler ([`engine`]), the commit-time comparison algorithm ([`shadow`]),
//! CRC-framed input/output ([`buffers`], [`crc`]), the delayed-free bin
//! ([`trash`]), the per-transaction allocator ([`talloc`]), control-flow
//! counters ([`cf`]), the deferred-syscall ledger ([`waitress`]), CPU-core
//! isolation ([`cpu`]), and the optional heap arena with page protection
//! ([`arena`], [`protection`]). The C ABI shim that drives real re-entry into
//! instrumented, non-closure application code lives in the separate `sei-abi`
//! crate; this crate's primary entry point ([`engine::Engine::run`]) drives
//! re-execution with an ordinary Rust closure instead.

#![warn(missing_docs)]

/// Optional preallocated, page-aligned heap region with size-classed free
/// lists, and its `mprotect`-based write tracking.
pub mod arena;
/// CRC-framed message buffers at the transaction boundary.
pub mod buffers;
/// Control-flow counters validating phase-boundary traversal.
pub mod cf;
/// Runtime configuration.
pub mod config;
/// Process-wide CPU-core isolation registry.
pub mod cpu;
/// CRC32C checksum routines used for all wire framing.
pub mod crc;
/// The phase engine: begin/switch/commit orchestration and rollback/retry.
pub mod engine;
/// The runtime's error taxonomy.
pub mod error;
/// `SIGSEGV`-based protection for `HEAP_PROTECT` builds.
pub mod protection;
/// The shadow write buffer: the commit-time comparison algorithm.
pub mod shadow;
/// Registry of output-buffer handles for multi-stream transactions.
pub mod stash;
/// Per-transaction allocator with phase-0 record / replay-phase playback.
pub mod talloc;
/// Deferred-free bin with cross-phase pointer matching.
pub mod trash;
/// Deferred-syscall ledger with cross-phase argument verification.
pub mod waitress;

pub use buffers::Mode;
pub use config::{Config, ConfigError};
pub use engine::{Engine, Memory, OutputMessage, Phase, Transaction};
pub use error::SeiError;
