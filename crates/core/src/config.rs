//! Runtime configuration.
//!
//! The original implementation this runtime is modeled on tuned most of
//! these values as compile-time `#define`s. Everything that is a pure
//! capacity/tuning knob is a runtime [`Config`] field here instead; the two
//! choices that change which trait implementation gets compiled in (shadow
//! buffer flavour, static vs growable bounds) remain Cargo features because
//! they select code, not a number.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Failure modes of [`Config::from_json_file`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    /// The config file's contents did not parse as a [`Config`].
    #[error("parsing config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Default capacity values, named after the constants they replace in the
/// original C configuration header.
pub mod defaults {
    /// Redundancy level (number of phases) when unspecified.
    pub const REDUNDANCY: u8 = 2;
    /// Initial shadow write buffer capacity (entries), before growth.
    pub const COW_SIZE: usize = 128;
    /// Output queue depth (messages in flight per phase).
    pub const OBUF_SIZE: usize = 10;
    /// Hard ceiling on in-flight output messages across all queues.
    pub const OBUF_MAX_MSGS: usize = 100;
    /// Initial trash-bin capacity (deferred frees), before growth.
    pub const TBIN_SIZE: usize = 10_000;
    /// Initial traversal-allocator record capacity, before growth.
    pub const TALLOC_MAX_ALLOCS: usize = 20_000;
    /// Initial waitress capacity (deferred syscalls), before growth.
    pub const SC_MAX_CALLS: usize = 100;
    /// Maximum number of arguments recorded per deferred syscall.
    pub const WTS_MAX_ARG: usize = 32;
    /// Shadow-buffer compare conflict list bound, before it is treated as
    /// unrecoverable divergence rather than a scan budget.
    pub const ABUF_MAX_CONFLICTS: usize = 8_000;
    /// Heap arena size in bytes; zero means "pass through to the system
    /// allocator, no arena".
    pub const HEAP_ARENA_SIZE: usize = 0;
}

/// Top-level runtime configuration.
///
/// Construct with [`Config::default`], deserialize one from JSON/TOML via
/// `serde`, or read overrides from the process environment with
/// [`Config::from_env`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of redundant phases executed per transaction (`N`, `2..=10`).
    pub redundancy: u8,
    /// Initial shadow write buffer capacity.
    pub cow_size: usize,
    /// Output queue depth.
    pub obuf_size: usize,
    /// Hard ceiling on in-flight output messages.
    pub obuf_max_msgs: usize,
    /// Initial trash-bin capacity.
    pub tbin_size: usize,
    /// Initial traversal-allocator record capacity.
    pub talloc_max_allocs: usize,
    /// Initial waitress capacity.
    pub sc_max_calls: usize,
    /// Maximum arguments recorded per deferred syscall.
    pub wts_max_arg: usize,
    /// Shadow-buffer conflict-list bound.
    pub abuf_max_conflicts: usize,
    /// Heap arena size in bytes (`0` disables the arena).
    pub heap_arena_size: usize,
    /// Allow buffers to grow past their initial capacity via reallocation.
    /// When `false`, exceeding a buffer's initial capacity is a
    /// [`crate::error::SeiError::CapacityExceeded`] rather than a realloc.
    pub allow_realloc: bool,
    /// Enable `mprotect`-based write tracking of the heap arena between
    /// transactions, in addition to (or instead of) explicit shadow
    /// tracking. Requires `heap_arena_size > 0`.
    pub heap_protect: bool,
    /// Wrap raw syscalls through the waitress (record-replay / defer).
    /// Disabled when the caller only ever runs a single thread and does not
    /// cross a syscall boundary inside a transaction.
    pub wrap_syscalls: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redundancy: defaults::REDUNDANCY,
            cow_size: defaults::COW_SIZE,
            obuf_size: defaults::OBUF_SIZE,
            obuf_max_msgs: defaults::OBUF_MAX_MSGS,
            tbin_size: defaults::TBIN_SIZE,
            talloc_max_allocs: defaults::TALLOC_MAX_ALLOCS,
            sc_max_calls: defaults::SC_MAX_CALLS,
            wts_max_arg: defaults::WTS_MAX_ARG,
            abuf_max_conflicts: defaults::ABUF_MAX_CONFLICTS,
            heap_arena_size: defaults::HEAP_ARENA_SIZE,
            allow_realloc: true,
            heap_protect: false,
            wrap_syscalls: false,
        }
    }
}

impl Config {
    /// Builds a [`Config`] from `SEI_*` environment variables, falling back
    /// to [`Config::default`] for anything unset or unparsable.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_u8("SEI_REDUNDANCY") {
            cfg.redundancy = v;
        }
        if let Some(v) = env_usize("SEI_COW_SIZE") {
            cfg.cow_size = v;
        }
        if let Some(v) = env_usize("SEI_OBUF_SIZE") {
            cfg.obuf_size = v;
        }
        if let Some(v) = env_usize("SEI_TBIN_SIZE") {
            cfg.tbin_size = v;
        }
        if let Some(v) = env_usize("SEI_TALLOC_MAX_ALLOCS") {
            cfg.talloc_max_allocs = v;
        }
        if let Some(v) = env_usize("SEI_HEAP_ARENA_SIZE") {
            cfg.heap_arena_size = v;
        }
        if let Some(v) = env_bool("SEI_ALLOW_REALLOC") {
            cfg.allow_realloc = v;
        }
        if let Some(v) = env_bool("SEI_HEAP_PROTECT") {
            cfg.heap_protect = v;
        }
        if let Some(v) = env_bool("SEI_WRAP_SC") {
            cfg.wrap_syscalls = v;
        }
        cfg
    }
}

impl Config {
    /// Reads a [`Config`] from a JSON file, falling back to
    /// [`Config::default`] for any field the file omits (`#[serde(default)]`
    /// applies per-field, same as [`Config::from_env`]'s partial overrides).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if `path` cannot be read, or
    /// [`ConfigError::Parse`] if its contents are not valid JSON for this
    /// struct's shape.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u8(key: &str) -> Option<u8> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}
