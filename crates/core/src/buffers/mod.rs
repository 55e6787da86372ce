//! CRC-framed message buffers at the transaction boundary.

/// CRC-verified message delivery into a transaction.
pub mod input;
/// Held-back message delivery out of a transaction.
pub mod output;

pub use input::{InputBuffer, Mode};
pub use output::OutputBuffer;
