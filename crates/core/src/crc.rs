//! CRC32C (Castagnoli) checksum used to frame every input and output
//! message crossing the transaction boundary.
//!
//! The contract is staged to match how message bytes actually arrive: a
//! caller opens a running checksum with [`Crc32::init`], folds bytes in as
//! they are read or written with [`Crc32::append`] (or a whole length with
//! [`Crc32::append_len`] when the bytes are already known to be correct,
//! e.g. zero-fill), and finalizes with [`Crc32::close`]. [`crc32`] is the
//! one-shot convenience wrapper over a complete buffer.
//!
//! A XOR-based "checksum" (`crc ^= byte`) exists in the reference this
//! runtime is modeled on but is scaffolding, not a real CRC: it can't
//! detect transposed bytes or certain multi-bit corruption patterns. It is
//! not shipped here; see the `#[cfg(test)]` module for it, used only to
//! demonstrate why the table-driven CRC32C below is required.

/// The CRC32C (Castagnoli) reversed polynomial.
const CRC32C_POLY: u32 = 0x82F6_3B78;

fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ CRC32C_POLY
            } else {
                crc >> 1
            };
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

fn table() -> &'static [u32; 256] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(build_table)
}

/// A running CRC32C accumulator.
///
/// `init` followed by zero or more `append`/`append_len` calls followed by
/// `close` reproduces the value [`crc32`] computes in one shot over the
/// concatenation of all appended bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32(u32);

impl Crc32 {
    /// Starts a new running checksum.
    #[must_use]
    pub fn init() -> Self {
        Self(0xFFFF_FFFF)
    }

    /// Folds `bytes` into the running checksum.
    pub fn append(&mut self, bytes: &[u8]) {
        let table = table();
        let mut crc = self.0;
        for &b in bytes {
            let idx = ((crc ^ u32::from(b)) & 0xFF) as usize;
            crc = (crc >> 8) ^ table[idx];
        }
        self.0 = crc;
    }

    /// Folds `len` zero bytes into the running checksum without allocating
    /// a zero buffer. Used for the zero-fill / null-message fast path.
    pub fn append_len(&mut self, len: usize) {
        let table = table();
        let mut crc = self.0;
        for _ in 0..len {
            let idx = (crc & 0xFF) as usize;
            crc = (crc >> 8) ^ table[idx];
        }
        self.0 = crc;
    }

    /// Finalizes the running checksum and returns the CRC32C value.
    #[must_use]
    pub fn close(self) -> u32 {
        !self.0
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::init()
    }
}

/// Computes the CRC32C of `bytes` in one call.
#[must_use]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut c = Crc32::init();
    c.append(bytes);
    c.close()
}

/// Validates `bytes` against a wire-frame CRC32C prefix, the gate the phase
/// engine's top-level `prepare` applies before a transaction begins (the
/// empty-message case is always accepted, matching the null-pointer/zero-size
/// null-message convention).
#[must_use]
pub fn verify_frame(bytes: &[u8], crc: u32) -> bool {
    bytes.is_empty() || crc32(bytes) == crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_has_known_crc() {
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn staged_append_matches_one_shot() {
        let mut staged = Crc32::init();
        staged.append(b"hello, ");
        staged.append(b"world");
        assert_eq!(staged.close(), crc32(b"hello, world"));
    }

    #[test]
    fn append_len_matches_explicit_zero_bytes() {
        let mut staged = Crc32::init();
        staged.append_len(16);
        let zeroes = [0u8; 16];
        assert_eq!(staged.close(), crc32(&zeroes));
    }

    #[test]
    fn verify_frame_accepts_matching_crc_and_the_null_message() {
        let bytes = b"counter=12\n";
        assert!(verify_frame(bytes, crc32(bytes)));
        assert!(verify_frame(b"", 0xDEAD_BEEF));
    }

    #[test]
    fn verify_frame_rejects_a_flipped_crc() {
        let bytes = b"hello";
        assert!(!verify_frame(bytes, crc32(bytes) ^ 1));
    }

    #[test]
    fn single_bit_flip_changes_crc() {
        let a = crc32(b"transactional memory");
        let mut corrupted = *b"transactional memory";
        corrupted[3] ^= 0x01;
        let b = crc32(&corrupted);
        assert_ne!(a, b);
    }

    /// The XOR scaffold a real CRC replaces: byte-swaps are invisible to it,
    /// demonstrating why it cannot ship as the production checksum.
    #[test]
    fn xor_scaffold_misses_byte_transposition() {
        fn xor_checksum(bytes: &[u8]) -> u32 {
            let mut crc = 0xFFFF_FFFFu32;
            for &b in bytes {
                crc ^= u32::from(b);
            }
            !crc
        }

        let original = b"ABCD";
        let mut swapped = *original;
        swapped.swap(0, 1);
        assert_eq!(
            xor_checksum(original),
            xor_checksum(&swapped),
            "XOR scaffold cannot detect a byte transposition"
        );
        assert_ne!(
            crc32(original),
            crc32(&swapped),
            "CRC32C must detect a byte transposition"
        );
    }
}
