//! # Migration Checksum
//!
//! CRC32 checksums detect manual edits to migration scripts after they have
//! been recorded in the ledger. The checksum input is the pinned contract
//! `up + "\n" + down`: changing either the algorithm or the input silently
//! invalidates every previously recorded checksum, so any such change is a
//! breaking change that requires a one-time re-baseline of the ledger.

use crc32fast::Hasher;

/// Compute the checksum for a migration's scripts.
///
/// Same `up`/`down` pair always produces the same checksum.
pub fn migration_checksum(up: &str, down: &str) -> String {
    let mut content = String::with_capacity(up.len() + down.len() + 1);
    content.push_str(up);
    content.push('\n');
    content.push_str(down);
    compute_checksum(&content)
}

/// Compute a CRC32 checksum over arbitrary content.
pub fn compute_checksum(content: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(content.as_bytes());
    format!("crc32:{:08X}", hasher.finalize())
}

/// Verify that content matches an expected checksum.
pub fn verify_checksum(content: &str, expected: &str) -> bool {
    compute_checksum(content) == expected
}

/// Parse the raw value out of a "crc32:ABC12345" formatted string.
pub fn parse_checksum(formatted: &str) -> Option<u32> {
    let hex_part = formatted.strip_prefix("crc32:")?;
    u32::from_str_radix(hex_part, 16).ok()
}
