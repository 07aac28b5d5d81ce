//! BLAKE3 content identifiers.
//!
//! Tools, pinned directories and stored blobs are all addressed by the hex
//! encoding of a 32-byte BLAKE3 digest.

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Hex-encoded BLAKE3 digest of `data`.
pub fn content_id(data: &[u8]) -> String {
    hex::encode(hash(data))
}

/// True if `s` has the shape of a content identifier (64 lowercase hex chars).
pub fn is_content_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
