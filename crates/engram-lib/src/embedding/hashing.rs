//! Content digests for cache keys and record ids.

/// 128-bit digest of a text, used as the embedding-cache key.
///
/// BLAKE3 output truncated to the first 16 bytes.
#[inline]
pub fn text_digest(text: &str) -> [u8; 16] {
    let hash = blake3::hash(text.as_bytes());
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash.as_bytes()[..16]);
    out
}

/// Hex form of [`text_digest`], used as the persistent cache's primary key.
#[inline]
pub fn text_digest_hex(text: &str) -> String {
    digest_hex(&text_digest(text))
}

/// Render a 16-byte digest as 32 lowercase hex characters.
#[inline]
pub fn digest_hex(digest: &[u8; 16]) -> String {
    hex_lower(digest)
}

/// 64-bit content digest rendered as 16 lowercase hex characters.
///
/// Record ids hash `text:wall-clock:salt` so duplicate texts submitted at
/// different times still get distinct ids.
#[inline]
pub fn id_digest(material: &str) -> String {
    let hash = blake3::hash(material.as_bytes());
    hex_lower(&hash.as_bytes()[..8])
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(&mut out, "{b:02x}").expect("writing to a String cannot fail");
    }
    out
}
