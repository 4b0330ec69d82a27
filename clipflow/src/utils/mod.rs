//! Utility functions for ids, timestamps and durable file writes.

pub mod fs;
pub mod timestamps;

pub use fs::{atomic_write, read_json_lenient, write_json_atomic};
pub use timestamps::{compact_timestamp, iso_timestamp, now_utc, Timestamp};

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a new run id.
#[must_use]
pub fn generate_run_id() -> Uuid {
    Uuid::new_v4()
}

/// Returns the first `len` hex characters of the SHA-256 of `input`.
#[must_use]
pub fn short_digest(input: &str, len: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..len.min(digest.len())].to_string()
}

/// Lowercase ASCII slug: alphanumerics kept, everything else collapsed to `-`.
#[must_use]
pub fn slugify(input: &str, max_len: usize) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= max_len {
            break;
        }
    }
    slug.truncate(max_len);
    slug.trim_end_matches('-').to_string()
}
