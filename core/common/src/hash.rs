//! Content hashing for change detection.

use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// SHA-256 hex digest of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of a file, streamed in fixed-size blocks.
pub fn hash_file(path: &Path) -> crate::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
