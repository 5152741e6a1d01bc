//! Content digest of staged bytes for the integrity header.
//!
//! Computed once per upload handoff, off the async executor (the upload
//! stage wraps this in `spawn_blocking`).

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

const BUF_SIZE: usize = 64 * 1024;

/// Compute SHA-256 of a file, reading in chunks to keep memory bounded.
/// Returns the raw 32-byte digest; callers pick the encoding (the header
/// wants base64, tests use hex).
pub fn sha256_path(path: &Path) -> Result<[u8; 32]> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().into())
}
