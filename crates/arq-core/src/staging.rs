//! Deterministic staging paths for downloaded source bytes.
//!
//! The path for a job is a pure function of its source's stable identifier,
//! so a retried download overwrites the previous partial file instead of
//! accumulating siblings.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::ArqConfig;

/// Staging directory: the configured override, or
/// `~/.local/state/arq/staging`.
pub fn staging_dir(cfg: &ArqConfig) -> Result<PathBuf> {
    if let Some(dir) = &cfg.staging_dir {
        return Ok(dir.clone());
    }
    let xdg_dirs = xdg::BaseDirectories::with_prefix("arq")?;
    Ok(xdg_dirs.get_state_home().join("arq").join("staging"))
}

/// Staging path for one source. The sanitized identifier keeps the file
/// recognizable; the digest suffix keeps distinct identifiers from
/// colliding after sanitization.
pub fn staging_path(dir: &Path, source_id: &str) -> PathBuf {
    let digest = Sha256::digest(source_id.as_bytes());
    let suffix = hex::encode(&digest[..4]);
    dir.join(format!("{}-{}", sanitize_component(source_id), suffix))
}

/// Replace anything outside [A-Za-z0-9._-] so the identifier is a safe
/// single path component, truncated to keep names filesystem-friendly.
fn sanitize_component(s: &str) -> String {
    let mut out: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(64);
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Best-effort removal of a staged file. Missing files are fine (the other
/// deleter in a cancel race already won); anything else is logged.
pub async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!(path = %path.display(), "removed staged file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "could not remove staged file: {}", e),
    }
}
