//! Local asset source: resolve opaque refs and stream bytes into staging.
//!
//! The engine only sees this trait; `FsAssetStore` is the shipped
//! implementation (a directory of source files, refs are relative paths).

use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::UNIX_EPOCH;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Metadata for a resolved source, captured at submit and re-checked at
/// download time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceAsset {
    /// The source's own stable identifier; staging paths derive from it.
    pub source_id: String,
    pub file_name: String,
    pub created_at: i64,
    pub modified_at: i64,
    pub favorite: bool,
}

/// Why a fetch stopped without staging the bytes.
#[derive(Debug)]
pub enum FetchError {
    /// The ref no longer resolves to a source.
    NotFound,
    /// The abort token was set; the caller owns partial-file cleanup.
    Aborted,
    /// Reading the source or writing the staging file failed.
    Io(std::io::Error),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::NotFound => write!(f, "source not found"),
            FetchError::Aborted => write!(f, "fetch aborted"),
            FetchError::Io(e) => write!(f, "io: {}", e),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Io(e) => Some(e),
            FetchError::NotFound | FetchError::Aborted => None,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Io(e)
    }
}

/// Progress observer for one fetch; receives fractions in [0.0, 1.0].
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// The local asset store the download phase pulls from.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Resolve an opaque ref to source metadata, or None if it no longer
    /// exists.
    async fn resolve(&self, local_ref: &str) -> anyhow::Result<Option<SourceAsset>>;

    /// Stream the source's bytes to `dest`, reporting progress fractions
    /// and honoring `abort` between chunks. On `Aborted` the destination
    /// file may be partial; the caller removes it.
    async fn fetch(
        &self,
        local_ref: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
        abort: &AtomicBool,
    ) -> Result<(), FetchError>;
}

/// Filesystem-backed asset store rooted at a directory. Local refs are
/// paths relative to the root; the stable source id is the ref itself.
pub struct FsAssetStore {
    root: PathBuf,
}

const CHUNK_SIZE: usize = 64 * 1024;

impl FsAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn source_path(&self, local_ref: &str) -> PathBuf {
        self.root.join(local_ref)
    }
}

fn unix_secs(t: std::io::Result<std::time::SystemTime>) -> i64 {
    t.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl AssetStore for FsAssetStore {
    async fn resolve(&self, local_ref: &str) -> anyhow::Result<Option<SourceAsset>> {
        let path = self.source_path(local_ref);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| local_ref.to_string());

        Ok(Some(SourceAsset {
            source_id: local_ref.to_string(),
            file_name,
            created_at: unix_secs(meta.created().or_else(|_| meta.modified())),
            modified_at: unix_secs(meta.modified()),
            favorite: false,
        }))
    }

    async fn fetch(
        &self,
        local_ref: &str,
        dest: &Path,
        progress: ProgressFn<'_>,
        abort: &AtomicBool,
    ) -> Result<(), FetchError> {
        let path = self.source_path(local_ref);
        let mut src = match tokio::fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound)
            }
            Err(e) => return Err(e.into()),
        };
        let total = src.metadata().await?.len();

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut out = tokio::fs::File::create(dest).await?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written: u64 = 0;
        loop {
            if abort.load(Ordering::Relaxed) {
                return Err(FetchError::Aborted);
            }
            let n = src.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n]).await?;
            written += n as u64;
            if total > 0 {
                progress((written as f64 / total as f64).min(1.0));
            }
        }
        out.flush().await?;
        progress(1.0);
        Ok(())
    }
}
