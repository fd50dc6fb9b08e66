//! Content-addressed copies of local artwork.
//!
//! Players hand out `file://` art URLs that are useless to a remote client.
//! Files under an allow-listed temp directory are copied into the cache
//! directory once per (path, mtime, size) and served back by key. Entries
//! are never evicted.

use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use tokio::fs;
use tracing::{debug, warn};
use url::Url;

use crate::error::{RemoteError, Result};

const MAX_KEY_LEN: usize = 96;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct ArtCache {
    root: PathBuf,
    allowed_roots: Vec<PathBuf>,
}

/// A cached file ready to be sent.
#[derive(Debug, Clone)]
pub struct CachedArt {
    pub bytes: Bytes,
    pub content_type: &'static str,
}

impl ArtCache {
    pub fn new(root: impl Into<PathBuf>, allowed_roots: Vec<PathBuf>) -> Self {
        Self {
            root: root.into(),
            allowed_roots,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    /// Materializes a `file://` artwork reference and returns its cache key.
    ///
    /// Remote URLs, unparseable references and paths outside the allow-list
    /// all yield `None`; the caller passes those through untouched.
    pub async fn proxy(&self, source_ref: &str) -> Option<String> {
        let path = local_source(source_ref)?;
        let path = self.contain(&path).await?;
        match self.materialize(&path).await {
            Ok((key, _)) => Some(key),
            Err(err) => {
                warn!(source = %path.display(), %err, "cache art failed");
                None
            }
        }
    }

    /// Re-checks the allow-list after resolving symlinks.
    async fn contain(&self, path: &Path) -> Option<PathBuf> {
        if !self.is_allowed(path) {
            debug!(source = %path.display(), "art source outside allowed roots");
            return None;
        }
        let resolved = fs::canonicalize(path).await.ok()?;
        if self.is_allowed(&resolved) {
            return Some(resolved);
        }
        for root in &self.allowed_roots {
            if let Ok(real_root) = fs::canonicalize(root).await {
                if resolved.starts_with(&real_root) {
                    return Some(resolved);
                }
            }
        }
        debug!(source = %path.display(), "art source escapes allowed roots");
        None
    }

    fn is_allowed(&self, path: &Path) -> bool {
        path.is_absolute()
            && !path.components().any(|c| matches!(c, Component::ParentDir))
            && self.allowed_roots.iter().any(|root| path.starts_with(root))
    }

    /// Returns the key and whether a copy was made.
    async fn materialize(&self, path: &Path) -> io::Result<(String, bool)> {
        let meta = fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
        }
        let mtime = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let key = cache_key(path, mtime, meta.len());
        let dest = self.root.join(&key);

        if fs::try_exists(&dest).await? {
            return Ok((key, false));
        }

        fs::create_dir_all(&self.root).await?;
        let tmp = self.root.join(format!(
            ".{key}.{}.{}.tmp",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(err) = fs::copy(path, &tmp).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        if let Err(err) = fs::rename(&tmp, &dest).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        debug!(%key, source = %path.display(), "cached art");
        Ok((key, true))
    }

    /// Maps a key to its file inside the cache root, failing closed.
    pub fn resolve(&self, key: &str) -> Result<PathBuf> {
        if !is_valid_key(key) {
            return Err(RemoteError::InvalidKey);
        }
        let path = self.root.join(key);
        if path.parent() != Some(self.root.as_path()) {
            return Err(RemoteError::InvalidKey);
        }
        Ok(path)
    }

    pub async fn serve(&self, key: &str) -> Result<CachedArt> {
        let path = self.resolve(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(CachedArt {
                bytes: Bytes::from(data),
                content_type: content_type(key),
            }),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(RemoteError::NotFound(key.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// URL path under which a cache key is exposed.
#[must_use]
pub fn proxy_path(key: &str) -> String {
    format!("/art/{key}")
}

fn local_source(source_ref: &str) -> Option<PathBuf> {
    let url = Url::parse(source_ref).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

/// sha1 over path, mtime and size, plus the source's extension.
#[must_use]
pub fn cache_key(path: &Path, mtime_nanos: u128, size: u64) -> String {
    let mut hasher = Sha1::new();
    hasher.update(path.as_os_str().as_encoded_bytes());
    hasher.update([0]);
    hasher.update(mtime_nanos.to_string().as_bytes());
    hasher.update([0]);
    hasher.update(size.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map_or_else(|| "img".to_string(), str::to_ascii_lowercase);
    format!("{digest}.{ext}")
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && !key.contains("..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
}

fn content_type(key: &str) -> &'static str {
    match key.rsplit('.').next().unwrap_or_default() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}
