//! Artifact cache.
//!
//! Containers run out of rootfs archives fetched over HTTP. The cache
//! lives at `<artifact-root>/<host>/<path-without-suffix>`; a fetch
//! downloads to a scratch file, unpacks into a scratch directory beside
//! the target, and atomically renames it into place. Concurrent fetches
//! of the same artifact are safe by filesystem semantics: whoever renames
//! first wins and the loser's rename finds the target already present.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("unsupported artifact url: {0}")]
    UnsupportedUrl(String),

    #[error("artifact download failed: {0}")]
    Download(String),

    #[error("artifact unpack failed: {0}")]
    Unpack(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Archive flavors the store understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Tar,
    TarGz,
    TarBz2,
}

/// The on-host artifact cache.
pub struct ArtifactStore {
    root: PathBuf,
    client: reqwest::Client,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Ensure the artifact at `url` is unpacked in the cache; returns the
    /// unpacked rootfs directory.
    pub async fn ensure(&self, url: &str) -> Result<PathBuf, ArtifactError> {
        let (dest, kind) = self.cache_entry_for(url)?;

        if dest.is_dir() {
            debug!(url, dest = %dest.display(), "artifact cache hit");
            return Ok(dest);
        }

        info!(url, dest = %dest.display(), "fetching artifact");

        let body = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ArtifactError::Download(e.to_string()))?
            .error_for_status()
            .map_err(|e| ArtifactError::Download(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| ArtifactError::Download(e.to_string()))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Unpack beside the target, then atomically rename into place.
        let scratch = dest.with_extension("unpack");
        let _ = tokio::fs::remove_dir_all(&scratch).await;
        let scratch_clone = scratch.clone();
        tokio::task::spawn_blocking(move || unpack(&body, kind, &scratch_clone))
            .await
            .map_err(|e| ArtifactError::Unpack(e.to_string()))??;

        match tokio::fs::rename(&scratch, &dest).await {
            Ok(()) => {}
            Err(_) if dest.is_dir() => {
                // Lost the race to a concurrent fetch; theirs is as good as ours.
                let _ = tokio::fs::remove_dir_all(&scratch).await;
            }
            Err(e) => return Err(e.into()),
        }

        Ok(dest)
    }

    /// Map an artifact url to its cache directory and archive kind.
    fn cache_entry_for(&self, url: &str) -> Result<(PathBuf, ArchiveKind), ArtifactError> {
        let rest = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"))
            .ok_or_else(|| ArtifactError::UnsupportedUrl(url.to_string()))?;

        let (host, path) = rest
            .split_once('/')
            .ok_or_else(|| ArtifactError::UnsupportedUrl(url.to_string()))?;
        if host.is_empty() || path.is_empty() {
            return Err(ArtifactError::UnsupportedUrl(url.to_string()));
        }

        let (stripped, kind) = strip_archive_suffix(path)
            .ok_or_else(|| ArtifactError::UnsupportedUrl(url.to_string()))?;

        // Refuse path traversal out of the cache root.
        if stripped.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(ArtifactError::UnsupportedUrl(url.to_string()));
        }

        Ok((self.root.join(host).join(stripped), kind))
    }
}

fn strip_archive_suffix(path: &str) -> Option<(&str, ArchiveKind)> {
    // Longest suffixes first so .tar.gz is not mistaken for .tar.
    if let Some(s) = path.strip_suffix(".tar.gz") {
        return Some((s, ArchiveKind::TarGz));
    }
    if let Some(s) = path.strip_suffix(".tar.bz2") {
        return Some((s, ArchiveKind::TarBz2));
    }
    if let Some(s) = path.strip_suffix(".tgz") {
        return Some((s, ArchiveKind::TarGz));
    }
    if let Some(s) = path.strip_suffix(".tar") {
        return Some((s, ArchiveKind::Tar));
    }
    None
}

fn unpack(body: &[u8], kind: ArchiveKind, dest: &Path) -> Result<(), ArtifactError> {
    std::fs::create_dir_all(dest)?;
    let result = match kind {
        ArchiveKind::Tar => tar::Archive::new(body).unpack(dest),
        ArchiveKind::TarGz => {
            tar::Archive::new(flate2::read::GzDecoder::new(body)).unpack(dest)
        }
        ArchiveKind::TarBz2 => {
            tar::Archive::new(bzip2::read::BzDecoder::new(body)).unpack(dest)
        }
    };
    result.map_err(|e| ArtifactError::Unpack(e.to_string()))
}
