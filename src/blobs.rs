//! Write-once content-addressed blob storage.
//!
//! Blobs live as flat files named exactly by their digest string
//! (`sha256:` + 64 hex chars). Digest strings from URLs are validated
//! against the exact pattern before any filesystem access.

use crate::error::{Error, Result};
use anyhow::Context as _;
use regex::Regex;
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static DIGEST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sha256:[0-9a-f]{64}$").expect("hardcoded regex"));

/// Whether a string is a well-formed digest.
pub fn valid_digest(digest: &str) -> bool {
    DIGEST_PATTERN.is_match(digest)
}

/// Compute the digest string for a byte sequence.
pub fn digest_of(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

#[derive(Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) the blob directory.
    pub async fn open(dir: &Path) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create blob directory: {}", dir.display()))?;

        Ok(Self { dir: dir.to_path_buf() })
    }

    /// Store a byte sequence, returning its digest. Writing the same content
    /// twice is a cheap no-op: the store never errors on or overwrites an
    /// existing digest.
    pub async fn put(&self, bytes: &[u8]) -> Result<String> {
        let digest = digest_of(bytes);
        let target = self.dir.join(&digest);

        if tokio::fs::try_exists(&target)
            .await
            .with_context(|| format!("failed to stat blob: {}", target.display()))?
        {
            return Ok(digest);
        }

        // Write-then-rename so a concurrent reader never sees a partial blob.
        let staging = self.dir.join(format!("{digest}.tmp-{}", std::process::id()));
        tokio::fs::write(&staging, bytes)
            .await
            .with_context(|| format!("failed to write blob: {}", staging.display()))?;
        tokio::fs::rename(&staging, &target)
            .await
            .with_context(|| format!("failed to finalize blob: {}", target.display()))?;

        Ok(digest)
    }

    /// Fetch a blob by digest. Malformed digests are rejected before any
    /// filesystem access; an unknown digest is `None`.
    pub async fn get(&self, digest: &str) -> Result<Option<Vec<u8>>> {
        if !valid_digest(digest) {
            return Err(Error::BadRequest("invalid hash format".into()));
        }

        let path = self.dir.join(digest);
        if !tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to stat blob: {}", path.display()))?
        {
            return Ok(None);
        }

        // The pattern already forbids traversal; verify the resolved path
        // anyway before reading.
        let canonical_dir = tokio::fs::canonicalize(&self.dir)
            .await
            .context("failed to canonicalize blob directory")?;
        let canonical = tokio::fs::canonicalize(&path)
            .await
            .with_context(|| format!("failed to canonicalize blob path: {}", path.display()))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(Error::BadRequest("invalid hash format".into()));
        }

        let bytes = tokio::fs::read(&canonical)
            .await
            .with_context(|| format!("failed to read blob: {}", canonical.display()))?;

        Ok(Some(bytes))
    }
}
