//! src/services/blob_store.rs
//!
//! BlobStore: durable byte storage on local disk, one directory per bucket
//! beneath `base_path/{bucket_id}/{token}{ext}`. It knows nothing about the
//! database; the record store is the only source of truth for which
//! locators are live.

use bytes::Bytes;
use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Fallback content type for unknown or missing extensions.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const MAX_LOCATOR_LEN: usize = 512;
const MAX_EXTENSION_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("invalid blob locator `{0}`")]
    InvalidLocator(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Result of a successful `put`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    /// Opaque locator, relative to the store root.
    pub locator: String,
    /// Content type inferred from the original name.
    pub content_type: String,
    /// Exact number of bytes written.
    pub size: u64,
}

/// Replacement bytes already durable on disk but not yet visible under
/// their locator. Must be either published or discarded.
#[derive(Debug)]
pub struct StagedBlob {
    locator: String,
    tmp_path: PathBuf,
    target: PathBuf,
    size: u64,
}

impl StagedBlob {
    pub fn locator(&self) -> &str {
        &self.locator
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Rename the staged bytes over the locator. The temp file is removed
    /// if the rename fails.
    pub async fn publish(self) -> BlobResult<()> {
        if let Err(err) = fs::rename(&self.tmp_path, &self.target).await {
            let _ = fs::remove_file(&self.tmp_path).await;
            return Err(BlobError::Io(err));
        }
        debug!(locator = %self.locator, size = self.size, "published blob");
        Ok(())
    }

    /// Drop the staged bytes, leaving the locator untouched.
    pub async fn discard(self) {
        match fs::remove_file(&self.tmp_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                path = %self.tmp_path.display(),
                error = %err,
                "could not remove staged blob"
            ),
        }
    }
}

/// Filesystem-backed blob store.
///
/// Writes go to a temp file in the target directory, are fsynced and then
/// renamed into place, so readers never observe a partially written blob.
#[derive(Clone, Debug)]
pub struct BlobStore {
    base_path: PathBuf,
}

impl BlobStore {
    /// Create a store rooted at `base_path`, creating the directory if needed.
    pub async fn new(base_path: impl Into<PathBuf>) -> BlobResult<Self> {
        let base_path = base_path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Directory holding every blob of a bucket.
    fn bucket_root(&self, bucket_id: i64) -> PathBuf {
        self.base_path.join(bucket_id.to_string())
    }

    /// Resolve a locator to a path under the root.
    ///
    /// Rejects empty or oversized locators, absolute paths, `..`, backslashes
    /// and control characters. Only plain relative components are accepted.
    fn blob_path(&self, locator: &str) -> BlobResult<PathBuf> {
        let invalid = || BlobError::InvalidLocator(locator.to_string());

        if locator.is_empty() || locator.len() > MAX_LOCATOR_LEN {
            return Err(invalid());
        }
        if locator.starts_with('/') || locator.contains("..") {
            return Err(invalid());
        }
        if locator
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        if !Path::new(locator)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(invalid());
        }

        Ok(self.base_path.join(locator))
    }

    /// Idempotently create the bucket's directory.
    #[instrument(skip(self))]
    pub async fn ensure_bucket_namespace(&self, bucket_id: i64) -> BlobResult<PathBuf> {
        let root = self.bucket_root(bucket_id);
        fs::create_dir_all(&root).await?;
        Ok(root)
    }

    /// Store `bytes` under a fresh locator in the bucket's namespace.
    ///
    /// The locator is a random UUID plus the original name's extension, so
    /// repeated uploads of the same name never collide and the untrusted
    /// name never reaches the filesystem.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn put(
        &self,
        bucket_id: i64,
        original_name: &str,
        bytes: &[u8],
    ) -> BlobResult<StoredBlob> {
        self.ensure_bucket_namespace(bucket_id).await?;

        let locator = format!(
            "{}/{}{}",
            bucket_id,
            Uuid::new_v4(),
            extension_of(original_name)
        );
        let path = self.blob_path(&locator)?;
        let size = write_atomic(&path, bytes).await?;

        debug!(%locator, size, "stored blob");
        Ok(StoredBlob {
            locator,
            content_type: content_type_for(original_name),
            size,
        })
    }

    /// Overwrite the bytes at `locator`, keeping the locator.
    ///
    /// Does not check that the locator was previously written: an unknown
    /// locator is created. Callers must take the locator from a live file row.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn replace(&self, locator: &str, bytes: &[u8]) -> BlobResult<()> {
        self.stage_replace(locator, bytes).await?.publish().await
    }

    /// First half of `replace`: write and fsync the new bytes next to
    /// `locator` without making them visible. Nothing changes at the
    /// locator until the returned `StagedBlob` is published.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn stage_replace(&self, locator: &str, bytes: &[u8]) -> BlobResult<StagedBlob> {
        let target = self.blob_path(locator)?;
        let parent = target
            .parent()
            .ok_or_else(|| BlobError::InvalidLocator(locator.to_string()))?;
        fs::create_dir_all(parent).await?;
        let tmp_path = write_temp(parent, bytes).await?;

        Ok(StagedBlob {
            locator: locator.to_string(),
            tmp_path,
            target,
            size: bytes.len() as u64,
        })
    }

    /// Remove the blob at `locator`.
    ///
    /// Returns `Ok(false)` when nothing was there, so repeated deletes are safe.
    #[instrument(skip(self))]
    pub async fn delete(&self, locator: &str) -> BlobResult<bool> {
        let path = self.blob_path(locator)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("removed physical file {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
                Ok(false)
            }
            Err(err) => Err(BlobError::Io(err)),
        }
    }

    /// Read the full contents of a blob.
    #[instrument(skip(self))]
    pub async fn read(&self, locator: &str) -> BlobResult<Bytes> {
        let path = self.blob_path(locator)?;
        let data = fs::read(&path).await.map_err(|err| not_found_or_io(err, locator))?;
        Ok(Bytes::from(data))
    }

    /// Open a blob for streaming reads.
    #[instrument(skip(self))]
    pub async fn open(&self, locator: &str) -> BlobResult<File> {
        let path = self.blob_path(locator)?;
        File::open(&path)
            .await
            .map_err(|err| not_found_or_io(err, locator))
    }

    /// Remove a bucket's directory with whatever it still contains.
    ///
    /// Returns `Ok(false)` if the directory did not exist.
    #[instrument(skip(self))]
    pub async fn remove_bucket_namespace(&self, bucket_id: i64) -> BlobResult<bool> {
        let root = self.bucket_root(bucket_id);
        match fs::remove_dir_all(&root).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(BlobError::Io(err)),
        }
    }
}

fn not_found_or_io(err: io::Error, locator: &str) -> BlobError {
    if err.kind() == ErrorKind::NotFound {
        BlobError::NotFound(locator.to_string())
    } else {
        BlobError::Io(err)
    }
}

/// Write `bytes` to a sibling temp file, fsync, then rename over `path`.
///
/// The temp file is removed on any failure.
async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<u64> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("blob path missing parent directory"))?;
    let tmp_path = write_temp(parent, bytes).await?;

    if let Err(err) = fs::rename(&tmp_path, path).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    Ok(bytes.len() as u64)
}

/// Write `bytes` to a fresh `.tmp-<uuid>` file in `dir` and fsync it.
async fn write_temp(dir: &Path, bytes: &[u8]) -> io::Result<PathBuf> {
    let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));

    let result: io::Result<()> = async {
        let mut file = File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;

    match result {
        Ok(()) => Ok(tmp_path),
        Err(err) => {
            let _ = fs::remove_file(&tmp_path).await;
            Err(err)
        }
    }
}

/// Extension of `original_name` including the dot, or an empty string.
///
/// Only short ASCII-alphanumeric extensions survive; anything else is
/// dropped rather than carried into the locator.
pub fn extension_of(original_name: &str) -> String {
    let file_name = original_name
        .rsplit(&['/', '\\'][..])
        .next()
        .unwrap_or(original_name);

    match file_name.rsplit_once('.') {
        Some((stem, ext))
            if !stem.is_empty()
                && !ext.is_empty()
                && ext.len() <= MAX_EXTENSION_LEN
                && ext.bytes().all(|b| b.is_ascii_alphanumeric()) =>
        {
            format!(".{}", ext)
        }
        _ => String::new(),
    }
}

/// Content type guessed from the original name's extension.
pub fn content_type_for(original_name: &str) -> String {
    let ext = extension_of(original_name);
    if ext.is_empty() {
        return DEFAULT_CONTENT_TYPE.to_string();
    }
    mime_guess::from_ext(&ext[1..])
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}
