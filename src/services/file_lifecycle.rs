//! src/services/file_lifecycle.rs
//!
//! FileLifecycle: the only component that touches both the record store and
//! the blob store for one logical action. Rows must never point at missing
//! blobs; blobs without rows are tolerated and logged as orphans.

use crate::{
    models::file::{FileRecord, NewFile},
    services::{
        blob_store::{BlobError, BlobStore, StagedBlob, StoredBlob},
        record_store::{MAX_PAGE_LIMIT, Page, RecordError, RecordStore},
    },
};
use futures::{StreamExt, stream};
use serde::Serialize;
use thiserror::Error;
use tokio::fs::File;
use tracing::{error, info, instrument, warn};

/// Concurrent blob deletions during a bucket cascade.
const CASCADE_CONCURRENCY: usize = 8;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(i64),
    #[error("file `{0}` not found")]
    FileNotFound(i64),
    #[error("storage write failed: {0}")]
    StorageWriteFailed(#[source] BlobError),
    #[error("storage read failed: {0}")]
    StorageReadFailed(#[source] BlobError),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error(transparent)]
    Record(RecordError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

impl From<RecordError> for LifecycleError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::BucketNotFound(id) => LifecycleError::BucketNotFound(id),
            RecordError::FileNotFound(id) => LifecycleError::FileNotFound(id),
            RecordError::IntegrityViolation(msg) => LifecycleError::IntegrityViolation(msg),
            other => LifecycleError::Record(other),
        }
    }
}

/// Outcome of a bucket cascade.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CascadeReport {
    /// File rows enumerated before the bucket row was removed.
    pub files: usize,
    /// Blobs actually removed from disk.
    pub blobs_deleted: usize,
    /// Blobs that were already gone.
    pub blobs_missing: usize,
    /// Blobs whose removal failed and that are left for reconciliation.
    pub blobs_orphaned: Vec<String>,
}

/// Sequences record and blob operations for uploads, replacements and deletes.
#[derive(Clone)]
pub struct FileLifecycle {
    records: RecordStore,
    blobs: BlobStore,
}

impl FileLifecycle {
    pub fn new(records: RecordStore, blobs: BlobStore) -> Self {
        Self { records, blobs }
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Store `bytes` as a new file of `bucket_id`.
    ///
    /// The blob is written first. If the row cannot be created afterwards the
    /// blob is removed again; failing that, it is logged as an orphan.
    #[instrument(skip(self, bytes, description), fields(size = bytes.len()))]
    pub async fn upload(
        &self,
        bucket_id: i64,
        original_name: &str,
        bytes: &[u8],
        description: Option<String>,
    ) -> LifecycleResult<FileRecord> {
        if !self.records.bucket_exists(bucket_id).await? {
            return Err(LifecycleError::BucketNotFound(bucket_id));
        }

        let stored = self
            .blobs
            .put(bucket_id, original_name, bytes)
            .await
            .map_err(LifecycleError::StorageWriteFailed)?;

        self.record_upload(bucket_id, original_name, stored, description)
            .await
    }

    /// Create the row for a freshly written blob, removing the blob again
    /// if the row cannot be created.
    async fn record_upload(
        &self,
        bucket_id: i64,
        original_name: &str,
        stored: StoredBlob,
        description: Option<String>,
    ) -> LifecycleResult<FileRecord> {
        let new_file = NewFile {
            bucket_id,
            original_name: original_name.to_string(),
            storage_path: stored.locator.clone(),
            file_type: stored.content_type,
            file_size: stored.size as i64,
            description,
        };

        match self.records.create_file(new_file).await {
            Ok(file) => {
                info!(file_id = file.id, bucket_id, size = file.file_size, "uploaded file");
                Ok(file)
            }
            Err(err) => {
                let err = LifecycleError::from(err);
                self.discard_blob(&stored.locator).await;
                if matches!(err, LifecycleError::IntegrityViolation(_)) {
                    // The bucket went away mid-upload; `put` recreated its directory.
                    if let Err(dir_err) = self.blobs.remove_bucket_namespace(bucket_id).await {
                        warn!(bucket_id, error = %dir_err, "failed to remove bucket directory");
                    }
                }
                Err(err)
            }
        }
    }

    /// Overwrite a file's content, keeping its locator.
    ///
    /// The new bytes are written and fsynced before the row is touched, so
    /// the database write lock only spans the rename and the commit.
    #[instrument(skip(self, bytes), fields(size = bytes.len()))]
    pub async fn replace_content(&self, file_id: i64, bytes: &[u8]) -> LifecycleResult<FileRecord> {
        let staged = self.prepare_replace(file_id, bytes).await?;
        self.publish_replace(file_id, staged).await
    }

    async fn prepare_replace(&self, file_id: i64, bytes: &[u8]) -> LifecycleResult<StagedBlob> {
        let file = self.records.get_file(file_id).await?;
        self.blobs
            .stage_replace(&file.storage_path, bytes)
            .await
            .map_err(LifecycleError::StorageWriteFailed)
    }

    /// Lock the row, publish the staged bytes, commit. A row deleted since
    /// `prepare_replace` discards the staged bytes; a failed rename rolls
    /// the row back untouched.
    async fn publish_replace(&self, file_id: i64, staged: StagedBlob) -> LifecycleResult<FileRecord> {
        let update = match self
            .records
            .stage_content_update(file_id, staged.size() as i64)
            .await
        {
            Ok(update) => update,
            Err(err) => {
                staged.discard().await;
                return Err(err.into());
            }
        };
        let locator = staged.locator().to_string();

        if let Err(err) = staged.publish().await {
            if let Err(rollback_err) = update.rollback().await {
                warn!(file_id, error = %rollback_err, "rollback after failed blob write failed");
            }
            return Err(LifecycleError::StorageWriteFailed(err));
        }

        match update.commit().await {
            Ok(file) => {
                info!(file_id, size = file.file_size, "replaced file content");
                Ok(file)
            }
            Err(err) => {
                error!(
                    file_id,
                    %locator,
                    error = %err,
                    "blob rewritten but metadata commit failed; size on record is stale"
                );
                Err(err.into())
            }
        }
    }

    /// Delete a file: row first, then blob.
    ///
    /// A blob that cannot be removed stays behind as a logged orphan; the
    /// call still succeeds because no row references it anymore.
    #[instrument(skip(self))]
    pub async fn delete_file(&self, file_id: i64) -> LifecycleResult<()> {
        let locator = self
            .records
            .delete_file_row(file_id)
            .await?
            .ok_or(LifecycleError::FileNotFound(file_id))?;

        match self.blobs.delete(&locator).await {
            Ok(true) => {}
            Ok(false) => warn!(file_id, %locator, "file row deleted but blob was already missing"),
            Err(err) => {
                warn!(file_id, %locator, error = %err, "orphaned blob left for reconciliation")
            }
        }

        info!(file_id, "deleted file");
        Ok(())
    }

    /// Delete a bucket with every file it owns.
    ///
    /// The file locators are collected first, then the bucket row is
    /// deleted; its foreign key cascade drops every file row in the same
    /// statement. Only then are the blobs removed (best effort), and the
    /// bucket directory is swept last to catch blobs of uploads that raced
    /// the enumeration.
    #[instrument(skip(self))]
    pub async fn delete_bucket_cascade(&self, bucket_id: i64) -> LifecycleResult<CascadeReport> {
        if !self.records.bucket_exists(bucket_id).await? {
            return Err(LifecycleError::BucketNotFound(bucket_id));
        }

        let mut locators = Vec::new();
        let mut page = Page::new(Some(0), Some(MAX_PAGE_LIMIT));
        loop {
            let files = self.records.list_files_for_bucket(bucket_id, page).await?;
            let fetched = files.len() as i64;
            locators.extend(files.into_iter().map(|f| f.storage_path));
            if fetched < page.limit {
                break;
            }
            page.skip += fetched;
        }

        if !self.records.delete_bucket(bucket_id).await? {
            return Err(LifecycleError::BucketNotFound(bucket_id));
        }

        let mut report = CascadeReport {
            files: locators.len(),
            ..Default::default()
        };

        let results: Vec<(String, Result<bool, BlobError>)> = stream::iter(locators)
            .map(|locator| async move {
                let result = self.blobs.delete(&locator).await;
                (locator, result)
            })
            .buffer_unordered(CASCADE_CONCURRENCY)
            .collect()
            .await;

        for (locator, result) in results {
            match result {
                Ok(true) => report.blobs_deleted += 1,
                Ok(false) => report.blobs_missing += 1,
                Err(err) => {
                    warn!(bucket_id, %locator, error = %err, "orphaned blob left for reconciliation");
                    report.blobs_orphaned.push(locator);
                }
            }
        }

        if let Err(err) = self.blobs.remove_bucket_namespace(bucket_id).await {
            warn!(bucket_id, error = %err, "failed to remove bucket directory after cascade");
        }

        info!(
            bucket_id,
            files = report.files,
            blobs_deleted = report.blobs_deleted,
            blobs_orphaned = report.blobs_orphaned.len(),
            "deleted bucket"
        );
        Ok(report)
    }

    pub async fn get_file_metadata(&self, file_id: i64) -> LifecycleResult<FileRecord> {
        Ok(self.records.get_file(file_id).await?)
    }

    /// Files of an existing bucket; an unknown bucket is `BucketNotFound`.
    pub async fn list_files_for_bucket(
        &self,
        bucket_id: i64,
        page: Page,
    ) -> LifecycleResult<Vec<FileRecord>> {
        if !self.records.bucket_exists(bucket_id).await? {
            return Err(LifecycleError::BucketNotFound(bucket_id));
        }
        Ok(self.records.list_files_for_bucket(bucket_id, page).await?)
    }

    pub async fn update_description(
        &self,
        file_id: i64,
        description: Option<String>,
    ) -> LifecycleResult<FileRecord> {
        Ok(self
            .records
            .update_file_description(file_id, description)
            .await?)
    }

    /// Metadata plus an open handle on the blob, for streaming downloads.
    #[instrument(skip(self))]
    pub async fn download(&self, file_id: i64) -> LifecycleResult<(FileRecord, File)> {
        let file = self.records.get_file(file_id).await?;
        let handle = self
            .blobs
            .open(&file.storage_path)
            .await
            .map_err(|err| match err {
                BlobError::NotFound(locator) => {
                    error!(file_id, %locator, "file row references a missing blob");
                    LifecycleError::FileNotFound(file_id)
                }
                other => LifecycleError::StorageReadFailed(other),
            })?;
        Ok((file, handle))
    }

    #[cfg(test)]
    async fn read_content(&self, file_id: i64) -> LifecycleResult<bytes::Bytes> {
        let file = self.records.get_file(file_id).await?;
        self.blobs
            .read(&file.storage_path)
            .await
            .map_err(|err| match err {
                BlobError::NotFound(_) => LifecycleError::FileNotFound(file_id),
                other => LifecycleError::StorageReadFailed(other),
            })
    }

    async fn discard_blob(&self, locator: &str) {
        if let Err(err) = self.blobs.delete(locator).await {
            warn!(%locator, error = %err, "orphaned blob left for reconciliation");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::record_store::tests::{new_bucket, test_store};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _records_dir: TempDir,
        _blobs_dir: TempDir,
        lifecycle: FileLifecycle,
    }

    async fn fixture() -> Fixture {
        let (records_dir, records) = test_store().await;
        let blobs_dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(blobs_dir.path()).await.unwrap();
        Fixture {
            _records_dir: records_dir,
            _blobs_dir: blobs_dir,
            lifecycle: FileLifecycle::new(records, blobs),
        }
    }

    async fn count_files(dir: &std::path::Path) -> usize {
        let mut count = 0;
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.file_type().await.unwrap().is_file() {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn release_notes_scenario() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket = lc
            .records()
            .create_bucket(new_bucket("v1.0", "v1-0"))
            .await
            .unwrap();

        let file = lc
            .upload(bucket.id, "notes.pdf", b"abc", Some("release pdf".into()))
            .await
            .unwrap();
        assert_eq!(file.file_type, "application/pdf");
        assert_eq!(file.file_size, 3);
        assert_eq!(file.description.as_deref(), Some("release pdf"));

        let replaced = lc.replace_content(file.id, b"hello").await.unwrap();
        assert_eq!(replaced.file_size, 5);
        assert_eq!(replaced.storage_path, file.storage_path);
        assert!(replaced.updated_at.is_some());
        assert_eq!(lc.read_content(file.id).await.unwrap().as_ref(), b"hello");

        lc.delete_file(file.id).await.unwrap();
        assert!(matches!(
            lc.get_file_metadata(file.id).await,
            Err(LifecycleError::FileNotFound(_))
        ));
        assert!(matches!(
            lc.blobs().read(&file.storage_path).await,
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(
            lc.download(file.id).await,
            Err(LifecycleError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn upload_size_matches_payload() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();

        for len in [0usize, 1, 4096, 2 * 1024 * 1024 + 17] {
            let payload = vec![0xAB; len];
            let file = lc.upload(bucket.id, "data.bin", &payload, None).await.unwrap();
            assert_eq!(file.file_size, len as i64);
        }
    }

    #[tokio::test]
    async fn upload_to_missing_bucket_is_not_found_and_writes_nothing() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;

        let err = lc.upload(404, "a.txt", b"x", None).await.unwrap_err();
        assert!(matches!(err, LifecycleError::BucketNotFound(404)));
        assert_eq!(count_files(&lc.blobs().base_path().join("404")).await, 0);
    }

    #[tokio::test]
    async fn duplicate_names_get_independent_blobs() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();

        let a = lc.upload(bucket.id, "notes.pdf", b"one", None).await.unwrap();
        let b = lc.upload(bucket.id, "notes.pdf", b"two", None).await.unwrap();

        assert_ne!(a.storage_path, b.storage_path);
        assert_eq!(lc.read_content(a.id).await.unwrap().as_ref(), b"one");
        assert_eq!(lc.read_content(b.id).await.unwrap().as_ref(), b"two");
    }

    #[tokio::test]
    async fn replace_of_missing_file_creates_no_blob() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();

        let err = lc.replace_content(12, b"data").await.unwrap_err();
        assert!(matches!(err, LifecycleError::FileNotFound(12)));
        assert_eq!(count_files(&lc.blobs().base_path().join("1")).await, 0);
    }

    #[tokio::test]
    async fn failed_blob_write_leaves_row_unchanged() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();
        let file = lc.upload(bucket.id, "a.txt", b"abc", None).await.unwrap();

        // A non-empty directory at the blob path makes the rename fail.
        let blob_path = lc.blobs().base_path().join(&file.storage_path);
        tokio::fs::remove_file(&blob_path).await.unwrap();
        tokio::fs::create_dir(&blob_path).await.unwrap();
        tokio::fs::write(blob_path.join("occupied"), b"x").await.unwrap();

        let err = lc.replace_content(file.id, b"longer content").await.unwrap_err();
        assert!(matches!(err, LifecycleError::StorageWriteFailed(_)));

        let unchanged = lc.get_file_metadata(file.id).await.unwrap();
        assert_eq!(unchanged.file_size, 3);
        assert_eq!(unchanged.updated_at, file.updated_at);
    }

    #[tokio::test]
    async fn pending_replace_does_not_block_other_writers() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let first = lc.records().create_bucket(new_bucket("a", "a")).await.unwrap();
        let second = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();
        let file = lc.upload(first.id, "big.bin", b"abc", None).await.unwrap();

        let payload = vec![0x5A; 4 * 1024 * 1024];
        let staged = lc.prepare_replace(file.id, &payload).await.unwrap();
        assert_eq!(lc.read_content(file.id).await.unwrap().as_ref(), b"abc");

        let other = tokio::time::timeout(
            Duration::from_secs(2),
            lc.upload(second.id, "other.txt", b"other", None),
        )
        .await
        .expect("upload waited on the pending replace")
        .unwrap();
        tokio::time::timeout(Duration::from_secs(2), lc.delete_file(other.id))
            .await
            .expect("delete waited on the pending replace")
            .unwrap();

        let replaced = lc.publish_replace(file.id, staged).await.unwrap();
        assert_eq!(replaced.file_size, payload.len() as i64);
        assert_eq!(lc.read_content(file.id).await.unwrap().as_ref(), payload.as_slice());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_replace_and_delete_never_resurrect_a_file() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();
        let bucket_dir = lc.blobs().base_path().join(bucket.id.to_string());

        for round in 0..24 {
            let file = lc.upload(bucket.id, "race.txt", b"before", None).await.unwrap();
            let file_id = file.id;

            let replacer = {
                let lc = lc.clone();
                tokio::spawn(async move { lc.replace_content(file_id, b"after").await })
            };
            let deleter = {
                let lc = lc.clone();
                tokio::spawn(async move { lc.delete_file(file_id).await })
            };
            let (replaced, deleted) = tokio::join!(replacer, deleter);
            let replaced = replaced.unwrap();
            deleted.unwrap().unwrap();

            assert!(
                matches!(replaced, Ok(_) | Err(LifecycleError::FileNotFound(_))),
                "round {round}: {replaced:?}"
            );
            assert!(matches!(
                lc.get_file_metadata(file.id).await,
                Err(LifecycleError::FileNotFound(_))
            ));
            assert!(matches!(
                lc.blobs().read(&file.storage_path).await,
                Err(BlobError::NotFound(_))
            ));
        }

        // No published blob and no leftover staged temp file.
        assert_eq!(count_files(&bucket_dir).await, 0);
    }

    #[tokio::test]
    async fn upload_that_loses_its_bucket_leaves_no_directory() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();
        let bucket_dir = lc.blobs().base_path().join(bucket.id.to_string());

        let stored = lc.blobs().put(bucket.id, "late.txt", b"late").await.unwrap();
        assert!(lc.records().delete_bucket(bucket.id).await.unwrap());

        let err = lc
            .record_upload(bucket.id, "late.txt", stored, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::IntegrityViolation(_)));
        assert!(!bucket_dir.exists());
    }

    #[tokio::test]
    async fn delete_file_twice_reports_not_found() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();
        let file = lc.upload(bucket.id, "a.txt", b"abc", None).await.unwrap();

        lc.delete_file(file.id).await.unwrap();
        assert!(matches!(
            lc.delete_file(file.id).await,
            Err(LifecycleError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_file_with_missing_blob_still_removes_row() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();
        let file = lc.upload(bucket.id, "a.txt", b"abc", None).await.unwrap();
        lc.blobs().delete(&file.storage_path).await.unwrap();

        lc.delete_file(file.id).await.unwrap();
        assert!(lc.get_file_metadata(file.id).await.is_err());
    }

    #[tokio::test]
    async fn bucket_cascade_removes_rows_and_blobs() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let keep = lc.records().create_bucket(new_bucket("keep", "keep")).await.unwrap();
        let bucket = lc.records().create_bucket(new_bucket("gone", "gone")).await.unwrap();

        let kept = lc.upload(keep.id, "k.txt", b"keep", None).await.unwrap();
        for i in 0..12 {
            lc.upload(bucket.id, &format!("f{i}.txt"), b"payload", None)
                .await
                .unwrap();
        }
        let bucket_dir = lc.blobs().base_path().join(bucket.id.to_string());
        assert_eq!(count_files(&bucket_dir).await, 12);

        let report = lc.delete_bucket_cascade(bucket.id).await.unwrap();
        assert_eq!(report.files, 12);
        assert_eq!(report.blobs_deleted, 12);
        assert!(report.blobs_orphaned.is_empty());

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE bucket_id = ?")
            .bind(bucket.id)
            .fetch_one(lc.records().pool())
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert!(!bucket_dir.exists());
        assert!(matches!(
            lc.records().get_bucket(bucket.id).await,
            Err(RecordError::BucketNotFound(_))
        ));

        assert_eq!(lc.read_content(kept.id).await.unwrap().as_ref(), b"keep");
        assert!(matches!(
            lc.delete_bucket_cascade(bucket.id).await,
            Err(LifecycleError::BucketNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cascade_sweeps_blobs_without_rows() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap();
        lc.upload(bucket.id, "a.txt", b"abc", None).await.unwrap();
        lc.blobs().put(bucket.id, "stray.txt", b"no row").await.unwrap();

        let report = lc.delete_bucket_cascade(bucket.id).await.unwrap();
        assert_eq!(report.files, 1);
        assert!(!lc.blobs().base_path().join(bucket.id.to_string()).exists());
    }

    #[tokio::test]
    async fn list_files_of_unknown_bucket_is_not_found() {
        let fx = fixture().await;
        assert!(matches!(
            fx.lifecycle.list_files_for_bucket(3, Page::default()).await,
            Err(LifecycleError::BucketNotFound(3))
        ));
    }

    #[tokio::test]
    async fn concurrent_uploads_to_one_bucket_do_not_collide() {
        let fx = fixture().await;
        let lc = &fx.lifecycle;
        let bucket_id = lc.records().create_bucket(new_bucket("b", "b")).await.unwrap().id;

        let uploads = (0..8).map(|i| {
            let payload = vec![i as u8; 64];
            async move { lc.upload(bucket_id, "same.txt", &payload, None).await }
        });
        let files = futures::future::join_all(uploads).await;

        let mut locators: Vec<_> = files
            .into_iter()
            .map(|f| f.unwrap().storage_path)
            .collect();
        locators.sort();
        locators.dedup();
        assert_eq!(locators.len(), 8);
    }
}
