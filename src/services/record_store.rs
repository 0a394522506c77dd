//! src/services/record_store.rs
//!
//! RecordStore: bucket and file metadata in SQLite. File rows reference
//! their bucket with `ON DELETE CASCADE`, so removing a bucket row always
//! removes its file rows in the same statement.

use crate::models::{
    bucket::{Bucket, BucketPatch, NewBucket},
    file::{FileRecord, NewFile},
};
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, Transaction, sqlite::Sqlite};
use thiserror::Error;
use tracing::{debug, instrument};

pub const DEFAULT_PAGE_LIMIT: i64 = 100;
pub const MAX_PAGE_LIMIT: i64 = 1000;

const BUCKET_COLUMNS: &str = "id, title, slug, content, version, release_date, is_published, \
                              created_at, updated_at";
const FILE_COLUMNS: &str = "id, bucket_id, original_name, storage_path, file_type, file_size, \
                            description, created_at, updated_at";

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(i64),
    #[error("file `{0}` not found")]
    FileNotFound(i64),
    #[error("slug `{0}` is already taken")]
    SlugTaken(String),
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RecordResult<T> = Result<T, RecordError>;

/// Offset pagination. `limit` is clamped to `1..=MAX_PAGE_LIMIT`.
#[derive(Clone, Copy, Debug)]
pub struct Page {
    pub skip: i64,
    pub limit: i64,
}

impl Page {
    pub fn new(skip: Option<i64>, limit: Option<i64>) -> Self {
        Self {
            skip: skip.unwrap_or(0).max(0),
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// CRUD over bucket and file rows.
#[derive(Clone)]
pub struct RecordStore {
    db: SqlitePool,
}

impl RecordStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Insert a bucket. A duplicate slug is reported, never overwritten.
    #[instrument(skip(self, new), fields(slug = %new.slug))]
    pub async fn create_bucket(&self, new: NewBucket) -> RecordResult<Bucket> {
        let sql = format!(
            "INSERT INTO buckets (title, slug, content, version, release_date, is_published, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING {BUCKET_COLUMNS}"
        );
        sqlx::query_as::<_, Bucket>(&sql)
            .bind(&new.title)
            .bind(&new.slug)
            .bind(&new.content)
            .bind(&new.version)
            .bind(new.release_date)
            .bind(new.is_published)
            .bind(Utc::now())
            .fetch_one(&self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    RecordError::SlugTaken(new.slug.clone())
                } else {
                    RecordError::Sqlx(err)
                }
            })
    }

    #[instrument(skip(self))]
    pub async fn get_bucket(&self, id: i64) -> RecordResult<Bucket> {
        let sql = format!("SELECT {BUCKET_COLUMNS} FROM buckets WHERE id = ?");
        sqlx::query_as::<_, Bucket>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(RecordError::BucketNotFound(id))
    }

    #[instrument(skip(self))]
    pub async fn bucket_exists(&self, id: i64) -> RecordResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM buckets WHERE id = ?)")
            .bind(id)
            .fetch_one(&self.db)
            .await?;
        Ok(exists)
    }

    /// Buckets in primary key order.
    #[instrument(skip(self))]
    pub async fn list_buckets(&self, page: Page) -> RecordResult<Vec<Bucket>> {
        let sql = format!("SELECT {BUCKET_COLUMNS} FROM buckets ORDER BY id ASC LIMIT ? OFFSET ?");
        let rows = sqlx::query_as::<_, Bucket>(&sql)
            .bind(page.limit)
            .bind(page.skip)
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }

    /// Apply only the fields present in `patch`.
    ///
    /// An empty patch returns the current row without touching `updated_at`.
    #[instrument(skip(self, patch))]
    pub async fn update_bucket(&self, id: i64, patch: BucketPatch) -> RecordResult<Bucket> {
        if patch.is_empty() {
            return self.get_bucket(id).await;
        }

        let mut builder = QueryBuilder::<Sqlite>::new("UPDATE buckets SET ");
        let mut set = builder.separated(", ");
        if let Some(title) = &patch.title {
            set.push("title = ").push_bind_unseparated(title);
        }
        if let Some(slug) = &patch.slug {
            set.push("slug = ").push_bind_unseparated(slug);
        }
        if let Some(content) = &patch.content {
            set.push("content = ").push_bind_unseparated(content);
        }
        if let Some(version) = &patch.version {
            set.push("version = ").push_bind_unseparated(version);
        }
        if let Some(release_date) = patch.release_date {
            set.push("release_date = ").push_bind_unseparated(release_date);
        }
        if let Some(is_published) = patch.is_published {
            set.push("is_published = ").push_bind_unseparated(is_published);
        }
        set.push("updated_at = ").push_bind_unseparated(Utc::now());

        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" RETURNING ");
        builder.push(BUCKET_COLUMNS);

        let updated: Option<Bucket> = builder
            .build_query_as()
            .fetch_optional(&self.db)
            .await
            .map_err(|err| match (&patch.slug, is_unique_violation(&err)) {
                (Some(slug), true) => RecordError::SlugTaken(slug.clone()),
                _ => RecordError::Sqlx(err),
            })?;

        updated.ok_or(RecordError::BucketNotFound(id))
    }

    /// Delete a bucket row; its file rows go with it through the foreign key.
    ///
    /// Returns false if no such bucket existed.
    #[instrument(skip(self))]
    pub async fn delete_bucket(&self, id: i64) -> RecordResult<bool> {
        let result = sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(id)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Insert a file row for an already written blob.
    ///
    /// A missing owner bucket surfaces as `IntegrityViolation`.
    #[instrument(skip(self, new), fields(bucket_id = new.bucket_id, locator = %new.storage_path))]
    pub async fn create_file(&self, new: NewFile) -> RecordResult<FileRecord> {
        let sql = format!(
            "INSERT INTO files (bucket_id, original_name, storage_path, file_type, file_size, description, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING {FILE_COLUMNS}"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(new.bucket_id)
            .bind(&new.original_name)
            .bind(&new.storage_path)
            .bind(&new.file_type)
            .bind(new.file_size)
            .bind(&new.description)
            .bind(Utc::now())
            .fetch_one(&self.db)
            .await
            .map_err(|err| {
                if is_foreign_key_violation(&err) {
                    RecordError::IntegrityViolation(format!(
                        "bucket `{}` does not exist",
                        new.bucket_id
                    ))
                } else {
                    RecordError::Sqlx(err)
                }
            })
    }

    #[instrument(skip(self))]
    pub async fn get_file(&self, id: i64) -> RecordResult<FileRecord> {
        let sql = format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?");
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(RecordError::FileNotFound(id))
    }

    /// Files of one bucket in primary key order.
    #[instrument(skip(self))]
    pub async fn list_files_for_bucket(
        &self,
        bucket_id: i64,
        page: Page,
    ) -> RecordResult<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {FILE_COLUMNS} FROM files WHERE bucket_id = ? ORDER BY id ASC LIMIT ? OFFSET ?"
        );
        let rows = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(bucket_id)
            .bind(page.limit)
            .bind(page.skip)
            .fetch_all(&self.db)
            .await?;
        Ok(rows)
    }

    #[instrument(skip(self, description))]
    pub async fn update_file_description(
        &self,
        id: i64,
        description: Option<String>,
    ) -> RecordResult<FileRecord> {
        let sql = format!(
            "UPDATE files SET description = ?, updated_at = ? WHERE id = ? RETURNING {FILE_COLUMNS}"
        );
        sqlx::query_as::<_, FileRecord>(&sql)
            .bind(description)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&self.db)
            .await?
            .ok_or(RecordError::FileNotFound(id))
    }

    /// Start a content update for a file.
    ///
    /// The row is updated inside an open transaction, which holds the SQLite
    /// write lock until the returned unit of work is committed or rolled
    /// back. Deletes of the same row wait for it, so a replace racing a
    /// delete ends either as "replaced then deleted" or as `FileNotFound`.
    #[instrument(skip(self))]
    pub async fn stage_content_update(
        &self,
        id: i64,
        new_size: i64,
    ) -> RecordResult<FileContentUpdate> {
        let mut tx = self.db.begin().await?;
        let sql = format!(
            "UPDATE files SET file_size = ?, updated_at = ? WHERE id = ? RETURNING {FILE_COLUMNS}"
        );
        let file = sqlx::query_as::<_, FileRecord>(&sql)
            .bind(new_size)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(RecordError::FileNotFound(id))?;

        Ok(FileContentUpdate { tx, file })
    }

    /// Delete a file row and hand back the locator it owned.
    ///
    /// `None` means the row did not exist.
    #[instrument(skip(self))]
    pub async fn delete_file_row(&self, id: i64) -> RecordResult<Option<String>> {
        let mut tx = self.db.begin().await?;
        let locator: Option<String> =
            sqlx::query_scalar("DELETE FROM files WHERE id = ? RETURNING storage_path")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        tx.commit().await?;

        if let Some(locator) = &locator {
            debug!(%locator, "deleted file row");
        }
        Ok(locator)
    }
}

/// Pending metadata change for a file whose content is being replaced.
///
/// Dropping it without `commit` rolls the row back.
pub struct FileContentUpdate {
    tx: Transaction<'static, Sqlite>,
    file: FileRecord,
}

impl FileContentUpdate {
    /// The row as it will look once committed.
    pub fn file(&self) -> &FileRecord {
        &self.file
    }

    pub async fn commit(self) -> RecordResult<FileRecord> {
        self.tx.commit().await?;
        Ok(self.file)
    }

    pub async fn rollback(self) -> RecordResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Return true if SQLx error indicates a foreign key constraint violation.
fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("foreign key")
    )
}
