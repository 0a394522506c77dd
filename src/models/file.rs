//! Represents a file uploaded into a bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Metadata for one uploaded blob.
///
/// The row stores metadata only; the bytes live in the blob store under
/// `storage_path`, which is never exposed to API callers.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileRecord {
    pub id: i64,

    /// Owning bucket.
    pub bucket_id: i64,

    /// Name supplied by the uploader. Never used to build a filesystem path.
    pub original_name: String,

    /// Blob locator (`<bucket_id>/<token><ext>`).
    #[serde(skip_serializing, default)]
    pub storage_path: String,

    /// Content type inferred at upload time.
    pub file_type: String,

    /// Size in bytes of the current content.
    pub file_size: i64,

    pub description: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Bumped whenever the content or description changes.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Row data for a freshly written blob.
#[derive(Clone, Debug)]
pub struct NewFile {
    pub bucket_id: i64,
    pub original_name: String,
    pub storage_path: String,
    pub file_type: String,
    pub file_size: i64,
    pub description: Option<String>,
}
