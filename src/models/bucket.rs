//! Represents a bucket: one release note and the files attached to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

/// A release-notes bucket.
///
/// Buckets own their files: deleting a bucket removes every file row and
/// every blob that belongs to it.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Bucket {
    /// Integer primary key; listing order follows it.
    pub id: i64,

    /// Human readable title (e.g. "v1.0").
    pub title: String,

    /// Globally unique URL slug (e.g. "v1-0").
    pub slug: String,

    /// Free-text release notes body.
    pub content: Option<String>,

    /// Version label of the release.
    pub version: Option<String>,

    /// When the release went (or goes) out.
    pub release_date: Option<DateTime<Utc>>,

    pub is_published: bool,

    pub created_at: DateTime<Utc>,

    /// Unset until the first update.
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fields accepted when creating a bucket.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct NewBucket {
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub release_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_published: bool,
}

/// Partial update for a bucket.
///
/// `None` means "leave untouched". For nullable columns `Some(None)` clears
/// the value, so an explicit JSON `null` is not confused with an absent key.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct BucketPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default, deserialize_with = "nullable")]
    pub content: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub version: Option<Option<String>>,
    #[serde(default, deserialize_with = "nullable")]
    pub release_date: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub is_published: Option<bool>,
}

impl BucketPatch {
    /// True when the patch carries no field at all.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.slug.is_none()
            && self.content.is_none()
            && self.version.is_none()
            && self.release_date.is_none()
            && self.is_published.is_none()
    }
}

/// Present key (null or value) becomes `Some(..)`; a missing key falls back
/// to `#[serde(default)]`.
fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_distinguishes_null_from_absent() {
        let patch: BucketPatch =
            serde_json::from_str(r#"{"title": "v1.1", "content": null}"#).unwrap();

        assert_eq!(patch.title.as_deref(), Some("v1.1"));
        assert_eq!(patch.content, Some(None));
        assert_eq!(patch.version, None);
        assert_eq!(patch.is_published, None);
        assert!(!patch.is_empty());
    }

    #[test]
    fn empty_patch_is_empty() {
        let patch: BucketPatch = serde_json::from_str("{}").unwrap();
        assert!(patch.is_empty());
    }

    #[test]
    fn new_bucket_defaults_to_unpublished() {
        let bucket: NewBucket =
            serde_json::from_str(r#"{"title": "v1.0", "slug": "v1-0"}"#).unwrap();
        assert!(!bucket.is_published);
        assert!(bucket.content.is_none());
    }
}
