//! Application state shared across handlers.

use crate::services::{
    blob_store::BlobStore, file_lifecycle::FileLifecycle, record_store::RecordStore,
};

/// Cheap to clone: both stores wrap shared handles (pool, root path).
#[derive(Clone)]
pub struct AppState {
    /// Bucket CRUD goes straight to the record store.
    pub records: RecordStore,
    /// Everything that touches file bytes goes through the coordinator.
    pub files: FileLifecycle,
}

impl AppState {
    pub fn new(records: RecordStore, blobs: BlobStore) -> Self {
        Self {
            files: FileLifecycle::new(records.clone(), blobs),
            records,
        }
    }
}
