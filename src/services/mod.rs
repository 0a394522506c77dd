//! Storage core: blob store, record store and the lifecycle coordinator
//! sequencing them.

pub mod blob_store;
pub mod file_lifecycle;
pub mod record_store;
