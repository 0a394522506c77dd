//! Core data models for the release notes store.
//!
//! Buckets and files map to database tables via `sqlx::FromRow` and
//! serialize as JSON via `serde`. Blob locators stay internal.

pub mod bucket;
pub mod file;
