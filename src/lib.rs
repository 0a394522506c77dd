//! Release notes storage backend.
//!
//! Buckets (release notes) and their file metadata live in SQLite; file
//! bytes live on local disk, one directory per bucket. `FileLifecycle` is
//! the only component that mutates both, keeping rows and blobs in step.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
