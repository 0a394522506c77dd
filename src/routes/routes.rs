//! Route table for the release notes API.
//!
//! ## Structure
//! - **Bucket endpoints**
//!   - `POST   /api/buckets` : create bucket
//!   - `GET    /api/buckets` : list buckets (`skip`, `limit`)
//!   - `GET    /api/buckets/{id}` : fetch bucket
//!   - `PATCH  /api/buckets/{id}` : partial update
//!   - `DELETE /api/buckets/{id}` : delete bucket, its files and their blobs
//!
//! - **File endpoints**
//!   - `POST   /api/buckets/{id}/files` : multipart upload
//!   - `GET    /api/buckets/{id}/files` : list files of a bucket
//!   - `GET    /api/files/{id}` : metadata
//!   - `PATCH  /api/files/{id}` : update description
//!   - `DELETE /api/files/{id}` : delete file
//!   - `GET    /api/files/{id}/content` : download
//!   - `PUT    /api/files/{id}/content` : replace content

use crate::{
    handlers::{
        bucket_handlers::{create_bucket, delete_bucket, get_bucket, list_buckets, update_bucket},
        file_handlers::{
            delete_file, download_file, get_file, list_files, replace_file_content, update_file,
            upload_file,
        },
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router carrying `AppState` to every handler.
///
/// `max_body_bytes` caps uploads and content replacements.
pub fn routes(max_body_bytes: usize) -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Bucket routes
        .route("/api/buckets", post(create_bucket).get(list_buckets))
        .route(
            "/api/buckets/{id}",
            get(get_bucket).patch(update_bucket).delete(delete_bucket),
        )
        // File routes
        .route("/api/buckets/{id}/files", post(upload_file).get(list_files))
        .route(
            "/api/files/{id}",
            get(get_file).patch(update_file).delete(delete_file),
        )
        .route(
            "/api/files/{id}/content",
            get(download_file).put(replace_file_content),
        )
        .layer(DefaultBodyLimit::max(max_body_bytes))
}
