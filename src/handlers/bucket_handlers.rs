//! HTTP handlers for bucket CRUD. Deleting a bucket goes through the
//! lifecycle coordinator so its files and blobs go with it.

use crate::{
    errors::AppError,
    handlers::PageQuery,
    models::bucket::{Bucket, BucketPatch, NewBucket},
    services::{file_lifecycle::CascadeReport, record_store::Page},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

/// POST `/api/buckets`: create bucket.
pub async fn create_bucket(
    State(state): State<AppState>,
    Json(payload): Json<NewBucket>,
) -> Result<(StatusCode, Json<Bucket>), AppError> {
    if payload.title.trim().is_empty() {
        return Err(AppError::bad_request("title must not be empty"));
    }
    if payload.slug.trim().is_empty() {
        return Err(AppError::bad_request("slug must not be empty"));
    }

    let bucket = state.records.create_bucket(payload).await?;
    tracing::info!(bucket_id = bucket.id, slug = %bucket.slug, "created bucket");
    Ok((StatusCode::CREATED, Json(bucket)))
}

/// GET `/api/buckets`: list buckets, supports ?skip=&limit=
pub async fn list_buckets(
    State(state): State<AppState>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Vec<Bucket>>, AppError> {
    let buckets = state
        .records
        .list_buckets(Page::new(q.skip, q.limit))
        .await?;
    Ok(Json(buckets))
}

/// GET `/api/buckets/{id}`
pub async fn get_bucket(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Bucket>, AppError> {
    Ok(Json(state.records.get_bucket(id).await?))
}

/// PATCH `/api/buckets/{id}`: partial update; absent fields stay as they are.
pub async fn update_bucket(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(patch): Json<BucketPatch>,
) -> Result<Json<Bucket>, AppError> {
    if matches!(&patch.slug, Some(slug) if slug.trim().is_empty()) {
        return Err(AppError::bad_request("slug must not be empty"));
    }
    Ok(Json(state.records.update_bucket(id, patch).await?))
}

/// DELETE `/api/buckets/{id}`: delete bucket with all its files.
pub async fn delete_bucket(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<CascadeReport>, AppError> {
    Ok(Json(state.files.delete_bucket_cascade(id).await?))
}
