//! HTTP handlers for file operations.
//! Every call that touches bytes is delegated to `FileLifecycle`; blob
//! locators never leave the server.

use crate::{
    errors::AppError,
    handlers::PageQuery,
    models::file::FileRecord,
    services::record_store::Page,
    state::AppState,
};
use axum::{
    Json,
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

/// Body of `PATCH /api/files/{id}`.
#[derive(Debug, Deserialize)]
pub struct UpdateFileReq {
    pub description: Option<String>,
}

/// POST `/api/buckets/{id}/files`: multipart upload.
///
/// Expects a `file` part carrying a filename and an optional `description`
/// text part.
pub async fn upload_file(
    State(state): State<AppState>,
    Path(bucket_id): Path<i64>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<FileRecord>), AppError> {
    let mut upload: Option<(String, Bytes)> = None;
    let mut description: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::bad_request(format!("invalid multipart body: {}", err)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|name| !name.trim().is_empty())
                    .ok_or_else(|| AppError::bad_request("file part is missing a filename"))?;
                let data = field.bytes().await.map_err(|err| {
                    AppError::bad_request(format!("failed to read file part: {}", err))
                })?;
                upload = Some((file_name, data));
            }
            Some("description") => {
                let text = field.text().await.map_err(|err| {
                    AppError::bad_request(format!("failed to read description: {}", err))
                })?;
                description = Some(text).filter(|t| !t.is_empty());
            }
            other => tracing::debug!("ignoring multipart field {:?}", other),
        }
    }

    let (file_name, data) = upload.ok_or_else(|| AppError::bad_request("missing `file` part"))?;
    let file = state
        .files
        .upload(bucket_id, &file_name, &data, description)
        .await?;
    Ok((StatusCode::CREATED, Json(file)))
}

/// GET `/api/buckets/{id}/files`: list a bucket's files, supports ?skip=&limit=
pub async fn list_files(
    State(state): State<AppState>,
    Path(bucket_id): Path<i64>,
    Query(q): Query<PageQuery>,
) -> Result<Json<Vec<FileRecord>>, AppError> {
    let files = state
        .files
        .list_files_for_bucket(bucket_id, Page::new(q.skip, q.limit))
        .await?;
    Ok(Json(files))
}

/// GET `/api/files/{id}`: metadata only.
pub async fn get_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(state.files.get_file_metadata(file_id).await?))
}

/// PATCH `/api/files/{id}`: update the description.
pub async fn update_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    Json(payload): Json<UpdateFileReq>,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(
        state
            .files
            .update_description(file_id, payload.description)
            .await?,
    ))
}

/// DELETE `/api/files/{id}`
pub async fn delete_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.files.delete_file(file_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET `/api/files/{id}/content`: stream the file back.
pub async fn download_file(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
) -> Result<Response, AppError> {
    let (meta, file) = state.files.download(file_id).await?;
    // Length of the blob actually opened; the row may lag a concurrent replace.
    let length = file
        .metadata()
        .await
        .map(|m| m.len())
        .unwrap_or(meta.file_size.max(0) as u64);
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_file_headers(response.headers_mut(), &meta, length);
    Ok(response)
}

/// PUT `/api/files/{id}/content`: replace the bytes, keep the file.
pub async fn replace_file_content(
    State(state): State<AppState>,
    Path(file_id): Path<i64>,
    body: Bytes,
) -> Result<Json<FileRecord>, AppError> {
    Ok(Json(state.files.replace_content(file_id, &body).await?))
}

fn set_file_headers(headers: &mut HeaderMap, meta: &FileRecord, length: u64) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.file_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    let disposition = format!(
        "attachment; filename=\"{}\"",
        meta.original_name.replace(&['"', '\\', '\r', '\n'][..], "_")
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
}
