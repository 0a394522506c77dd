pub mod bucket_handlers;
pub mod file_handlers;
pub mod health_handlers;

use serde::Deserialize;

/// `?skip=&limit=` query accepted by list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
}
