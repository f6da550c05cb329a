use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
};
use chrono::{DateTime, Utc};
use folio_common::{FolioError, PageRecord};
use serde::Serialize;

use crate::{handlers::ApiError, state::AppState};

#[derive(Debug, Serialize)]
pub struct PageView {
    pub page_number: u32,
    pub content: String,
    pub success: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<PageRecord> for PageView {
    fn from(page: PageRecord) -> Self {
        Self {
            page_number: page.page_number,
            content: page.content,
            success: page.success,
            updated_at: page.updated_at,
        }
    }
}

/// Stored page results in page order. A document that was never processed
/// is reported as not found.
pub async fn list_pages(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<Vec<PageView>>, ApiError> {
    let pages = state.store.pages(&document_id).await?;
    if pages.is_empty() && state.store.document_status(&document_id).await?.is_none() {
        return Err(ApiError(FolioError::DocumentNotFound(document_id)));
    }
    Ok(Json(pages.into_iter().map(PageView::from).collect()))
}
