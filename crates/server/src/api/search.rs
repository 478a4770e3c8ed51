use axum::{
    extract::State,
    Json,
};
use engine::search::SearchHit;
use engine::Page;
use serde::Deserialize;
use std::sync::Arc;

use crate::api::{ApiQuery, ApiResult, AppState};

#[derive(Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    ApiQuery(params): ApiQuery<SearchParams>,
) -> ApiResult<Json<Page<SearchHit>>> {
    let page = state
        .engine
        .search(params.q, params.limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(page))
}
