use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use common::types::{parse_date, InsightStatus};
use engine::insights::{Insight, InsightPatch, InsightQuery, NewInsight};
use engine::Page;
use serde::Deserialize;
use std::sync::Arc;

use crate::api::{double_option, ApiJson, ApiPath, ApiQuery, ApiResult, AppState};

#[derive(Deserialize)]
pub struct ListParams {
    pub q: Option<String>,
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_insights(
    State(state): State<Arc<AppState>>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<Json<Page<Insight>>> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<InsightStatus>)
        .transpose()?;
    let page = state
        .engine
        .list_insights(InsightQuery {
            query: params.q,
            status,
            limit: params.limit.unwrap_or(50),
            offset: params.offset.unwrap_or(0),
        })
        .await?;
    Ok(Json(page))
}

#[derive(Deserialize)]
pub struct CreateInsightRequest {
    pub title: String,
    pub thesis: Option<String>,
    pub status: Option<String>,
    pub valid_from: Option<String>,
    pub valid_to: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub async fn create_insight(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateInsightRequest>,
) -> ApiResult<(StatusCode, Json<Insight>)> {
    let new = NewInsight {
        title: req.title,
        thesis: req.thesis,
        status: req.status.as_deref().map(str::parse).transpose()?,
        valid_from: req
            .valid_from
            .as_deref()
            .map(|raw| parse_date("valid_from", raw))
            .transpose()?,
        valid_to: req
            .valid_to
            .as_deref()
            .map(|raw| parse_date("valid_to", raw))
            .transpose()?,
        tags: req.tags,
    };
    let insight = state.engine.create_insight(new).await?;
    Ok((StatusCode::CREATED, Json(insight)))
}

pub async fn get_insight(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<Insight>> {
    Ok(Json(state.engine.get_insight(id).await?))
}

/// Absent fields are left alone; `null` clears the optional ones.
#[derive(Deserialize)]
pub struct UpdateInsightRequest {
    pub title: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub thesis: Option<Option<String>>,
    pub status: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub valid_from: Option<Option<String>>,
    #[serde(default, deserialize_with = "double_option")]
    pub valid_to: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
}

fn patch_date(
    field: &str,
    raw: Option<Option<String>>,
) -> common::EngineResult<Option<Option<chrono::NaiveDate>>> {
    match raw {
        None => Ok(None),
        Some(None) => Ok(Some(None)),
        Some(Some(raw)) => parse_date(field, &raw).map(|d| Some(Some(d))),
    }
}

pub async fn update_insight(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
    ApiJson(req): ApiJson<UpdateInsightRequest>,
) -> ApiResult<Json<Insight>> {
    let patch = InsightPatch {
        title: req.title,
        thesis: req.thesis,
        status: req.status.as_deref().map(str::parse).transpose()?,
        valid_from: patch_date("valid_from", req.valid_from)?,
        valid_to: patch_date("valid_to", req.valid_to)?,
        tags: req.tags,
    };
    Ok(Json(state.engine.update_insight(id, patch).await?))
}

pub async fn remove_insight(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<Insight>> {
    Ok(Json(state.engine.remove_insight(id).await?))
}
