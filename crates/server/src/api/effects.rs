use axum::{
    extract::State,
    Json,
};
use common::types::{parse_date, MethodKey, MetricKey};
use engine::timeline::{ChannelSpec, EffectChannel, EffectPoint};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{ApiJson, ApiPath, ApiQuery, ApiResult, AppState};

pub async fn list_channels(
    State(state): State<Arc<AppState>>,
    ApiPath(insight_id): ApiPath<i64>,
) -> ApiResult<Json<Vec<EffectChannel>>> {
    Ok(Json(state.engine.list_effect_channels(insight_id).await?))
}

#[derive(Deserialize)]
pub struct ChannelRequest {
    pub method_key: Option<String>,
    pub metric_key: String,
    pub stage: String,
    pub operator: String,
    #[serde(default)]
    pub priority: i64,
}

/// A missing `method_key` targets every valuation method.
pub async fn upsert_channel(
    State(state): State<Arc<AppState>>,
    ApiPath(insight_id): ApiPath<i64>,
    ApiJson(req): ApiJson<ChannelRequest>,
) -> ApiResult<Json<EffectChannel>> {
    let spec = ChannelSpec {
        method_key: match req.method_key.as_deref() {
            Some(raw) => MethodKey::parse(raw)?,
            None => MethodKey::wildcard(),
        },
        metric_key: MetricKey::parse(&req.metric_key)?,
        stage: req.stage.parse()?,
        operator: req.operator.parse()?,
        priority: req.priority,
    };
    Ok(Json(state.engine.upsert_effect_channel(insight_id, spec).await?))
}

pub async fn remove_channel(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<EffectChannel>> {
    Ok(Json(state.engine.remove_effect_channel(id).await?))
}

pub async fn list_points(
    State(state): State<Arc<AppState>>,
    ApiPath(channel_id): ApiPath<i64>,
) -> ApiResult<Json<Vec<EffectPoint>>> {
    Ok(Json(state.engine.list_effect_points(channel_id).await?))
}

#[derive(Deserialize)]
pub struct PointRequest {
    pub effect_date: String,
    pub effect_value: f64,
}

pub async fn upsert_point(
    State(state): State<Arc<AppState>>,
    ApiPath(channel_id): ApiPath<i64>,
    ApiJson(req): ApiJson<PointRequest>,
) -> ApiResult<Json<EffectPoint>> {
    let date = parse_date("effect_date", &req.effect_date)?;
    let point = state
        .engine
        .upsert_effect_point(channel_id, date, req.effect_value)
        .await?;
    Ok(Json(point))
}

pub async fn remove_point(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<EffectPoint>> {
    Ok(Json(state.engine.remove_effect_point(id).await?))
}

#[derive(Deserialize)]
pub struct InterpolateParams {
    pub date: Option<String>,
}

#[derive(Serialize)]
pub struct InterpolateResponse {
    pub channel_id: i64,
    pub date: chrono::NaiveDate,
    /// `None` when the date falls outside the channel's points or it has none.
    pub value: Option<f64>,
}

pub async fn interpolate(
    State(state): State<Arc<AppState>>,
    ApiPath(channel_id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<InterpolateParams>,
) -> ApiResult<Json<InterpolateResponse>> {
    let date = match params.date.as_deref() {
        Some(raw) => parse_date("date", raw)?,
        None => chrono::Utc::now().date_naive(),
    };
    let value = state.engine.interpolate(channel_id, date).await?;
    Ok(Json(InterpolateResponse {
        channel_id,
        date,
        value,
    }))
}
