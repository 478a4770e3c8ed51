use axum::{
    extract::State,
    Json,
};
use common::types::MethodKey;
use engine::valuation::ValuationAdjustmentResult;
use serde::Deserialize;
use std::sync::Arc;

use crate::api::{as_of_or_today, ApiJson, ApiPath, ApiQuery, ApiResult, AppState};

fn method_key(raw: Option<&str>) -> common::EngineResult<Option<MethodKey>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(MethodKey::parse)
        .transpose()
}

#[derive(Deserialize)]
pub struct EvaluateParams {
    pub as_of: Option<String>,
    pub method_key: Option<String>,
}

pub async fn evaluate(
    State(state): State<Arc<AppState>>,
    ApiPath(symbol): ApiPath<String>,
    ApiQuery(params): ApiQuery<EvaluateParams>,
) -> ApiResult<Json<ValuationAdjustmentResult>> {
    let as_of = as_of_or_today(params.as_of.as_deref())?;
    let method = method_key(params.method_key.as_deref())?;
    let result = state
        .engine
        .compute_valuation_adjustment(symbol, as_of, method)
        .await?;
    Ok(Json(result))
}

#[derive(Deserialize)]
pub struct BatchRequest {
    pub symbols: Vec<String>,
    pub as_of: Option<String>,
    pub method_key: Option<String>,
}

/// Results come back in request order.
pub async fn evaluate_batch(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<BatchRequest>,
) -> ApiResult<Json<Vec<ValuationAdjustmentResult>>> {
    let as_of = as_of_or_today(req.as_of.as_deref())?;
    let method = method_key(req.method_key.as_deref())?;
    let results = state
        .engine
        .compute_valuation_adjustments(req.symbols, as_of, method)
        .await?;
    Ok(Json(results))
}
