use axum::{
    extract::State,
    Json,
};
use engine::materialize::{MaterializationPreview, MaterializedTarget};
use engine::scope::{ScopeRule, ScopeRuleSpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::{ApiJson, ApiPath, ApiQuery, ApiResult, AppState};

pub async fn list_scope_rules(
    State(state): State<Arc<AppState>>,
    ApiPath(insight_id): ApiPath<i64>,
) -> ApiResult<Json<Vec<ScopeRule>>> {
    Ok(Json(state.engine.list_scope_rules(insight_id).await?))
}

#[derive(Deserialize)]
pub struct ScopeRuleRequest {
    pub scope_type: String,
    pub scope_key: String,
    pub mode: Option<String>,
    pub enabled: Option<bool>,
}

/// Mode defaults to `include`, `enabled` to true.
pub async fn upsert_scope_rule(
    State(state): State<Arc<AppState>>,
    ApiPath(insight_id): ApiPath<i64>,
    ApiJson(req): ApiJson<ScopeRuleRequest>,
) -> ApiResult<Json<ScopeRule>> {
    let spec = ScopeRuleSpec {
        scope_type: req.scope_type.parse()?,
        scope_key: req.scope_key,
        mode: req.mode.as_deref().unwrap_or("include").parse()?,
        enabled: req.enabled.unwrap_or(true),
    };
    Ok(Json(state.engine.upsert_scope_rule(insight_id, spec).await?))
}

pub async fn remove_scope_rule(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<ScopeRule>> {
    Ok(Json(state.engine.remove_scope_rule(id).await?))
}

#[derive(Deserialize)]
pub struct MaterializeParams {
    pub limit: Option<usize>,
    #[serde(default)]
    pub persist: bool,
}

pub async fn materialize(
    State(state): State<Arc<AppState>>,
    ApiPath(insight_id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<MaterializeParams>,
) -> ApiResult<Json<MaterializationPreview>> {
    let preview = state
        .engine
        .preview_materialized_targets(insight_id, params.limit, params.persist)
        .await?;
    Ok(Json(preview))
}

#[derive(Deserialize)]
pub struct TargetParams {
    #[serde(default)]
    pub include_excluded: bool,
}

pub async fn list_targets(
    State(state): State<Arc<AppState>>,
    ApiPath(insight_id): ApiPath<i64>,
    ApiQuery(params): ApiQuery<TargetParams>,
) -> ApiResult<Json<Vec<MaterializedTarget>>> {
    let targets = state
        .engine
        .list_targets(insight_id, params.include_excluded)
        .await?;
    Ok(Json(targets))
}

#[derive(Deserialize)]
pub struct ExclusionRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// The body is optional; a request without one records no reason.
pub async fn exclude_target(
    State(state): State<Arc<AppState>>,
    ApiPath((insight_id, symbol)): ApiPath<(i64, String)>,
    req: Option<ApiJson<ExclusionRequest>>,
) -> ApiResult<Json<MaterializedTarget>> {
    let reason = req.and_then(|ApiJson(req)| req.reason);
    let target = state
        .engine
        .exclude_target(insight_id, symbol, reason)
        .await?;
    Ok(Json(target))
}

#[derive(Serialize)]
pub struct ClearExclusionResponse {
    pub message: String,
    /// Present when the symbol is still in scope and stays an active target.
    pub target: Option<MaterializedTarget>,
}

pub async fn clear_target_exclusion(
    State(state): State<Arc<AppState>>,
    ApiPath((insight_id, symbol)): ApiPath<(i64, String)>,
) -> ApiResult<Json<ClearExclusionResponse>> {
    let target = state
        .engine
        .clear_target_exclusion(insight_id, symbol)
        .await?;
    let message = match &target {
        Some(t) => format!("exclusion cleared; {} is an active target", t.symbol),
        None => "exclusion cleared; symbol is no longer in scope".to_string(),
    };
    Ok(Json(ClearExclusionResponse { message, target }))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{send, test_app};
    use axum::http::StatusCode;
    use serde_json::json;

    async fn insight_with_domain_scope(app: &axum::Router) -> i64 {
        let (_, created) = send(
            app,
            "POST",
            "/api/insights",
            Some(json!({"title": "Semis cycle", "status": "active"})),
        )
        .await;
        let id = created["id"].as_i64().unwrap();
        let (status, rule) = send(
            app,
            "POST",
            &format!("/api/insights/{id}/scope-rules"),
            Some(json!({"scope_type": "domain", "scope_key": "semis"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rule["mode"], "include");
        id
    }

    #[tokio::test]
    async fn test_preview_does_not_persist() {
        let app = test_app().await;
        let id = insight_with_domain_scope(&app).await;

        let (status, preview) =
            send(&app, "POST", &format!("/api/insights/{id}/materialize?limit=1"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(preview["total"], 2);
        assert_eq!(preview["truncated"], true);
        assert_eq!(preview["symbols"], json!(["AAA"]));
        assert_eq!(preview["persisted"], false);

        let (_, targets) = send(&app, "GET", &format!("/api/insights/{id}/targets"), None).await;
        assert_eq!(targets, json!([]));
    }

    #[tokio::test]
    async fn test_exclude_and_clear_target() {
        let app = test_app().await;
        let id = insight_with_domain_scope(&app).await;
        send(&app, "POST", &format!("/api/insights/{id}/materialize?persist=true"), None).await;

        let (status, excluded) = send(
            &app,
            "PUT",
            &format!("/api/insights/{id}/targets/bbb/exclusion"),
            Some(json!({"reason": "guidance withdrawn"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(excluded["symbol"], "BBB");
        assert_eq!(excluded["excluded"], true);

        let (_, active) = send(&app, "GET", &format!("/api/insights/{id}/targets"), None).await;
        assert_eq!(active.as_array().unwrap().len(), 1);
        let (_, all) = send(
            &app,
            "GET",
            &format!("/api/insights/{id}/targets?include_excluded=true"),
            None,
        )
        .await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let (status, cleared) = send(
            &app,
            "DELETE",
            &format!("/api/insights/{id}/targets/BBB/exclusion"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(cleared["target"]["excluded"], false);

        let (status, _) = send(
            &app,
            "DELETE",
            &format!("/api/insights/{id}/targets/BBB/exclusion"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_exclusion_without_body_records_no_reason() {
        let app = test_app().await;
        let id = insight_with_domain_scope(&app).await;
        send(&app, "POST", &format!("/api/insights/{id}/materialize?persist=true"), None).await;

        let (status, excluded) = send(
            &app,
            "PUT",
            &format!("/api/insights/{id}/targets/aaa/exclusion"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(excluded["symbol"], "AAA");
        assert_eq!(excluded["excluded"], true);
        assert_eq!(excluded["exclude_reason"], serde_json::Value::Null);

        let (_, all) = send(
            &app,
            "GET",
            &format!("/api/insights/{id}/targets?include_excluded=true"),
            None,
        )
        .await;
        assert_eq!(all.as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_scope_type_rejected() {
        let app = test_app().await;
        let id = insight_with_domain_scope(&app).await;
        let (status, _) = send(
            &app,
            "POST",
            &format!("/api/insights/{id}/scope-rules"),
            Some(json!({"scope_type": "galaxy", "scope_key": "x"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, "DELETE", "/api/scope-rules/9999", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
