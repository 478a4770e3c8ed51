use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use engine::facts::Fact;
use engine::Page;
use serde::Deserialize;
use std::sync::Arc;

use crate::api::{ApiJson, ApiPath, ApiQuery, ApiResult, AppState};

#[derive(Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list_facts(
    State(state): State<Arc<AppState>>,
    ApiQuery(params): ApiQuery<ListParams>,
) -> ApiResult<Json<Page<Fact>>> {
    let page = state
        .engine
        .list_facts(params.limit.unwrap_or(50), params.offset.unwrap_or(0))
        .await?;
    Ok(Json(page))
}

#[derive(Deserialize)]
pub struct CreateFactRequest {
    pub body: String,
}

pub async fn create_fact(
    State(state): State<Arc<AppState>>,
    ApiJson(req): ApiJson<CreateFactRequest>,
) -> ApiResult<(StatusCode, Json<Fact>)> {
    let fact = state.engine.create_fact(req.body).await?;
    Ok((StatusCode::CREATED, Json(fact)))
}

pub async fn remove_fact(
    State(state): State<Arc<AppState>>,
    ApiPath(id): ApiPath<i64>,
) -> ApiResult<Json<Fact>> {
    Ok(Json(state.engine.remove_fact(id).await?))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{send, test_app};
    use axum::http::StatusCode;
    use serde_json::json;

    #[tokio::test]
    async fn test_fact_endpoints() {
        let app = test_app().await;
        let (status, fact) = send(
            &app,
            "POST",
            "/api/facts",
            Some(json!({"body": "TSMC capex guide raised"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = fact["id"].as_i64().unwrap();

        let (status, blank) = send(&app, "POST", "/api/facts", Some(json!({"body": " "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(blank["message"].is_string());

        let (_, page) = send(&app, "GET", "/api/facts", None).await;
        assert_eq!(page["total"], 1);

        let (status, _) = send(&app, "DELETE", &format!("/api/facts/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, "DELETE", &format!("/api/facts/{id}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
