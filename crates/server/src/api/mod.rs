pub mod effects;
pub mod facts;
pub mod insights;
pub mod scope;
pub mod search;
pub mod valuations;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        FromRequest, FromRequestParts, OptionalFromRequest, Path, Query, Request, State,
    },
    http::{request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use common::EngineError;
use engine::InsightEngine;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state available to all handlers.
pub struct AppState {
    pub engine: InsightEngine,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub api_key: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    // Health endpoint is always public (no auth)
    let public = Router::new().route("/api/health", get(health));

    // Protected routes require bearer token (if api_key is configured)
    let protected = Router::new()
        // Insights
        .route(
            "/api/insights",
            get(insights::list_insights).post(insights::create_insight),
        )
        .route(
            "/api/insights/{id}",
            get(insights::get_insight)
                .patch(insights::update_insight)
                .delete(insights::remove_insight),
        )
        // Scope and materialization
        .route(
            "/api/insights/{id}/scope-rules",
            get(scope::list_scope_rules).post(scope::upsert_scope_rule),
        )
        .route("/api/scope-rules/{id}", delete(scope::remove_scope_rule))
        .route("/api/insights/{id}/materialize", post(scope::materialize))
        .route("/api/insights/{id}/targets", get(scope::list_targets))
        .route(
            "/api/insights/{id}/targets/{symbol}/exclusion",
            put(scope::exclude_target).delete(scope::clear_target_exclusion),
        )
        // Effects
        .route(
            "/api/insights/{id}/channels",
            get(effects::list_channels).post(effects::upsert_channel),
        )
        .route("/api/channels/{id}", delete(effects::remove_channel))
        .route(
            "/api/channels/{id}/points",
            get(effects::list_points).post(effects::upsert_point),
        )
        .route("/api/channels/{id}/interpolate", get(effects::interpolate))
        .route("/api/points/{id}", delete(effects::remove_point))
        // Evaluation
        .route("/api/valuations", post(valuations::evaluate_batch))
        .route("/api/valuations/{symbol}", get(valuations::evaluate))
        // Search and notes
        .route("/api/search", get(search::search))
        .route("/api/facts", get(facts::list_facts).post(facts::create_fact))
        .route("/api/facts/{id}", delete(facts::remove_fact))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    public
        .merge(protected)
        .layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let started = std::time::Instant::now();
    let response = next.run(req).await;
    crate::metrics::record_request(
        method.as_str(),
        response.status().as_u16(),
        started.elapsed().as_secs_f64() * 1000.0,
    );
    response
}

/// Bearer token auth middleware. Skipped when no api_key is configured.
async fn auth_middleware(State(state): State<Arc<AppState>>, req: Request, next: Next) -> Response {
    let Some(api_key) = &state.api_key else {
        return next.run(req).await; // No key configured = dev mode
    };

    let token = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "));

    match token {
        Some(token) if constant_time_eq(token.as_bytes(), api_key.as_bytes()) => {
            next.run(req).await
        }
        _ => StatusCode::UNAUTHORIZED.into_response(),
    }
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let uptime = chrono::Utc::now()
        .signed_duration_since(state.started_at)
        .num_seconds();

    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: uptime,
    })
}

#[derive(Serialize)]
pub(crate) struct MessageResponse {
    pub message: String,
}

/// Error body `{"message": ...}` with a status picked from the engine error kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Extractor rejections are client errors unless axum itself failed.
    fn rejected(status: StatusCode, message: String) -> Self {
        let status = if status.is_server_error() {
            status
        } else {
            StatusCode::BAD_REQUEST
        };
        Self { status, message }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = if err.is_validation() {
            StatusCode::BAD_REQUEST
        } else if err.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            tracing::error!(error = %err, "engine infrastructure error");
            return Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "internal storage error".to_string(),
            };
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<EngineError>() {
            Ok(engine_err) => engine_err.into(),
            Err(other) => {
                tracing::error!(error = %format!("{other:#}"), "request failed");
                Self {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    message: "internal error".to_string(),
                }
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(MessageResponse {
                message: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::rejected(rejection.status(), rejection.body_text())
    }
}

/// `Json` body whose rejections answer 400 `{"message"}` like every other error.
/// As `Option<ApiJson<T>>` a request without a content type yields `None`.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = <Json<T> as FromRequest<S>>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

impl<S, T> OptionalFromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Option<Self>, Self::Rejection> {
        let value = <Json<T> as OptionalFromRequest<S>>::from_request(req, state).await?;
        Ok(value.map(|Json(value)| Self(value)))
    }
}

pub struct ApiQuery<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

pub struct ApiPath<T>(pub T);

impl<S, T> FromRequestParts<S> for ApiPath<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Send,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(value) = Path::<T>::from_request_parts(parts, state).await?;
        Ok(Self(value))
    }
}

/// `as_of` query/body value, defaulting to today (UTC).
pub(crate) fn as_of_or_today(raw: Option<&str>) -> Result<chrono::NaiveDate, EngineError> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => common::types::parse_date("as_of", raw),
        None => Ok(chrono::Utc::now().date_naive()),
    }
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`).
pub(crate) fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
