use crate::authority::Caller;
use crate::error::{AppError, AppResult};
use crate::web::websocket::{ws_handler, AppState};
use axum::{
    extract::{Path, Request, State},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use walletbridge_types::{PendingRequest, RpcEnvelope, RpcErrorKind, RpcResult};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub authority: bool,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        authority: !state.authority.is_closed(),
    })
}

/// Approval decision body
#[derive(Debug, Deserialize)]
pub struct Decision {
    pub approved: bool,
}

/// Raw RPC with wallet-UI rights
pub async fn rpc(
    State(state): State<AppState>,
    Json(envelope): Json<RpcEnvelope>,
) -> AppResult<Json<RpcResult>> {
    let result = state.authority.call(Caller::Extension, envelope).await?;
    Ok(Json(result))
}

async fn pending_requests(state: &AppState) -> AppResult<Vec<PendingRequest>> {
    let value = state
        .authority
        .request(Caller::Extension, "get_pending_requests", Vec::new())
        .await?
        .into_result()
        .map_err(|e| AppError::internal(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| AppError::internal(e.to_string()))
}

/// List requests awaiting a decision
pub async fn list_pending(State(state): State<AppState>) -> AppResult<Json<Vec<PendingRequest>>> {
    Ok(Json(pending_requests(&state).await?))
}

/// One pending request
pub async fn get_pending(
    Path(id): Path<u64>,
    State(state): State<AppState>,
) -> AppResult<Json<PendingRequest>> {
    pending_requests(&state)
        .await?
        .into_iter()
        .find(|r| r.id == id)
        .map(Json)
        .ok_or(AppError::PendingNotFound(id))
}

/// Submit approve/reject for a pending request
pub async fn respond(
    Path(id): Path<u64>,
    State(state): State<AppState>,
    Json(decision): Json<Decision>,
) -> AppResult<Json<RpcResult>> {
    let result = state
        .authority
        .request(
            Caller::Extension,
            "notification_response",
            vec![json!(id), json!(decision.approved)],
        )
        .await?;

    if let Err(err) = result.clone().into_result() {
        if err.kind() == RpcErrorKind::ResultNotFound {
            return Err(AppError::PendingNotFound(id));
        }
    }
    Ok(Json(result))
}

async fn require_session_token(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state.session_token();
    let ok = req
        .headers()
        .get("X-Session-Token")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected.as_str())
        .unwrap_or(false);

    if !ok {
        return Err(AppError::AuthRequired);
    }

    Ok(next.run(req).await)
}

/// Create the web router
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/rpc", post(rpc))
        .route("/pending", get(list_pending))
        .route("/pending/{id}", get(get_pending))
        .route("/pending/{id}/response", post(respond))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session_token))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .nest("/api", api)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}
