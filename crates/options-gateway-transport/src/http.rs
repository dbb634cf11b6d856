//! HTTP routes: `POST /rpc`, `GET /health` and the `/ws` upgrade.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
};
use options_gateway_core::ErrorKind;
use options_gateway_session::HealthReport;
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{Dispatcher, protocol::RpcResponse, websocket::ws_handler};

/// HTTP status for an error kind.
#[must_use]
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::SessionNotFound => StatusCode::NOT_FOUND,
        ErrorKind::CapacityExceeded
        | ErrorKind::ConnectionUnavailable
        | ErrorKind::TransientUpstreamError => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::PermanentUpstreamError => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
    }
}

/// Build the gateway router.
///
/// # Example
/// ```ignore
/// let app = create_router(Arc::new(dispatcher));
/// axum::serve(listener, app).await?;
/// ```
#[must_use]
pub fn create_router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/rpc", post(rpc_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(dispatcher)
}

async fn rpc_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    body: String,
) -> (StatusCode, Json<RpcResponse>) {
    let response = dispatcher.handle_text(&body).await;
    let status = response
        .error
        .as_ref()
        .map_or(StatusCode::OK, |err| status_for(err.kind));
    (status, Json(response))
}

#[derive(Debug, Deserialize)]
struct HealthQuery {
    session_id: Option<String>,
}

async fn health_handler(
    State(dispatcher): State<Arc<Dispatcher>>,
    Query(query): Query<HealthQuery>,
) -> Json<HealthReport> {
    Json(
        dispatcher
            .facade()
            .health_check(query.session_id.as_deref())
            .await,
    )
}
