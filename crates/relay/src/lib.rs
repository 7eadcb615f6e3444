//! The cowrite relay: forwards document updates and presence between the
//! connections of a room over the y-sync WebSocket protocol.

pub mod config;
pub mod cors;
pub mod rooms;
mod ws;

use std::future::Future;
use std::time::Instant;

use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::{header::HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

use crate::rooms::{RoomRegistry, RoomSummary};

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Clone, Default)]
pub struct RelayState {
    pub rooms: RoomRegistry,
}

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/rooms", get(list_rooms))
        .route("/parties/{party}/{room}", get(ws::room_route))
        .with_state(state)
        .layer(middleware::from_fn(request_context_middleware))
}

/// Serve `router` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("relay server exited unexpectedly")
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn list_rooms(State(state): State<RelayState>) -> Json<Vec<RoomSummary>> {
    Json(state.rooms.list())
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = next.run(request).await;

    if let Ok(request_id_header) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, request_id_header);
    }

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
