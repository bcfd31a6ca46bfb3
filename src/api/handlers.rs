use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, StatusCode},
    response::Response,
    Json,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::models::*;
use super::routes::AppState;
use crate::error::Error;
use crate::session::Session;
use crate::window::ViewWindow;

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn get_window(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Response, ApiError> {
    let start = Instant::now();
    let window = query.to_window().map_err(error_response)?;
    let record = query.record;

    let decoded = blocking(&state.session, move |session| {
        session.get_window(&window, record)
    })
    .await?;
    debug!(
        bytes = decoded.pixels.len(),
        elapsed_ms = start.elapsed().as_secs_f64() * 1000.0,
        "Served window"
    );

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream");
    for (name, value) in window_headers(&decoded.window) {
        response = response.header(name, value);
    }
    response
        .body(Body::from(decoded.pixels))
        .map_err(|e| internal(format!("Failed to build response: {}", e)))
}

pub async fn get_availability(
    State(state): State<AppState>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<AvailabilityResponse>, ApiError> {
    let window = query.to_window().map_err(error_response)?;
    let available = blocking(&state.session, move |session| {
        session.is_window_available(&window)
    })
    .await?;

    let stats = state.session.ledger().stats();
    Ok(Json(AvailabilityResponse {
        available,
        cached_precincts: stats.entries,
        cached_bytes: stats.total_bytes,
    }))
}

pub async fn get_speed(State(state): State<AppState>) -> Json<SpeedResponse> {
    Json(SpeedResponse {
        bytes_per_second: state.session.speed(),
        phase: state.session.phase(),
    })
}

pub async fn get_prefetch_status(
    State(state): State<AppState>,
) -> Result<Json<PrefetchStatusResponse>, ApiError> {
    match &state.prefetch {
        Some(engine) => Ok(Json(PrefetchStatusResponse {
            state: engine.state(),
            stats: engine.stats(),
        })),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Prefetching is disabled".to_string(),
            }),
        )),
    }
}

pub async fn close_session(State(state): State<AppState>) -> Result<Json<CloseResponse>, ApiError> {
    blocking(&state.session, |session| session.close_session()).await?;
    Ok(Json(CloseResponse {
        phase: state.session.phase(),
    }))
}

/// Runs a session call off the async workers
async fn blocking<T, F>(session: &Arc<Session>, call: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&Session) -> crate::Result<T> + Send + 'static,
{
    let session = Arc::clone(session);
    tokio::task::spawn_blocking(move || call(&session))
        .await
        .map_err(|e| internal(format!("Session task failed: {}", e)))?
        .map_err(error_response)
}

fn window_headers(window: &ViewWindow) -> Vec<(&'static str, String)> {
    let mut headers = Vec::new();
    if let Some(frame) = window.frame_size {
        headers.push(("x-frame-size", format!("{},{}", frame.width, frame.height)));
    }
    if let Some(offset) = window.region_offset {
        headers.push(("x-region-offset", format!("{},{}", offset.x, offset.y)));
    }
    if let Some(size) = window.region_size {
        headers.push(("x-region-size", format!("{},{}", size.width, size.height)));
    }
    if let Some(layers) = window.layers {
        headers.push(("x-layers", layers.to_string()));
    }
    headers
}

fn error_response(e: Error) -> ApiError {
    let status = match &e {
        Error::InvalidWindow(_)
        | Error::InvalidComponents(_)
        | Error::InvalidCacheDescriptor { .. } => StatusCode::BAD_REQUEST,
        Error::SessionClosed => StatusCode::GONE,
        Error::Fetch { .. } => StatusCode::BAD_GATEWAY,
        Error::MainHeaderUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "Request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn internal(error: String) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error }))
}
