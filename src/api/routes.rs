use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use super::handlers::*;
use crate::prefetch::PrefetchEngine;
use crate::session::Session;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<Session>,
    pub prefetch: Option<Arc<PrefetchEngine>>,
}

pub fn create_router(session: Arc<Session>, prefetch: Option<PrefetchEngine>) -> Router {
    let state = AppState {
        session,
        prefetch: prefetch.map(Arc::new),
    };
    Router::new()
        .route("/api/window", get(get_window))
        .route("/api/available", get(get_availability))
        .route("/api/speed", get(get_speed))
        .route("/api/prefetch", get(get_prefetch_status))
        .route("/api/close", post(close_session))
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
        .with_state(state)
}
