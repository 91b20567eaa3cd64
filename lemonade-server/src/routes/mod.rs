//! Assembles every endpoint in §4.G's table onto one router, mounted both under
//! `/api/v1` and bare at the root (the CLI and most OpenAI-compatible clients hit the
//! unprefixed paths; `/api/v1` is kept for clients that expect the versioned prefix).

pub mod audio;
pub mod control;
pub mod health;
pub mod inference;
pub mod load;
pub mod models;
pub mod pull;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build() -> Router<Arc<AppState>> {
    let api = health::router()
        .merge(models::router())
        .merge(pull::router())
        .merge(load::router())
        .merge(inference::router())
        .merge(audio::router())
        .merge(control::router());

    Router::new()
        .merge(api.clone())
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any))
}
