pub mod api;
pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod openapi;
pub mod repositories;
pub mod services;
pub mod utils;

#[cfg(test)]
pub mod testing;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use middleware::AppState;
pub use openapi::ApiDoc;

use axum::{
    http::{header, Method},
    middleware as axum_middleware,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// HTTP-приложение целиком: служебные маршруты, Swagger и `/v1`.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/v1", api::routes())
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "name": "Dom Billing API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Backend API for apartment billing - bill division, invitations and payments"
    }))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}
