pub mod apartments;
pub mod auth;
pub mod bills;
pub mod telegram;
pub mod users;

use crate::middleware::AppState;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::IntoParams;

pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/user", auth::routes())
        .nest(
            "/resident",
            users::routes().merge(apartments::resident_routes()),
        )
        .nest(
            "/manager",
            apartments::manager_routes().merge(bills::manager_routes()),
        )
        .nest("/bills", bills::routes())
        .nest("/payments", bills::payment_routes())
        .nest("/telegram", telegram::routes())
}

/// Обёртка успешного ответа: `{"success": true, "message": ..., "data": ...}`.
pub fn ok<T: Serialize>(message: &str, data: T) -> Json<Value> {
    Json(json!({
        "success": true,
        "message": message,
        "data": data
    }))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct IdQuery {
    /// ID объекта
    pub id: i64,
}
