use axum::{extract::State, http::HeaderMap, routing::post, Json, Router};
use serde_json::Value;

use crate::api::ok;
use crate::error::{AppError, AppResult};
use crate::middleware::AppState;
use crate::services::telegram_service::{bind_chat_from_update, TelegramUpdate};

const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhook", post(webhook))
}

/// Входящие обновления бота. `/start` привязывает чат к профилю.
#[utoipa::path(
    post,
    path = "/v1/telegram/webhook",
    tag = "telegram",
    request_body = TelegramUpdate,
    responses(
        (status = 200, description = "Обновление принято"),
        (status = 401, description = "Неверный секрет webhook")
    )
)]
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<TelegramUpdate>,
) -> AppResult<Json<Value>> {
    if let Some(secret) = state.config.chat.webhook_secret.as_deref() {
        let provided = headers
            .get(SECRET_HEADER)
            .and_then(|value| value.to_str().ok());
        if provided != Some(secret) {
            return Err(AppError::Unauthorized);
        }
    }

    let bound =
        bind_chat_from_update(state.users.as_ref(), state.notifier.as_ref(), &update).await?;

    Ok(ok("Обновление принято", bound))
}
