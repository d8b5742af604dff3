use axum::{extract::State, routing::get, Json, Router};
use serde_json::Value;

use crate::api::ok;
use crate::error::{AppError, AppResult};
use crate::middleware::{AppState, AuthUser};
use crate::models::{ProfileChanges, UpdateProfileRequest, User, UserPublic};
use crate::utils::validators::{
    is_valid_telegram, non_empty, normalize_telegram, validate_email, validate_phone,
};

pub fn routes() -> Router<AppState> {
    Router::new().route("/profile", get(get_profile).put(update_profile))
}

async fn load_user(state: &AppState, user_id: i64) -> AppResult<User> {
    state
        .users
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Пользователь не найден".to_string()))
}

/// Профиль текущего пользователя
#[utoipa::path(
    get,
    path = "/v1/resident/profile",
    tag = "users",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Профиль пользователя", body = UserPublic),
        (status = 401, description = "Не авторизован")
    )
)]
pub async fn get_profile(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> AppResult<Json<Value>> {
    let user = load_user(&state, auth_user.user_id).await?;
    Ok(ok("Профиль", UserPublic::from(user)))
}

/// Обновление профиля
///
/// Новое имя Telegram сбрасывает привязку чата, то же самое имя ничего не меняет,
/// пустая строка отвязывает Telegram.
#[utoipa::path(
    put,
    path = "/v1/resident/profile",
    tag = "users",
    security(("bearer_auth" = [])),
    request_body = UpdateProfileRequest,
    responses(
        (status = 200, description = "Профиль обновлён", body = UserPublic),
        (status = 400, description = "Ошибка валидации"),
        (status = 401, description = "Не авторизован"),
        (status = 409, description = "Telegram уже привязан к другому аккаунту")
    )
)]
pub async fn update_profile(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(payload): Json<UpdateProfileRequest>,
) -> AppResult<Json<Value>> {
    let mut user = load_user(&state, auth_user.user_id).await?;

    let changes = ProfileChanges {
        email: non_empty(payload.email),
        phone: non_empty(payload.phone),
        full_name: non_empty(payload.full_name),
    };

    if let Some(email) = &changes.email {
        if !validate_email(email) {
            return Err(AppError::BadRequest("Неверный формат email".to_string()));
        }
    }
    if let Some(phone) = &changes.phone {
        if !validate_phone(phone) {
            return Err(AppError::BadRequest(
                "Неверный формат номера телефона".to_string(),
            ));
        }
    }

    if let Some(telegram) = payload.telegram_user {
        let telegram = normalize_telegram(&telegram);

        if telegram.is_empty() {
            if user.telegram_user.is_some() {
                user = state.users.set_telegram(user.id, None).await?;
            }
        } else if user.telegram_user.as_deref() != Some(telegram.as_str()) {
            if !is_valid_telegram(&telegram) {
                return Err(AppError::BadRequest(
                    "Неверное имя пользователя Telegram".to_string(),
                ));
            }
            if let Some(other) = state.users.find_by_telegram(&telegram).await? {
                if other.id != user.id {
                    return Err(AppError::Conflict(
                        "Telegram уже привязан к другому аккаунту".to_string(),
                    ));
                }
            }
            user = state.users.set_telegram(user.id, Some(&telegram)).await?;
            tracing::info!("User {} changed telegram, chat binding reset", user.id);
        }
    }

    if changes.email.is_some() || changes.phone.is_some() || changes.full_name.is_some() {
        user = state.users.update_profile(user.id, &changes).await?;
    }

    Ok(ok("Профиль обновлён", UserPublic::from(user)))
}
