use axum::{extract::State, routing::post, Json, Router};
use serde_json::Value;

use crate::api::ok;
use crate::error::{AppError, AppResult};
use crate::middleware::AppState;
use crate::models::{AuthResponse, LoginRequest, NewUser, SignupRequest, UserPublic};
use crate::services::AuthService;
use crate::utils::validators::{
    is_valid_telegram, non_empty, normalize_telegram, sanitize_string, validate_email,
    validate_phone, validate_username, MIN_PASSWORD_LENGTH,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/signup", post(signup))
        .route("/login", post(login))
}

/// Регистрация
#[utoipa::path(
    post,
    path = "/v1/user/signup",
    tag = "auth",
    request_body = SignupRequest,
    responses(
        (status = 200, description = "Пользователь создан", body = AuthResponse),
        (status = 400, description = "Ошибка валидации"),
        (status = 409, description = "Имя пользователя или Telegram уже заняты")
    )
)]
pub async fn signup(
    State(state): State<AppState>,
    Json(payload): Json<SignupRequest>,
) -> AppResult<Json<Value>> {
    let username = sanitize_string(&payload.username);
    if !validate_username(&username) {
        return Err(AppError::BadRequest(
            "Имя пользователя: 3-32 символа, латиница, цифры, _ . -".to_string(),
        ));
    }

    if payload.password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AppError::BadRequest(format!(
            "Пароль должен содержать не менее {} символов",
            MIN_PASSWORD_LENGTH
        )));
    }

    let email = sanitize_string(&payload.email);
    if !validate_email(&email) {
        return Err(AppError::BadRequest("Неверный формат email".to_string()));
    }

    let phone = non_empty(payload.phone);
    if let Some(phone) = &phone {
        if !validate_phone(phone) {
            return Err(AppError::BadRequest(
                "Неверный формат номера телефона".to_string(),
            ));
        }
    }

    let full_name = sanitize_string(&payload.full_name);
    if full_name.is_empty() {
        return Err(AppError::BadRequest("Укажите имя".to_string()));
    }

    let telegram_user = non_empty(payload.telegram_user).map(|t| normalize_telegram(&t));
    if let Some(telegram) = &telegram_user {
        if !is_valid_telegram(telegram) {
            return Err(AppError::BadRequest(
                "Неверное имя пользователя Telegram".to_string(),
            ));
        }
        if state.users.find_by_telegram(telegram).await?.is_some() {
            return Err(AppError::Conflict(
                "Telegram уже привязан к другому аккаунту".to_string(),
            ));
        }
    }

    if state.users.find_by_username(&username).await?.is_some() {
        return Err(AppError::Conflict("Имя пользователя уже занято".to_string()));
    }

    let user = state
        .users
        .create(&NewUser {
            username,
            password_hash: AuthService::hash_password(&payload.password)?,
            email,
            phone,
            full_name,
            role: payload.role,
            telegram_user,
        })
        .await?;

    let token = state.auth.generate_access_token(&user)?;
    tracing::info!("User {} signed up as {}", user.id, user.role.as_str());

    Ok(ok(
        "Регистрация выполнена",
        AuthResponse {
            token,
            user: UserPublic::from(user),
        },
    ))
}

/// Вход по логину и паролю
#[utoipa::path(
    post,
    path = "/v1/user/login",
    tag = "auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Успешный вход", body = AuthResponse),
        (status = 401, description = "Неверный логин или пароль")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<Value>> {
    let user = state
        .users
        .find_by_username(payload.username.trim())
        .await?
        .ok_or(AppError::Unauthorized)?;

    if !AuthService::verify_password(&payload.password, &user.password_hash) {
        return Err(AppError::Unauthorized);
    }

    let token = state.auth.generate_access_token(&user)?;

    Ok(ok(
        "Вход выполнен",
        AuthResponse {
            token,
            user: UserPublic::from(user),
        },
    ))
}

#[cfg(test)]
mod tests {
    use crate::api::tests::test_app;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_signup_then_login() {
        let app = test_app();
        let (id, _) = app.signup("alice", "manager", Some("alice_tg")).await;

        let (status, body) = app
            .call(
                Method::POST,
                "/v1/user/login",
                None,
                Some(json!({"username": "alice", "password": "password123"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["user"]["id"], id);
        assert_eq!(body["data"]["user"]["role"], "manager");
        assert!(body["data"]["user"].get("password_hash").is_none());

        let (status, body) = app
            .call(
                Method::POST,
                "/v1/user/login",
                None,
                Some(json!({"username": "alice", "password": "wrong-password"})),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_signup_validation_and_conflicts() {
        let app = test_app();
        app.signup("alice", "manager", Some("alice_tg")).await;

        let signup = |username: &str, password: &str, telegram: &str| {
            json!({
                "username": username,
                "password": password,
                "email": "x@example.com",
                "full_name": "X",
                "role": "resident",
                "telegram_user": telegram,
            })
        };

        for (body, expected) in [
            (signup("al", "password123", ""), StatusCode::BAD_REQUEST),
            (signup("carol", "short", ""), StatusCode::BAD_REQUEST),
            (signup("carol", "password123", "bad"), StatusCode::BAD_REQUEST),
            (signup("alice", "password123", ""), StatusCode::CONFLICT),
            (signup("carol", "password123", "@Alice_TG"), StatusCode::CONFLICT),
        ] {
            let (status, _) = app
                .call(Method::POST, "/v1/user/signup", None, Some(body))
                .await;
            assert_eq!(status, expected);
        }
    }
}
