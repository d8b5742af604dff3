use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Неверный запрос: {0}")]
    BadRequest(String),

    #[error("Не авторизован")]
    Unauthorized,

    #[error("Доступ запрещён")]
    Forbidden,

    #[error("Не найдено: {0}")]
    NotFound(String),

    #[error("Больше не доступно: {0}")]
    Gone(String),

    #[error("Конфликт: {0}")]
    Conflict(String),

    #[error("Платёж отклонён: {0}")]
    PaymentFailed(String),

    #[error("Превышено время ожидания: {0}")]
    Timeout(String),

    #[error("Ошибка базы данных: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Ошибка JWT: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Ошибка хранилища файлов: {0}")]
    Storage(String),

    #[error("Ошибка чата: {0}")]
    Chat(String),

    #[error("Внутренняя ошибка: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized | AppError::Jwt(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Gone(_) => StatusCode::GONE,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::PaymentFailed(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_)
            | AppError::Database(_)
            | AppError::Storage(_)
            | AppError::Chat(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Ошибка уникальности в БД превращается в Conflict, остальное остаётся как есть.
    pub fn from_unique_violation(err: sqlx::Error, message: &str) -> Self {
        let is_unique = err
            .as_database_error()
            .map(|db| db.is_unique_violation())
            .unwrap_or(false);

        if is_unique {
            AppError::Conflict(message.to_string())
        } else {
            AppError::Database(err)
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let message = match &self {
            AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Gone(msg)
            | AppError::Conflict(msg)
            | AppError::PaymentFailed(msg) => msg.clone(),
            AppError::Unauthorized | AppError::Forbidden => self.to_string(),
            AppError::Jwt(_) => "Неверный токен".to_string(),
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "Ошибка базы данных".to_string()
            }
            AppError::Timeout(cause) => {
                tracing::error!("Timeout: {}", cause);
                "Превышено время ожидания".to_string()
            }
            AppError::Storage(msg) => {
                tracing::error!("Storage error: {}", msg);
                "Ошибка хранилища файлов".to_string()
            }
            AppError::Chat(msg) => {
                tracing::error!("Chat error: {}", msg);
                "Ошибка отправки сообщения".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Внутренняя ошибка".to_string()
            }
        };

        let body = Json(json!({
            "success": false,
            "error": message
        }));

        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
