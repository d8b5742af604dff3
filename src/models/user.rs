use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "user_role", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Manager,
    Resident,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::Resident
    }
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Manager => "manager",
            UserRole::Resident => "resident",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "manager" => Some(UserRole::Manager),
            "resident" => Some(UserRole::Resident),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct User {
    pub id: i64,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub email: String,
    pub phone: Option<String>,
    pub full_name: String,
    pub role: UserRole,
    pub telegram_user: Option<String>,
    /// 0 означает, что чат ещё не привязан
    pub telegram_chat_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Адресат сообщения в чате: числовой chat id (предпочтительно) или @username.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatTarget {
    Id(i64),
    Username(String),
}

impl ChatTarget {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ChatTarget::Id(id) => serde_json::Value::from(*id),
            ChatTarget::Username(name) => serde_json::Value::from(format!("@{}", name)),
        }
    }
}

impl User {
    pub fn chat_target(&self) -> Option<ChatTarget> {
        if self.telegram_chat_id != 0 {
            return Some(ChatTarget::Id(self.telegram_chat_id));
        }
        self.telegram_user
            .as_ref()
            .map(|name| ChatTarget::Username(name.clone()))
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UserPublic {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub phone: Option<String>,
    pub full_name: String,
    pub role: UserRole,
    pub telegram_user: Option<String>,
    pub telegram_connected: bool,
}

impl From<User> for UserPublic {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            phone: user.phone,
            full_name: user.full_name,
            role: user.role,
            telegram_user: user.telegram_user,
            telegram_connected: user.telegram_chat_id != 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub email: String,
    pub phone: Option<String>,
    pub full_name: String,
    pub role: UserRole,
    pub telegram_user: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileChanges {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
}

// DTOs
#[derive(Debug, Deserialize, ToSchema)]
pub struct SignupRequest {
    pub username: String,
    pub password: String,
    pub email: String,
    pub phone: Option<String>,
    pub full_name: String,
    pub role: UserRole,
    pub telegram_user: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthResponse {
    pub token: String,
    pub user: UserPublic,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateProfileRequest {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    /// Пустая строка отвязывает Telegram
    pub telegram_user: Option<String>,
}
