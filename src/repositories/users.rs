use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::models::{NewUser, ProfileChanges, User};

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn create(&self, user: &NewUser) -> AppResult<User>;
    async fn find_by_id(&self, id: i64) -> AppResult<Option<User>>;
    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>>;
    async fn find_by_telegram(&self, telegram_user: &str) -> AppResult<Option<User>>;
    async fn update_profile(&self, id: i64, changes: &ProfileChanges) -> AppResult<User>;
    /// Меняет Telegram-имя и сбрасывает привязку чата.
    async fn set_telegram(&self, id: i64, telegram_user: Option<&str>) -> AppResult<User>;
    /// Привязывает chat id к пользователю с данным Telegram-именем.
    async fn bind_chat(&self, telegram_user: &str, chat_id: i64) -> AppResult<bool>;
}

#[derive(Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn create(&self, user: &NewUser) -> AppResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (username, password_hash, email, phone, full_name, role, telegram_user)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(&user.email)
        .bind(&user.phone)
        .bind(&user.full_name)
        .bind(user.role)
        .bind(&user.telegram_user)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            AppError::from_unique_violation(e, "Имя пользователя или Telegram уже заняты")
        })
    }

    async fn find_by_id(&self, id: i64) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn find_by_telegram(&self, telegram_user: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE telegram_user = $1")
            .bind(telegram_user)
            .fetch_optional(&self.pool)
            .await?;
        Ok(user)
    }

    async fn update_profile(&self, id: i64, changes: &ProfileChanges) -> AppResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET
                email = COALESCE($2, email),
                phone = COALESCE($3, phone),
                full_name = COALESCE($4, full_name),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&changes.email)
        .bind(&changes.phone)
        .bind(&changes.full_name)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Пользователь не найден".to_string()))
    }

    async fn set_telegram(&self, id: i64, telegram_user: Option<&str>) -> AppResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            UPDATE users
            SET telegram_user = $2, telegram_chat_id = 0, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(telegram_user)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::from_unique_violation(e, "Telegram уже привязан к другому аккаунту"))?
        .ok_or_else(|| AppError::NotFound("Пользователь не найден".to_string()))
    }

    async fn bind_chat(&self, telegram_user: &str, chat_id: i64) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE users SET telegram_chat_id = $2, updated_at = NOW() WHERE telegram_user = $1",
        )
        .bind(telegram_user)
        .bind(chat_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
