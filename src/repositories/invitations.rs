use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{AppError, AppResult};
use crate::models::{Invitation, InvitationStatus};

/// Хранилище приглашений с ограниченным временем жизни.
///
/// Записи остаются видимыми до `expires_at + grace`, чтобы повторная попытка
/// присоединиться по истёкшему токену получала `Gone`, а не `NotFound`.
#[async_trait]
pub trait InvitationStore: Send + Sync {
    async fn insert(&self, invitation: &Invitation) -> AppResult<()>;
    async fn get(&self, token: &str) -> AppResult<Option<Invitation>>;
    /// pending -> notified
    async fn mark_notified(&self, token: &str) -> AppResult<bool>;
    /// Атомарный CAS `pending|notified -> consumed` для неистёкшего токена.
    /// Возвращает прежний статус, если переход выполнен.
    async fn consume(&self, token: &str, now: DateTime<Utc>)
        -> AppResult<Option<InvitationStatus>>;
    /// Откат `consume`, когда членство не удалось записать.
    async fn restore(&self, token: &str, status: InvitationStatus) -> AppResult<()>;
    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64>;
}

#[derive(Clone)]
pub struct PgInvitationStore {
    pool: PgPool,
    grace: Duration,
}

impl PgInvitationStore {
    pub fn new(pool: PgPool, grace: Duration) -> Self {
        Self { pool, grace }
    }
}

#[async_trait]
impl InvitationStore for PgInvitationStore {
    async fn insert(&self, invitation: &Invitation) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO invitations
                (token, sender_id, receiver_username, apartment_id, expires_at, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&invitation.token)
        .bind(invitation.sender_id)
        .bind(&invitation.receiver_username)
        .bind(invitation.apartment_id)
        .bind(invitation.expires_at)
        .bind(invitation.status)
        .bind(invitation.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_unique_violation(e, "Токен приглашения уже существует"))?;

        Ok(())
    }

    async fn get(&self, token: &str) -> AppResult<Option<Invitation>> {
        let invitation = sqlx::query_as::<_, Invitation>(
            "SELECT * FROM invitations WHERE token = $1 AND expires_at + $2 > NOW()",
        )
        .bind(token)
        .bind(self.grace)
        .fetch_optional(&self.pool)
        .await?;
        Ok(invitation)
    }

    async fn mark_notified(&self, token: &str) -> AppResult<bool> {
        let result = sqlx::query(
            "UPDATE invitations SET status = 'notified' WHERE token = $1 AND status = 'pending'",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn consume(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<InvitationStatus>> {
        // Подзапрос читает прежний статус до обновления той же строки
        let previous: Option<(InvitationStatus,)> = sqlx::query_as(
            r#"
            UPDATE invitations i
            SET status = 'consumed'
            FROM (SELECT token, status FROM invitations WHERE token = $1 FOR UPDATE) old
            WHERE i.token = old.token
              AND i.status IN ('pending', 'notified')
              AND i.expires_at > $2
            RETURNING old.status
            "#,
        )
        .bind(token)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        Ok(previous.map(|(status,)| status))
    }

    async fn restore(&self, token: &str, status: InvitationStatus) -> AppResult<()> {
        sqlx::query(
            "UPDATE invitations SET status = $2 WHERE token = $1 AND status = 'consumed'",
        )
        .bind(token)
        .bind(status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM invitations WHERE expires_at + $2 <= $1")
            .bind(now)
            .bind(self.grace)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Приглашения в памяти процесса, для одного экземпляра сервиса.
pub struct MemoryInvitationStore {
    entries: Mutex<HashMap<String, Invitation>>,
    grace: Duration,
}

impl MemoryInvitationStore {
    pub fn new(grace: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            grace,
        }
    }

    fn is_visible(&self, invitation: &Invitation, now: DateTime<Utc>) -> bool {
        invitation.expires_at + self.grace > now
    }
}

#[async_trait]
impl InvitationStore for MemoryInvitationStore {
    async fn insert(&self, invitation: &Invitation) -> AppResult<()> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&invitation.token) {
            return Err(AppError::Conflict(
                "Токен приглашения уже существует".to_string(),
            ));
        }
        entries.insert(invitation.token.clone(), invitation.clone());
        Ok(())
    }

    async fn get(&self, token: &str) -> AppResult<Option<Invitation>> {
        let now = Utc::now();
        let mut entries = self.entries.lock().await;
        match entries.get(token) {
            Some(inv) if self.is_visible(inv, now) => Ok(Some(inv.clone())),
            Some(_) => {
                entries.remove(token);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn mark_notified(&self, token: &str) -> AppResult<bool> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(token) {
            Some(inv) if inv.status == InvitationStatus::Pending => {
                inv.status = InvitationStatus::Notified;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn consume(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<InvitationStatus>> {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(token) {
            Some(inv) if inv.status.is_active() && inv.expires_at > now => {
                let previous = inv.status;
                inv.status = InvitationStatus::Consumed;
                Ok(Some(previous))
            }
            _ => Ok(None),
        }
    }

    async fn restore(&self, token: &str, status: InvitationStatus) -> AppResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(inv) = entries.get_mut(token) {
            if inv.status == InvitationStatus::Consumed {
                inv.status = status;
            }
        }
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        let grace = self.grace;
        entries.retain(|_, inv| inv.expires_at + grace > now);
        Ok((before - entries.len()) as u64)
    }
}
