use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "invitation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvitationStatus {
    Pending,
    Notified,
    Consumed,
    Expired,
}

impl InvitationStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, InvitationStatus::Pending | InvitationStatus::Notified)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Invitation {
    pub token: String,
    pub sender_id: i64,
    pub receiver_username: String,
    pub apartment_id: i64,
    pub expires_at: DateTime<Utc>,
    pub status: InvitationStatus,
    pub created_at: DateTime<Utc>,
}

impl Invitation {
    /// Статус с учётом времени: истёкшее приглашение считается `Expired`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> InvitationStatus {
        if self.status.is_active() && now >= self.expires_at {
            InvitationStatus::Expired
        } else {
            self.status
        }
    }

    pub fn invite_url(&self, base_url: &str) -> String {
        format!(
            "{}/join?token={}",
            base_url.trim_end_matches('/'),
            self.token
        )
    }
}

// DTOs
#[derive(Debug, Deserialize, ToSchema)]
pub struct InviteRequest {
    pub apartment_id: i64,
    pub telegram_username: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IssuedInvitation {
    pub token: String,
    pub invite_url: String,
    pub expires_at: DateTime<Utc>,
    pub delivered: bool,
    pub qr_code: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RedeemedInvitation {
    pub apartment_id: i64,
    pub apartment_name: String,
}
