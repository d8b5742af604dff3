use crate::error::{AppError, AppResult};
use crate::models::{Invitation, InvitationStatus, IssuedInvitation, RedeemedInvitation};
use crate::repositories::{ApartmentRepository, InvitationStore, MembershipRepository, UserRepository};
use crate::services::{AccessOracle, Notifier};
use crate::utils::validators::{is_valid_telegram, normalize_telegram};
use chrono::{Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::Arc;

pub struct InvitationService {
    store: Arc<dyn InvitationStore>,
    users: Arc<dyn UserRepository>,
    apartments: Arc<dyn ApartmentRepository>,
    memberships: Arc<dyn MembershipRepository>,
    access: AccessOracle,
    notifier: Arc<dyn Notifier>,
    ttl: Duration,
    app_base_url: String,
}

impl InvitationService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn InvitationStore>,
        users: Arc<dyn UserRepository>,
        apartments: Arc<dyn ApartmentRepository>,
        memberships: Arc<dyn MembershipRepository>,
        access: AccessOracle,
        notifier: Arc<dyn Notifier>,
        ttl: Duration,
        app_base_url: String,
    ) -> Self {
        Self {
            store,
            users,
            apartments,
            memberships,
            access,
            notifier,
            ttl,
            app_base_url,
        }
    }

    /// Выпускает приглашение и пытается доставить его в чат.
    /// Недоставленное приглашение остаётся действительным.
    pub async fn issue(
        &self,
        manager_id: i64,
        apartment_id: i64,
        receiver_username: &str,
    ) -> AppResult<IssuedInvitation> {
        self.access.require_manager(manager_id, apartment_id).await?;

        let receiver_username = normalize_telegram(receiver_username);
        if !is_valid_telegram(&receiver_username) {
            return Err(AppError::BadRequest(
                "Неверное имя пользователя Telegram".to_string(),
            ));
        }

        let receiver = self
            .users
            .find_by_telegram(&receiver_username)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Пользователь с Telegram @{} не найден",
                    receiver_username
                ))
            })?;

        if self.access.is_member(receiver.id, apartment_id).await? {
            return Err(AppError::Conflict(
                "Пользователь уже состоит в этом доме".to_string(),
            ));
        }

        let now = Utc::now();
        let invitation = Invitation {
            token: generate_token(),
            sender_id: manager_id,
            receiver_username,
            apartment_id,
            expires_at: now + self.ttl,
            status: InvitationStatus::Pending,
            created_at: now,
        };

        self.store.insert(&invitation).await?;

        let delivered = match self.notifier.send_invitation(&invitation).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_notified(&invitation.token).await {
                    tracing::warn!("Invitation delivered but status not updated: {}", e);
                }
                true
            }
            Err(e) => {
                tracing::warn!(
                    "Invitation for @{} created but not delivered: {}",
                    invitation.receiver_username,
                    e
                );
                false
            }
        };

        let invite_url = invitation.invite_url(&self.app_base_url);
        let qr_code = match generate_qr_code_base64(&invite_url) {
            Ok(qr) => Some(qr),
            Err(e) => {
                tracing::warn!("Failed to render invitation QR code: {}", e);
                None
            }
        };

        tracing::info!(
            "Invitation issued for apartment {} to @{} (delivered: {})",
            apartment_id,
            invitation.receiver_username,
            delivered
        );

        Ok(IssuedInvitation {
            token: invitation.token,
            invite_url,
            expires_at: invitation.expires_at,
            delivered,
            qr_code,
        })
    }

    /// Одноразовое присоединение по токену. CAS на записи приглашения
    /// упорядочивает конкурентные попытки; если членство не записалось,
    /// статус приглашения откатывается.
    pub async fn redeem(&self, user_id: i64, token: &str) -> AppResult<RedeemedInvitation> {
        let token = token.trim();
        let invitation = self
            .store
            .get(token)
            .await?
            .ok_or_else(|| AppError::NotFound("Приглашение не найдено".to_string()))?;

        let now = Utc::now();
        match invitation.effective_status(now) {
            InvitationStatus::Consumed => {
                return Err(AppError::Gone("Приглашение уже использовано".to_string()))
            }
            InvitationStatus::Expired => {
                return Err(AppError::Gone("Срок действия приглашения истёк".to_string()))
            }
            InvitationStatus::Pending | InvitationStatus::Notified => {}
        }

        if self.access.is_member(user_id, invitation.apartment_id).await? {
            return Err(AppError::Conflict("Вы уже состоите в этом доме".to_string()));
        }

        let previous = self
            .store
            .consume(token, now)
            .await?
            .ok_or_else(|| AppError::Gone("Приглашение уже использовано".to_string()))?;

        match self
            .memberships
            .add(user_id, invitation.apartment_id, false)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.rollback_consume(token, previous).await;
                return Err(AppError::Conflict("Вы уже состоите в этом доме".to_string()));
            }
            Err(e) => {
                self.rollback_consume(token, previous).await;
                return Err(e);
            }
        }

        let apartment_name = self
            .apartments
            .find_by_id(invitation.apartment_id)
            .await?
            .map(|a| a.name)
            .unwrap_or_default();

        tracing::info!(
            "User {} joined apartment {} by invitation",
            user_id,
            invitation.apartment_id
        );

        Ok(RedeemedInvitation {
            apartment_id: invitation.apartment_id,
            apartment_name,
        })
    }

    async fn rollback_consume(&self, token: &str, previous: InvitationStatus) {
        if let Err(e) = self.store.restore(token, previous).await {
            tracing::error!("Failed to restore invitation after rejected join: {}", e);
        }
    }

    pub async fn purge_expired(&self) -> AppResult<u64> {
        self.store.purge_expired(Utc::now()).await
    }

    /// Фоновая чистка истёкших приглашений.
    pub fn spawn_janitor(self: Arc<Self>, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match self.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!("Purged {} expired invitation(s)", removed),
                    Err(e) => tracing::warn!("Invitation cleanup failed: {}", e),
                }
            }
        })
    }
}

/// 32 случайных байта в hex.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// QR код генерация
pub fn generate_qr_code(data: &str) -> AppResult<Vec<u8>> {
    use image::Luma;
    use qrcode::QrCode;

    let code = QrCode::new(data.as_bytes()).map_err(|e| AppError::Internal(e.to_string()))?;

    let image = code.render::<Luma<u8>>().build();

    let mut buffer = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, image::ImageFormat::Png)
        .map_err(|e| AppError::Internal(e.to_string()))?;

    Ok(buffer.into_inner())
}

pub fn generate_qr_code_base64(data: &str) -> AppResult<String> {
    let png_data = generate_qr_code(data)?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &png_data)
    ))
}
