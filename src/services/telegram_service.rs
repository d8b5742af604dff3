use crate::config::ChatConfig;
use crate::error::{AppError, AppResult};
use crate::models::{Bill, ChatTarget, Invitation};
use crate::repositories::{ApartmentRepository, UserRepository};
use crate::utils::validators::normalize_telegram;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Уведомления в чат. Ошибки нужны вызывающему только для логов
/// и для перевода приглашения в `notified`.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, target: &ChatTarget, text: &str) -> AppResult<()>;
    async fn send_invitation(&self, invitation: &Invitation) -> AppResult<()>;
    async fn send_bill_notification(
        &self,
        user_id: i64,
        bill: &Bill,
        amount: Decimal,
    ) -> AppResult<()>;
}

pub struct TelegramService {
    config: ChatConfig,
    app_base_url: String,
    client: reqwest::Client,
    permits: Semaphore,
    users: Arc<dyn UserRepository>,
    apartments: Arc<dyn ApartmentRepository>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest {
    chat_id: serde_json::Value,
    text: String,
    disable_web_page_preview: bool,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    description: Option<String>,
}

impl TelegramService {
    pub fn new(
        config: ChatConfig,
        app_base_url: String,
        users: Arc<dyn UserRepository>,
        apartments: Arc<dyn ApartmentRepository>,
    ) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| AppError::Internal(e.to_string()))?;

        Ok(Self {
            permits: Semaphore::new(config.max_concurrent.max(1)),
            config,
            app_base_url,
            client,
            users,
            apartments,
        })
    }

    async fn resolve_user_target(&self, user_id: i64) -> AppResult<ChatTarget> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Пользователь не найден".to_string()))?;

        user.chat_target()
            .ok_or_else(|| AppError::Chat(format!("user {} has no telegram", user_id)))
    }
}

#[async_trait]
impl Notifier for TelegramService {
    async fn send_message(&self, target: &ChatTarget, text: &str) -> AppResult<()> {
        if self.config.bot_token.is_empty() {
            tracing::info!("Chat disabled. Message for {:?} dropped", target);
            return Err(AppError::Chat("bot token is not configured".to_string()));
        }

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?;

        let url = format!(
            "{}/bot{}/sendMessage",
            self.config.api_url.trim_end_matches('/'),
            self.config.bot_token
        );

        let request = SendMessageRequest {
            chat_id: target.to_json(),
            text: text.to_string(),
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout(format!("telegram: {}", e))
                } else {
                    AppError::Chat(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Chat(e.to_string()))?;

        if !status.is_success() {
            tracing::error!("Telegram API error: {} - {}", status, body);
            let reason = serde_json::from_str::<TelegramResponse>(&body)
                .ok()
                .and_then(|r| r.description)
                .unwrap_or_else(|| format!("Telegram API error: {}", status));
            return Err(AppError::Chat(reason));
        }

        let result: TelegramResponse =
            serde_json::from_str(&body).map_err(|e| AppError::Chat(e.to_string()))?;

        if !result.ok {
            let reason = result.description.unwrap_or_else(|| status.to_string());
            tracing::error!("Telegram send failed: {}", reason);
            return Err(AppError::Chat(reason));
        }

        tracing::info!("Telegram message sent to {:?}", target);
        Ok(())
    }

    async fn send_invitation(&self, invitation: &Invitation) -> AppResult<()> {
        let target = match self.users.find_by_telegram(&invitation.receiver_username).await? {
            Some(user) => user
                .chat_target()
                .unwrap_or_else(|| ChatTarget::Username(invitation.receiver_username.clone())),
            None => ChatTarget::Username(invitation.receiver_username.clone()),
        };

        let apartment_name = self
            .apartments
            .find_by_id(invitation.apartment_id)
            .await?
            .map(|a| a.name)
            .unwrap_or_else(|| format!("#{}", invitation.apartment_id));

        let text = format!(
            "Вас пригласили в дом «{}». Чтобы присоединиться, откройте ссылку:\n{}\nСсылка действует до {}.",
            apartment_name,
            invitation.invite_url(&self.app_base_url),
            invitation.expires_at.format("%d.%m.%Y %H:%M UTC")
        );

        self.send_message(&target, &text).await
    }

    async fn send_bill_notification(
        &self,
        user_id: i64,
        bill: &Bill,
        amount: Decimal,
    ) -> AppResult<()> {
        let target = self.resolve_user_target(user_id).await?;

        let mut text = format!(
            "Новый счёт: {}. Ваша доля: {} из {}. Оплатить до {}.",
            bill.bill_type.title(),
            amount,
            bill.total_amount,
            bill.due_date.format("%d.%m.%Y")
        );
        if let Some(description) = &bill.description {
            text.push('\n');
            text.push_str(description);
        }

        self.send_message(&target, &text).await
    }
}

// Входящие обновления Telegram (webhook)
#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
    pub text: Option<String>,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct TelegramUser {
    pub username: Option<String>,
}

/// Привязка чата: `/start` от @username сохраняет chat id у пользователя
/// с таким Telegram-именем. Возвращает `true`, если привязка выполнена.
pub async fn bind_chat_from_update(
    users: &dyn UserRepository,
    notifier: &dyn Notifier,
    update: &TelegramUpdate,
) -> AppResult<bool> {
    let Some(message) = &update.message else {
        return Ok(false);
    };

    let is_start = message
        .text
        .as_deref()
        .map(|t| t.trim_start().starts_with("/start"))
        .unwrap_or(false);
    if !is_start {
        return Ok(false);
    }

    let Some(username) = message.from.as_ref().and_then(|u| u.username.as_deref()) else {
        return Ok(false);
    };

    let username = normalize_telegram(username);
    let bound = users.bind_chat(&username, message.chat.id).await?;

    let reply = if bound {
        "Готово! Теперь уведомления о счетах и приглашениях будут приходить сюда."
    } else {
        "Этот Telegram-аккаунт не указан ни в одном профиле. Добавьте его в настройках профиля."
    };

    if let Err(e) = notifier
        .send_message(&ChatTarget::Id(message.chat.id), reply)
        .await
    {
        tracing::warn!("Failed to confirm chat binding for @{}: {}", username, e);
    }

    if bound {
        tracing::info!("Telegram chat bound for @{}", username);
    }
    Ok(bound)
}
