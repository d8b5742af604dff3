use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::repositories::MembershipRepository;

/// Проверки доступа по таблице членств. Без кэша: всегда читает хранилище.
#[derive(Clone)]
pub struct AccessOracle {
    memberships: Arc<dyn MembershipRepository>,
}

impl AccessOracle {
    pub fn new(memberships: Arc<dyn MembershipRepository>) -> Self {
        Self { memberships }
    }

    pub async fn is_member(&self, user_id: i64, apartment_id: i64) -> AppResult<bool> {
        Ok(self.memberships.find(user_id, apartment_id).await?.is_some())
    }

    /// Управляющий всегда является и участником: оба ответа читаются из одной строки.
    pub async fn is_manager_of(&self, user_id: i64, apartment_id: i64) -> AppResult<bool> {
        Ok(self
            .memberships
            .find(user_id, apartment_id)
            .await?
            .map(|m| m.is_manager)
            .unwrap_or(false))
    }

    pub async fn require_member(&self, user_id: i64, apartment_id: i64) -> AppResult<()> {
        if self.is_member(user_id, apartment_id).await? {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }

    pub async fn require_manager(&self, user_id: i64, apartment_id: i64) -> AppResult<()> {
        if self.is_manager_of(user_id, apartment_id).await? {
            Ok(())
        } else {
            Err(AppError::Forbidden)
        }
    }
}
