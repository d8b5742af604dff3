use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReceipt {
    pub reference: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("payment declined: {0}")]
    Declined(String),

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("idempotency key reused with different payments")]
    KeyReused,
}

/// Внешний платёжный шлюз. Для одинаковых аргументов результат одинаков,
/// повтор с тем же ключом и теми же платежами не списывает деньги второй раз.
/// Ключ, уже использованный для другого набора платежей, отклоняется.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn pay_bills(
        &self,
        payment_ids: &[i64],
        idempotency_key: &str,
    ) -> Result<GatewayReceipt, GatewayError>;
}

struct Charge {
    payment_ids: Vec<i64>,
    receipt: GatewayReceipt,
}

/// Песочница без реального провайдера: детерминированные ссылки
/// и дедупликация по ключу идемпотентности.
#[derive(Default)]
pub struct SandboxGateway {
    settled: Mutex<HashMap<String, Charge>>,
}

impl SandboxGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Количество реальных (не повторных) списаний.
    pub async fn charges(&self) -> usize {
        self.settled.lock().await.len()
    }

    fn normalized(payment_ids: &[i64]) -> Vec<i64> {
        let mut ids = payment_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    fn reference_for(ids: &[i64], idempotency_key: &str) -> String {
        let joined = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let seed = format!("{}:{}", idempotency_key, joined);
        format!(
            "PAY-{}",
            Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()).simple()
        )
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn pay_bills(
        &self,
        payment_ids: &[i64],
        idempotency_key: &str,
    ) -> Result<GatewayReceipt, GatewayError> {
        if idempotency_key.trim().is_empty() {
            return Err(GatewayError::Declined("missing idempotency key".to_string()));
        }

        if payment_ids.is_empty() {
            return Err(GatewayError::Declined("empty batch".to_string()));
        }

        let ids = Self::normalized(payment_ids);
        let mut settled = self.settled.lock().await;
        if let Some(charge) = settled.get(idempotency_key) {
            if charge.payment_ids != ids {
                tracing::warn!(
                    "Idempotency key {} reused for a different payment set",
                    idempotency_key
                );
                return Err(GatewayError::KeyReused);
            }
            tracing::debug!("Replaying settled payment for key {}", idempotency_key);
            return Ok(charge.receipt.clone());
        }

        let receipt = GatewayReceipt {
            reference: Self::reference_for(&ids, idempotency_key),
        };
        settled.insert(
            idempotency_key.to_string(),
            Charge {
                payment_ids: ids,
                receipt: receipt.clone(),
            },
        );

        tracing::info!(
            "Sandbox gateway settled {} payment(s), reference {}",
            payment_ids.len(),
            receipt.reference
        );
        Ok(receipt)
    }
}
