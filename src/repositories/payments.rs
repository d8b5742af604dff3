use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::models::{Payment, PaymentHistoryEntry};

/// Отметка об успешной оплате, которую ставит шлюз.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub paid_at: DateTime<Utc>,
    pub reference: String,
    pub idempotency_key: String,
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn create(&self, bill_id: i64, user_id: i64, amount: Decimal) -> AppResult<Payment>;
    async fn find_by_bill_and_user(&self, bill_id: i64, user_id: i64)
        -> AppResult<Option<Payment>>;
    async fn list_by_bill(&self, bill_id: i64) -> AppResult<Vec<Payment>>;
    /// Всё, что ещё не оплачено: pending и failed.
    async fn list_unpaid_by_user(&self, user_id: i64) -> AppResult<Vec<Payment>>;
    async fn list_by_idempotency_key(&self, user_id: i64, key: &str) -> AppResult<Vec<Payment>>;
    async fn history(&self, user_id: i64) -> AppResult<Vec<PaymentHistoryEntry>>;
    /// Переводит pending/failed в paid одним оператором; уже оплаченные не трогает.
    async fn mark_paid(&self, ids: &[i64], settlement: &Settlement) -> AppResult<u64>;
    async fn count_paid_for_bill(&self, bill_id: i64) -> AppResult<i64>;
}

#[derive(Clone)]
pub struct PgPaymentRepository {
    pool: PgPool,
}

impl PgPaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PaymentRepository for PgPaymentRepository {
    async fn create(&self, bill_id: i64, user_id: i64, amount: Decimal) -> AppResult<Payment> {
        sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (bill_id, user_id, amount, status)
            VALUES ($1, $2, $3, 'pending')
            RETURNING *
            "#,
        )
        .bind(bill_id)
        .bind(user_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::from_unique_violation(e, "Платёж для жильца уже создан"))
    }

    async fn find_by_bill_and_user(
        &self,
        bill_id: i64,
        user_id: i64,
    ) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE bill_id = $1 AND user_id = $2",
        )
        .bind(bill_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    async fn list_by_bill(&self, bill_id: i64) -> AppResult<Vec<Payment>> {
        let payments =
            sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE bill_id = $1 ORDER BY user_id")
                .bind(bill_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(payments)
    }

    async fn list_unpaid_by_user(&self, user_id: i64) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE user_id = $1 AND status <> 'paid' ORDER BY bill_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn list_by_idempotency_key(&self, user_id: i64, key: &str) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE user_id = $1 AND idempotency_key = $2 ORDER BY bill_id",
        )
        .bind(user_id)
        .bind(key)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    async fn history(&self, user_id: i64) -> AppResult<Vec<PaymentHistoryEntry>> {
        let entries = sqlx::query_as::<_, PaymentHistoryEntry>(
            r#"
            SELECT
                p.id AS payment_id,
                p.bill_id,
                b.apartment_id,
                b.bill_type,
                p.amount,
                p.status,
                p.paid_at,
                p.payment_reference
            FROM payments p
            JOIN bills b ON b.id = p.bill_id
            WHERE p.user_id = $1 AND p.status = 'paid'
            ORDER BY p.paid_at DESC, p.id DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn mark_paid(&self, ids: &[i64], settlement: &Settlement) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'paid', paid_at = $2, payment_reference = $3, idempotency_key = $4
            WHERE id = ANY($1) AND status IN ('pending', 'failed')
            "#,
        )
        .bind(ids)
        .bind(settlement.paid_at)
        .bind(&settlement.reference)
        .bind(&settlement.idempotency_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn count_paid_for_bill(&self, bill_id: i64) -> AppResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM payments WHERE bill_id = $1 AND status = 'paid'")
                .bind(bill_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
