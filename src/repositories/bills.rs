use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::models::{Bill, BillType, NewBill};

#[async_trait]
pub trait BillRepository: Send + Sync {
    async fn create(&self, bill: &NewBill) -> AppResult<Bill>;
    async fn find_by_id(&self, id: i64) -> AppResult<Option<Bill>>;
    async fn list_by_apartment(&self, apartment_id: i64) -> AppResult<Vec<Bill>>;
    /// Счета дома без платежей, опционально только заданного типа.
    async fn list_undivided(
        &self,
        apartment_id: i64,
        bill_type: Option<BillType>,
    ) -> AppResult<Vec<Bill>>;
    async fn update(&self, bill: &Bill) -> AppResult<Bill>;
    /// Платежи удаляются каскадно.
    async fn delete(&self, id: i64) -> AppResult<bool>;
}

#[derive(Clone)]
pub struct PgBillRepository {
    pool: PgPool,
}

impl PgBillRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillRepository for PgBillRepository {
    async fn create(&self, bill: &NewBill) -> AppResult<Bill> {
        let created = sqlx::query_as::<_, Bill>(
            r#"
            INSERT INTO bills
                (apartment_id, bill_type, total_amount, due_date, billing_deadline, description, image_key)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(bill.apartment_id)
        .bind(bill.bill_type)
        .bind(bill.total_amount)
        .bind(bill.due_date)
        .bind(bill.billing_deadline)
        .bind(&bill.description)
        .bind(&bill.image_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> AppResult<Option<Bill>> {
        let bill = sqlx::query_as::<_, Bill>("SELECT * FROM bills WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(bill)
    }

    async fn list_by_apartment(&self, apartment_id: i64) -> AppResult<Vec<Bill>> {
        let bills = sqlx::query_as::<_, Bill>(
            "SELECT * FROM bills WHERE apartment_id = $1 ORDER BY due_date DESC, id DESC",
        )
        .bind(apartment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bills)
    }

    async fn list_undivided(
        &self,
        apartment_id: i64,
        bill_type: Option<BillType>,
    ) -> AppResult<Vec<Bill>> {
        let bills = sqlx::query_as::<_, Bill>(
            r#"
            SELECT b.* FROM bills b
            WHERE b.apartment_id = $1
              AND ($2::bill_type IS NULL OR b.bill_type = $2)
              AND NOT EXISTS (SELECT 1 FROM payments p WHERE p.bill_id = b.id)
            ORDER BY b.due_date DESC, b.id DESC
            "#,
        )
        .bind(apartment_id)
        .bind(bill_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(bills)
    }

    async fn update(&self, bill: &Bill) -> AppResult<Bill> {
        sqlx::query_as::<_, Bill>(
            r#"
            UPDATE bills
            SET
                bill_type = $2,
                total_amount = $3,
                due_date = $4,
                billing_deadline = $5,
                description = $6,
                updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(bill.id)
        .bind(bill.bill_type)
        .bind(bill.total_amount)
        .bind(bill.due_date)
        .bind(bill.billing_deadline)
        .bind(&bill.description)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Счёт не найден".to_string()))
    }

    async fn delete(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM bills WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
