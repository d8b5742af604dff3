use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::{AppError, AppResult};
use crate::models::{Apartment, Membership, NewApartment, ResidentInfo};

#[async_trait]
pub trait ApartmentRepository: Send + Sync {
    /// Создаёт дом и членство управляющего одной транзакцией.
    async fn create_with_manager(
        &self,
        apartment: &NewApartment,
        manager_id: i64,
    ) -> AppResult<Apartment>;
    async fn find_by_id(&self, id: i64) -> AppResult<Option<Apartment>>;
    async fn list_for_user(&self, user_id: i64) -> AppResult<Vec<Apartment>>;
    async fn update(&self, apartment: &Apartment) -> AppResult<Apartment>;
    /// Каскадно удаляет членства, счета и платежи.
    async fn delete(&self, id: i64) -> AppResult<bool>;
}

#[async_trait]
pub trait MembershipRepository: Send + Sync {
    async fn find(&self, user_id: i64, apartment_id: i64) -> AppResult<Option<Membership>>;
    /// Идемпотентная вставка: `false`, если пользователь уже состоит в доме.
    async fn add(&self, user_id: i64, apartment_id: i64, is_manager: bool) -> AppResult<bool>;
    async fn remove(&self, user_id: i64, apartment_id: i64) -> AppResult<bool>;
    async fn list_by_apartment(&self, apartment_id: i64) -> AppResult<Vec<Membership>>;
    async fn list_residents(&self, apartment_id: i64) -> AppResult<Vec<ResidentInfo>>;
}

#[derive(Clone)]
pub struct PgApartmentRepository {
    pool: PgPool,
}

impl PgApartmentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ApartmentRepository for PgApartmentRepository {
    async fn create_with_manager(
        &self,
        apartment: &NewApartment,
        manager_id: i64,
    ) -> AppResult<Apartment> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, Apartment>(
            r#"
            INSERT INTO apartments (name, address, units_count, manager_id)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(&apartment.name)
        .bind(&apartment.address)
        .bind(apartment.units_count)
        .bind(manager_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO memberships (user_id, apartment_id, is_manager) VALUES ($1, $2, true)",
        )
        .bind(manager_id)
        .bind(created.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(created)
    }

    async fn find_by_id(&self, id: i64) -> AppResult<Option<Apartment>> {
        let apartment = sqlx::query_as::<_, Apartment>("SELECT * FROM apartments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(apartment)
    }

    async fn list_for_user(&self, user_id: i64) -> AppResult<Vec<Apartment>> {
        let apartments = sqlx::query_as::<_, Apartment>(
            r#"
            SELECT a.* FROM apartments a
            JOIN memberships m ON m.apartment_id = a.id
            WHERE m.user_id = $1
            ORDER BY a.name
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(apartments)
    }

    async fn update(&self, apartment: &Apartment) -> AppResult<Apartment> {
        sqlx::query_as::<_, Apartment>(
            r#"
            UPDATE apartments
            SET name = $2, address = $3, units_count = $4, updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(apartment.id)
        .bind(&apartment.name)
        .bind(&apartment.address)
        .bind(apartment.units_count)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound("Дом не найден".to_string()))
    }

    async fn delete(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM apartments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[derive(Clone)]
pub struct PgMembershipRepository {
    pool: PgPool,
}

impl PgMembershipRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MembershipRepository for PgMembershipRepository {
    async fn find(&self, user_id: i64, apartment_id: i64) -> AppResult<Option<Membership>> {
        let membership = sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE user_id = $1 AND apartment_id = $2",
        )
        .bind(user_id)
        .bind(apartment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(membership)
    }

    async fn add(&self, user_id: i64, apartment_id: i64, is_manager: bool) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO memberships (user_id, apartment_id, is_manager)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, apartment_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(apartment_id)
        .bind(is_manager)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::from_unique_violation(e, "У дома уже есть управляющий"))?;

        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, user_id: i64, apartment_id: i64) -> AppResult<bool> {
        let result = sqlx::query(
            "DELETE FROM memberships WHERE user_id = $1 AND apartment_id = $2 AND NOT is_manager",
        )
        .bind(user_id)
        .bind(apartment_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_by_apartment(&self, apartment_id: i64) -> AppResult<Vec<Membership>> {
        let memberships = sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE apartment_id = $1 ORDER BY user_id",
        )
        .bind(apartment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(memberships)
    }

    async fn list_residents(&self, apartment_id: i64) -> AppResult<Vec<ResidentInfo>> {
        let residents = sqlx::query_as::<_, ResidentInfo>(
            r#"
            SELECT
                u.id AS user_id,
                u.username,
                u.full_name,
                u.telegram_user,
                m.is_manager,
                m.joined_at
            FROM memberships m
            JOIN users u ON u.id = m.user_id
            WHERE m.apartment_id = $1
            ORDER BY m.is_manager DESC, u.id
            "#,
        )
        .bind(apartment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(residents)
    }
}
