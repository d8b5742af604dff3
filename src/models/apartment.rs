use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Apartment {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub units_count: i32,
    pub manager_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Membership {
    pub user_id: i64,
    pub apartment_id: i64,
    pub is_manager: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewApartment {
    pub name: String,
    pub address: String,
    pub units_count: i32,
}

#[derive(Debug, Clone, Serialize, FromRow, ToSchema)]
pub struct ResidentInfo {
    pub user_id: i64,
    pub username: String,
    pub full_name: String,
    pub telegram_user: Option<String>,
    pub is_manager: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApartmentResponse {
    pub id: i64,
    pub name: String,
    pub address: String,
    pub units_count: i32,
    pub manager_id: i64,
    pub is_manager: bool,
}

impl ApartmentResponse {
    pub fn for_user(apartment: Apartment, user_id: i64) -> Self {
        Self {
            is_manager: apartment.manager_id == user_id,
            id: apartment.id,
            name: apartment.name,
            address: apartment.address,
            units_count: apartment.units_count,
            manager_id: apartment.manager_id,
        }
    }
}

// DTOs
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateApartmentRequest {
    pub name: String,
    pub address: String,
    pub units_count: i32,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateApartmentRequest {
    pub id: i64,
    pub name: Option<String>,
    pub address: Option<String>,
    pub units_count: Option<i32>,
}
