use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "bill_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillType {
    Water,
    Electricity,
    Gas,
    Maintenance,
    Other,
}

impl BillType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "water" => Some(BillType::Water),
            "electricity" => Some(BillType::Electricity),
            "gas" => Some(BillType::Gas),
            "maintenance" => Some(BillType::Maintenance),
            "other" => Some(BillType::Other),
            _ => None,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            BillType::Water => "Вода",
            BillType::Electricity => "Электричество",
            BillType::Gas => "Газ",
            BillType::Maintenance => "Обслуживание",
            BillType::Other => "Прочее",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Bill {
    pub id: i64,
    pub apartment_id: i64,
    #[serde(rename = "type")]
    pub bill_type: BillType,
    pub total_amount: Decimal,
    pub due_date: NaiveDate,
    pub billing_deadline: Option<NaiveDate>,
    pub description: Option<String>,
    pub image_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Проверенные поля счёта, готовые к записи.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBill {
    pub apartment_id: i64,
    pub bill_type: BillType,
    pub total_amount: Decimal,
    pub due_date: NaiveDate,
    pub billing_deadline: Option<NaiveDate>,
    pub description: Option<String>,
    pub image_key: Option<String>,
}

/// Сырые поля счёта из запроса (multipart приносит только строки).
#[derive(Debug, Clone, Default)]
pub struct BillFields {
    pub bill_type: String,
    pub total_amount: String,
    pub due_date: String,
    pub billing_deadline: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub content_type: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl Default for PaymentStatus {
    fn default() -> Self {
        Self::Pending
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Payment {
    pub id: i64,
    pub bill_id: i64,
    pub user_id: i64,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_reference: Option<String>,
    #[serde(skip_serializing)]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    pub fn is_payable(&self) -> bool {
        matches!(self.status, PaymentStatus::Pending | PaymentStatus::Failed)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BillWarning {
    pub message: String,
    pub user_ids: Vec<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateBillResponse {
    pub bill_id: i64,
    pub residents_count: usize,
    pub amount_per_person: Decimal,
    pub image_uploaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<BillWarning>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BillResponse {
    pub id: i64,
    pub apartment_id: i64,
    #[serde(rename = "type")]
    pub bill_type: BillType,
    pub total_amount: Decimal,
    pub due_date: NaiveDate,
    pub billing_deadline: Option<NaiveDate>,
    pub description: Option<String>,
    pub image_url: String,
    pub created_at: DateTime<Utc>,
}

impl BillResponse {
    pub fn new(bill: Bill, image_url: String) -> Self {
        Self {
            id: bill.id,
            apartment_id: bill.apartment_id,
            bill_type: bill.bill_type,
            total_amount: bill.total_amount,
            due_date: bill.due_date,
            billing_deadline: bill.billing_deadline,
            description: bill.description,
            image_url,
            created_at: bill.created_at,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentInfo {
    pub payment_id: i64,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_reference: Option<String>,
}

impl From<Payment> for PaymentInfo {
    fn from(payment: Payment) -> Self {
        Self {
            payment_id: payment.id,
            amount: payment.amount,
            status: payment.status,
            paid_at: payment.paid_at,
            payment_reference: payment.payment_reference,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BillWithPaymentStatus {
    pub bill: BillResponse,
    pub payment: Option<PaymentInfo>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UnpaidBill {
    pub bill_id: i64,
    pub apartment_id: i64,
    #[serde(rename = "type")]
    pub bill_type: BillType,
    pub total_amount: Decimal,
    pub amount_due: Decimal,
    pub due_date: NaiveDate,
    pub billing_deadline: Option<NaiveDate>,
    pub description: Option<String>,
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Serialize, FromRow, ToSchema)]
pub struct PaymentHistoryEntry {
    pub payment_id: i64,
    pub bill_id: i64,
    pub apartment_id: i64,
    #[serde(rename = "type")]
    pub bill_type: BillType,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub payment_reference: Option<String>,
}

// DTOs
#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateBillRequest {
    pub id: i64,
    #[serde(rename = "type")]
    pub bill_type: Option<String>,
    pub total_amount: Option<Decimal>,
    pub due_date: Option<String>,
    pub billing_deadline: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PayBillsRequest {
    #[serde(default)]
    pub bill_ids: Vec<i64>,
    pub idempotency_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PayBillsResponse {
    pub bills_paid: usize,
    pub total_amount: Decimal,
    pub payment_reference: Option<String>,
}
