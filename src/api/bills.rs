use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    routing::{delete, get, post, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use utoipa::IntoParams;

use crate::api::{ok, IdQuery};
use crate::error::{AppError, AppResult};
use crate::middleware::{AppState, AuthUser, ManagerUser, RequestStarted};
use crate::models::{
    BillFields, BillResponse, BillType, BillWithPaymentStatus, CreateBillResponse, ImageUpload,
    PayBillsRequest, PayBillsResponse, PaymentHistoryEntry, UnpaidBill, UpdateBillRequest,
};
use crate::services::file_service::MAX_IMAGE_SIZE;

#[derive(Debug, Deserialize, IntoParams)]
pub struct BillsQuery {
    /// Тип счёта: water, electricity, gas, maintenance, other
    #[serde(rename = "type")]
    pub bill_type: Option<String>,
    /// Только счета без платежей
    pub undivided: Option<bool>,
}

/// Форма создания счёта, только для документации multipart-запроса.
#[allow(dead_code)]
#[derive(Deserialize, utoipa::ToSchema)]
pub struct CreateBillForm {
    /// water, electricity, gas, maintenance, other
    #[serde(rename = "type")]
    #[schema(example = "water")]
    bill_type: String,
    #[schema(example = "100.00")]
    total_amount: String,
    #[schema(example = "2024-01-15")]
    due_date: String,
    billing_deadline: Option<String>,
    description: Option<String>,
    /// JPEG, PNG, GIF или WebP до 10 МБ
    #[schema(value_type = String, format = Binary)]
    image: Option<Vec<u8>>,
}

pub fn manager_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/apartment/:id/bills",
            post(create_bill)
                .layer(DefaultBodyLimit::max(MAX_IMAGE_SIZE + 1024 * 1024))
                .get(list_bills),
        )
        .route("/bills/divide", post(divide_bill))
        .route("/bills/update", put(update_bill))
        .route("/bills/delete", delete(delete_bill))
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(get_bill))
        .route("/status", get(get_bill_status))
        .route("/pay", post(pay_bills))
        .route("/unpaid", get(unpaid_bills))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new().route("/history", get(payment_history))
}

fn field_error(e: impl std::fmt::Display) -> AppError {
    AppError::BadRequest(e.to_string())
}

/// Создание счёта с делением между жильцами (multipart/form-data)
///
/// Поля: `type`, `total_amount`, `due_date`, `billing_deadline`, `description`
/// и необязательный файл `image`.
#[utoipa::path(
    post,
    path = "/v1/manager/apartment/{id}/bills",
    tag = "bills",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "ID дома")
    ),
    request_body(
        content = CreateBillForm,
        content_type = "multipart/form-data",
        description = "Поля счёта и изображение квитанции"
    ),
    responses(
        (status = 200, description = "Счёт создан и разделён", body = CreateBillResponse),
        (status = 400, description = "Ошибка валидации"),
        (status = 403, description = "Не управляющий этого дома"),
        (status = 409, description = "В доме нет жильцов")
    )
)]
pub async fn create_bill(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Extension(RequestStarted(started)): Extension<RequestStarted>,
    Path(apartment_id): Path<i64>,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    let mut fields = BillFields::default();
    let mut image = None;

    while let Some(field) = multipart.next_field().await.map_err(field_error)? {
        let name = field.name().unwrap_or("").to_string();

        match name.as_str() {
            "image" => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let filename = field.file_name().unwrap_or("receipt.jpg").to_string();
                let bytes = field.bytes().await.map_err(field_error)?;

                if bytes.is_empty() {
                    continue;
                }
                image = Some(ImageUpload {
                    bytes: bytes.to_vec(),
                    filename,
                    content_type,
                });
            }
            "type" => fields.bill_type = field.text().await.map_err(field_error)?,
            "total_amount" => fields.total_amount = field.text().await.map_err(field_error)?,
            "due_date" => fields.due_date = field.text().await.map_err(field_error)?,
            "billing_deadline" => {
                fields.billing_deadline = Some(field.text().await.map_err(field_error)?)
            }
            "description" => fields.description = Some(field.text().await.map_err(field_error)?),
            _ => {}
        }
    }

    let created = state
        .bill_service
        .create_and_divide_until(
            state.bill_service.deadline_from(started),
            manager.user_id,
            apartment_id,
            fields,
            image,
        )
        .await?;

    let message = if created.warning.is_some() {
        "Счёт создан, но платежи созданы не для всех жильцов"
    } else {
        "Счёт создан и разделён"
    };
    Ok(ok(message, created))
}

/// Счета дома
#[utoipa::path(
    get,
    path = "/v1/manager/apartment/{id}/bills",
    tag = "bills",
    security(("bearer_auth" = [])),
    params(
        ("id" = i64, Path, description = "ID дома"),
        BillsQuery
    ),
    responses(
        (status = 200, description = "Список счетов", body = Vec<BillResponse>),
        (status = 400, description = "Неверный тип счёта"),
        (status = 403, description = "Не управляющий этого дома")
    )
)]
pub async fn list_bills(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Path(apartment_id): Path<i64>,
    Query(query): Query<BillsQuery>,
) -> AppResult<Json<Value>> {
    let bill_type = match query.bill_type.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(value) => Some(
            BillType::parse(value)
                .ok_or_else(|| AppError::BadRequest("Неверный тип счёта".to_string()))?,
        ),
    };

    let bills = state
        .bill_service
        .list_bills(
            manager.user_id,
            apartment_id,
            bill_type,
            query.undivided.unwrap_or(false),
        )
        .await?;
    Ok(ok("Счета", bills))
}

/// Деление ранее созданного счёта
#[utoipa::path(
    post,
    path = "/v1/manager/bills/divide",
    tag = "bills",
    security(("bearer_auth" = [])),
    params(IdQuery),
    responses(
        (status = 200, description = "Счёт разделён", body = CreateBillResponse),
        (status = 403, description = "Не управляющий этого дома"),
        (status = 404, description = "Счёт не найден"),
        (status = 409, description = "Счёт уже разделён или нет жильцов")
    )
)]
pub async fn divide_bill(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Extension(RequestStarted(started)): Extension<RequestStarted>,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<Value>> {
    let divided = state
        .bill_service
        .divide_existing_until(
            state.bill_service.deadline_from(started),
            manager.user_id,
            query.id,
        )
        .await?;
    Ok(ok("Счёт разделён", divided))
}

/// Обновление счёта
#[utoipa::path(
    put,
    path = "/v1/manager/bills/update",
    tag = "bills",
    security(("bearer_auth" = [])),
    request_body = UpdateBillRequest,
    responses(
        (status = 200, description = "Счёт обновлён", body = BillResponse),
        (status = 400, description = "Ошибка валидации"),
        (status = 403, description = "Не управляющий этого дома"),
        (status = 409, description = "Сумма разделённого счёта не меняется")
    )
)]
pub async fn update_bill(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Json(payload): Json<UpdateBillRequest>,
) -> AppResult<Json<Value>> {
    let bill = state
        .bill_service
        .update_bill(manager.user_id, payload)
        .await?;
    Ok(ok("Счёт обновлён", bill))
}

/// Удаление счёта
#[utoipa::path(
    delete,
    path = "/v1/manager/bills/delete",
    tag = "bills",
    security(("bearer_auth" = [])),
    params(IdQuery),
    responses(
        (status = 200, description = "Счёт удалён"),
        (status = 403, description = "Не управляющий этого дома"),
        (status = 404, description = "Счёт не найден"),
        (status = 409, description = "По счёту уже есть оплаты")
    )
)]
pub async fn delete_bill(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<Value>> {
    state
        .bill_service
        .delete_bill(manager.user_id, query.id)
        .await?;
    Ok(ok("Счёт удалён", query.id))
}

/// Счёт по ID
#[utoipa::path(
    get,
    path = "/v1/bills",
    tag = "bills",
    security(("bearer_auth" = [])),
    params(IdQuery),
    responses(
        (status = 200, description = "Счёт", body = BillResponse),
        (status = 403, description = "Не состоите в доме"),
        (status = 404, description = "Счёт не найден")
    )
)]
pub async fn get_bill(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<Value>> {
    let bill = state
        .bill_service
        .get_bill(auth_user.user_id, query.id)
        .await?;
    Ok(ok("Счёт", bill))
}

/// Счёт и статус доли текущего пользователя
#[utoipa::path(
    get,
    path = "/v1/bills/status",
    tag = "bills",
    security(("bearer_auth" = [])),
    params(IdQuery),
    responses(
        (status = 200, description = "Счёт со статусом оплаты", body = BillWithPaymentStatus),
        (status = 403, description = "Не состоите в доме"),
        (status = 404, description = "Счёт не найден")
    )
)]
pub async fn get_bill_status(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<Value>> {
    let status = state
        .bill_service
        .bill_with_payment_status(auth_user.user_id, query.id)
        .await?;
    Ok(ok("Статус оплаты", status))
}

/// Оплата счетов
#[utoipa::path(
    post,
    path = "/v1/bills/pay",
    tag = "bills",
    security(("bearer_auth" = [])),
    request_body = PayBillsRequest,
    responses(
        (status = 200, description = "Счета оплачены", body = PayBillsResponse),
        (status = 400, description = "Нет ключа идемпотентности"),
        (status = 403, description = "Счёт не принадлежит пользователю"),
        (status = 409, description = "Нет неоплаченных счетов"),
        (status = 502, description = "Платёжный шлюз отказал")
    )
)]
pub async fn pay_bills(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(payload): Json<PayBillsRequest>,
) -> AppResult<Json<Value>> {
    let paid = state
        .bill_service
        .pay_batch(auth_user.user_id, payload)
        .await?;
    Ok(ok("Оплата выполнена", paid))
}

/// Неоплаченные счета текущего пользователя
#[utoipa::path(
    get,
    path = "/v1/bills/unpaid",
    tag = "bills",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Неоплаченные счета", body = Vec<UnpaidBill>),
        (status = 401, description = "Не авторизован")
    )
)]
pub async fn unpaid_bills(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> AppResult<Json<Value>> {
    let bills = state.bill_service.unpaid_bills(auth_user.user_id).await?;
    Ok(ok("Неоплаченные счета", bills))
}

/// История оплат
#[utoipa::path(
    get,
    path = "/v1/payments/history",
    tag = "bills",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "История оплат", body = Vec<PaymentHistoryEntry>),
        (status = 401, description = "Не авторизован")
    )
)]
pub async fn payment_history(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> AppResult<Json<Value>> {
    let history = state.bill_service.payment_history(auth_user.user_id).await?;
    Ok(ok("История оплат", history))
}
