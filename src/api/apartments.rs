use axum::{
    extract::{Query, State},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use utoipa::IntoParams;

use crate::api::{ok, IdQuery};
use crate::error::{AppError, AppResult};
use crate::middleware::{AppState, AuthUser, ManagerUser};
use crate::models::{
    Apartment, ApartmentResponse, CreateApartmentRequest, InviteRequest, IssuedInvitation,
    NewApartment, RedeemedInvitation, ResidentInfo, UpdateApartmentRequest,
};
use crate::utils::validators::{non_empty, sanitize_string};

#[derive(Debug, Deserialize, IntoParams)]
pub struct JoinQuery {
    /// Токен приглашения
    pub token: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct LeaveQuery {
    pub apartment_id: i64,
}

pub fn manager_routes() -> Router<AppState> {
    Router::new()
        .route("/apartment/create", post(create_apartment))
        .route("/apartment/get", get(get_apartment))
        .route("/apartment/update", put(update_apartment))
        .route("/apartment/delete", delete(delete_apartment))
        .route("/apartment/residents", get(list_residents))
        .route("/apartment/invite", post(invite_resident))
}

pub fn resident_routes() -> Router<AppState> {
    Router::new()
        .route("/apartments", get(my_apartments))
        .route("/apartment/join", post(join_apartment))
        .route("/apartment/leave", post(leave_apartment))
}

/// Дом, которым управляет вызывающий.
async fn managed_apartment(state: &AppState, user_id: i64, apartment_id: i64) -> AppResult<Apartment> {
    let apartment = state
        .apartments
        .find_by_id(apartment_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Дом не найден".to_string()))?;

    state.access.require_manager(user_id, apartment.id).await?;
    Ok(apartment)
}

fn validate_units(units_count: i32) -> AppResult<i32> {
    if units_count < 1 {
        return Err(AppError::BadRequest(
            "Количество квартир должно быть не меньше 1".to_string(),
        ));
    }
    Ok(units_count)
}

/// Создание дома
#[utoipa::path(
    post,
    path = "/v1/manager/apartment/create",
    tag = "apartments",
    security(("bearer_auth" = [])),
    request_body = CreateApartmentRequest,
    responses(
        (status = 200, description = "Дом создан", body = ApartmentResponse),
        (status = 400, description = "Ошибка валидации"),
        (status = 401, description = "Не авторизован или не управляющий")
    )
)]
pub async fn create_apartment(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Json(payload): Json<CreateApartmentRequest>,
) -> AppResult<Json<Value>> {
    let name = sanitize_string(&payload.name);
    let address = sanitize_string(&payload.address);
    if name.is_empty() || address.is_empty() {
        return Err(AppError::BadRequest(
            "Название и адрес обязательны".to_string(),
        ));
    }

    let apartment = state
        .apartments
        .create_with_manager(
            &NewApartment {
                name,
                address,
                units_count: validate_units(payload.units_count)?,
            },
            manager.user_id,
        )
        .await?;

    tracing::info!("Apartment {} created by {}", apartment.id, manager.user_id);
    Ok(ok(
        "Дом создан",
        ApartmentResponse::for_user(apartment, manager.user_id),
    ))
}

/// Получение дома
#[utoipa::path(
    get,
    path = "/v1/manager/apartment/get",
    tag = "apartments",
    security(("bearer_auth" = [])),
    params(IdQuery),
    responses(
        (status = 200, description = "Дом", body = ApartmentResponse),
        (status = 403, description = "Не управляющий этого дома"),
        (status = 404, description = "Дом не найден")
    )
)]
pub async fn get_apartment(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<Value>> {
    let apartment = managed_apartment(&state, manager.user_id, query.id).await?;
    Ok(ok(
        "Дом",
        ApartmentResponse::for_user(apartment, manager.user_id),
    ))
}

/// Обновление дома
#[utoipa::path(
    put,
    path = "/v1/manager/apartment/update",
    tag = "apartments",
    security(("bearer_auth" = [])),
    request_body = UpdateApartmentRequest,
    responses(
        (status = 200, description = "Дом обновлён", body = ApartmentResponse),
        (status = 400, description = "Ошибка валидации"),
        (status = 403, description = "Не управляющий этого дома"),
        (status = 404, description = "Дом не найден")
    )
)]
pub async fn update_apartment(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Json(payload): Json<UpdateApartmentRequest>,
) -> AppResult<Json<Value>> {
    let mut apartment = managed_apartment(&state, manager.user_id, payload.id).await?;

    if let Some(name) = non_empty(payload.name) {
        apartment.name = name;
    }
    if let Some(address) = non_empty(payload.address) {
        apartment.address = address;
    }
    if let Some(units_count) = payload.units_count {
        apartment.units_count = validate_units(units_count)?;
    }

    let apartment = state.apartments.update(&apartment).await?;
    Ok(ok(
        "Дом обновлён",
        ApartmentResponse::for_user(apartment, manager.user_id),
    ))
}

/// Удаление дома вместе со счетами, платежами и членствами
#[utoipa::path(
    delete,
    path = "/v1/manager/apartment/delete",
    tag = "apartments",
    security(("bearer_auth" = [])),
    params(IdQuery),
    responses(
        (status = 200, description = "Дом удалён"),
        (status = 403, description = "Не управляющий этого дома"),
        (status = 404, description = "Дом не найден")
    )
)]
pub async fn delete_apartment(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<Value>> {
    let apartment = managed_apartment(&state, manager.user_id, query.id).await?;

    if !state.apartments.delete(apartment.id).await? {
        return Err(AppError::NotFound("Дом не найден".to_string()));
    }

    tracing::info!("Apartment {} deleted by {}", apartment.id, manager.user_id);
    Ok(ok("Дом удалён", apartment.id))
}

/// Жильцы дома
#[utoipa::path(
    get,
    path = "/v1/manager/apartment/residents",
    tag = "apartments",
    security(("bearer_auth" = [])),
    params(IdQuery),
    responses(
        (status = 200, description = "Список жильцов", body = Vec<ResidentInfo>),
        (status = 403, description = "Не управляющий этого дома"),
        (status = 404, description = "Дом не найден")
    )
)]
pub async fn list_residents(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Query(query): Query<IdQuery>,
) -> AppResult<Json<Value>> {
    let apartment = managed_apartment(&state, manager.user_id, query.id).await?;
    let residents = state.memberships.list_residents(apartment.id).await?;
    Ok(ok("Жильцы", residents))
}

/// Приглашение жильца через Telegram
#[utoipa::path(
    post,
    path = "/v1/manager/apartment/invite",
    tag = "apartments",
    security(("bearer_auth" = [])),
    request_body = InviteRequest,
    responses(
        (status = 200, description = "Приглашение создано", body = IssuedInvitation),
        (status = 400, description = "Неверное имя Telegram"),
        (status = 403, description = "Не управляющий этого дома"),
        (status = 404, description = "Пользователь не найден"),
        (status = 409, description = "Пользователь уже в доме")
    )
)]
pub async fn invite_resident(
    State(state): State<AppState>,
    ManagerUser(manager): ManagerUser,
    Json(payload): Json<InviteRequest>,
) -> AppResult<Json<Value>> {
    let issued = state
        .invitation_service
        .issue(
            manager.user_id,
            payload.apartment_id,
            &payload.telegram_username,
        )
        .await?;

    let message = if issued.delivered {
        "Приглашение отправлено"
    } else {
        "Приглашение создано, но не доставлено"
    };
    Ok(ok(message, issued))
}

/// Дома текущего пользователя
#[utoipa::path(
    get,
    path = "/v1/resident/apartments",
    tag = "apartments",
    security(("bearer_auth" = [])),
    responses(
        (status = 200, description = "Список домов", body = Vec<ApartmentResponse>),
        (status = 401, description = "Не авторизован")
    )
)]
pub async fn my_apartments(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> AppResult<Json<Value>> {
    let apartments: Vec<ApartmentResponse> = state
        .apartments
        .list_for_user(auth_user.user_id)
        .await?
        .into_iter()
        .map(|a| ApartmentResponse::for_user(a, auth_user.user_id))
        .collect();
    Ok(ok("Дома", apartments))
}

/// Присоединение к дому по приглашению
#[utoipa::path(
    post,
    path = "/v1/resident/apartment/join",
    tag = "apartments",
    security(("bearer_auth" = [])),
    params(JoinQuery),
    responses(
        (status = 200, description = "Вы присоединились к дому", body = RedeemedInvitation),
        (status = 404, description = "Приглашение не найдено"),
        (status = 409, description = "Уже в доме"),
        (status = 410, description = "Приглашение истекло или использовано")
    )
)]
pub async fn join_apartment(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<JoinQuery>,
) -> AppResult<Json<Value>> {
    let joined = state
        .invitation_service
        .redeem(auth_user.user_id, &query.token)
        .await?;
    Ok(ok("Вы присоединились к дому", joined))
}

/// Выход из дома
#[utoipa::path(
    post,
    path = "/v1/resident/apartment/leave",
    tag = "apartments",
    security(("bearer_auth" = [])),
    params(LeaveQuery),
    responses(
        (status = 200, description = "Вы покинули дом"),
        (status = 403, description = "Вы не состоите в доме"),
        (status = 409, description = "Управляющий не может покинуть свой дом")
    )
)]
pub async fn leave_apartment(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<LeaveQuery>,
) -> AppResult<Json<Value>> {
    let membership = state
        .memberships
        .find(auth_user.user_id, query.apartment_id)
        .await?
        .ok_or(AppError::Forbidden)?;

    if membership.is_manager {
        return Err(AppError::Conflict(
            "Управляющий не может покинуть свой дом".to_string(),
        ));
    }

    state
        .memberships
        .remove(auth_user.user_id, query.apartment_id)
        .await?;

    tracing::info!(
        "User {} left apartment {}",
        auth_user.user_id,
        query.apartment_id
    );
    Ok(ok("Вы покинули дом", query.apartment_id))
}
