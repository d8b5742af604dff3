use axum::{
    body::Body,
    extract::{FromRequestParts, State},
    http::{request::Parts, Request},
    middleware::Next,
    response::Response,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::AppError;
use crate::models::UserRole;
use crate::repositories::{
    ApartmentRepository, BillRepository, InvitationStore, MembershipRepository,
    PaymentRepository, UserRepository,
};
use crate::services::{
    AccessOracle, AuthService, BillService, BillingPolicy, ImageStore, InvitationService,
    Notifier, PaymentGateway,
};

#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user_id: i64,
    pub role: UserRole,
}

/// Момент, когда запрос прошёл внешний `TimeoutLayer`.
#[derive(Clone, Copy, Debug)]
pub struct RequestStarted(pub Instant);

/// Запас между сроком деления счёта и таймаутом всего запроса:
/// за это время handler успевает собрать ответ с `warning`.
pub const RESPONSE_MARGIN: Duration = Duration::from_secs(1);

/// Пользователь с ролью управляющего; для маршрутов `/v1/manager/*`.
#[derive(Clone, Debug)]
pub struct ManagerUser(pub AuthUser);

/// Хранилища, которые собираются в точке входа.
pub struct Repositories {
    pub users: Arc<dyn UserRepository>,
    pub apartments: Arc<dyn ApartmentRepository>,
    pub memberships: Arc<dyn MembershipRepository>,
    pub bills: Arc<dyn BillRepository>,
    pub payments: Arc<dyn PaymentRepository>,
    pub invitations: Arc<dyn InvitationStore>,
}

/// Внешние сервисы: изображения, чат, платёжный шлюз.
pub struct Sidecars {
    pub images: Arc<dyn ImageStore>,
    pub notifier: Arc<dyn Notifier>,
    pub gateway: Arc<dyn PaymentGateway>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: AuthService,
    pub users: Arc<dyn UserRepository>,
    pub apartments: Arc<dyn ApartmentRepository>,
    pub memberships: Arc<dyn MembershipRepository>,
    pub access: AccessOracle,
    pub notifier: Arc<dyn Notifier>,
    pub invitation_service: Arc<InvitationService>,
    pub bill_service: Arc<BillService>,
}

impl AppState {
    pub fn new(config: Config, repos: Repositories, sidecars: Sidecars) -> Self {
        let access = AccessOracle::new(repos.memberships.clone());

        let invitation_service = Arc::new(InvitationService::new(
            repos.invitations,
            repos.users.clone(),
            repos.apartments.clone(),
            repos.memberships.clone(),
            access.clone(),
            sidecars.notifier.clone(),
            chrono::Duration::seconds(config.invite_store.ttl_secs),
            config.app_base_url.clone(),
        ));

        let policy = BillingPolicy {
            include_manager_in_split: config.billing.include_manager_in_split,
            request_deadline: Duration::from_secs(config.server.request_timeout_secs)
                .saturating_sub(RESPONSE_MARGIN),
            gateway_timeout: Duration::from_secs(config.payments.timeout_secs),
        };
        let bill_service = Arc::new(BillService::new(
            repos.bills,
            repos.payments,
            repos.memberships.clone(),
            access.clone(),
            sidecars.images,
            sidecars.notifier.clone(),
            sidecars.gateway,
            policy,
        ));

        Self {
            auth: AuthService::new(config.auth.clone()),
            config: Arc::new(config),
            users: repos.users,
            apartments: repos.apartments,
            memberships: repos.memberships,
            access,
            notifier: sidecars.notifier,
            invitation_service,
            bill_service,
        }
    }
}

pub fn is_manager(role: &UserRole) -> bool {
    matches!(role, UserRole::Manager)
}

// Middleware для добавления AppState в extensions
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    request.extensions_mut().insert(state);
    request
        .extensions_mut()
        .insert(RequestStarted(Instant::now()));
    next.run(request).await
}

// Экстрактор для авторизованного пользователя
#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let app_state = parts
            .extensions
            .get::<AppState>()
            .cloned()
            .ok_or_else(|| AppError::Internal("application state is not attached".to_string()))?;

        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Unauthorized)?;

        let claims = app_state
            .auth
            .verify_token(bearer.token())
            .map_err(|_| AppError::Unauthorized)?;

        if claims.token_type != "access" {
            return Err(AppError::Unauthorized);
        }

        let user_id = claims
            .sub
            .parse::<i64>()
            .map_err(|_| AppError::Unauthorized)?;
        let role = UserRole::parse(&claims.role).ok_or(AppError::Unauthorized)?;

        Ok(AuthUser { user_id, role })
    }
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for ManagerUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !is_manager(&user.role) {
            return Err(AppError::Unauthorized);
        }
        Ok(ManagerUser(user))
    }
}
