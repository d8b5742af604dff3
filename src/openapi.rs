use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Dom Billing API",
        version = "1.0.0",
        description = "Backend API для домов: деление счетов, приглашения жильцов, оплата"
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development server")
    ),
    tags(
        (name = "auth", description = "Регистрация и вход"),
        (name = "users", description = "Профиль пользователя"),
        (name = "apartments", description = "Дома, жильцы и приглашения"),
        (name = "bills", description = "Счета, деление и оплата"),
        (name = "telegram", description = "Webhook Telegram-бота")
    ),
    paths(
        // Auth
        crate::api::auth::signup,
        crate::api::auth::login,
        // Users
        crate::api::users::get_profile,
        crate::api::users::update_profile,
        // Apartments
        crate::api::apartments::create_apartment,
        crate::api::apartments::get_apartment,
        crate::api::apartments::update_apartment,
        crate::api::apartments::delete_apartment,
        crate::api::apartments::list_residents,
        crate::api::apartments::invite_resident,
        crate::api::apartments::my_apartments,
        crate::api::apartments::join_apartment,
        crate::api::apartments::leave_apartment,
        // Bills
        crate::api::bills::create_bill,
        crate::api::bills::list_bills,
        crate::api::bills::divide_bill,
        crate::api::bills::update_bill,
        crate::api::bills::delete_bill,
        crate::api::bills::get_bill,
        crate::api::bills::get_bill_status,
        crate::api::bills::pay_bills,
        crate::api::bills::unpaid_bills,
        crate::api::bills::payment_history,
        // Telegram
        crate::api::telegram::webhook,
    ),
    components(
        schemas(
            // Users
            crate::models::UserRole,
            crate::models::UserPublic,
            crate::models::SignupRequest,
            crate::models::LoginRequest,
            crate::models::AuthResponse,
            crate::models::UpdateProfileRequest,
            // Apartments
            crate::models::ApartmentResponse,
            crate::models::CreateApartmentRequest,
            crate::models::UpdateApartmentRequest,
            crate::models::ResidentInfo,
            // Invitations
            crate::models::InviteRequest,
            crate::models::IssuedInvitation,
            crate::models::RedeemedInvitation,
            // Bills
            crate::models::BillType,
            crate::models::PaymentStatus,
            crate::models::BillResponse,
            crate::models::BillWarning,
            crate::models::CreateBillResponse,
            crate::models::PaymentInfo,
            crate::models::BillWithPaymentStatus,
            crate::models::UnpaidBill,
            crate::models::PaymentHistoryEntry,
            crate::models::UpdateBillRequest,
            crate::api::bills::CreateBillForm,
            crate::models::PayBillsRequest,
            crate::models::PayBillsResponse,
            // Telegram
            crate::services::telegram_service::TelegramUpdate,
            crate::services::telegram_service::TelegramMessage,
            crate::services::telegram_service::TelegramChat,
            crate::services::telegram_service::TelegramUser,
        )
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::Http::new(
                        utoipa::openapi::security::HttpAuthScheme::Bearer,
                    ),
                ),
            );
        }
    }
}
