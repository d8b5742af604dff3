pub mod auth;

pub use auth::{
    auth_middleware, is_manager, AppState, AuthUser, ManagerUser, Repositories, RequestStarted,
    Sidecars, RESPONSE_MARGIN,
};
