pub mod access;
pub mod auth_service;
pub mod bill_service;
pub mod file_service;
pub mod invitation_service;
pub mod payment_gateway;
pub mod telegram_service;

pub use access::AccessOracle;
pub use auth_service::{AuthService, Claims};
pub use bill_service::{BillService, BillingPolicy};
pub use file_service::{FileService, ImageStore};
pub use invitation_service::InvitationService;
pub use payment_gateway::{GatewayError, GatewayReceipt, PaymentGateway, SandboxGateway};
pub use telegram_service::{Notifier, TelegramService};
