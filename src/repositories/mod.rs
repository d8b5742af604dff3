pub mod apartments;
pub mod bills;
pub mod invitations;
pub mod payments;
pub mod users;

pub use apartments::{
    ApartmentRepository, MembershipRepository, PgApartmentRepository, PgMembershipRepository,
};
pub use bills::{BillRepository, PgBillRepository};
pub use invitations::{InvitationStore, MemoryInvitationStore, PgInvitationStore};
pub use payments::{PaymentRepository, PgPaymentRepository, Settlement};
pub use users::{PgUserRepository, UserRepository};
