pub mod apartment;
pub mod bill;
pub mod invitation;
pub mod user;

pub use apartment::*;
pub use bill::*;
pub use invitation::*;
pub use user::*;
