pub mod money;
pub mod validators;
