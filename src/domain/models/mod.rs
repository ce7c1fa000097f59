pub mod money;
pub mod recurring;
pub mod transaction;
