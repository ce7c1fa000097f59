pub mod category_service;
pub mod commands;
pub mod error;
pub mod execution_policy;
pub mod models;
pub mod recurring_service;
