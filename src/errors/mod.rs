pub mod app_error;
pub mod auth_error;
