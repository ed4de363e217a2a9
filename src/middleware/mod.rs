pub mod auth;
pub mod platform_admin;
pub mod rate_limit;
pub mod school;
