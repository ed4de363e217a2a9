pub mod authz;
pub mod billing;
pub mod email;
pub mod notifications;
pub mod presence;
pub mod stripe;
pub mod webhooks;
