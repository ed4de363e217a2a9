pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use redis::Client as RedisClient;
use sqlx::PgPool;

use config::Config;
use services::email::EmailService;
use services::notifications::NotificationService;
use services::presence::PresenceService;
use services::stripe::StripeGateway;
use services::webhooks::WebhookReconciler;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub redis: redis::aio::MultiplexedConnection,
    pub redis_client: RedisClient,
    pub config: Arc<Config>,
    pub stripe: Arc<StripeGateway>,
    pub notifications: Arc<NotificationService>,
    pub presence: Arc<PresenceService>,
    pub webhooks: Arc<WebhookReconciler>,
    pub email: Option<Arc<EmailService>>,
}
