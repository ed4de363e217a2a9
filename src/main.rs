use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{delete, get, post, put},
    Router,
};
use redis::Client as RedisClient;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dojohub_api::{
    config::Config,
    db,
    middleware::auth::JwtSecret,
    routes,
    services::email::EmailService,
    services::notifications::NotificationService,
    services::presence::PresenceService,
    services::stripe::StripeGateway,
    services::webhooks::WebhookReconciler,
    AppState,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;
    info!("Database connected and migrations applied");

    let redis_client = RedisClient::open(config.redis_url.as_str())?;
    let redis_conn = redis_client.get_multiplexed_async_connection().await?;
    info!("Redis connected");

    let stripe = Arc::new(StripeGateway::new(&config));
    let notifications = Arc::new(NotificationService::new(redis_client.clone()));
    let presence = Arc::new(PresenceService::new(redis_client.clone()));

    let email = EmailService::new(&config).map(Arc::new);
    if email.is_some() {
        info!("SMTP email service configured");
    } else {
        info!("SMTP not configured — email features disabled");
    }

    let webhooks = Arc::new(WebhookReconciler::new(
        pool.clone(),
        notifications.clone(),
        email.clone(),
    ));

    let state = AppState {
        db: pool,
        redis: redis_conn,
        redis_client: redis_client.clone(),
        config: config.clone(),
        stripe,
        notifications,
        presence,
        webhooks,
        email,
    };

    // Build CORS: allow the app base domain and its subdomains (school
    // subdomains). In development (localhost), all origins are allowed.
    let cors_origin = {
        let base = config.app_base_url.clone();
        AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let o = match origin.to_str() {
                Ok(s) => s,
                Err(_) => return false,
            };
            if o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1") {
                return true;
            }
            if o == base {
                return true;
            }
            if let Some(idx) = base.find("://") {
                let after_scheme = &base[idx + 3..];
                let domain = after_scheme.split('/').next().unwrap_or(after_scheme);
                let domain_clean = domain.split(':').next().unwrap_or(domain);
                if o.contains(&format!(".{domain_clean}")) {
                    return true;
                }
            }
            false
        })
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-school"),
            header::HeaderName::from_static("x-admin-key"),
        ]))
        .allow_origin(cors_origin);

    let jwt_secret = JwtSecret(config.jwt_secret.clone());

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        // School lifecycle
        .route("/api/signup", post(routes::schools::signup))
        .route("/api/school", get(routes::schools::school_info).put(routes::schools::update_school))
        .route("/api/school/payout-account", put(routes::schools::set_payout_account))
        // Auth
        .route("/api/auth/login", post(routes::auth::login))
        .route("/api/auth/refresh", post(routes::auth::refresh_token))
        .route("/api/auth/logout", post(routes::auth::logout))
        .route("/api/auth/me", get(routes::auth::me))
        // Members & families
        .route("/api/members", get(routes::users::list_members).post(routes::users::create_member))
        .route("/api/members/{id}", put(routes::users::update_member).delete(routes::users::deactivate_member))
        .route("/api/families", get(routes::families::list_families).post(routes::families::create_family))
        .route("/api/families/mine", get(routes::families::my_family))
        .route("/api/families/{id}", put(routes::families::update_family))
        .route("/api/families/{id}/members", put(routes::families::set_family_members))
        // Classes & attendance
        .route("/api/classes", get(routes::classes::list_classes).post(routes::classes::create_class))
        .route("/api/classes/{id}", put(routes::classes::update_class).delete(routes::classes::delete_class))
        .route("/api/attendance", post(routes::attendance::record_attendance))
        .route("/api/attendance/class/{id}", get(routes::attendance::class_attendance))
        .route("/api/attendance/student/{id}", get(routes::attendance::student_attendance))
        // Events & registration
        .route("/api/events", get(routes::events::list_events).post(routes::events::create_event))
        .route("/api/events/register", post(routes::events::register))
        .route("/api/events/register-by-owner", post(routes::events::register_by_owner))
        .route("/api/events/{id}", put(routes::events::update_event).delete(routes::events::delete_event))
        .route("/api/events/{id}/registrations", get(routes::events::list_registrations))
        // Belt tests
        .route("/api/belt-tests/fees", get(routes::belt_tests::list_fees).post(routes::belt_tests::create_fee))
        .route("/api/belt-tests/fees/{id}", delete(routes::belt_tests::delete_fee))
        .route("/api/belt-tests/payments", get(routes::belt_tests::list_payments).post(routes::belt_tests::create_payments))
        // Billing
        .route("/api/pay/event", post(routes::billing::pay_event))
        .route("/api/pay/belt-test", post(routes::billing::pay_belt_test))
        .route("/api/pay/monthly", post(routes::billing::pay_monthly))
        .route("/api/payment-methods", get(routes::billing::list_payment_methods).post(routes::billing::add_payment_method))
        .route("/api/charges", get(routes::billing::list_charges).post(routes::billing::create_charge))
        .route("/api/billing/ledger", get(routes::billing::ledger))
        .route("/api/billing/webhook", post(routes::webhook::stripe_webhook))
        // Feed, announcements, notifications
        .route("/api/posts", get(routes::posts::list_posts).post(routes::posts::create_post))
        .route("/api/posts/{id}", delete(routes::posts::delete_post))
        .route("/api/announcements", get(routes::announcements::list_announcements).post(routes::announcements::create_announcement))
        .route("/api/announcements/{id}", delete(routes::announcements::retire_announcement))
        .route("/api/notifications", get(routes::notifications::list_notifications))
        .route("/api/notifications/unread-count", get(routes::notifications::unread_count))
        .route("/api/notifications/{id}/read", post(routes::notifications::mark_read))
        .route("/api/notifications/read-all", post(routes::notifications::mark_all_read))
        // Presence
        .route("/api/presence", get(routes::websocket::online_members))
        .route("/ws", get(routes::websocket::ws_handler))
        // Platform operator
        .route("/api/platform/schools", get(routes::schools::list_schools))
        .route("/api/platform/schools/{id}/plan", put(routes::schools::override_plan))
        .layer(axum::Extension(jwt_secret))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("dojohub API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
