use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Event {
    pub id: Uuid,
    pub school_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    /// NULL = free event.
    pub fee_cents: Option<i64>,
    pub max_capacity: Option<i32>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EventRegistration {
    pub id: Uuid,
    pub event_id: Uuid,
    pub student_id: Uuid,
    pub registered_by: Option<Uuid>,
    pub payment_status: String,
    pub amount_cents: i64,
    pub stripe_payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateEventRequest {
    pub title: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub fee_cents: Option<i64>,
    pub max_capacity: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateEventRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub fee_cents: Option<i64>,
    pub max_capacity: Option<i32>,
}

/// Self-service registration: one or several students at once.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub event_id: Uuid,
    pub student_ids: Vec<Uuid>,
}

/// Owner-initiated bulk registration with an auto-charge attempt.
#[derive(Debug, Deserialize)]
pub struct OwnerRegisterRequest {
    pub event_id: Uuid,
    pub student_ids: Vec<Uuid>,
}

#[derive(Debug, Default, Serialize)]
pub struct BulkRegistrationOutcome {
    pub registered: usize,
    pub charged: usize,
    pub pending_payment: usize,
    pub skipped: usize,
}
