use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Fee keyed by a (from_belt, to_belt) pair; NULL on a side is a wildcard.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BeltTestFee {
    pub id: Uuid,
    pub school_id: Uuid,
    pub from_belt: Option<String>,
    pub to_belt: Option<String>,
    pub amount_cents: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BeltTestPayment {
    pub id: Uuid,
    pub school_id: Uuid,
    pub fee_id: Option<Uuid>,
    pub student_id: Uuid,
    pub family_id: Option<Uuid>,
    pub profile_id: Option<Uuid>,
    pub from_belt: Option<String>,
    pub to_belt: String,
    pub status: String,
    pub amount_cents: i64,
    pub stripe_payment_intent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBeltFeeRequest {
    pub from_belt: Option<String>,
    pub to_belt: Option<String>,
    pub amount_cents: i64,
}

/// Raise pending belt-test payments for a set of candidates.
#[derive(Debug, Deserialize)]
pub struct CreateBeltTestPaymentsRequest {
    pub student_ids: Vec<Uuid>,
    pub to_belt: String,
}
