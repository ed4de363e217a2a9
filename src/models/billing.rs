use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Ledger row recording completed or failed money movement.
/// Written only by the webhook reconciler.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlatformPayment {
    pub id: Uuid,
    pub school_id: Uuid,
    pub charge_type: String,
    pub reference_id: Option<Uuid>,
    pub amount_cents: i64,
    pub platform_fee_cents: i64,
    pub net_cents: i64,
    pub status: String,
    pub stripe_payment_intent_id: Option<String>,
    pub stripe_invoice_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CustomCharge {
    pub id: Uuid,
    pub school_id: Uuid,
    pub family_id: Option<Uuid>,
    pub profile_id: Option<Uuid>,
    pub description: String,
    pub amount_cents: i64,
    pub status: String,
    pub stripe_payment_intent_id: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
}

/// Shared body of the three pay endpoints.
#[derive(Debug, Deserialize)]
pub struct PayRequest {
    pub payment_id: Uuid,
    pub payment_method_id: Option<String>,
    #[serde(default)]
    pub save_card: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateCustomChargeRequest {
    pub family_id: Option<Uuid>,
    pub profile_id: Option<Uuid>,
    pub description: String,
    pub amount_cents: i64,
}

#[derive(Debug, Serialize)]
pub struct CardSummary {
    pub id: String,
    pub brand: String,
    pub last4: String,
    pub exp_month: i64,
    pub exp_year: i64,
}
