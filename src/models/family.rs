use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Billing aggregate: guardians and minor students sharing one payment method.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Family {
    pub id: Uuid,
    pub school_id: Uuid,
    pub name: String,
    pub billing_email: Option<String>,
    pub primary_holder_id: Option<Uuid>,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
    #[serde(skip_serializing)]
    pub default_payment_method_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateFamilyRequest {
    pub name: String,
    pub billing_email: Option<String>,
    pub primary_holder_id: Option<Uuid>,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateFamilyRequest {
    pub name: Option<String>,
    pub billing_email: Option<String>,
    pub primary_holder_id: Option<Uuid>,
}
