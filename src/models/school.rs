use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trial,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// A successful invoice activates trialing and past-due schools.
    /// Cancellation is terminal; a stray invoice does not resurrect it.
    pub fn on_invoice_paid(self) -> Self {
        match self {
            SubscriptionStatus::Canceled => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::Active,
        }
    }

    /// Only an active school is demoted by a failed invoice.
    pub fn on_invoice_failed(self) -> Self {
        match self {
            SubscriptionStatus::Active => SubscriptionStatus::PastDue,
            other => other,
        }
    }

    pub fn on_subscription_deleted(self) -> Self {
        SubscriptionStatus::Canceled
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(SubscriptionStatus::Trial),
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            _ => Err(anyhow::anyhow!("Unknown subscription status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    Trial,
    Standard,
    FoundingPartner,
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Trial => "trial",
            SubscriptionPlan::Standard => "standard",
            SubscriptionPlan::FoundingPartner => "founding_partner",
        }
    }
}

impl std::fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionPlan {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trial" => Ok(SubscriptionPlan::Trial),
            "standard" => Ok(SubscriptionPlan::Standard),
            "founding_partner" => Ok(SubscriptionPlan::FoundingPartner),
            _ => Err(anyhow::anyhow!("Unknown subscription plan: {s}")),
        }
    }
}

/// Tenant root row. Status/plan are fetched as TEXT and parsed on demand.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct School {
    pub id: Uuid,
    pub name: String,
    pub subdomain: String,
    pub timezone: String,
    pub subscription_status: String,
    pub subscription_plan: String,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub billing_day: Option<i16>,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_account_id: Option<String>,
    #[serde(skip_serializing)]
    pub stripe_subscription_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl School {
    pub fn status(&self) -> SubscriptionStatus {
        self.subscription_status
            .parse()
            .unwrap_or(SubscriptionStatus::Trial)
    }

    pub fn plan(&self) -> SubscriptionPlan {
        self.subscription_plan
            .parse()
            .unwrap_or(SubscriptionPlan::Trial)
    }
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub subdomain: String,
    pub school_name: String,
    pub timezone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password: String,
}

/// Platform-operator override: sets the plan directly, bypassing Stripe.
#[derive(Debug, Deserialize)]
pub struct PlanOverrideRequest {
    pub plan: SubscriptionPlan,
    pub trial_ends_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_paid_activates_trial_and_past_due() {
        assert_eq!(
            SubscriptionStatus::Trial.on_invoice_paid(),
            SubscriptionStatus::Active
        );
        assert_eq!(
            SubscriptionStatus::PastDue.on_invoice_paid(),
            SubscriptionStatus::Active
        );
        assert_eq!(
            SubscriptionStatus::Active.on_invoice_paid(),
            SubscriptionStatus::Active
        );
    }

    #[test]
    fn invoice_paid_does_not_resurrect_canceled() {
        assert_eq!(
            SubscriptionStatus::Canceled.on_invoice_paid(),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn invoice_failed_demotes_only_active() {
        assert_eq!(
            SubscriptionStatus::Active.on_invoice_failed(),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            SubscriptionStatus::Trial.on_invoice_failed(),
            SubscriptionStatus::Trial
        );
        assert_eq!(
            SubscriptionStatus::PastDue.on_invoice_failed(),
            SubscriptionStatus::PastDue
        );
        assert_eq!(
            SubscriptionStatus::Canceled.on_invoice_failed(),
            SubscriptionStatus::Canceled
        );
    }

    #[test]
    fn subscription_deleted_cancels_from_any_state() {
        for s in [
            SubscriptionStatus::Trial,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Canceled,
        ] {
            assert_eq!(s.on_subscription_deleted(), SubscriptionStatus::Canceled);
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in ["trial", "active", "past_due", "canceled"] {
            let parsed: SubscriptionStatus = s.parse().unwrap();
            assert_eq!(parsed.as_str(), s);
        }
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }
}
