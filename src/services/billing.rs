use std::collections::HashMap;

use serde_json::{json, Value};
use sqlx::PgPool;
use stripe::PaymentIntentStatus;
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::billing::PayRequest;
use crate::models::family::Family;
use crate::models::school::{School, SubscriptionPlan};
use crate::models::user::Profile;
use crate::services::stripe::{ConnectSplit, StripeGateway};

/// Per-plan platform cut, in basis points. Business parameter, not an
/// algorithmic concern.
fn plan_fee_bps(plan: SubscriptionPlan) -> i64 {
    match plan {
        SubscriptionPlan::FoundingPartner => 200,
        SubscriptionPlan::Standard => 350,
        SubscriptionPlan::Trial => 500,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub platform_fee_cents: i64,
    pub net_cents: i64,
}

/// "$12.34" rendering for notification and email copy.
pub fn format_cents(amount_cents: i64) -> String {
    format!("${}.{:02}", amount_cents / 100, (amount_cents % 100).abs())
}

/// Split a gross amount into the platform cut and the school's net.
/// Holds `fee + net == gross` and `0 <= fee <= gross` for any gross >= 0,
/// and is monotonic in the gross amount.
pub fn platform_fee_split(gross_cents: i64, plan: SubscriptionPlan) -> FeeSplit {
    let gross = gross_cents.max(0);
    let platform_fee_cents = gross * plan_fee_bps(plan) / 10_000;
    FeeSplit {
        platform_fee_cents,
        net_cents: gross - platform_fee_cents,
    }
}

/// The payable record classes a charge can settle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeKind {
    EventRegistration,
    BeltTest,
    CustomCharge,
}

impl ChargeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeKind::EventRegistration => "event_registration",
            ChargeKind::BeltTest => "belt_test",
            ChargeKind::CustomCharge => "custom_charge",
        }
    }
}

impl std::str::FromStr for ChargeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "event_registration" => Ok(ChargeKind::EventRegistration),
            "belt_test" => Ok(ChargeKind::BeltTest),
            "custom_charge" => Ok(ChargeKind::CustomCharge),
            _ => Err(anyhow::anyhow!("Unknown charge kind: {s}")),
        }
    }
}

/// The entity that owns the payment method for a charge: the payer's family
/// when they have one, the individual profile otherwise, or the school
/// itself for owner-level platform billing.
#[derive(Debug, Clone)]
pub enum BillingEntity {
    Family(Family),
    Individual(Profile),
    School(School),
}

impl BillingEntity {
    pub fn stripe_customer_id(&self) -> Option<&str> {
        match self {
            BillingEntity::Family(f) => f.stripe_customer_id.as_deref(),
            BillingEntity::Individual(p) => p.stripe_customer_id.as_deref(),
            BillingEntity::School(s) => s.stripe_customer_id.as_deref(),
        }
    }

    pub fn default_payment_method(&self) -> Option<&str> {
        match self {
            BillingEntity::Family(f) => f.default_payment_method_id.as_deref(),
            BillingEntity::Individual(p) => p.default_payment_method_id.as_deref(),
            BillingEntity::School(_) => None,
        }
    }

    pub fn billing_email(&self) -> Option<&str> {
        match self {
            BillingEntity::Family(f) => f.billing_email.as_deref(),
            BillingEntity::Individual(p) => Some(p.email.as_str()),
            BillingEntity::School(_) => None,
        }
    }

    fn customer_name(&self) -> String {
        match self {
            BillingEntity::Family(f) => f.name.clone(),
            BillingEntity::Individual(p) => p.full_name(),
            BillingEntity::School(s) => s.name.clone(),
        }
    }
}

/// Family first, individual profile second. The school path is only taken
/// explicitly (owner-level platform billing), never by fallback.
pub async fn resolve_billing_entity(
    pool: &PgPool,
    payer: &Profile,
) -> Result<BillingEntity, ApiError> {
    if let Some(family_id) = payer.family_id {
        let family: Option<Family> = sqlx::query_as("SELECT * FROM families WHERE id = $1")
            .bind(family_id)
            .fetch_optional(pool)
            .await?;
        if let Some(family) = family {
            return Ok(BillingEntity::Family(family));
        }
    }
    Ok(BillingEntity::Individual(payer.clone()))
}

/// Returns the Stripe customer id for the entity, creating it lazily on
/// first use. The id is persisted back with a `stripe_customer_id IS NULL`
/// guard so concurrent callers cannot overwrite each other; the row's value
/// wins over the freshly created one if the guard loses.
pub async fn ensure_stripe_customer(
    pool: &PgPool,
    gateway: &StripeGateway,
    entity: &BillingEntity,
    school: &School,
) -> Result<String, ApiError> {
    if let Some(existing) = entity.stripe_customer_id() {
        return Ok(existing.to_string());
    }

    let mut metadata = HashMap::from([("school_id".to_string(), school.id.to_string())]);
    let (table, row_id) = match entity {
        BillingEntity::Family(f) => {
            metadata.insert("family_id".to_string(), f.id.to_string());
            ("families", f.id)
        }
        BillingEntity::Individual(p) => {
            metadata.insert("profile_id".to_string(), p.id.to_string());
            ("profiles", p.id)
        }
        BillingEntity::School(s) => ("schools", s.id),
    };

    let customer_id = gateway
        .create_customer(entity.billing_email(), &entity.customer_name(), metadata)
        .await?;

    let updated = sqlx::query(&format!(
        "UPDATE {table} SET stripe_customer_id = $1 WHERE id = $2 AND stripe_customer_id IS NULL"
    ))
    .bind(&customer_id)
    .bind(row_id)
    .execute(pool)
    .await?;

    if updated.rows_affected() == 0 {
        // Another request created one first; use the persisted id.
        let winner: Option<String> =
            sqlx::query_scalar(&format!("SELECT stripe_customer_id FROM {table} WHERE id = $1"))
                .bind(row_id)
                .fetch_optional(pool)
                .await?
                .flatten();
        if let Some(winner) = winner {
            return Ok(winner);
        }
    }

    Ok(customer_id)
}

/// What the pay endpoints hand back to the client.
#[derive(Debug, Clone)]
pub enum PaymentOutcome {
    Succeeded {
        payment_intent_id: String,
    },
    RequiresAction {
        payment_intent_id: String,
        client_secret: String,
    },
}

impl PaymentOutcome {
    pub fn into_json(self) -> Value {
        match self {
            PaymentOutcome::Succeeded { payment_intent_id } => json!({
                "success": true,
                "status": "succeeded",
                "payment_intent_id": payment_intent_id,
            }),
            PaymentOutcome::RequiresAction { payment_intent_id, client_secret } => json!({
                "requires_action": true,
                "client_secret": client_secret,
                "payment_intent_id": payment_intent_id,
            }),
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, PaymentOutcome::Succeeded { .. })
    }

    pub fn payment_intent_id(&self) -> &str {
        match self {
            PaymentOutcome::Succeeded { payment_intent_id }
            | PaymentOutcome::RequiresAction { payment_intent_id, .. } => payment_intent_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChargeSpec {
    pub kind: ChargeKind,
    pub payable_id: Uuid,
    pub amount_cents: i64,
    pub description: String,
}

/// Shared pay-for-X contract: resolve the billing entity, lazily create the
/// Stripe customer, then either confirm against a supplied saved card or
/// hand back a client-completable intent. The caller flips the payable row
/// on a synchronous success; the webhook reconciler remains the source of
/// truth for everything asynchronous.
pub async fn collect_school_fee(
    pool: &PgPool,
    gateway: &StripeGateway,
    school: &School,
    payer: &Profile,
    spec: &ChargeSpec,
    pay: &PayRequest,
) -> Result<PaymentOutcome, ApiError> {
    let destination = school.stripe_account_id.as_deref().ok_or_else(|| {
        ApiError::bad_request(
            "This school has not connected a payout account yet. Ask the school owner to finish payment setup.",
        )
    })?;

    let entity = resolve_billing_entity(pool, payer).await?;
    let customer_id = ensure_stripe_customer(pool, gateway, &entity, school).await?;

    let split = platform_fee_split(spec.amount_cents, school.plan());
    let connect = ConnectSplit {
        destination_account: destination.to_string(),
        platform_fee_cents: split.platform_fee_cents,
    };

    let metadata = HashMap::from([
        ("type".to_string(), spec.kind.as_str().to_string()),
        ("payment_id".to_string(), spec.payable_id.to_string()),
        ("school_id".to_string(), school.id.to_string()),
    ]);

    let outcome = match pay.payment_method_id.as_deref() {
        Some(payment_method_id) => {
            let intent = gateway
                .confirm_with_saved_method(
                    spec.amount_cents,
                    &customer_id,
                    payment_method_id,
                    Some(&connect),
                    metadata,
                    &spec.description,
                    pay.save_card,
                )
                .await?;

            if pay.save_card {
                persist_default_payment_method(pool, &entity, payment_method_id).await?;
            }

            match intent.status {
                PaymentIntentStatus::Succeeded => PaymentOutcome::Succeeded {
                    payment_intent_id: intent.id.to_string(),
                },
                PaymentIntentStatus::RequiresAction => PaymentOutcome::RequiresAction {
                    payment_intent_id: intent.id.to_string(),
                    client_secret: intent
                        .client_secret
                        .ok_or_else(|| ApiError::Payment("Payment failed".into()))?,
                },
                _ => return Err(ApiError::Payment("Payment failed".into())),
            }
        }
        None => {
            let intent = gateway
                .create_client_intent(
                    spec.amount_cents,
                    &customer_id,
                    Some(&connect),
                    metadata,
                    &spec.description,
                    pay.save_card,
                )
                .await?;

            PaymentOutcome::RequiresAction {
                payment_intent_id: intent.id.to_string(),
                client_secret: intent
                    .client_secret
                    .ok_or_else(|| ApiError::Payment("Payment failed".into()))?,
            }
        }
    };

    Ok(outcome)
}

async fn persist_default_payment_method(
    pool: &PgPool,
    entity: &BillingEntity,
    payment_method_id: &str,
) -> Result<(), ApiError> {
    match entity {
        BillingEntity::Family(f) => {
            sqlx::query("UPDATE families SET default_payment_method_id = $1 WHERE id = $2")
                .bind(payment_method_id)
                .bind(f.id)
                .execute(pool)
                .await?;
        }
        BillingEntity::Individual(p) => {
            sqlx::query("UPDATE profiles SET default_payment_method_id = $1 WHERE id = $2")
                .bind(payment_method_id)
                .bind(p.id)
                .execute(pool)
                .await?;
        }
        BillingEntity::School(_) => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLANS: [SubscriptionPlan; 3] = [
        SubscriptionPlan::Trial,
        SubscriptionPlan::Standard,
        SubscriptionPlan::FoundingPartner,
    ];

    #[test]
    fn split_is_exact_for_every_plan() {
        for plan in PLANS {
            for gross in [0, 1, 99, 100, 2500, 5000, 9_999, 1_000_000, i64::MAX / 20_000] {
                let split = platform_fee_split(gross, plan);
                assert_eq!(
                    split.platform_fee_cents + split.net_cents,
                    gross,
                    "leaked cents at gross={gross} plan={plan:?}"
                );
                assert!(split.platform_fee_cents >= 0);
                assert!(split.platform_fee_cents <= gross);
            }
        }
    }

    #[test]
    fn fee_is_monotonic_in_gross() {
        for plan in PLANS {
            let mut last = 0;
            for gross in 0..5_000 {
                let fee = platform_fee_split(gross, plan).platform_fee_cents;
                assert!(fee >= last, "fee regressed at gross={gross} plan={plan:?}");
                last = fee;
            }
        }
    }

    #[test]
    fn founding_partners_keep_more_than_standard() {
        let gross = 10_000;
        let founding = platform_fee_split(gross, SubscriptionPlan::FoundingPartner);
        let standard = platform_fee_split(gross, SubscriptionPlan::Standard);
        let trial = platform_fee_split(gross, SubscriptionPlan::Trial);
        assert!(founding.net_cents > standard.net_cents);
        assert!(standard.net_cents > trial.net_cents);
    }

    #[test]
    fn known_split_for_standard_plan() {
        // 3.5% of $50.00
        let split = platform_fee_split(5_000, SubscriptionPlan::Standard);
        assert_eq!(split.platform_fee_cents, 175);
        assert_eq!(split.net_cents, 4_825);
    }

    #[test]
    fn negative_gross_charges_no_fee() {
        let split = platform_fee_split(-100, SubscriptionPlan::Standard);
        assert_eq!(split.platform_fee_cents, 0);
    }

    #[test]
    fn outcome_envelopes_match_the_api_contract() {
        let ok = PaymentOutcome::Succeeded { payment_intent_id: "pi_1".into() }.into_json();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["status"], "succeeded");
        assert_eq!(ok["payment_intent_id"], "pi_1");

        let action = PaymentOutcome::RequiresAction {
            payment_intent_id: "pi_2".into(),
            client_secret: "pi_2_secret".into(),
        }
        .into_json();
        assert_eq!(action["requires_action"], true);
        assert_eq!(action["client_secret"], "pi_2_secret");
        assert_eq!(action["payment_intent_id"], "pi_2");
    }

    #[test]
    fn cents_render_for_user_copy() {
        assert_eq!(format_cents(0), "$0.00");
        assert_eq!(format_cents(5), "$0.05");
        assert_eq!(format_cents(9_900), "$99.00");
        assert_eq!(format_cents(12_345), "$123.45");
    }

    #[test]
    fn charge_kind_round_trips() {
        for kind in [
            ChargeKind::EventRegistration,
            ChargeKind::BeltTest,
            ChargeKind::CustomCharge,
        ] {
            assert_eq!(kind.as_str().parse::<ChargeKind>().unwrap(), kind);
        }
        assert!("refund".parse::<ChargeKind>().is_err());
    }
}
