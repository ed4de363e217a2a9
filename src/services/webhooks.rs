use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use stripe::{CheckoutSession, Event, EventObject, EventType, Invoice, PaymentIntent, Subscription};
use uuid::Uuid;

use crate::models::school::{School, SubscriptionPlan, SubscriptionStatus};
use crate::services::billing::{format_cents, platform_fee_split, ChargeKind};
use crate::services::email::EmailService;
use crate::services::notifications::NotificationService;

/// Applies verified Stripe events to local state. Every handler is
/// idempotent: deliveries are deduplicated by event id, payable updates are
/// guarded on `pending`, and ledger writes key on the Stripe object id.
/// Unhandled event types are logged and acknowledged.
pub struct WebhookReconciler {
    pool: PgPool,
    notifications: Arc<NotificationService>,
    email: Option<Arc<EmailService>>,
}

/// Metadata carried on payment intents for school-collected fees. The
/// payload is signature-verified upstream, but the fields are still treated
/// as untrusted-shaped input and validated here before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentContext {
    pub kind: ChargeKind,
    pub payment_id: Uuid,
    pub school_id: Uuid,
}

pub fn parse_payment_context(metadata: &HashMap<String, String>) -> Option<PaymentContext> {
    let kind: ChargeKind = metadata.get("type")?.parse().ok()?;
    let payment_id: Uuid = metadata.get("payment_id")?.parse().ok()?;
    let school_id: Uuid = metadata.get("school_id")?.parse().ok()?;
    Some(PaymentContext { kind, payment_id, school_id })
}

/// Local rendition of a provider-side subscription status.
pub fn mirror_subscription_status(status: stripe::SubscriptionStatus) -> SubscriptionStatus {
    use stripe::SubscriptionStatus as S;
    match status {
        S::Active => SubscriptionStatus::Active,
        S::Trialing | S::Incomplete => SubscriptionStatus::Trial,
        S::Canceled | S::IncompleteExpired => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::PastDue,
    }
}

impl WebhookReconciler {
    pub fn new(
        pool: PgPool,
        notifications: Arc<NotificationService>,
        email: Option<Arc<EmailService>>,
    ) -> Self {
        Self { pool, notifications, email }
    }

    pub async fn handle_event(&self, event: Event) -> anyhow::Result<()> {
        let event_id = event.id.to_string();
        let event_type = event.type_.to_string();

        if !self.claim_event(&event_id, &event_type).await? {
            tracing::info!(%event_id, %event_type, "Duplicate webhook delivery — skipped");
            return Ok(());
        }

        tracing::info!(%event_id, %event_type, "Processing Stripe webhook event");

        match event.type_ {
            EventType::CheckoutSessionCompleted => {
                if let EventObject::CheckoutSession(session) = event.data.object {
                    self.handle_checkout_completed(session).await?;
                }
            }
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                if let EventObject::Subscription(subscription) = event.data.object {
                    self.handle_subscription_upserted(subscription).await?;
                }
            }
            EventType::CustomerSubscriptionDeleted => {
                if let EventObject::Subscription(subscription) = event.data.object {
                    self.handle_subscription_deleted(subscription).await?;
                }
            }
            EventType::InvoicePaymentSucceeded => {
                if let EventObject::Invoice(invoice) = event.data.object {
                    self.handle_invoice_succeeded(invoice).await?;
                }
            }
            EventType::InvoicePaymentFailed => {
                if let EventObject::Invoice(invoice) = event.data.object {
                    self.handle_invoice_failed(invoice).await?;
                }
            }
            EventType::PaymentIntentSucceeded => {
                if let EventObject::PaymentIntent(intent) = event.data.object {
                    self.handle_payment_intent_succeeded(intent).await?;
                }
            }
            EventType::PaymentIntentPaymentFailed => {
                if let EventObject::PaymentIntent(intent) = event.data.object {
                    self.handle_payment_intent_failed(intent).await?;
                }
            }
            other => {
                tracing::info!(event_type = %other, "Unhandled Stripe event type — acknowledged");
            }
        }

        Ok(())
    }

    /// Claims the event id. Returns false when a previous delivery already
    /// claimed it (at-least-once semantics from the provider).
    async fn claim_event(&self, event_id: &str, event_type: &str) -> anyhow::Result<bool> {
        let claimed = sqlx::query(
            "INSERT INTO stripe_webhook_events (stripe_event_id, event_type)
             VALUES ($1, $2)
             ON CONFLICT (stripe_event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(event_type)
        .execute(&self.pool)
        .await?;

        Ok(claimed.rows_affected() > 0)
    }

    async fn school_by_customer(&self, customer_id: &str) -> anyhow::Result<Option<School>> {
        Ok(
            sqlx::query_as("SELECT * FROM schools WHERE stripe_customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    async fn school_by_id(&self, school_id: Uuid) -> anyhow::Result<Option<School>> {
        Ok(sqlx::query_as("SELECT * FROM schools WHERE id = $1")
            .bind(school_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Checkout completion either activates a school subscription or settles
    /// the payable named in metadata.
    async fn handle_checkout_completed(&self, session: CheckoutSession) -> anyhow::Result<()> {
        let metadata = session.metadata.clone().unwrap_or_default();

        if let Some(context) = parse_payment_context(&metadata) {
            let intent_id = session
                .payment_intent
                .as_ref()
                .map(|pi| pi.id().to_string());
            self.settle_payable(context, intent_id.as_deref()).await?;
            return Ok(());
        }

        let Some(school_id) = metadata.get("school_id").and_then(|s| s.parse::<Uuid>().ok())
        else {
            tracing::warn!("checkout.session.completed without a usable school_id — ignored");
            return Ok(());
        };

        let plan = metadata
            .get("plan")
            .and_then(|p| p.parse::<SubscriptionPlan>().ok())
            .unwrap_or(SubscriptionPlan::Standard);
        let customer_id = session.customer.as_ref().map(|c| c.id().to_string());
        let subscription_id = session.subscription.as_ref().map(|s| s.id().to_string());

        sqlx::query(
            "UPDATE schools
             SET subscription_status = 'active',
                 subscription_plan = $2,
                 stripe_customer_id = COALESCE($3, stripe_customer_id),
                 stripe_subscription_id = COALESCE($4, stripe_subscription_id)
             WHERE id = $1",
        )
        .bind(school_id)
        .bind(plan.as_str())
        .bind(customer_id)
        .bind(subscription_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(school_id = %school_id, plan = %plan, "School subscription activated via checkout");
        Ok(())
    }

    /// Mirror provider-side subscription state onto the school row.
    async fn handle_subscription_upserted(&self, subscription: Subscription) -> anyhow::Result<()> {
        let Some(school) = self.school_for_subscription(&subscription).await? else {
            tracing::warn!(
                subscription_id = %subscription.id,
                "Subscription event for unknown school — ignored"
            );
            return Ok(());
        };

        let status = mirror_subscription_status(subscription.status);
        let trial_ends_at: Option<DateTime<Utc>> = subscription
            .trial_end
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

        sqlx::query(
            "UPDATE schools
             SET subscription_status = $2,
                 trial_ends_at = COALESCE($3, trial_ends_at),
                 stripe_subscription_id = $4,
                 stripe_customer_id = COALESCE($5, stripe_customer_id)
             WHERE id = $1",
        )
        .bind(school.id)
        .bind(status.as_str())
        .bind(trial_ends_at)
        .bind(subscription.id.to_string())
        .bind(subscription.customer.id().to_string())
        .execute(&self.pool)
        .await?;

        tracing::info!(school_id = %school.id, status = %status, "Subscription mirrored");
        Ok(())
    }

    async fn handle_subscription_deleted(&self, subscription: Subscription) -> anyhow::Result<()> {
        let Some(school) = self.school_for_subscription(&subscription).await? else {
            return Ok(());
        };

        sqlx::query("UPDATE schools SET subscription_status = 'canceled' WHERE id = $1")
            .bind(school.id)
            .execute(&self.pool)
            .await?;

        tracing::info!(school_id = %school.id, "School subscription canceled");
        Ok(())
    }

    async fn school_for_subscription(
        &self,
        subscription: &Subscription,
    ) -> anyhow::Result<Option<School>> {
        if let Some(school_id) = subscription
            .metadata
            .get("school_id")
            .and_then(|s| s.parse::<Uuid>().ok())
        {
            if let Some(school) = self.school_by_id(school_id).await? {
                return Ok(Some(school));
            }
        }
        self.school_by_customer(&subscription.customer.id().to_string())
            .await
    }

    async fn handle_invoice_succeeded(&self, invoice: Invoice) -> anyhow::Result<()> {
        let Some(customer_id) = invoice.customer.as_ref().map(|c| c.id().to_string()) else {
            return Ok(());
        };
        let Some(school) = self.school_by_customer(&customer_id).await? else {
            tracing::warn!("invoice.payment_succeeded for unknown customer — ignored");
            return Ok(());
        };

        let next = school.status().on_invoice_paid();
        sqlx::query("UPDATE schools SET subscription_status = $2 WHERE id = $1")
            .bind(school.id)
            .bind(next.as_str())
            .execute(&self.pool)
            .await?;

        let amount = invoice.amount_paid.or(invoice.amount_due).unwrap_or(0);
        sqlx::query(
            "INSERT INTO platform_payments
                 (school_id, charge_type, amount_cents, platform_fee_cents, net_cents, status, stripe_invoice_id)
             VALUES ($1, 'subscription_invoice', $2, $2, 0, 'succeeded', $3)
             ON CONFLICT (stripe_invoice_id) DO UPDATE SET status = 'succeeded'",
        )
        .bind(school.id)
        .bind(amount)
        .bind(invoice.id.to_string())
        .execute(&self.pool)
        .await?;

        tracing::info!(school_id = %school.id, status = %next, "Subscription invoice settled");
        Ok(())
    }

    async fn handle_invoice_failed(&self, invoice: Invoice) -> anyhow::Result<()> {
        let Some(customer_id) = invoice.customer.as_ref().map(|c| c.id().to_string()) else {
            return Ok(());
        };
        let Some(school) = self.school_by_customer(&customer_id).await? else {
            tracing::warn!("invoice.payment_failed for unknown customer — ignored");
            return Ok(());
        };

        let previous = school.status();
        let next = previous.on_invoice_failed();
        if next != previous {
            sqlx::query("UPDATE schools SET subscription_status = $2 WHERE id = $1")
                .bind(school.id)
                .bind(next.as_str())
                .execute(&self.pool)
                .await?;
        }

        let amount_due = invoice.amount_due.unwrap_or(0);
        sqlx::query(
            "INSERT INTO platform_payments
                 (school_id, charge_type, amount_cents, platform_fee_cents, net_cents, status, stripe_invoice_id)
             VALUES ($1, 'subscription_invoice', $2, $2, 0, 'failed', $3)
             ON CONFLICT (stripe_invoice_id) DO NOTHING",
        )
        .bind(school.id)
        .bind(amount_due)
        .bind(invoice.id.to_string())
        .execute(&self.pool)
        .await?;

        if next == SubscriptionStatus::PastDue && previous != SubscriptionStatus::PastDue {
            let owners: Vec<(Uuid, String, String, String)> = sqlx::query_as(
                "SELECT id, email, first_name, last_name FROM profiles
                 WHERE school_id = $1 AND role = 'owner' AND is_active = TRUE",
            )
            .bind(school.id)
            .fetch_all(&self.pool)
            .await?;

            for (owner_id, owner_email, first_name, last_name) in owners {
                self.notifications
                    .notify(
                        &self.pool,
                        school.id,
                        owner_id,
                        "subscription_past_due",
                        "Subscription payment failed",
                        &format!(
                            "Your {} subscription payment of {} failed. Please update your payment method.",
                            school.name,
                            format_cents(amount_due)
                        ),
                        Some(serde_json::json!({ "amount_due_cents": amount_due })),
                    )
                    .await;

                if let Some(email) = &self.email {
                    if let Err(e) = email
                        .send_payment_failed(
                            &owner_email,
                            &format!("{first_name} {last_name}"),
                            &school.name,
                            "your platform subscription",
                        )
                        .await
                    {
                        tracing::warn!(error = %e, "Past-due email failed");
                    }
                }
            }
        }

        tracing::warn!(school_id = %school.id, amount_due, "Subscription invoice failed");
        Ok(())
    }

    async fn handle_payment_intent_succeeded(&self, intent: PaymentIntent) -> anyhow::Result<()> {
        let Some(context) = parse_payment_context(&intent.metadata) else {
            tracing::info!(intent_id = %intent.id, "payment_intent.succeeded without payment metadata — ignored");
            return Ok(());
        };

        self.settle_payable(context, Some(&intent.id.to_string()))
            .await?;

        // Ledger rows are written only here, never from client-initiated
        // paths. A later success overwrites an earlier failure for the same
        // intent; replays are no-ops.
        if let Some(school) = self.school_by_id(context.school_id).await? {
            let split = platform_fee_split(intent.amount, school.plan());
            sqlx::query(
                "INSERT INTO platform_payments
                     (school_id, charge_type, reference_id, amount_cents, platform_fee_cents, net_cents, status, stripe_payment_intent_id)
                 VALUES ($1, $2, $3, $4, $5, $6, 'succeeded', $7)
                 ON CONFLICT (stripe_payment_intent_id) DO UPDATE SET status = 'succeeded'",
            )
            .bind(school.id)
            .bind(context.kind.as_str())
            .bind(context.payment_id)
            .bind(intent.amount)
            .bind(split.platform_fee_cents)
            .bind(split.net_cents)
            .bind(intent.id.to_string())
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    async fn handle_payment_intent_failed(&self, intent: PaymentIntent) -> anyhow::Result<()> {
        let Some(context) = parse_payment_context(&intent.metadata) else {
            return Ok(());
        };

        if context.kind == ChargeKind::CustomCharge {
            sqlx::query(
                "UPDATE custom_charges SET status = 'failed'
                 WHERE id = $1 AND status = 'pending'",
            )
            .bind(context.payment_id)
            .execute(&self.pool)
            .await?;
        }

        if let Some(payer_id) = self.payer_for(context).await? {
            self.notifications
                .notify(
                    &self.pool,
                    context.school_id,
                    payer_id,
                    "payment_failed",
                    "Payment failed",
                    "A payment could not be processed. Please try again or use a different card.",
                    Some(serde_json::json!({
                        "type": context.kind.as_str(),
                        "payment_id": context.payment_id,
                    })),
                )
                .await;
        }

        sqlx::query(
            "INSERT INTO platform_payments
                 (school_id, charge_type, reference_id, amount_cents, platform_fee_cents, net_cents, status, stripe_payment_intent_id)
             VALUES ($1, $2, $3, $4, 0, 0, 'failed', $5)
             ON CONFLICT (stripe_payment_intent_id) DO NOTHING",
        )
        .bind(context.school_id)
        .bind(context.kind.as_str())
        .bind(context.payment_id)
        .bind(intent.amount)
        .bind(intent.id.to_string())
        .execute(&self.pool)
        .await?;

        tracing::warn!(
            payment_id = %context.payment_id,
            kind = context.kind.as_str(),
            "Payment intent failed"
        );
        Ok(())
    }

    /// Flip the payable row named by the metadata to paid, guarded on
    /// `pending`, and notify the payer when this delivery performed the flip.
    async fn settle_payable(
        &self,
        context: PaymentContext,
        intent_id: Option<&str>,
    ) -> anyhow::Result<()> {
        let settled_recipient: Option<Uuid> = match context.kind {
            ChargeKind::EventRegistration => {
                sqlx::query_scalar(
                    "UPDATE event_registrations
                     SET payment_status = 'paid', paid_at = NOW(),
                         stripe_payment_intent_id = COALESCE($2, stripe_payment_intent_id)
                     WHERE id = $1 AND payment_status = 'pending'
                     RETURNING student_id",
                )
                .bind(context.payment_id)
                .bind(intent_id)
                .fetch_optional(&self.pool)
                .await?
            }
            ChargeKind::BeltTest => {
                let row: Option<(Uuid, Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
                    "UPDATE belt_test_payments
                     SET status = 'paid', paid_at = NOW(),
                         stripe_payment_intent_id = COALESCE($2, stripe_payment_intent_id)
                     WHERE id = $1 AND status = 'pending'
                     RETURNING student_id, profile_id, family_id",
                )
                .bind(context.payment_id)
                .bind(intent_id)
                .fetch_optional(&self.pool)
                .await?;
                match row {
                    Some((student_id, profile_id, family_id)) => {
                        self.resolve_payer(profile_id, family_id)
                            .await?
                            .or(Some(student_id))
                    }
                    None => None,
                }
            }
            ChargeKind::CustomCharge => {
                let row: Option<(Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
                    "UPDATE custom_charges
                     SET status = 'paid', paid_at = NOW(),
                         stripe_payment_intent_id = COALESCE($2, stripe_payment_intent_id)
                     WHERE id = $1 AND status IN ('pending', 'failed')
                     RETURNING profile_id, family_id",
                )
                .bind(context.payment_id)
                .bind(intent_id)
                .fetch_optional(&self.pool)
                .await?;
                match row {
                    Some((profile_id, family_id)) => self.resolve_payer(profile_id, family_id).await?,
                    None => None,
                }
            }
        };

        if let Some(recipient_id) = settled_recipient {
            self.notifications
                .notify(
                    &self.pool,
                    context.school_id,
                    recipient_id,
                    "payment_succeeded",
                    "Payment received",
                    "Your payment was received. Thank you!",
                    Some(serde_json::json!({
                        "type": context.kind.as_str(),
                        "payment_id": context.payment_id,
                    })),
                )
                .await;
            tracing::info!(
                payment_id = %context.payment_id,
                kind = context.kind.as_str(),
                "Payable settled from webhook"
            );
        }

        Ok(())
    }

    async fn payer_for(&self, context: PaymentContext) -> anyhow::Result<Option<Uuid>> {
        match context.kind {
            ChargeKind::EventRegistration => Ok(sqlx::query_scalar(
                "SELECT student_id FROM event_registrations WHERE id = $1",
            )
            .bind(context.payment_id)
            .fetch_optional(&self.pool)
            .await?),
            ChargeKind::BeltTest => {
                let row: Option<(Uuid, Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
                    "SELECT student_id, profile_id, family_id FROM belt_test_payments WHERE id = $1",
                )
                .bind(context.payment_id)
                .fetch_optional(&self.pool)
                .await?;
                match row {
                    Some((student_id, profile_id, family_id)) => Ok(self
                        .resolve_payer(profile_id, family_id)
                        .await?
                        .or(Some(student_id))),
                    None => Ok(None),
                }
            }
            ChargeKind::CustomCharge => {
                let row: Option<(Option<Uuid>, Option<Uuid>)> = sqlx::query_as(
                    "SELECT profile_id, family_id FROM custom_charges WHERE id = $1",
                )
                .bind(context.payment_id)
                .fetch_optional(&self.pool)
                .await?;
                match row {
                    Some((profile_id, family_id)) => self.resolve_payer(profile_id, family_id).await,
                    None => Ok(None),
                }
            }
        }
    }

    /// The notification target for a family-billed payable is the family's
    /// primary holder.
    async fn resolve_payer(
        &self,
        profile_id: Option<Uuid>,
        family_id: Option<Uuid>,
    ) -> anyhow::Result<Option<Uuid>> {
        if profile_id.is_some() {
            return Ok(profile_id);
        }
        if let Some(family_id) = family_id {
            let holder: Option<Option<Uuid>> =
                sqlx::query_scalar("SELECT primary_holder_id FROM families WHERE id = $1")
                    .bind(family_id)
                    .fetch_optional(&self.pool)
                    .await?;
            return Ok(holder.flatten());
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_well_formed_payment_metadata() {
        let payment_id = Uuid::new_v4();
        let school_id = Uuid::new_v4();
        let md = metadata(&[
            ("type", "belt_test"),
            ("payment_id", &payment_id.to_string()),
            ("school_id", &school_id.to_string()),
        ]);

        let context = parse_payment_context(&md).unwrap();
        assert_eq!(context.kind, ChargeKind::BeltTest);
        assert_eq!(context.payment_id, payment_id);
        assert_eq!(context.school_id, school_id);
    }

    #[test]
    fn rejects_missing_or_malformed_metadata() {
        let id = Uuid::new_v4().to_string();

        // missing type
        assert!(parse_payment_context(&metadata(&[
            ("payment_id", &id),
            ("school_id", &id),
        ]))
        .is_none());

        // unknown type
        assert!(parse_payment_context(&metadata(&[
            ("type", "gift_card"),
            ("payment_id", &id),
            ("school_id", &id),
        ]))
        .is_none());

        // payment_id that is not a UUID
        assert!(parse_payment_context(&metadata(&[
            ("type", "event_registration"),
            ("payment_id", "42"),
            ("school_id", &id),
        ]))
        .is_none());

        // missing school_id
        assert!(parse_payment_context(&metadata(&[
            ("type", "event_registration"),
            ("payment_id", &id),
        ]))
        .is_none());
    }

    #[test]
    fn provider_statuses_mirror_to_local_states() {
        use stripe::SubscriptionStatus as S;
        assert_eq!(mirror_subscription_status(S::Active), SubscriptionStatus::Active);
        assert_eq!(mirror_subscription_status(S::Trialing), SubscriptionStatus::Trial);
        assert_eq!(mirror_subscription_status(S::PastDue), SubscriptionStatus::PastDue);
        assert_eq!(mirror_subscription_status(S::Unpaid), SubscriptionStatus::PastDue);
        assert_eq!(mirror_subscription_status(S::Canceled), SubscriptionStatus::Canceled);
        assert_eq!(
            mirror_subscription_status(S::IncompleteExpired),
            SubscriptionStatus::Canceled
        );
    }
}
