use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::school::SchoolContext,
    models::auth::AuthenticatedUser,
    models::belt::BeltTestPayment,
    models::billing::{CreateCustomChargeRequest, CustomCharge, PayRequest, PlatformPayment},
    models::event::EventRegistration,
    models::school::School,
    models::user::Role,
    routes::auth::load_member,
    services::authz::{self, Capability},
    services::billing::{
        collect_school_fee, ensure_stripe_customer, format_cents, resolve_billing_entity,
        BillingEntity, ChargeKind, ChargeSpec,
    },
    AppState,
};

/// POST /api/pay/event
pub async fn pay_event(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<PayRequest>,
) -> Result<Json<Value>, ApiError> {
    let registration: Option<EventRegistration> = sqlx::query_as(
        "SELECT r.* FROM event_registrations r
         JOIN events e ON e.id = r.event_id
         WHERE r.id = $1 AND e.school_id = $2
           AND r.payment_status = 'pending' AND r.amount_cents > 0",
    )
    .bind(body.payment_id)
    .bind(school.id)
    .fetch_optional(&state.db)
    .await?;

    let registration =
        registration.ok_or_else(|| ApiError::not_found("Registration not found or already paid"))?;

    let event_title: String = sqlx::query_scalar("SELECT title FROM events WHERE id = $1")
        .bind(registration.event_id)
        .fetch_one(&state.db)
        .await?;

    let payer = load_member(&state, &school, user.profile_id).await?;
    let spec = ChargeSpec {
        kind: ChargeKind::EventRegistration,
        payable_id: registration.id,
        amount_cents: registration.amount_cents,
        description: format!("{} — {}", school.name, event_title),
    };

    let outcome =
        collect_school_fee(&state.db, &state.stripe, &school, &payer, &spec, &body).await?;

    if outcome.succeeded() {
        sqlx::query(
            "UPDATE event_registrations
             SET payment_status = 'paid', paid_at = NOW(), stripe_payment_intent_id = $2
             WHERE id = $1 AND payment_status = 'pending'",
        )
        .bind(registration.id)
        .bind(outcome.payment_intent_id())
        .execute(&state.db)
        .await?;

        notify_settled(&state, &school, registration.student_id, &spec).await;
    }

    Ok(Json(outcome.into_json()))
}

/// POST /api/pay/belt-test
pub async fn pay_belt_test(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<PayRequest>,
) -> Result<Json<Value>, ApiError> {
    let payment: Option<BeltTestPayment> = sqlx::query_as(
        "SELECT * FROM belt_test_payments
         WHERE id = $1 AND school_id = $2 AND status = 'pending'",
    )
    .bind(body.payment_id)
    .bind(school.id)
    .fetch_optional(&state.db)
    .await?;

    let payment =
        payment.ok_or_else(|| ApiError::not_found("Belt test payment not found or already paid"))?;

    let payer = load_member(&state, &school, user.profile_id).await?;
    let spec = ChargeSpec {
        kind: ChargeKind::BeltTest,
        payable_id: payment.id,
        amount_cents: payment.amount_cents,
        description: format!("{} — belt test ({})", school.name, payment.to_belt),
    };

    let outcome =
        collect_school_fee(&state.db, &state.stripe, &school, &payer, &spec, &body).await?;

    if outcome.succeeded() {
        sqlx::query(
            "UPDATE belt_test_payments
             SET status = 'paid', paid_at = NOW(), stripe_payment_intent_id = $2
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(payment.id)
        .bind(outcome.payment_intent_id())
        .execute(&state.db)
        .await?;

        notify_settled(&state, &school, payment.student_id, &spec).await;
    }

    Ok(Json(outcome.into_json()))
}

/// POST /api/pay/monthly — settles an owner-raised custom charge. A charge
/// that failed out-of-band stays retryable.
pub async fn pay_monthly(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<PayRequest>,
) -> Result<Json<Value>, ApiError> {
    let charge: Option<CustomCharge> = sqlx::query_as(
        "SELECT * FROM custom_charges
         WHERE id = $1 AND school_id = $2 AND status IN ('pending', 'failed')",
    )
    .bind(body.payment_id)
    .bind(school.id)
    .fetch_optional(&state.db)
    .await?;

    let charge = charge.ok_or_else(|| ApiError::not_found("Charge not found or already paid"))?;

    let payer = load_member(&state, &school, user.profile_id).await?;
    let spec = ChargeSpec {
        kind: ChargeKind::CustomCharge,
        payable_id: charge.id,
        amount_cents: charge.amount_cents,
        description: format!("{} — {}", school.name, charge.description),
    };

    let outcome =
        collect_school_fee(&state.db, &state.stripe, &school, &payer, &spec, &body).await?;

    if outcome.succeeded() {
        sqlx::query(
            "UPDATE custom_charges
             SET status = 'paid', paid_at = NOW(), stripe_payment_intent_id = $2
             WHERE id = $1 AND status IN ('pending', 'failed')",
        )
        .bind(charge.id)
        .bind(outcome.payment_intent_id())
        .execute(&state.db)
        .await?;

        if let Some(recipient) = charge_payer(&state, &charge).await? {
            notify_settled(&state, &school, recipient, &spec).await;
        }
    }

    Ok(Json(outcome.into_json()))
}

async fn notify_settled(state: &AppState, school: &School, recipient: Uuid, spec: &ChargeSpec) {
    state
        .notifications
        .notify(
            &state.db,
            school.id,
            recipient,
            "payment_succeeded",
            "Payment received",
            &format!("Your payment for {} was received. Thank you!", spec.description),
            Some(json!({ "type": spec.kind.as_str(), "payment_id": spec.payable_id })),
        )
        .await;

    // Receipt email is fire-and-forget; a dead SMTP relay never fails a payment.
    if let Some(email_svc) = &state.email {
        let recipient_row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT email, first_name, last_name FROM profiles WHERE id = $1",
        )
        .bind(recipient)
        .fetch_optional(&state.db)
        .await
        .unwrap_or(None);

        if let Some((email, first_name, last_name)) = recipient_row {
            let svc = email_svc.clone();
            let school_name = school.name.clone();
            let description = spec.description.clone();
            let amount_cents = spec.amount_cents;
            tokio::spawn(async move {
                if let Err(e) = svc
                    .send_payment_receipt(
                        &email,
                        &format!("{first_name} {last_name}"),
                        &school_name,
                        &description,
                        amount_cents,
                    )
                    .await
                {
                    tracing::warn!(error = %e, "Receipt email failed");
                }
            });
        }
    }
}

async fn charge_payer(state: &AppState, charge: &CustomCharge) -> Result<Option<Uuid>, ApiError> {
    if let Some(profile_id) = charge.profile_id {
        return Ok(Some(profile_id));
    }
    if let Some(family_id) = charge.family_id {
        let holder: Option<Option<Uuid>> =
            sqlx::query_scalar("SELECT primary_holder_id FROM families WHERE id = $1")
                .bind(family_id)
                .fetch_optional(&state.db)
                .await?;
        return Ok(holder.flatten());
    }
    Ok(None)
}

/// Billing-entity precedence for card management: owners act for the school,
/// everyone else for their family, falling back to their own profile.
async fn card_entity(
    state: &AppState,
    school: &School,
    user: &AuthenticatedUser,
) -> Result<BillingEntity, ApiError> {
    if user.role == Role::Owner {
        return Ok(BillingEntity::School(school.clone()));
    }
    let payer = load_member(state, school, user.profile_id).await?;
    resolve_billing_entity(&state.db, &payer).await
}

/// GET /api/payment-methods
pub async fn list_payment_methods(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let entity = card_entity(&state, &school, &user).await?;

    let cards = match entity.stripe_customer_id() {
        Some(customer_id) => state.stripe.list_cards(customer_id).await?,
        None => Vec::new(),
    };

    Ok(Json(json!({
        "cards": cards,
        "default_payment_method_id": entity.default_payment_method(),
    })))
}

/// POST /api/payment-methods — SetupIntent for adding a card.
pub async fn add_payment_method(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let entity = card_entity(&state, &school, &user).await?;
    let customer_id = ensure_stripe_customer(&state.db, &state.stripe, &entity, &school).await?;

    let setup_intent = state.stripe.create_setup_intent(&customer_id).await?;
    let client_secret = setup_intent
        .client_secret
        .ok_or_else(|| ApiError::Payment("Payment setup failed".into()))?;

    Ok(Json(json!({
        "client_secret": client_secret,
        "publishable_key": state.stripe.publishable_key(),
    })))
}

/// POST /api/charges — owner raises a custom charge (monthly dues,
/// equipment, late fees) against a family or an individual profile.
pub async fn create_charge(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<CreateCustomChargeRequest>,
) -> Result<(StatusCode, Json<CustomCharge>), ApiError> {
    authz::require(&user, Capability::ManageBilling)?;

    if body.amount_cents <= 0 {
        return Err(ApiError::bad_request("amount_cents must be positive"));
    }
    if body.description.trim().is_empty() {
        return Err(ApiError::bad_request("description is required"));
    }
    if body.family_id.is_some() == body.profile_id.is_some() {
        return Err(ApiError::bad_request(
            "Exactly one of family_id or profile_id is required",
        ));
    }

    if let Some(family_id) = body.family_id {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM families WHERE id = $1 AND school_id = $2)",
        )
        .bind(family_id)
        .bind(school.id)
        .fetch_one(&state.db)
        .await?;
        if !exists {
            return Err(ApiError::bad_request("Unknown family for this school"));
        }
    }
    if let Some(profile_id) = body.profile_id {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM profiles WHERE id = $1 AND school_id = $2)",
        )
        .bind(profile_id)
        .bind(school.id)
        .fetch_one(&state.db)
        .await?;
        if !exists {
            return Err(ApiError::bad_request("Unknown profile for this school"));
        }
    }

    let charge: CustomCharge = sqlx::query_as(
        "INSERT INTO custom_charges (school_id, family_id, profile_id, description, amount_cents, created_by)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING *",
    )
    .bind(school.id)
    .bind(body.family_id)
    .bind(body.profile_id)
    .bind(body.description.trim())
    .bind(body.amount_cents)
    .bind(user.profile_id)
    .fetch_one(&state.db)
    .await?;

    if let Some(recipient) = charge_payer(&state, &charge).await? {
        state
            .notifications
            .notify(
                &state.db,
                school.id,
                recipient,
                "payment_required",
                "Payment due",
                &format!(
                    "{} — {} is due.",
                    charge.description,
                    format_cents(charge.amount_cents)
                ),
                Some(json!({ "type": "custom_charge", "payment_id": charge.id })),
            )
            .await;
    }

    Ok((StatusCode::CREATED, Json(charge)))
}

/// GET /api/charges — staff see all; members see what they owe.
pub async fn list_charges(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Vec<CustomCharge>>, ApiError> {
    let charges: Vec<CustomCharge> = if matches!(user.role, Role::Owner | Role::Admin) {
        sqlx::query_as(
            "SELECT * FROM custom_charges WHERE school_id = $1 ORDER BY created_at DESC",
        )
        .bind(school.id)
        .fetch_all(&state.db)
        .await?
    } else {
        sqlx::query_as(
            "SELECT * FROM custom_charges
             WHERE school_id = $1
               AND (profile_id = $2
                    OR family_id = (SELECT family_id FROM profiles WHERE id = $2))
             ORDER BY created_at DESC",
        )
        .bind(school.id)
        .bind(user.profile_id)
        .fetch_all(&state.db)
        .await?
    };

    Ok(Json(charges))
}

/// GET /api/billing/ledger
pub async fn ledger(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Vec<PlatformPayment>>, ApiError> {
    authz::require(&user, Capability::ManageBilling)?;

    let payments: Vec<PlatformPayment> = sqlx::query_as(
        "SELECT * FROM platform_payments
         WHERE school_id = $1
         ORDER BY created_at DESC
         LIMIT 200",
    )
    .bind(school.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(payments))
}
