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
    models::billing::PayRequest,
    models::event::{
        BulkRegistrationOutcome, CreateEventRequest, Event, EventRegistration,
        OwnerRegisterRequest, RegisterRequest, UpdateEventRequest,
    },
    models::school::School,
    models::user::{Profile, Role},
    services::authz::{self, Capability},
    services::billing::{collect_school_fee, format_cents, resolve_billing_entity, ChargeKind, ChargeSpec},
    AppState,
};

/// GET /api/events
pub async fn list_events(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    _user: AuthenticatedUser,
) -> Result<Json<Vec<Event>>, ApiError> {
    let events: Vec<Event> = sqlx::query_as(
        "SELECT * FROM events WHERE school_id = $1 ORDER BY starts_at DESC LIMIT 100",
    )
    .bind(school.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(events))
}

/// POST /api/events
pub async fn create_event(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<CreateEventRequest>,
) -> Result<(StatusCode, Json<Event>), ApiError> {
    authz::require(&user, Capability::ManageEvents)?;

    if body.title.trim().is_empty() {
        return Err(ApiError::bad_request("Event title is required"));
    }
    if let Some(fee) = body.fee_cents {
        if fee < 0 {
            return Err(ApiError::bad_request("fee_cents must not be negative"));
        }
    }
    if let Some(capacity) = body.max_capacity {
        if capacity <= 0 {
            return Err(ApiError::bad_request("max_capacity must be positive"));
        }
    }

    let event: Event = sqlx::query_as(
        "INSERT INTO events (school_id, title, description, location, starts_at, ends_at, fee_cents, max_capacity, created_by)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         RETURNING *",
    )
    .bind(school.id)
    .bind(body.title.trim())
    .bind(body.description.as_deref())
    .bind(body.location.as_deref())
    .bind(body.starts_at)
    .bind(body.ends_at)
    .bind(body.fee_cents.filter(|f| *f > 0))
    .bind(body.max_capacity)
    .bind(user.profile_id)
    .fetch_one(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(event)))
}

/// PUT /api/events/{id}
pub async fn update_event(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(event_id): Path<Uuid>,
    Json(body): Json<UpdateEventRequest>,
) -> Result<Json<Event>, ApiError> {
    authz::require(&user, Capability::ManageEvents)?;

    let updated: Option<Event> = sqlx::query_as(
        "UPDATE events
         SET title = COALESCE($3, title),
             description = COALESCE($4, description),
             location = COALESCE($5, location),
             starts_at = COALESCE($6, starts_at),
             ends_at = COALESCE($7, ends_at),
             fee_cents = COALESCE($8, fee_cents),
             max_capacity = COALESCE($9, max_capacity)
         WHERE id = $1 AND school_id = $2
         RETURNING *",
    )
    .bind(event_id)
    .bind(school.id)
    .bind(body.title.as_deref().map(str::trim))
    .bind(body.description.as_deref())
    .bind(body.location.as_deref())
    .bind(body.starts_at)
    .bind(body.ends_at)
    .bind(body.fee_cents)
    .bind(body.max_capacity)
    .fetch_optional(&state.db)
    .await?;

    updated
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Event not found"))
}

/// DELETE /api/events/{id}
pub async fn delete_event(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(event_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageEvents)?;

    let deleted = sqlx::query("DELETE FROM events WHERE id = $1 AND school_id = $2")
        .bind(event_id)
        .bind(school.id)
        .execute(&state.db)
        .await?;

    if deleted.rows_affected() == 0 {
        return Err(ApiError::not_found("Event not found"));
    }

    Ok(Json(json!({ "ok": true })))
}

/// GET /api/events/{id}/registrations
pub async fn list_registrations(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(event_id): Path<Uuid>,
) -> Result<Json<Vec<EventRegistration>>, ApiError> {
    authz::require(&user, Capability::ManageEvents)?;

    let registrations: Vec<EventRegistration> = sqlx::query_as(
        "SELECT r.* FROM event_registrations r
         JOIN events e ON e.id = r.event_id
         WHERE r.event_id = $1 AND e.school_id = $2
         ORDER BY r.created_at",
    )
    .bind(event_id)
    .bind(school.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(registrations))
}

async fn load_event(state: &AppState, school: &School, event_id: Uuid) -> Result<Event, ApiError> {
    let event: Option<Event> =
        sqlx::query_as("SELECT * FROM events WHERE id = $1 AND school_id = $2")
            .bind(event_id)
            .bind(school.id)
            .fetch_optional(&state.db)
            .await?;
    event.ok_or_else(|| ApiError::not_found("Event not found"))
}

/// Existing-registration screen. This is a check-then-act window: two
/// concurrent requests for the same student can both pass. Known gap,
/// matched by a count-based capacity screen below.
async fn already_registered(
    state: &AppState,
    event_id: Uuid,
    student_id: Uuid,
) -> Result<bool, ApiError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM event_registrations WHERE event_id = $1 AND student_id = $2)",
    )
    .bind(event_id)
    .bind(student_id)
    .fetch_one(&state.db)
    .await?;
    Ok(exists)
}

async fn event_is_full(state: &AppState, event: &Event) -> Result<bool, ApiError> {
    let Some(capacity) = event.max_capacity else {
        return Ok(false);
    };
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM event_registrations WHERE event_id = $1")
            .bind(event.id)
            .fetch_one(&state.db)
            .await?;
    Ok(count >= capacity as i64)
}

async fn insert_registration(
    state: &AppState,
    event: &Event,
    student_id: Uuid,
    registered_by: Uuid,
) -> Result<EventRegistration, ApiError> {
    let fee = event.fee_cents.unwrap_or(0);
    let status = if fee > 0 { "pending" } else { "paid" };

    let registration: EventRegistration = sqlx::query_as(
        "INSERT INTO event_registrations (event_id, student_id, registered_by, payment_status, amount_cents)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING *",
    )
    .bind(event.id)
    .bind(student_id)
    .bind(registered_by)
    .bind(status)
    .bind(fee)
    .fetch_one(&state.db)
    .await?;

    Ok(registration)
}

/// May `user` register `student`? Themself, a family member, or staff.
async fn may_register(
    state: &AppState,
    school: &School,
    user: &AuthenticatedUser,
    student: &Profile,
) -> Result<bool, ApiError> {
    if student.id == user.profile_id {
        return Ok(true);
    }
    if matches!(user.role, Role::Owner | Role::Admin) {
        return Ok(true);
    }
    if let Some(family_id) = student.family_id {
        let same_family: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM profiles WHERE id = $1 AND family_id = $2 AND school_id = $3)",
        )
        .bind(user.profile_id)
        .bind(family_id)
        .bind(school.id)
        .fetch_one(&state.db)
        .await?;
        return Ok(same_family);
    }
    Ok(false)
}

/// POST /api/events/register — self-service, single or bulk. Free events
/// settle immediately; paid events leave the registration pending for the
/// pay endpoint.
pub async fn register(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    authz::require(&user, Capability::RegisterStudents)?;

    if body.student_ids.is_empty() {
        return Err(ApiError::bad_request("student_ids must not be empty"));
    }

    let event = load_event(&state, &school, body.event_id).await?;

    let mut registrations: Vec<EventRegistration> = Vec::new();
    let mut skipped = 0usize;

    for student_id in &body.student_ids {
        let student: Option<Profile> = sqlx::query_as(
            "SELECT * FROM profiles WHERE id = $1 AND school_id = $2 AND is_active = TRUE",
        )
        .bind(student_id)
        .bind(school.id)
        .fetch_optional(&state.db)
        .await?;

        let Some(student) = student else {
            skipped += 1;
            continue;
        };

        if !may_register(&state, &school, &user, &student).await? {
            return Err(ApiError::Forbidden("You cannot register this student"));
        }

        if already_registered(&state, event.id, student.id).await? {
            skipped += 1;
            continue;
        }

        if event_is_full(&state, &event).await? {
            return Err(ApiError::bad_request("Event is full"));
        }

        registrations.push(insert_registration(&state, &event, student.id, user.profile_id).await?);
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "registrations": registrations,
            "skipped": skipped,
        })),
    ))
}

/// POST /api/events/register-by-owner — bulk registration with an
/// auto-charge attempt against each student's stored default card, falling
/// back to a payment-required notification.
pub async fn register_by_owner(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<OwnerRegisterRequest>,
) -> Result<Json<BulkRegistrationOutcome>, ApiError> {
    authz::require(&user, Capability::ManageEvents)?;

    if body.student_ids.is_empty() {
        return Err(ApiError::bad_request("student_ids must not be empty"));
    }

    let event = load_event(&state, &school, body.event_id).await?;

    // A paid event needs the payout account before any charge is attempted.
    if event.fee_cents.unwrap_or(0) > 0 && school.stripe_account_id.is_none() {
        return Err(ApiError::bad_request(
            "This school has not connected a payout account yet. Finish payment setup before collecting fees.",
        ));
    }

    let mut outcome = BulkRegistrationOutcome::default();

    for student_id in &body.student_ids {
        let student: Option<Profile> = sqlx::query_as(
            "SELECT * FROM profiles WHERE id = $1 AND school_id = $2 AND is_active = TRUE",
        )
        .bind(student_id)
        .bind(school.id)
        .fetch_optional(&state.db)
        .await?;

        let Some(student) = student else {
            outcome.skipped += 1;
            continue;
        };

        if already_registered(&state, event.id, student.id).await?
            || event_is_full(&state, &event).await?
        {
            outcome.skipped += 1;
            continue;
        }

        let registration =
            insert_registration(&state, &event, student.id, user.profile_id).await?;
        outcome.registered += 1;

        if registration.amount_cents == 0 {
            continue;
        }

        let entity = resolve_billing_entity(&state.db, &student).await?;
        let charged = match entity.default_payment_method() {
            Some(payment_method_id) => {
                let spec = ChargeSpec {
                    kind: ChargeKind::EventRegistration,
                    payable_id: registration.id,
                    amount_cents: registration.amount_cents,
                    description: format!("{} — {}", school.name, event.title),
                };
                let pay = PayRequest {
                    payment_id: registration.id,
                    payment_method_id: Some(payment_method_id.to_string()),
                    save_card: false,
                };
                match collect_school_fee(&state.db, &state.stripe, &school, &student, &spec, &pay)
                    .await
                {
                    Ok(result) if result.succeeded() => {
                        sqlx::query(
                            "UPDATE event_registrations
                             SET payment_status = 'paid', paid_at = NOW(), stripe_payment_intent_id = $2
                             WHERE id = $1 AND payment_status = 'pending'",
                        )
                        .bind(registration.id)
                        .bind(result.payment_intent_id())
                        .execute(&state.db)
                        .await?;
                        true
                    }
                    Ok(_) => false,
                    Err(e) => {
                        tracing::warn!(
                            student = %student.id,
                            error = %e,
                            "Auto-charge failed during owner registration"
                        );
                        false
                    }
                }
            }
            None => false,
        };

        if charged {
            outcome.charged += 1;
        } else {
            outcome.pending_payment += 1;
            state
                .notifications
                .notify(
                    &state.db,
                    school.id,
                    student.id,
                    "payment_required",
                    "Payment required",
                    &format!(
                        "You have been registered for {}. A payment of {} is due.",
                        event.title,
                        format_cents(registration.amount_cents)
                    ),
                    Some(json!({
                        "type": "event_registration",
                        "payment_id": registration.id,
                        "event_id": event.id,
                    })),
                )
                .await;
        }
    }

    Ok(Json(outcome))
}
