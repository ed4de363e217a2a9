use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::school::SchoolContext,
    models::auth::AuthenticatedUser,
    models::belt::{BeltTestFee, BeltTestPayment, CreateBeltFeeRequest, CreateBeltTestPaymentsRequest},
    models::user::{Profile, Role},
    services::authz::{self, Capability},
    services::billing::format_cents,
    AppState,
};

/// Best fee row for a (from, to) promotion. Exact matches beat single-sided
/// wildcards, which beat the full wildcard; ties go to the newest row.
pub async fn resolve_fee(
    pool: &PgPool,
    school_id: Uuid,
    from_belt: &str,
    to_belt: &str,
) -> Result<Option<BeltTestFee>, ApiError> {
    let fee: Option<BeltTestFee> = sqlx::query_as(
        "SELECT * FROM belt_test_fees
         WHERE school_id = $1
           AND (from_belt = $2 OR from_belt IS NULL)
           AND (to_belt = $3 OR to_belt IS NULL)
         ORDER BY ((from_belt IS NOT NULL)::int + (to_belt IS NOT NULL)::int) DESC,
                  created_at DESC
         LIMIT 1",
    )
    .bind(school_id)
    .bind(from_belt)
    .bind(to_belt)
    .fetch_optional(pool)
    .await?;
    Ok(fee)
}

/// GET /api/belt-tests/fees
pub async fn list_fees(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Vec<BeltTestFee>>, ApiError> {
    authz::require(&user, Capability::ManageBilling)?;

    let fees: Vec<BeltTestFee> = sqlx::query_as(
        "SELECT * FROM belt_test_fees WHERE school_id = $1 ORDER BY created_at DESC",
    )
    .bind(school.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(fees))
}

/// POST /api/belt-tests/fees
pub async fn create_fee(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<CreateBeltFeeRequest>,
) -> Result<(StatusCode, Json<BeltTestFee>), ApiError> {
    authz::require(&user, Capability::ManageBilling)?;

    if body.amount_cents < 0 {
        return Err(ApiError::bad_request("amount_cents must not be negative"));
    }

    let fee: BeltTestFee = sqlx::query_as(
        "INSERT INTO belt_test_fees (school_id, from_belt, to_belt, amount_cents)
         VALUES ($1, $2, $3, $4)
         RETURNING *",
    )
    .bind(school.id)
    .bind(body.from_belt.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .bind(body.to_belt.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .bind(body.amount_cents)
    .fetch_one(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(fee)))
}

/// DELETE /api/belt-tests/fees/{id}
pub async fn delete_fee(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(fee_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageBilling)?;

    let deleted = sqlx::query("DELETE FROM belt_test_fees WHERE id = $1 AND school_id = $2")
        .bind(fee_id)
        .bind(school.id)
        .execute(&state.db)
        .await?;

    if deleted.rows_affected() == 0 {
        return Err(ApiError::not_found("Fee not found"));
    }

    Ok(Json(json!({ "ok": true })))
}

/// POST /api/belt-tests/payments — raises pending payments for a set of
/// candidates. The payer is the student's family when they have one, the
/// student's own profile otherwise.
pub async fn create_payments(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<CreateBeltTestPaymentsRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    authz::require(&user, Capability::ManageBilling)?;

    if body.student_ids.is_empty() {
        return Err(ApiError::bad_request("student_ids must not be empty"));
    }
    let to_belt = body.to_belt.trim();
    if to_belt.is_empty() {
        return Err(ApiError::bad_request("to_belt is required"));
    }

    let mut created: Vec<BeltTestPayment> = Vec::new();
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

        let Some(fee) = resolve_fee(&state.db, school.id, &student.belt_rank, to_belt).await?
        else {
            skipped += 1;
            continue;
        };

        // One outstanding payment per candidate and target rank.
        let open: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM belt_test_payments
             WHERE student_id = $1 AND to_belt = $2 AND status = 'pending')",
        )
        .bind(student.id)
        .bind(to_belt)
        .fetch_one(&state.db)
        .await?;
        if open {
            skipped += 1;
            continue;
        }

        let payment: BeltTestPayment = sqlx::query_as(
            "INSERT INTO belt_test_payments
                 (school_id, fee_id, student_id, family_id, profile_id, from_belt, to_belt, amount_cents)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING *",
        )
        .bind(school.id)
        .bind(fee.id)
        .bind(student.id)
        .bind(student.family_id)
        .bind(if student.family_id.is_none() { Some(student.id) } else { None })
        .bind(&student.belt_rank)
        .bind(to_belt)
        .bind(fee.amount_cents)
        .fetch_one(&state.db)
        .await?;

        state
            .notifications
            .notify(
                &state.db,
                school.id,
                student.id,
                "payment_required",
                "Belt test fee due",
                &format!(
                    "A belt test fee of {} is due for your {} promotion.",
                    format_cents(payment.amount_cents),
                    to_belt
                ),
                Some(json!({ "type": "belt_test", "payment_id": payment.id })),
            )
            .await;

        created.push(payment);
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "payments": created, "skipped": skipped })),
    ))
}

/// GET /api/belt-tests/payments — owners see everything; everyone else sees
/// payments they owe or that belong to their family.
pub async fn list_payments(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Vec<BeltTestPayment>>, ApiError> {
    let payments: Vec<BeltTestPayment> = if matches!(user.role, Role::Owner | Role::Admin) {
        sqlx::query_as(
            "SELECT * FROM belt_test_payments WHERE school_id = $1 ORDER BY created_at DESC",
        )
        .bind(school.id)
        .fetch_all(&state.db)
        .await?
    } else {
        sqlx::query_as(
            "SELECT * FROM belt_test_payments
             WHERE school_id = $1
               AND (student_id = $2 OR profile_id = $2
                    OR family_id = (SELECT family_id FROM profiles WHERE id = $2))
             ORDER BY created_at DESC",
        )
        .bind(school.id)
        .bind(user.profile_id)
        .fetch_all(&state.db)
        .await?
    };

    Ok(Json(payments))
}
