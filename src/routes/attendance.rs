use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::school::SchoolContext,
    models::auth::AuthenticatedUser,
    models::class::{AttendanceRecord, RecordAttendanceRequest},
    services::authz::{self, Capability},
    AppState,
};

/// POST /api/attendance — checks students in. Re-submitting the same
/// check-in is a no-op thanks to the (class, student, day) uniqueness.
pub async fn record_attendance(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<RecordAttendanceRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    authz::require(&user, Capability::RecordAttendance)?;

    if body.student_ids.is_empty() {
        return Err(ApiError::bad_request("student_ids must not be empty"));
    }

    let class_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM classes WHERE id = $1 AND school_id = $2)",
    )
    .bind(body.class_id)
    .bind(school.id)
    .fetch_one(&state.db)
    .await?;
    if !class_exists {
        return Err(ApiError::not_found("Class not found"));
    }

    let attended_on = body.attended_on.unwrap_or_else(|| Utc::now().date_naive());
    let mut recorded = 0usize;

    for student_id in &body.student_ids {
        let valid_student: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM profiles WHERE id = $1 AND school_id = $2 AND is_active = TRUE)",
        )
        .bind(student_id)
        .bind(school.id)
        .fetch_one(&state.db)
        .await?;
        if !valid_student {
            continue;
        }

        let inserted = sqlx::query(
            "INSERT INTO attendance (school_id, class_id, student_id, attended_on, recorded_by)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (class_id, student_id, attended_on) DO NOTHING",
        )
        .bind(school.id)
        .bind(body.class_id)
        .bind(student_id)
        .bind(attended_on)
        .bind(user.profile_id)
        .execute(&state.db)
        .await?;

        recorded += inserted.rows_affected() as usize;
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({ "recorded": recorded, "attended_on": attended_on })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ClassAttendanceQuery {
    pub date: Option<NaiveDate>,
}

/// GET /api/attendance/class/{id}?date=YYYY-MM-DD
pub async fn class_attendance(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(class_id): Path<Uuid>,
    Query(query): Query<ClassAttendanceQuery>,
) -> Result<Json<Vec<AttendanceRecord>>, ApiError> {
    authz::require(&user, Capability::RecordAttendance)?;

    let date = query.date.unwrap_or_else(|| Utc::now().date_naive());
    let records: Vec<AttendanceRecord> = sqlx::query_as(
        "SELECT * FROM attendance
         WHERE school_id = $1 AND class_id = $2 AND attended_on = $3
         ORDER BY created_at",
    )
    .bind(school.id)
    .bind(class_id)
    .bind(date)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(records))
}

/// GET /api/attendance/student/{id} — staff, or the student themself.
pub async fn student_attendance(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(student_id): Path<Uuid>,
) -> Result<Json<Vec<AttendanceRecord>>, ApiError> {
    if student_id != user.profile_id {
        authz::require(&user, Capability::RecordAttendance)?;
    }

    let records: Vec<AttendanceRecord> = sqlx::query_as(
        "SELECT * FROM attendance
         WHERE school_id = $1 AND student_id = $2
         ORDER BY attended_on DESC
         LIMIT 200",
    )
    .bind(school.id)
    .bind(student_id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(records))
}
