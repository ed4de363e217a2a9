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
    models::class::{Class, CreateClassRequest, UpdateClassRequest},
    services::authz::{self, Capability},
    AppState,
};

/// GET /api/classes — visible to every member.
pub async fn list_classes(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    _user: AuthenticatedUser,
) -> Result<Json<Vec<Class>>, ApiError> {
    let classes: Vec<Class> = sqlx::query_as(
        "SELECT * FROM classes WHERE school_id = $1 ORDER BY weekday, starts_at",
    )
    .bind(school.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(classes))
}

/// POST /api/classes
pub async fn create_class(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<CreateClassRequest>,
) -> Result<(StatusCode, Json<Class>), ApiError> {
    authz::require(&user, Capability::ManageClasses)?;

    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("Class name is required"));
    }
    if !(0..=6).contains(&body.weekday) {
        return Err(ApiError::bad_request("weekday must be between 0 and 6"));
    }
    if body.ends_at <= body.starts_at {
        return Err(ApiError::bad_request("Class must end after it starts"));
    }

    let class: Class = sqlx::query_as(
        "INSERT INTO classes (school_id, name, description, instructor_id, weekday, starts_at, ends_at, max_capacity)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
         RETURNING *",
    )
    .bind(school.id)
    .bind(body.name.trim())
    .bind(body.description.as_deref())
    .bind(body.instructor_id)
    .bind(body.weekday)
    .bind(body.starts_at)
    .bind(body.ends_at)
    .bind(body.max_capacity)
    .fetch_one(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(class)))
}

/// PUT /api/classes/{id}
pub async fn update_class(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(class_id): Path<Uuid>,
    Json(body): Json<UpdateClassRequest>,
) -> Result<Json<Class>, ApiError> {
    authz::require(&user, Capability::ManageClasses)?;

    if let Some(weekday) = body.weekday {
        if !(0..=6).contains(&weekday) {
            return Err(ApiError::bad_request("weekday must be between 0 and 6"));
        }
    }

    let updated: Option<Class> = sqlx::query_as(
        "UPDATE classes
         SET name = COALESCE($3, name),
             description = COALESCE($4, description),
             instructor_id = COALESCE($5, instructor_id),
             weekday = COALESCE($6, weekday),
             starts_at = COALESCE($7, starts_at),
             ends_at = COALESCE($8, ends_at),
             max_capacity = COALESCE($9, max_capacity)
         WHERE id = $1 AND school_id = $2
         RETURNING *",
    )
    .bind(class_id)
    .bind(school.id)
    .bind(body.name.as_deref().map(str::trim))
    .bind(body.description.as_deref())
    .bind(body.instructor_id)
    .bind(body.weekday)
    .bind(body.starts_at)
    .bind(body.ends_at)
    .bind(body.max_capacity)
    .fetch_optional(&state.db)
    .await?;

    updated
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Class not found"))
}

/// DELETE /api/classes/{id}
pub async fn delete_class(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(class_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageClasses)?;

    let deleted = sqlx::query("DELETE FROM classes WHERE id = $1 AND school_id = $2")
        .bind(class_id)
        .bind(school.id)
        .execute(&state.db)
        .await?;

    if deleted.rows_affected() == 0 {
        return Err(ApiError::not_found("Class not found"));
    }

    Ok(Json(json!({ "ok": true })))
}
