use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::school::SchoolContext,
    models::auth::AuthenticatedUser,
    models::notification::Notification,
    AppState,
};

/// GET /api/notifications — the caller's inbox, newest first.
pub async fn list_notifications(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Vec<Notification>>, ApiError> {
    let notifications: Vec<Notification> = sqlx::query_as(
        "SELECT * FROM notifications
         WHERE school_id = $1 AND recipient_id = $2
         ORDER BY created_at DESC
         LIMIT 50",
    )
    .bind(school.id)
    .bind(user.profile_id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(notifications))
}

/// GET /api/notifications/unread-count
pub async fn unread_count(
    State(state): State<AppState>,
    SchoolContext(_school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let count = state
        .notifications
        .unread_count(&state.db, user.profile_id)
        .await;

    Ok(Json(json!({ "unread": count })))
}

/// POST /api/notifications/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(notification_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let updated = sqlx::query(
        "UPDATE notifications SET is_read = TRUE
         WHERE id = $1 AND recipient_id = $2",
    )
    .bind(notification_id)
    .bind(user.profile_id)
    .execute(&state.db)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(ApiError::not_found("Notification not found"));
    }

    state
        .notifications
        .publish_unread(&state.db, school.id, user.profile_id)
        .await;

    Ok(Json(json!({ "ok": true })))
}

/// POST /api/notifications/read-all
pub async fn mark_all_read(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    sqlx::query(
        "UPDATE notifications SET is_read = TRUE
         WHERE recipient_id = $1 AND is_read = FALSE",
    )
    .bind(user.profile_id)
    .execute(&state.db)
    .await?;

    state
        .notifications
        .publish_unread(&state.db, school.id, user.profile_id)
        .await;

    Ok(Json(json!({ "ok": true })))
}
