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
    models::announcement::{Announcement, SetAnnouncementRequest},
    models::auth::AuthenticatedUser,
    services::authz::{self, Capability},
    AppState,
};

/// GET /api/announcements — active announcements, newest first.
pub async fn list_announcements(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    _user: AuthenticatedUser,
) -> Result<Json<Vec<Announcement>>, ApiError> {
    let announcements: Vec<Announcement> = sqlx::query_as(
        "SELECT * FROM announcements
         WHERE school_id = $1 AND is_active = TRUE
         ORDER BY created_at DESC",
    )
    .bind(school.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(announcements))
}

/// POST /api/announcements
pub async fn create_announcement(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<SetAnnouncementRequest>,
) -> Result<(StatusCode, Json<Announcement>), ApiError> {
    authz::require(&user, Capability::ManageAnnouncements)?;

    if body.title.trim().is_empty() || body.body.trim().is_empty() {
        return Err(ApiError::bad_request("Title and body are required"));
    }

    let announcement: Announcement = sqlx::query_as(
        "INSERT INTO announcements (school_id, title, body, created_by)
         VALUES ($1, $2, $3, $4)
         RETURNING *",
    )
    .bind(school.id)
    .bind(body.title.trim())
    .bind(body.body.trim())
    .bind(user.profile_id)
    .fetch_one(&state.db)
    .await?;

    Ok((StatusCode::CREATED, Json(announcement)))
}

/// DELETE /api/announcements/{id} — deactivates, keeps history.
pub async fn retire_announcement(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(announcement_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageAnnouncements)?;

    let updated = sqlx::query(
        "UPDATE announcements SET is_active = FALSE WHERE id = $1 AND school_id = $2",
    )
    .bind(announcement_id)
    .bind(school.id)
    .execute(&state.db)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(ApiError::not_found("Announcement not found"));
    }

    Ok(Json(json!({ "ok": true })))
}
