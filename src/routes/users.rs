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
    models::user::{CreateMemberRequest, Profile, ProfileSummary, Role, UpdateMemberRequest},
    services::authz::{self, Capability},
    AppState,
};

/// GET /api/members
pub async fn list_members(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Vec<ProfileSummary>>, ApiError> {
    authz::require(&user, Capability::ManageMembers)?;

    let members: Vec<Profile> = sqlx::query_as(
        "SELECT * FROM profiles WHERE school_id = $1
         ORDER BY role, last_name, first_name",
    )
    .bind(school.id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(members.into_iter().map(ProfileSummary::from).collect()))
}

/// POST /api/members
pub async fn create_member(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<CreateMemberRequest>,
) -> Result<(StatusCode, Json<ProfileSummary>), ApiError> {
    authz::require(&user, Capability::ManageMembers)?;

    let role = body.role.unwrap_or(Role::Student);
    if matches!(role, Role::Owner | Role::Admin) {
        authz::require(&user, Capability::ManageSchool)?;
    }

    let email = body.email.trim().to_lowercase();
    if !email.contains('@') {
        return Err(ApiError::bad_request("Invalid email address"));
    }
    if body.password.len() < 8 {
        return Err(ApiError::bad_request("Password must be at least 8 characters"));
    }

    if let Some(family_id) = body.family_id {
        ensure_family_in_school(&state, school.id, family_id).await?;
    }

    let password_hash =
        bcrypt::hash(&body.password, 12).map_err(|e| ApiError::Internal(e.into()))?;

    let created: Result<Profile, sqlx::Error> = sqlx::query_as(
        "INSERT INTO profiles (school_id, family_id, role, email, password_hash, first_name, last_name, belt_rank)
         VALUES ($1, $2, $3, $4, $5, $6, $7, COALESCE($8, 'white'))
         RETURNING *",
    )
    .bind(school.id)
    .bind(body.family_id)
    .bind(role.to_string())
    .bind(&email)
    .bind(&password_hash)
    .bind(body.first_name.trim())
    .bind(body.last_name.trim())
    .bind(body.belt_rank.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .fetch_one(&state.db)
    .await;

    match created {
        Ok(profile) => Ok((StatusCode::CREATED, Json(ProfileSummary::from(profile)))),
        Err(sqlx::Error::Database(db)) if db.code().as_deref() == Some("23505") => {
            Err(ApiError::Conflict("An account with this email already exists".into()))
        }
        Err(e) => Err(e.into()),
    }
}

/// PUT /api/members/{id}
pub async fn update_member(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(member_id): Path<Uuid>,
    Json(body): Json<UpdateMemberRequest>,
) -> Result<Json<ProfileSummary>, ApiError> {
    authz::require(&user, Capability::ManageMembers)?;

    // Role escalation is an owner-only move.
    if matches!(body.role, Some(Role::Owner) | Some(Role::Admin)) {
        authz::require(&user, Capability::ManageSchool)?;
    }

    if let Some(family_id) = body.family_id {
        ensure_family_in_school(&state, school.id, family_id).await?;
    }

    let updated: Option<Profile> = sqlx::query_as(
        "UPDATE profiles
         SET first_name = COALESCE($3, first_name),
             last_name = COALESCE($4, last_name),
             role = COALESCE($5, role),
             belt_rank = COALESCE($6, belt_rank),
             family_id = COALESCE($7, family_id),
             is_active = COALESCE($8, is_active)
         WHERE id = $1 AND school_id = $2
         RETURNING *",
    )
    .bind(member_id)
    .bind(school.id)
    .bind(body.first_name.as_deref().map(str::trim))
    .bind(body.last_name.as_deref().map(str::trim))
    .bind(body.role.map(|r| r.to_string()))
    .bind(body.belt_rank.as_deref().map(str::trim))
    .bind(body.family_id)
    .bind(body.is_active)
    .fetch_optional(&state.db)
    .await?;

    let profile = updated.ok_or_else(|| ApiError::not_found("Member not found"))?;
    Ok(Json(ProfileSummary::from(profile)))
}

/// DELETE /api/members/{id} — deactivates rather than deletes.
pub async fn deactivate_member(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(member_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageMembers)?;

    if member_id == user.profile_id {
        return Err(ApiError::bad_request("You cannot deactivate your own account"));
    }

    let updated = sqlx::query(
        "UPDATE profiles SET is_active = FALSE WHERE id = $1 AND school_id = $2",
    )
    .bind(member_id)
    .bind(school.id)
    .execute(&state.db)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(ApiError::not_found("Member not found"));
    }

    Ok(Json(json!({ "ok": true })))
}

async fn ensure_family_in_school(
    state: &AppState,
    school_id: Uuid,
    family_id: Uuid,
) -> Result<(), ApiError> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM families WHERE id = $1 AND school_id = $2)",
    )
    .bind(family_id)
    .bind(school_id)
    .fetch_one(&state.db)
    .await?;

    if !exists {
        return Err(ApiError::bad_request("Unknown family for this school"));
    }
    Ok(())
}
