use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::school::SchoolContext,
    models::auth::AuthenticatedUser,
    models::family::{CreateFamilyRequest, Family, UpdateFamilyRequest},
    models::user::{Profile, ProfileSummary},
    services::authz::{self, Capability},
    AppState,
};

async fn family_members(state: &AppState, family_id: Uuid) -> Result<Vec<ProfileSummary>, ApiError> {
    let members: Vec<Profile> = sqlx::query_as(
        "SELECT * FROM profiles WHERE family_id = $1 ORDER BY last_name, first_name",
    )
    .bind(family_id)
    .fetch_all(&state.db)
    .await?;
    Ok(members.into_iter().map(ProfileSummary::from).collect())
}

fn family_json(family: &Family, members: Vec<ProfileSummary>) -> Value {
    json!({
        "id": family.id,
        "name": family.name,
        "billing_email": family.billing_email,
        "primary_holder_id": family.primary_holder_id,
        "has_saved_card": family.default_payment_method_id.is_some(),
        "created_at": family.created_at,
        "members": members,
    })
}

/// GET /api/families
pub async fn list_families(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageMembers)?;

    let families: Vec<Family> =
        sqlx::query_as("SELECT * FROM families WHERE school_id = $1 ORDER BY name")
            .bind(school.id)
            .fetch_all(&state.db)
            .await?;

    let mut result = Vec::with_capacity(families.len());
    for family in &families {
        let members = family_members(&state, family.id).await?;
        result.push(family_json(family, members));
    }

    Ok(Json(json!(result)))
}

/// GET /api/families/mine — the caller's own family, if any.
pub async fn my_family(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let family: Option<Family> = sqlx::query_as(
        "SELECT f.* FROM families f
         JOIN profiles p ON p.family_id = f.id
         WHERE p.id = $1 AND f.school_id = $2",
    )
    .bind(user.profile_id)
    .bind(school.id)
    .fetch_optional(&state.db)
    .await?;

    match family {
        Some(family) => {
            let members = family_members(&state, family.id).await?;
            Ok(Json(family_json(&family, members)))
        }
        None => Ok(Json(json!(null))),
    }
}

/// POST /api/families
pub async fn create_family(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<CreateFamilyRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    authz::require(&user, Capability::ManageMembers)?;

    if body.name.trim().is_empty() {
        return Err(ApiError::bad_request("Family name is required"));
    }

    let family: Family = sqlx::query_as(
        "INSERT INTO families (school_id, name, billing_email, primary_holder_id)
         VALUES ($1, $2, $3, $4)
         RETURNING *",
    )
    .bind(school.id)
    .bind(body.name.trim())
    .bind(body.billing_email.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .bind(body.primary_holder_id)
    .fetch_one(&state.db)
    .await?;

    if !body.member_ids.is_empty() {
        sqlx::query(
            "UPDATE profiles SET family_id = $1 WHERE id = ANY($2) AND school_id = $3",
        )
        .bind(family.id)
        .bind(&body.member_ids)
        .bind(school.id)
        .execute(&state.db)
        .await?;
    }

    let members = family_members(&state, family.id).await?;
    Ok((StatusCode::CREATED, Json(family_json(&family, members))))
}

/// PUT /api/families/{id}
pub async fn update_family(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(family_id): Path<Uuid>,
    Json(body): Json<UpdateFamilyRequest>,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageMembers)?;

    let updated: Option<Family> = sqlx::query_as(
        "UPDATE families
         SET name = COALESCE($3, name),
             billing_email = COALESCE($4, billing_email),
             primary_holder_id = COALESCE($5, primary_holder_id)
         WHERE id = $1 AND school_id = $2
         RETURNING *",
    )
    .bind(family_id)
    .bind(school.id)
    .bind(body.name.as_deref().map(str::trim))
    .bind(body.billing_email.as_deref().map(str::trim))
    .bind(body.primary_holder_id)
    .fetch_optional(&state.db)
    .await?;

    let family = updated.ok_or_else(|| ApiError::not_found("Family not found"))?;
    let members = family_members(&state, family.id).await?;
    Ok(Json(family_json(&family, members)))
}

#[derive(Debug, Deserialize)]
pub struct SetFamilyMembersRequest {
    pub member_ids: Vec<Uuid>,
}

/// PUT /api/families/{id}/members — replaces the member set.
pub async fn set_family_members(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Path(family_id): Path<Uuid>,
    Json(body): Json<SetFamilyMembersRequest>,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageMembers)?;

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM families WHERE id = $1 AND school_id = $2)",
    )
    .bind(family_id)
    .bind(school.id)
    .fetch_one(&state.db)
    .await?;
    if !exists {
        return Err(ApiError::not_found("Family not found"));
    }

    sqlx::query("UPDATE profiles SET family_id = NULL WHERE family_id = $1")
        .bind(family_id)
        .execute(&state.db)
        .await?;

    if !body.member_ids.is_empty() {
        sqlx::query(
            "UPDATE profiles SET family_id = $1 WHERE id = ANY($2) AND school_id = $3",
        )
        .bind(family_id)
        .bind(&body.member_ids)
        .bind(school.id)
        .execute(&state.db)
        .await?;
    }

    Ok(Json(json!({ "ok": true })))
}
