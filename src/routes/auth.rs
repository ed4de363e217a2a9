use axum::{extract::State, Json};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::{rate_limit::check_rate_limit, school::SchoolContext},
    models::auth::{AuthenticatedUser, Claims, LoginRequest, LoginResponse, RefreshClaims, RefreshTokenRequest},
    models::school::School,
    models::user::{Profile, ProfileSummary, Role},
    AppState,
};

fn issue_access_token(
    state: &AppState,
    profile_id: Uuid,
    school: &str,
    role: Role,
) -> Result<String, ApiError> {
    let now = Utc::now();
    let claims = Claims {
        sub: profile_id.to_string(),
        school: school.to_string(),
        role,
        iat: now.timestamp() as usize,
        exp: (now + Duration::seconds(state.config.jwt_expiry_seconds as i64)).timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.config.jwt_secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(e.into()))
}

async fn issue_refresh_token(state: &AppState, profile_id: Uuid) -> Result<String, ApiError> {
    let expires_at = Utc::now() + Duration::days(state.config.jwt_refresh_expiry_days as i64);

    let jti: Uuid = sqlx::query_scalar(
        "INSERT INTO refresh_tokens (profile_id, expires_at) VALUES ($1, $2) RETURNING id",
    )
    .bind(profile_id)
    .bind(expires_at)
    .fetch_one(&state.db)
    .await?;

    let now = Utc::now();
    let claims = RefreshClaims {
        sub: profile_id.to_string(),
        jti: jti.to_string(),
        iat: now.timestamp() as usize,
        exp: expires_at.timestamp() as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.config.jwt_refresh_secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(e.into()))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let email = body.email.trim().to_lowercase();

    {
        let mut redis = state.redis.clone();
        check_rate_limit(&mut redis, &format!("rate:login:{email}"), 10, 900).await?;
    }

    let profile: Option<Profile> =
        sqlx::query_as("SELECT * FROM profiles WHERE email = $1 AND school_id = $2")
            .bind(&email)
            .bind(school.id)
            .fetch_optional(&state.db)
            .await?;

    let profile = profile.ok_or(ApiError::Unauthorized("Invalid email or password"))?;

    if !profile.is_active {
        return Err(ApiError::Forbidden("This account has been deactivated"));
    }

    let valid = bcrypt::verify(&body.password, &profile.password_hash).unwrap_or(false);
    if !valid {
        return Err(ApiError::Unauthorized("Invalid email or password"));
    }

    let access_token = issue_access_token(&state, profile.id, &school.subdomain, profile.role())?;
    let refresh_token = issue_refresh_token(&state, profile.id).await?;

    Ok(Json(LoginResponse {
        access_token,
        refresh_token,
        school_name: school.name,
    }))
}

/// POST /api/auth/refresh — rotates the refresh token.
pub async fn refresh_token(
    State(state): State<AppState>,
    Json(body): Json<RefreshTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    let key = DecodingKey::from_secret(state.config.jwt_refresh_secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;

    let claims = decode::<RefreshClaims>(&body.refresh_token, &key, &validation)
        .map_err(|_| ApiError::Unauthorized("Invalid or expired refresh token"))?
        .claims;

    let jti: Uuid = claims
        .jti
        .parse()
        .map_err(|_| ApiError::Unauthorized("Invalid or expired refresh token"))?;
    let profile_id: Uuid = claims
        .sub
        .parse()
        .map_err(|_| ApiError::Unauthorized("Invalid or expired refresh token"))?;

    // The row must still be live; rotation revokes it in the same statement.
    let rotated = sqlx::query(
        "UPDATE refresh_tokens SET revoked = TRUE
         WHERE id = $1 AND profile_id = $2 AND revoked = FALSE AND expires_at > NOW()",
    )
    .bind(jti)
    .bind(profile_id)
    .execute(&state.db)
    .await?;

    if rotated.rows_affected() == 0 {
        return Err(ApiError::Unauthorized("Invalid or expired refresh token"));
    }

    let row: Option<(Uuid, String, String)> = sqlx::query_as(
        "SELECT p.id, p.role, s.subdomain
         FROM profiles p JOIN schools s ON s.id = p.school_id
         WHERE p.id = $1 AND p.is_active = TRUE",
    )
    .bind(profile_id)
    .fetch_optional(&state.db)
    .await?;

    let (id, role, subdomain) = row.ok_or(ApiError::Unauthorized("Account no longer active"))?;
    let role: Role = role.parse().unwrap_or(Role::Student);

    let access_token = issue_access_token(&state, id, &subdomain, role)?;
    let refresh_token = issue_refresh_token(&state, id).await?;

    Ok(Json(json!({
        "access_token": access_token,
        "refresh_token": refresh_token,
    })))
}

/// POST /api/auth/logout — revokes the presented refresh token.
pub async fn logout(
    State(state): State<AppState>,
    Json(body): Json<RefreshTokenRequest>,
) -> Result<Json<Value>, ApiError> {
    let key = DecodingKey::from_secret(state.config.jwt_refresh_secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = false;

    if let Ok(data) = decode::<RefreshClaims>(&body.refresh_token, &key, &validation) {
        if let Ok(jti) = data.claims.jti.parse::<Uuid>() {
            sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE id = $1")
                .bind(jti)
                .execute(&state.db)
                .await?;
        }
    }

    Ok(Json(json!({ "ok": true })))
}

/// GET /api/auth/me
pub async fn me(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
) -> Result<Json<Value>, ApiError> {
    let profile = load_member(&state, &school, user.profile_id).await?;
    let summary = ProfileSummary::from(profile);

    Ok(Json(json!({
        "profile": summary,
        "school": {
            "name": school.name,
            "subdomain": school.subdomain,
            "subscription_status": school.subscription_status,
            "subscription_plan": school.subscription_plan,
        },
    })))
}

/// Fetch a profile scoped to the current school.
pub async fn load_member(
    state: &AppState,
    school: &School,
    profile_id: Uuid,
) -> Result<Profile, ApiError> {
    let profile: Option<Profile> =
        sqlx::query_as("SELECT * FROM profiles WHERE id = $1 AND school_id = $2")
            .bind(profile_id)
            .bind(school.id)
            .fetch_optional(&state.db)
            .await?;

    profile.ok_or_else(|| ApiError::not_found("Profile not found"))
}
