use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiError,
    middleware::{
        platform_admin::PlatformAdminAuth,
        rate_limit::check_rate_limit,
        school::{is_valid_subdomain, SchoolContext},
    },
    models::auth::AuthenticatedUser,
    models::school::{PlanOverrideRequest, School, SignupRequest, SubscriptionPlan},
    services::authz::{self, Capability},
    AppState,
};

const RESERVED_SUBDOMAINS: &[&str] = &[
    "www", "api", "app", "admin", "login", "signup", "register", "support",
    "billing", "status", "about", "contact", "docs", "platform",
];

fn real_ip(headers: &HeaderMap) -> String {
    if let Some(ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return ip.to_string();
    }
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            return first.trim().to_string();
        }
    }
    "unknown".to_string()
}

/// POST /api/signup — creates the school with a 30-day trial and its owner.
pub async fn signup(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SignupRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    {
        let ip = real_ip(&headers);
        let mut redis = state.redis.clone();
        check_rate_limit(&mut redis, &format!("rate:signup:ip:{ip}"), 5, 3600).await?;
        check_rate_limit(&mut redis, "rate:signup:global", 20, 3600).await?;
    }

    let subdomain = body.subdomain.to_lowercase();

    if !is_valid_subdomain(&subdomain) || subdomain.len() < 3 {
        return Err(ApiError::bad_request(
            "School identifier must be 3-63 characters: lowercase letters, digits and hyphens.",
        ));
    }
    if RESERVED_SUBDOMAINS.contains(&subdomain.as_str()) {
        return Err(ApiError::bad_request("This school identifier is reserved."));
    }
    if !body.email.contains('@') {
        return Err(ApiError::bad_request("Invalid email address."));
    }
    if body.password.len() < 8 {
        return Err(ApiError::bad_request("Password must be at least 8 characters."));
    }
    if body.school_name.trim().is_empty() {
        return Err(ApiError::bad_request("School name is required."));
    }
    if body.first_name.trim().is_empty() || body.last_name.trim().is_empty() {
        return Err(ApiError::bad_request("First and last name are required."));
    }

    let trial_ends_at = Utc::now() + Duration::days(30);

    let school: School = match sqlx::query_as(
        "INSERT INTO schools (name, subdomain, timezone, subscription_status, subscription_plan, trial_ends_at)
         VALUES ($1, $2, COALESCE($3, 'America/New_York'), 'trial', 'trial', $4)
         RETURNING *",
    )
    .bind(body.school_name.trim())
    .bind(&subdomain)
    .bind(body.timezone.as_deref().filter(|s| !s.trim().is_empty()))
    .bind(trial_ends_at)
    .fetch_one(&state.db)
    .await
    {
        Ok(row) => row,
        Err(e) if is_unique_violation(&e) => {
            return Err(ApiError::Conflict("This school identifier is already taken.".into()))
        }
        Err(e) => return Err(e.into()),
    };

    let password_hash =
        bcrypt::hash(&body.password, 12).map_err(|e| ApiError::Internal(e.into()))?;

    let owner = sqlx::query(
        "INSERT INTO profiles (school_id, role, email, password_hash, first_name, last_name, belt_rank)
         VALUES ($1, 'owner', $2, $3, $4, $5, 'black')",
    )
    .bind(school.id)
    .bind(body.email.trim().to_lowercase())
    .bind(&password_hash)
    .bind(body.first_name.trim())
    .bind(body.last_name.trim())
    .execute(&state.db)
    .await;

    if let Err(e) = owner {
        // Roll the school back so the subdomain is not burned by a dead signup.
        sqlx::query("DELETE FROM schools WHERE id = $1")
            .bind(school.id)
            .execute(&state.db)
            .await
            .ok();
        if is_unique_violation(&e) {
            return Err(ApiError::Conflict("An account with this email already exists.".into()));
        }
        return Err(e.into());
    }

    tracing::info!(subdomain = %school.subdomain, "New school signed up");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "subdomain": school.subdomain,
            "name": school.name,
            "trial_ends_at": school.trial_ends_at,
        })),
    ))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// GET /api/school — tenant info for the current school.
pub async fn school_info(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({
        "name": school.name,
        "subdomain": school.subdomain,
        "timezone": school.timezone,
        "subscription_status": school.subscription_status,
        "subscription_plan": school.subscription_plan,
        "trial_ends_at": school.trial_ends_at,
        "payments_ready": school.stripe_account_id.is_some(),
        "stripe_publishable_key": state.stripe.publishable_key(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateSchoolRequest {
    pub name: Option<String>,
    pub timezone: Option<String>,
    pub billing_day: Option<i16>,
}

/// PUT /api/school — owner-editable settings.
pub async fn update_school(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<UpdateSchoolRequest>,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageSchool)?;

    if let Some(day) = body.billing_day {
        if !(1..=28).contains(&day) {
            return Err(ApiError::bad_request("billing_day must be between 1 and 28"));
        }
    }

    sqlx::query(
        "UPDATE schools
         SET name = COALESCE($2, name),
             timezone = COALESCE($3, timezone),
             billing_day = COALESCE($4, billing_day)
         WHERE id = $1",
    )
    .bind(school.id)
    .bind(body.name.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .bind(body.timezone.as_deref().map(str::trim).filter(|s| !s.is_empty()))
    .bind(body.billing_day)
    .execute(&state.db)
    .await?;

    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
pub struct PayoutAccountRequest {
    pub stripe_account_id: String,
}

/// PUT /api/school/payout-account — records the school's Connect account id
/// after onboarding completes.
pub async fn set_payout_account(
    State(state): State<AppState>,
    SchoolContext(school): SchoolContext,
    user: AuthenticatedUser,
    Json(body): Json<PayoutAccountRequest>,
) -> Result<Json<Value>, ApiError> {
    authz::require(&user, Capability::ManageBilling)?;

    let account = body.stripe_account_id.trim();
    if !account.starts_with("acct_") {
        return Err(ApiError::bad_request("Invalid Stripe account id"));
    }

    sqlx::query("UPDATE schools SET stripe_account_id = $2 WHERE id = $1")
        .bind(school.id)
        .bind(account)
        .execute(&state.db)
        .await?;

    Ok(Json(json!({ "ok": true })))
}

/// GET /api/platform/schools — platform-operator listing.
pub async fn list_schools(
    State(state): State<AppState>,
    _auth: PlatformAdminAuth,
) -> Result<Json<Value>, ApiError> {
    let schools: Vec<School> =
        sqlx::query_as("SELECT * FROM schools ORDER BY created_at DESC")
            .fetch_all(&state.db)
            .await?;

    let result: Vec<Value> = schools
        .iter()
        .map(|s| {
            json!({
                "id": s.id,
                "name": s.name,
                "subdomain": s.subdomain,
                "subscription_status": s.subscription_status,
                "subscription_plan": s.subscription_plan,
                "trial_ends_at": s.trial_ends_at,
                "is_active": s.is_active,
                "payments_ready": s.stripe_account_id.is_some(),
                "created_at": s.created_at,
            })
        })
        .collect();

    Ok(Json(json!(result)))
}

/// PUT /api/platform/schools/{id}/plan — manual plan override, bypassing the
/// provider. Setting the trial plan recomputes trial_ends_at (provided end
/// date, else +30 days); paid plans activate immediately.
pub async fn override_plan(
    State(state): State<AppState>,
    _auth: PlatformAdminAuth,
    Path(school_id): Path<Uuid>,
    Json(body): Json<PlanOverrideRequest>,
) -> Result<Json<Value>, ApiError> {
    let (status, trial_ends_at) = match body.plan {
        SubscriptionPlan::Trial => {
            let ends_at = body.trial_ends_at.unwrap_or_else(|| Utc::now() + Duration::days(30));
            ("trial", Some(ends_at))
        }
        SubscriptionPlan::Standard | SubscriptionPlan::FoundingPartner => ("active", None),
    };

    let updated = sqlx::query(
        "UPDATE schools
         SET subscription_plan = $2,
             subscription_status = $3,
             trial_ends_at = COALESCE($4, trial_ends_at)
         WHERE id = $1",
    )
    .bind(school_id)
    .bind(body.plan.as_str())
    .bind(status)
    .bind(trial_ends_at)
    .execute(&state.db)
    .await?;

    if updated.rows_affected() == 0 {
        return Err(ApiError::not_found("School not found"));
    }

    tracing::info!(school_id = %school_id, plan = %body.plan, "Plan override applied");

    Ok(Json(json!({
        "ok": true,
        "plan": body.plan,
        "subscription_status": status,
        "trial_ends_at": trial_ends_at,
    })))
}
