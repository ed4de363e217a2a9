use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::Utc;

use crate::error::ApiError;
use crate::models::school::{School, SubscriptionStatus};
use crate::AppState;

/// Validates that a subdomain only contains lowercase ASCII letters, digits
/// and hyphens, does not start or end with a hyphen, and is between 2 and 63
/// characters.
pub fn is_valid_subdomain(s: &str) -> bool {
    let len = s.len();
    len >= 2
        && len <= 63
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Resolves the tenant from the `X-School` header or first subdomain to a
/// school row, and rejects inactive schools and expired trials.
#[derive(Debug, Clone)]
pub struct SchoolContext(pub School);

impl FromRequestParts<AppState> for SchoolContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let subdomain = extract_subdomain(parts)?;

        let school: Option<School> =
            sqlx::query_as("SELECT * FROM schools WHERE subdomain = $1")
                .bind(&subdomain)
                .fetch_optional(&state.db)
                .await?;

        let school = school.ok_or_else(|| ApiError::not_found("School not found"))?;

        if !school.is_active {
            return Err(ApiError::Forbidden("School account is inactive"));
        }

        if school.status() == SubscriptionStatus::Trial {
            if let Some(ends_at) = school.trial_ends_at {
                if ends_at < Utc::now() {
                    return Err(ApiError::PaymentRequired(
                        "The trial period has ended. Please contact support to activate your subscription.".into(),
                    ));
                }
            }
        }

        Ok(SchoolContext(school))
    }
}

fn extract_subdomain(parts: &Parts) -> Result<String, ApiError> {
    // 1. X-School header
    if let Some(school) = parts
        .headers
        .get("X-School")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty())
    {
        if !is_valid_subdomain(&school) {
            return Err(ApiError::bad_request("Invalid school identifier"));
        }
        return Ok(school);
    }

    // 2. Subdomain from Host header
    if let Some(host) = parts.headers.get("Host").and_then(|v| v.to_str().ok()) {
        let domain = host.split(':').next().unwrap_or(host);
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() >= 3 {
            let subdomain = labels[0].to_lowercase();
            if subdomain != "www" && subdomain != "api" {
                if !is_valid_subdomain(&subdomain) {
                    return Err(ApiError::bad_request("Invalid school identifier"));
                }
                return Ok(subdomain);
            }
        }
    }

    Err(ApiError::bad_request("Missing X-School header"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_subdomains() {
        for s in ["tiger-dojo", "north2", "ka"] {
            assert!(is_valid_subdomain(s), "{s} should be valid");
        }
    }

    #[test]
    fn rejects_malformed_subdomains() {
        for s in ["", "a", "-dojo", "dojo-", "Dojo", "tiger_dojo", "a b"] {
            assert!(!is_valid_subdomain(s), "{s} should be invalid");
        }
    }

    #[test]
    fn rejects_overlong_subdomains() {
        let long = "a".repeat(64);
        assert!(!is_valid_subdomain(&long));
        let ok = "a".repeat(63);
        assert!(is_valid_subdomain(&ok));
    }
}
