use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Owner,
    Parent,
    Student,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::Owner => "owner",
            Role::Parent => "parent",
            Role::Student => "student",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "owner" => Ok(Role::Owner),
            "parent" => Ok(Role::Parent),
            "student" => Ok(Role::Student),
            _ => Err(anyhow::anyhow!("Unknown role: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Profile {
    pub id: Uuid,
    pub school_id: Uuid,
    pub family_id: Option<Uuid>,
    pub role: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub belt_rank: String,
    #[serde(skip_serializing)]
    pub stripe_customer_id: Option<String>,
    #[serde(skip_serializing)]
    pub default_payment_method_id: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    pub fn role(&self) -> Role {
        self.role.parse().unwrap_or(Role::Student)
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

// Request/Response DTOs

#[derive(Debug, Serialize)]
pub struct ProfileSummary {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub belt_rank: String,
    pub family_id: Option<Uuid>,
    pub is_active: bool,
}

impl From<Profile> for ProfileSummary {
    fn from(p: Profile) -> Self {
        let role = p.role();
        Self {
            id: p.id,
            email: p.email,
            first_name: p.first_name,
            last_name: p.last_name,
            role,
            belt_rank: p.belt_rank,
            family_id: p.family_id,
            is_active: p.is_active,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateMemberRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
    pub role: Option<Role>,
    pub belt_rank: Option<String>,
    pub family_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub role: Option<Role>,
    pub belt_rank: Option<String>,
    pub family_id: Option<Uuid>,
    pub is_active: Option<bool>,
}
