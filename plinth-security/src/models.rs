//! Row types for the access-control tables in `public`.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub email_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RoleRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AccessRuleRow {
    pub id: String,
    pub description: Option<String>,
    pub is_authenticated_default: bool,
    pub is_public_default: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TeamRow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ApplicationRow {
    pub id: Uuid,
    pub name: String,
    pub secret_hash: String,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: String,
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

/// One team's grant on a team-scoped resource.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TeamGrant {
    pub team_id: Uuid,
    pub can_read: bool,
    pub can_manage: bool,
}
