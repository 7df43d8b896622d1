//! Idempotent boot seeding: system roles and the initial admin.

use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use plinth_core::AppError;

use crate::rules::{INITIAL_ADMIN_ID, ROLE_ADMIN, SYSTEM_ROLES};
use crate::tokens::hash_secret;

/// Password of the seeded initial admin. Operators change it on first
/// login.
const INITIAL_ADMIN_PASSWORD: &str = "admin";

/// Ensure the four system roles exist. Safe to run on every boot.
pub async fn ensure_system_roles(pool: &PgPool) -> Result<(), AppError> {
    for role in SYSTEM_ROLES {
        sqlx::query(
            "INSERT INTO role (id, name, description, is_system)
             VALUES ($1, $1, $2, true)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(role)
        .bind(format!("System role: {role}"))
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Ensure the initial admin exists: id `initial-admin-id`, email
/// `admin@<brand>`, role `admin`. Safe to run on every boot.
pub async fn ensure_initial_admin(pool: &PgPool, brand: &str) -> Result<(), AppError> {
    let exists = sqlx::query("SELECT 1 AS found FROM \"user\" WHERE id = $1")
        .bind(INITIAL_ADMIN_ID)
        .fetch_optional(pool)
        .await?
        .is_some();
    if exists {
        return Ok(());
    }

    let email = format!("admin@{brand}");
    let password_hash = hash_secret(INITIAL_ADMIN_PASSWORD)?;

    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO \"user\" (id, email, name, email_verified, created_at, updated_at)
         VALUES ($1, $2, 'Administrator', true, now(), now())",
    )
    .bind(INITIAL_ADMIN_ID)
    .bind(&email)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO account (id, account_id, provider_id, user_id, password, created_at)
         VALUES ($1, $2, 'credentials', $3, $4, now())",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&email)
    .bind(INITIAL_ADMIN_ID)
    .bind(&password_hash)
    .execute(&mut *tx)
    .await?;
    sqlx::query(
        "INSERT INTO user_role (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(INITIAL_ADMIN_ID)
    .bind(ROLE_ADMIN)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(email = %email, "seeded initial admin");
    Ok(())
}

/// Run all idempotent seeds.
pub async fn seed(pool: &PgPool, brand: &str) -> Result<(), AppError> {
    ensure_system_roles(pool).await?;
    ensure_initial_admin(pool, brand).await?;
    Ok(())
}

/// Number of users, exposed for boot diagnostics.
pub async fn user_count(pool: &PgPool) -> Result<i64, AppError> {
    Ok(sqlx::query("SELECT COUNT(*) AS n FROM \"user\"")
        .fetch_one(pool)
        .await?
        .get("n"))
}
