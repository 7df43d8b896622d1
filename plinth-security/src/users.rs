//! User administration and the credential strategy.

use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::warn;
use uuid::Uuid;

use plinth_core::AppError;
use plinth_events::{hooks, EventBus};

use crate::models::UserRow;
use crate::rules::{INITIAL_ADMIN_ID, ROLE_ADMIN, ROLE_USERS};
use crate::strategy::validate_password;
use crate::tokens::hash_secret;

/// Provider id of locally stored email/password accounts.
const CREDENTIAL_PROVIDER: &str = "credentials";

pub struct UserService {
    pool: PgPool,
    bus: EventBus,
    /// Whether the email/password strategy is enabled in the meta-config.
    credentials_enabled: bool,
}

impl UserService {
    pub fn new(pool: PgPool, bus: EventBus, credentials_enabled: bool) -> Self {
        Self {
            pool,
            bus,
            credentials_enabled,
        }
    }

    pub async fn list(&self) -> Result<Vec<UserRow>, AppError> {
        Ok(sqlx::query_as::<_, UserRow>(
            "SELECT id, email, name, email_verified, created_at, updated_at
             FROM \"user\" ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn get(&self, user_id: &str) -> Result<UserRow, AppError> {
        sqlx::query_as::<_, UserRow>(
            "SELECT id, email, name, email_verified, created_at, updated_at
             FROM \"user\" WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no user '{user_id}'")))
    }

    /// Register a new user through the credential strategy. New users get
    /// the `users` role automatically.
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<UserRow, AppError> {
        if !self.credentials_enabled {
            return Err(AppError::BadRequest(
                "the credential strategy is disabled".into(),
            ));
        }
        validate_password(password)?;

        let existing = sqlx::query("SELECT 1 AS found FROM \"user\" WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            return Err(AppError::BadRequest(
                "a user with this email already exists".into(),
            ));
        }

        let user_id = Uuid::new_v4().to_string();
        let password_hash = hash_secret(password)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO \"user\" (id, email, name, email_verified, created_at, updated_at)
             VALUES ($1, $2, $3, false, now(), now())",
        )
        .bind(&user_id)
        .bind(email)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO account (id, account_id, provider_id, user_id, password, created_at)
             VALUES ($1, $2, $3, $4, $5, now())",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(email)
        .bind(CREDENTIAL_PROVIDER)
        .bind(&user_id)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO user_role (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(&user_id)
        .bind(ROLE_USERS)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get(&user_id).await
    }

    /// Delete a user and its dependents.
    ///
    /// Two protections apply, deliberately both: the seeded initial admin
    /// is never deletable by id, and the last user holding the `admin`
    /// role cannot be removed either (a platform without any admin is
    /// unrecoverable).
    pub async fn delete(&self, user_id: &str) -> Result<(), AppError> {
        if user_id == INITIAL_ADMIN_ID {
            return Err(AppError::Forbidden(
                "the initial admin cannot be deleted".into(),
            ));
        }
        self.get(user_id).await?;

        let is_admin = sqlx::query(
            "SELECT 1 AS held FROM user_role WHERE user_id = $1 AND role_id = $2",
        )
        .bind(user_id)
        .bind(ROLE_ADMIN)
        .fetch_optional(&self.pool)
        .await?
        .is_some();
        if is_admin {
            let admins: i64 =
                sqlx::query("SELECT COUNT(*) AS n FROM user_role WHERE role_id = $1")
                    .bind(ROLE_ADMIN)
                    .fetch_one(&self.pool)
                    .await?
                    .get("n");
            if admins <= 1 {
                return Err(AppError::Forbidden(
                    "the last admin cannot be deleted".into(),
                ));
            }
        }

        // No FK cascades on these tables; the order is explicit.
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_role WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM session WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM account WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_team WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM team_manager WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM \"user\" WHERE id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        // Other plugins clean up their own user-keyed state on this hook.
        if let Err(e) = self
            .bus
            .emit(hooks::USER_DELETED, &serde_json::json!({ "userId": user_id }))
            .await
        {
            warn!(user = %user_id, error = %e, "failed to emit user deletion hook");
        }
        Ok(())
    }
}
