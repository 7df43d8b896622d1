//! First-run onboarding.
//!
//! While the platform has no users at all, `complete_onboarding` creates
//! the first admin. The moment any user exists - including the seeded
//! initial admin - it rejects.

use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use plinth_core::AppError;

use crate::rules::ROLE_ADMIN;
use crate::strategy::validate_password;
use crate::tokens::hash_secret;

pub struct OnboardingService {
    pool: PgPool,
}

impl OnboardingService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn is_completed(&self) -> Result<bool, AppError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM \"user\"")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        Ok(count > 0)
    }

    /// Create the first admin user. Rejects once any user exists.
    pub async fn complete_onboarding(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<String, AppError> {
        if self.is_completed().await? {
            return Err(AppError::BadRequest("onboarding already completed".into()));
        }
        validate_password(password)?;

        let user_id = Uuid::new_v4().to_string();
        let password_hash = hash_secret(password)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO \"user\" (id, email, name, email_verified, created_at, updated_at)
             VALUES ($1, $2, $3, true, now(), now())",
        )
        .bind(&user_id)
        .bind(email)
        .bind(name)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO account (id, account_id, provider_id, user_id, password, created_at)
             VALUES ($1, $2, 'credentials', $3, $4, now())",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(email)
        .bind(&user_id)
        .bind(&password_hash)
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO user_role (user_id, role_id) VALUES ($1, $2)")
            .bind(&user_id)
            .bind(ROLE_ADMIN)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(user_id)
    }
}
