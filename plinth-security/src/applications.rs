//! External application administration.
//!
//! Applications authenticate with `ck_` bearer tokens. The cleartext
//! secret exists exactly once, in the response that created or regenerated
//! it; only the hash is stored.

use sqlx::postgres::PgPool;
use uuid::Uuid;

use plinth_core::AppError;

use crate::models::ApplicationRow;
use crate::tokens::{format_token, generate_secret, hash_secret};

/// A freshly created or re-keyed application together with its one-time
/// cleartext token.
pub struct IssuedApplication {
    pub application: ApplicationRow,
    /// Full bearer token (`ck_<id>_<secret>`). Shown once, never stored.
    pub token: String,
}

pub struct ApplicationService {
    pool: PgPool,
}

impl ApplicationService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<ApplicationRow>, AppError> {
        Ok(sqlx::query_as::<_, ApplicationRow>(
            "SELECT id, name, secret_hash, last_used_at, created_at
             FROM application ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn get(&self, application_id: Uuid) -> Result<ApplicationRow, AppError> {
        sqlx::query_as::<_, ApplicationRow>(
            "SELECT id, name, secret_hash, last_used_at, created_at
             FROM application WHERE id = $1",
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no application '{application_id}'")))
    }

    /// Create an application with roles, returning the one-time token.
    pub async fn create(
        &self,
        name: &str,
        role_ids: &[String],
    ) -> Result<IssuedApplication, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::BadRequest(
                "application name must not be empty".into(),
            ));
        }

        let id = Uuid::new_v4();
        let secret = generate_secret();
        let secret_hash = hash_secret(&secret)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO application (id, name, secret_hash, created_at) VALUES ($1, $2, $3, now())",
        )
        .bind(id)
        .bind(name)
        .bind(&secret_hash)
        .execute(&mut *tx)
        .await?;
        for role_id in role_ids {
            sqlx::query(
                "INSERT INTO application_role (application_id, role_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        Ok(IssuedApplication {
            application: self.get(id).await?,
            token: format_token(&id, &secret),
        })
    }

    /// Issue a new secret, invalidating the previous one.
    pub async fn regenerate_secret(
        &self,
        application_id: Uuid,
    ) -> Result<IssuedApplication, AppError> {
        self.get(application_id).await?;

        let secret = generate_secret();
        let secret_hash = hash_secret(&secret)?;
        sqlx::query("UPDATE application SET secret_hash = $1 WHERE id = $2")
            .bind(&secret_hash)
            .bind(application_id)
            .execute(&self.pool)
            .await?;

        Ok(IssuedApplication {
            application: self.get(application_id).await?,
            token: format_token(&application_id, &secret),
        })
    }

    pub async fn delete(&self, application_id: Uuid) -> Result<(), AppError> {
        self.get(application_id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM application_role WHERE application_id = $1")
            .bind(application_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM application_team WHERE application_id = $1")
            .bind(application_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM application WHERE id = $1")
            .bind(application_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_roles(
        &self,
        application_id: Uuid,
        role_ids: &[String],
    ) -> Result<(), AppError> {
        self.get(application_id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM application_role WHERE application_id = $1")
            .bind(application_id)
            .execute(&mut *tx)
            .await?;
        for role_id in role_ids {
            sqlx::query(
                "INSERT INTO application_role (application_id, role_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(application_id)
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_team(&self, application_id: Uuid, team_id: Uuid) -> Result<(), AppError> {
        self.get(application_id).await?;
        sqlx::query(
            "INSERT INTO application_team (application_id, team_id)
             VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(application_id)
        .bind(team_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_team(&self, application_id: Uuid, team_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "DELETE FROM application_team WHERE application_id = $1 AND team_id = $2",
        )
        .bind(application_id)
        .bind(team_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
