//! Team administration and team-scoped resource grants.

use sqlx::postgres::PgPool;
use uuid::Uuid;

use plinth_core::AppError;

use crate::models::TeamRow;

pub struct TeamService {
    pool: PgPool,
}

impl TeamService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<TeamRow>, AppError> {
        Ok(sqlx::query_as::<_, TeamRow>(
            "SELECT id, name, description FROM team ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn get(&self, team_id: Uuid) -> Result<TeamRow, AppError> {
        sqlx::query_as::<_, TeamRow>("SELECT id, name, description FROM team WHERE id = $1")
            .bind(team_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no team '{team_id}'")))
    }

    pub async fn create(&self, name: &str, description: Option<&str>) -> Result<TeamRow, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::BadRequest("team name must not be empty".into()));
        }
        let id = Uuid::new_v4();
        sqlx::query("INSERT INTO team (id, name, description) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(name)
            .bind(description)
            .execute(&self.pool)
            .await?;
        self.get(id).await
    }

    pub async fn update(
        &self,
        team_id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<TeamRow, AppError> {
        self.get(team_id).await?;
        sqlx::query(
            "UPDATE team SET name = COALESCE($1, name), description = COALESCE($2, description)
             WHERE id = $3",
        )
        .bind(name)
        .bind(description)
        .bind(team_id)
        .execute(&self.pool)
        .await?;
        self.get(team_id).await
    }

    /// Delete a team; membership, managers, application links and resource
    /// grants go with it in one transaction.
    pub async fn delete(&self, team_id: Uuid) -> Result<(), AppError> {
        self.get(team_id).await?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_team WHERE team_id = $1")
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM team_manager WHERE team_id = $1")
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM application_team WHERE team_id = $1")
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM resource_team_access WHERE team_id = $1")
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM team WHERE id = $1")
            .bind(team_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_member(&self, team_id: Uuid, user_id: &str) -> Result<(), AppError> {
        self.get(team_id).await?;
        sqlx::query(
            "INSERT INTO user_team (team_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(team_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_member(&self, team_id: Uuid, user_id: &str) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_team WHERE team_id = $1 AND user_id = $2")
            .bind(team_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        // Managers must be members; dropping membership drops management.
        sqlx::query("DELETE FROM team_manager WHERE team_id = $1 AND user_id = $2")
            .bind(team_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn set_manager(&self, team_id: Uuid, user_id: &str) -> Result<(), AppError> {
        self.get(team_id).await?;
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO user_team (team_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(team_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO team_manager (team_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(team_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn remove_manager(&self, team_id: Uuid, user_id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM team_manager WHERE team_id = $1 AND user_id = $2")
            .bind(team_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Resource grants ─────────────────────────────────────────────────

    /// Grant (or update) a team's access to a resource.
    pub async fn grant_resource_access(
        &self,
        resource_type: &str,
        resource_id: &str,
        team_id: Uuid,
        can_read: bool,
        can_manage: bool,
    ) -> Result<(), AppError> {
        self.get(team_id).await?;
        sqlx::query(
            "INSERT INTO resource_team_access (resource_type, resource_id, team_id, can_read, can_manage)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (resource_type, resource_id, team_id)
             DO UPDATE SET can_read = EXCLUDED.can_read, can_manage = EXCLUDED.can_manage",
        )
        .bind(resource_type)
        .bind(resource_id)
        .bind(team_id)
        .bind(can_read)
        .bind(can_manage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn revoke_resource_access(
        &self,
        resource_type: &str,
        resource_id: &str,
        team_id: Uuid,
    ) -> Result<(), AppError> {
        sqlx::query(
            "DELETE FROM resource_team_access
             WHERE resource_type = $1 AND resource_id = $2 AND team_id = $3",
        )
        .bind(resource_type)
        .bind(resource_id)
        .bind(team_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Toggle whether a resource ignores global access and admits only
    /// granted teams.
    pub async fn set_team_only(
        &self,
        resource_type: &str,
        resource_id: &str,
        team_only: bool,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO resource_settings (resource_type, resource_id, team_only)
             VALUES ($1, $2, $3)
             ON CONFLICT (resource_type, resource_id)
             DO UPDATE SET team_only = EXCLUDED.team_only",
        )
        .bind(resource_type)
        .bind(resource_id)
        .bind(team_only)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove every grant and setting of a deleted resource.
    pub async fn purge_resource(
        &self,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM resource_team_access WHERE resource_type = $1 AND resource_id = $2",
        )
        .bind(resource_type)
        .bind(resource_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM resource_settings WHERE resource_type = $1 AND resource_id = $2")
            .bind(resource_type)
            .bind(resource_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}
