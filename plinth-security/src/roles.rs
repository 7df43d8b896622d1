//! Role administration.
//!
//! System roles are seeded and protected: they are never deletable, the
//! `admin` role's permissions are fixed at the wildcard, and a caller can
//! never escalate through a role they currently hold - editing such a
//! role's permissions is skipped and deleting it is refused.

use std::collections::HashSet;

use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use plinth_core::AppError;

use crate::models::RoleRow;
use crate::rules::{ROLE_ADMIN, ROLE_ANONYMOUS, ROLE_USERS};

/// Split a desired permission set against the current one.
pub(crate) fn diff_permissions(
    current: &[String],
    desired: &[String],
) -> (Vec<String>, Vec<String>) {
    let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();
    let desired_set: HashSet<&str> = desired.iter().map(String::as_str).collect();

    let to_add = desired
        .iter()
        .filter(|p| !current_set.contains(p.as_str()))
        .cloned()
        .collect();
    let to_remove = current
        .iter()
        .filter(|p| !desired_set.contains(p.as_str()))
        .cloned()
        .collect();
    (to_add, to_remove)
}

/// Which code-declared defaults the admin is disabling or re-enabling with
/// this permission set.
pub(crate) fn plan_disabled_defaults(
    declared_defaults: &[String],
    desired: &[String],
) -> (Vec<String>, Vec<String>) {
    let desired_set: HashSet<&str> = desired.iter().map(String::as_str).collect();
    let disable = declared_defaults
        .iter()
        .filter(|d| !desired_set.contains(d.as_str()))
        .cloned()
        .collect();
    let re_enable = declared_defaults
        .iter()
        .filter(|d| desired_set.contains(d.as_str()))
        .cloned()
        .collect();
    (disable, re_enable)
}

pub struct RoleService {
    pool: PgPool,
}

impl RoleService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn list(&self) -> Result<Vec<RoleRow>, AppError> {
        Ok(sqlx::query_as::<_, RoleRow>(
            "SELECT id, name, description, is_system FROM role ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?)
    }

    pub async fn get(&self, role_id: &str) -> Result<RoleRow, AppError> {
        sqlx::query_as::<_, RoleRow>(
            "SELECT id, name, description, is_system FROM role WHERE id = $1",
        )
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("no role '{role_id}'")))
    }

    pub async fn permissions(&self, role_id: &str) -> Result<Vec<String>, AppError> {
        let rows = sqlx::query(
            "SELECT access_rule_id FROM role_access_rule WHERE role_id = $1 ORDER BY access_rule_id",
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("access_rule_id")).collect())
    }

    async fn actor_holds(&self, actor_user_id: &str, role_id: &str) -> Result<bool, AppError> {
        let row = sqlx::query(
            "SELECT 1 AS held FROM user_role WHERE user_id = $1 AND role_id = $2",
        )
        .bind(actor_user_id)
        .bind(role_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        permissions: &[String],
    ) -> Result<RoleRow, AppError> {
        if name.trim().is_empty() {
            return Err(AppError::BadRequest("role name must not be empty".into()));
        }
        let id = Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO role (id, name, description, is_system) VALUES ($1, $2, $3, false)",
        )
        .bind(&id)
        .bind(name)
        .bind(description)
        .execute(&mut *tx)
        .await?;
        for permission in permissions {
            sqlx::query(
                "INSERT INTO role_access_rule (role_id, access_rule_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(&id)
            .bind(permission)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get(&id).await
    }

    /// Update a role's name, description and (where allowed) permissions.
    ///
    /// Permission changes are skipped for the `admin` role and for any role
    /// the acting user currently holds; name/description still update.
    /// Editing the `users`/`anonymous` defaults records admin-disabled
    /// defaults so a later rule sync does not re-add them.
    pub async fn update(
        &self,
        actor_user_id: &str,
        role_id: &str,
        name: Option<&str>,
        description: Option<&str>,
        permissions: Option<&[String]>,
    ) -> Result<RoleRow, AppError> {
        let role = self.get(role_id).await?;

        if name.is_some() || description.is_some() {
            sqlx::query(
                "UPDATE role SET name = COALESCE($1, name), description = COALESCE($2, description)
                 WHERE id = $3",
            )
            .bind(name)
            .bind(description)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        }

        if let Some(desired) = permissions {
            if role.id == ROLE_ADMIN {
                debug!("ignoring permission update for the admin role");
            } else if self.actor_holds(actor_user_id, role_id).await? {
                debug!(role = %role_id, "ignoring permission update for a role the caller holds");
            } else {
                self.apply_permissions(&role, desired).await?;
            }
        }

        self.get(role_id).await
    }

    async fn apply_permissions(&self, role: &RoleRow, desired: &[String]) -> Result<(), AppError> {
        let current = self.permissions(&role.id).await?;
        let (to_add, to_remove) = diff_permissions(&current, desired);

        let default_tracking = match role.id.as_str() {
            ROLE_USERS => Some(("is_authenticated_default", "disabled_default_access_rule")),
            ROLE_ANONYMOUS => Some(("is_public_default", "disabled_public_default_access_rule")),
            _ => None,
        };

        let mut tx = self.pool.begin().await?;

        for permission in &to_add {
            sqlx::query(
                "INSERT INTO role_access_rule (role_id, access_rule_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(&role.id)
            .bind(permission)
            .execute(&mut *tx)
            .await?;
        }
        if !to_remove.is_empty() {
            sqlx::query(
                "DELETE FROM role_access_rule WHERE role_id = $1 AND access_rule_id = ANY($2)",
            )
            .bind(&role.id)
            .bind(&to_remove)
            .execute(&mut *tx)
            .await?;
        }

        if let Some((default_column, disabled_table)) = default_tracking {
            let declared_defaults: Vec<String> = sqlx::query(&format!(
                "SELECT id FROM access_rule WHERE {default_column}"
            ))
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|r| r.get("id"))
            .collect();

            let (disable, re_enable) = plan_disabled_defaults(&declared_defaults, desired);
            for rule_id in disable {
                sqlx::query(&format!(
                    "INSERT INTO {disabled_table} (access_rule_id, disabled_at)
                     VALUES ($1, now()) ON CONFLICT DO NOTHING"
                ))
                .bind(rule_id)
                .execute(&mut *tx)
                .await?;
            }
            if !re_enable.is_empty() {
                sqlx::query(&format!(
                    "DELETE FROM {disabled_table} WHERE access_rule_id = ANY($1)"
                ))
                .bind(&re_enable)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Delete a role. System roles and roles the caller holds are refused.
    pub async fn delete(&self, actor_user_id: &str, role_id: &str) -> Result<(), AppError> {
        let role = self.get(role_id).await?;
        if role.is_system {
            return Err(AppError::Forbidden("system roles cannot be deleted".into()));
        }
        if self.actor_holds(actor_user_id, role_id).await? {
            return Err(AppError::Forbidden(
                "you cannot delete a role you currently hold".into(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM role_access_rule WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_role WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM application_role WHERE role_id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM role WHERE id = $1")
            .bind(role_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Assign a role to a user. Self-assignment and the `anonymous` role
    /// are refused.
    pub async fn assign_to_user(
        &self,
        actor_user_id: &str,
        target_user_id: &str,
        role_id: &str,
    ) -> Result<(), AppError> {
        if actor_user_id == target_user_id {
            return Err(AppError::Forbidden(
                "you cannot change your own roles".into(),
            ));
        }
        if role_id == ROLE_ANONYMOUS {
            return Err(AppError::Forbidden(
                "the anonymous role is never assignable".into(),
            ));
        }
        self.get(role_id).await?;

        sqlx::query(
            "INSERT INTO user_role (user_id, role_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(target_user_id)
        .bind(role_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_from_user(
        &self,
        actor_user_id: &str,
        target_user_id: &str,
        role_id: &str,
    ) -> Result<(), AppError> {
        if actor_user_id == target_user_id {
            return Err(AppError::Forbidden(
                "you cannot change your own roles".into(),
            ));
        }
        sqlx::query("DELETE FROM user_role WHERE user_id = $1 AND role_id = $2")
            .bind(target_user_id)
            .bind(role_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn diff_finds_additions_and_removals() {
        let current = strings(&["a.x", "a.y"]);
        let desired = strings(&["a.y", "a.z"]);
        let (to_add, to_remove) = diff_permissions(&current, &desired);
        assert_eq!(to_add, strings(&["a.z"]));
        assert_eq!(to_remove, strings(&["a.x"]));
    }

    #[test]
    fn identical_sets_diff_to_nothing() {
        let current = strings(&["a.x"]);
        let (to_add, to_remove) = diff_permissions(&current, &current.clone());
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }

    #[test]
    fn omitted_defaults_are_disabled_and_present_ones_re_enabled() {
        let declared = strings(&["a.read", "b.read"]);
        let desired = strings(&["b.read", "c.extra"]);
        let (disable, re_enable) = plan_disabled_defaults(&declared, &desired);
        assert_eq!(disable, strings(&["a.read"]));
        assert_eq!(re_enable, strings(&["b.read"]));
    }
}
