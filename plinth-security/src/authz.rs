//! Authorization evaluation.
//!
//! Rule checks are pure set logic over the caller's effective rules.
//! Team-scoped resources overlay per-team grants and an optional
//! `team_only` setting that makes team membership the only path in.

use std::collections::{HashMap, HashSet};

use sqlx::postgres::PgPool;
use sqlx::Row;
use uuid::Uuid;

use plinth_core::AppError;

use crate::models::TeamGrant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceAction {
    Read,
    Manage,
}

/// Evaluate team-scoped access for one resource.
///
/// - no grants at all: the caller's rule-derived global access decides;
/// - otherwise the grants intersected with the caller's teams must allow
///   the action;
/// - `team_only` ignores global access entirely;
/// - without `team_only`, a failed team check falls back to global access.
pub fn evaluate_team_access(
    action: ResourceAction,
    grants: &[TeamGrant],
    team_only: bool,
    user_teams: &[Uuid],
    has_global_access: bool,
) -> bool {
    if grants.is_empty() {
        return has_global_access;
    }

    let team_allows = grants
        .iter()
        .filter(|grant| user_teams.contains(&grant.team_id))
        .any(|grant| match action {
            ResourceAction::Read => grant.can_read,
            ResourceAction::Manage => grant.can_manage,
        });

    if team_only {
        team_allows
    } else {
        team_allows || has_global_access
    }
}

/// Team-scoped permission checks backed by the grant tables.
pub struct PermissionService {
    pool: PgPool,
}

impl PermissionService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_grants(
        &self,
        resource_type: &str,
        resource_ids: &[String],
    ) -> Result<HashMap<String, Vec<TeamGrant>>, AppError> {
        let rows = sqlx::query(
            "SELECT resource_id, team_id, can_read, can_manage
             FROM resource_team_access
             WHERE resource_type = $1 AND resource_id = ANY($2)",
        )
        .bind(resource_type)
        .bind(resource_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grants: HashMap<String, Vec<TeamGrant>> = HashMap::new();
        for row in rows {
            grants
                .entry(row.get("resource_id"))
                .or_default()
                .push(TeamGrant {
                    team_id: row.get("team_id"),
                    can_read: row.get("can_read"),
                    can_manage: row.get("can_manage"),
                });
        }
        Ok(grants)
    }

    async fn load_team_only(
        &self,
        resource_type: &str,
        resource_ids: &[String],
    ) -> Result<HashSet<String>, AppError> {
        let rows = sqlx::query(
            "SELECT resource_id FROM resource_settings
             WHERE resource_type = $1 AND resource_id = ANY($2) AND team_only",
        )
        .bind(resource_type)
        .bind(resource_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.get("resource_id")).collect())
    }

    /// Whether the caller may perform `action` on one resource.
    pub async fn check_resource_team_access(
        &self,
        resource_type: &str,
        resource_id: &str,
        action: ResourceAction,
        user_teams: &[Uuid],
        has_global_access: bool,
    ) -> Result<bool, AppError> {
        let ids = vec![resource_id.to_string()];
        let grants = self.load_grants(resource_type, &ids).await?;
        let team_only = self.load_team_only(resource_type, &ids).await?;

        Ok(evaluate_team_access(
            action,
            grants.get(resource_id).map(Vec::as_slice).unwrap_or(&[]),
            team_only.contains(resource_id),
            user_teams,
            has_global_access,
        ))
    }

    /// Filter `resource_ids` down to those the caller may act on,
    /// preserving input order.
    pub async fn accessible_resource_ids(
        &self,
        resource_type: &str,
        resource_ids: &[String],
        action: ResourceAction,
        user_teams: &[Uuid],
        has_global_access: bool,
    ) -> Result<Vec<String>, AppError> {
        if resource_ids.is_empty() {
            return Ok(Vec::new());
        }
        let grants = self.load_grants(resource_type, resource_ids).await?;
        let team_only = self.load_team_only(resource_type, resource_ids).await?;

        Ok(resource_ids
            .iter()
            .filter(|id| {
                evaluate_team_access(
                    action,
                    grants.get(*id).map(Vec::as_slice).unwrap_or(&[]),
                    team_only.contains(*id),
                    user_teams,
                    has_global_access,
                )
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grant(team: Uuid, read: bool, manage: bool) -> TeamGrant {
        TeamGrant {
            team_id: team,
            can_read: read,
            can_manage: manage,
        }
    }

    #[test]
    fn no_grants_defers_to_global_access() {
        assert!(evaluate_team_access(
            ResourceAction::Read,
            &[],
            false,
            &[],
            true
        ));
        assert!(!evaluate_team_access(
            ResourceAction::Read,
            &[],
            false,
            &[],
            false
        ));
    }

    #[test]
    fn team_member_with_matching_capability_is_allowed() {
        let t1 = Uuid::new_v4();
        let grants = [grant(t1, true, false)];
        assert!(evaluate_team_access(
            ResourceAction::Read,
            &grants,
            false,
            &[t1],
            false
        ));
        // Read-only grant does not confer manage.
        assert!(!evaluate_team_access(
            ResourceAction::Manage,
            &grants,
            false,
            &[t1],
            false
        ));
    }

    #[test]
    fn team_only_ignores_global_access() {
        // A caller with global access but no intersecting grant is denied
        // once the resource is team-only.
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let grants = [grant(t1, true, false)];

        assert!(!evaluate_team_access(
            ResourceAction::Read,
            &grants,
            true,
            &[t2],
            true
        ));
        // Joining the granted team flips the decision.
        assert!(evaluate_team_access(
            ResourceAction::Read,
            &grants,
            true,
            &[t1, t2],
            true
        ));
    }

    #[test]
    fn without_team_only_global_access_is_the_fallback() {
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        let grants = [grant(t1, true, true)];

        assert!(evaluate_team_access(
            ResourceAction::Manage,
            &grants,
            false,
            &[t2],
            true
        ));
        assert!(!evaluate_team_access(
            ResourceAction::Manage,
            &grants,
            false,
            &[t2],
            false
        ));
    }

    #[test]
    fn only_intersecting_grants_apply() {
        let t1 = Uuid::new_v4();
        let t2 = Uuid::new_v4();
        // t2 has manage, but the caller is only in t1.
        let grants = [grant(t1, true, false), grant(t2, true, true)];
        assert!(!evaluate_team_access(
            ResourceAction::Manage,
            &grants,
            true,
            &[t1],
            false
        ));
    }
}
