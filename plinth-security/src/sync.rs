//! Access-rule synchronization.
//!
//! Plugins declare access rules in code; this module mirrors them into the
//! database. The full sync runs once the plugin host is ready and covers
//! every declared rule including orphan cleanup; incremental syncs react
//! to install/uninstall hooks on a work queue and touch only one plugin's
//! rules. The plan is computed as a pure diff so the write path stays a
//! straight transaction.

use std::collections::HashSet;
use std::sync::Arc;

use sqlx::postgres::PgPool;
use sqlx::Row;
use tracing::{debug, info};

use plinth_core::{AccessRule, AccessRulesRegistered, AppError, PluginEvent};
use plinth_events::{hooks, EventBus, Listener, SubscribeOptions};

use crate::rules::{ROLE_ADMIN, ROLE_ANONYMOUS, ROLE_USERS};

/// Subscriptions of the access subsystem are recorded under this id.
const ACCESS_PLUGIN_ID: &str = "access";

/// What a full sync will write.
#[derive(Debug, Default, PartialEq)]
pub struct SyncPlan {
    /// Every declared rule, upserted by id.
    pub upserts: Vec<AccessRule>,
    /// Rules in the database that no plugin declares anymore.
    pub orphan_ids: Vec<String>,
    /// Declared authenticated-defaults to attach to `users`.
    pub attach_users: Vec<String>,
    /// Declared public-defaults to attach to `anonymous`.
    pub attach_anonymous: Vec<String>,
}

/// Diff declared rules against the database state.
///
/// Defaults an admin explicitly disabled stay disabled: the two
/// disabled-defaults tables are honored here so a re-sync never re-adds
/// them.
pub fn plan_full_sync(
    declared: &[AccessRule],
    existing_ids: &[String],
    disabled_authenticated: &HashSet<String>,
    disabled_public: &HashSet<String>,
) -> SyncPlan {
    let declared_ids: HashSet<&str> = declared.iter().map(|r| r.id.as_str()).collect();

    SyncPlan {
        upserts: declared.to_vec(),
        orphan_ids: existing_ids
            .iter()
            .filter(|id| !declared_ids.contains(id.as_str()))
            .cloned()
            .collect(),
        attach_users: declared
            .iter()
            .filter(|r| r.is_authenticated_default && !disabled_authenticated.contains(&r.id))
            .map(|r| r.id.clone())
            .collect(),
        attach_anonymous: declared
            .iter()
            .filter(|r| r.is_public_default && !disabled_public.contains(&r.id))
            .map(|r| r.id.clone())
            .collect(),
    }
}

pub struct RuleSyncService {
    pool: PgPool,
}

impl RuleSyncService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_disabled(&self, table: &str) -> Result<HashSet<String>, AppError> {
        let rows = sqlx::query(&format!("SELECT access_rule_id FROM {table}"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get("access_rule_id")).collect())
    }

    /// Full sync of all code-declared rules. Errors abort boot.
    pub async fn full_sync(&self, declared: &[AccessRule]) -> Result<(), AppError> {
        let existing_ids: Vec<String> = sqlx::query("SELECT id FROM access_rule")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|r| r.get("id"))
            .collect();
        let disabled_authenticated = self.load_disabled("disabled_default_access_rule").await?;
        let disabled_public = self
            .load_disabled("disabled_public_default_access_rule")
            .await?;

        let plan = plan_full_sync(
            declared,
            &existing_ids,
            &disabled_authenticated,
            &disabled_public,
        );

        let mut tx = self.pool.begin().await?;

        for rule in &plan.upserts {
            sqlx::query(
                "INSERT INTO access_rule (id, description, is_authenticated_default, is_public_default)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE
                 SET description = EXCLUDED.description,
                     is_authenticated_default = EXCLUDED.is_authenticated_default,
                     is_public_default = EXCLUDED.is_public_default",
            )
            .bind(&rule.id)
            .bind(&rule.description)
            .bind(rule.is_authenticated_default)
            .bind(rule.is_public_default)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO role_access_rule (role_id, access_rule_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(ROLE_ADMIN)
            .bind(&rule.id)
            .execute(&mut *tx)
            .await?;
        }

        if !plan.orphan_ids.is_empty() {
            sqlx::query("DELETE FROM role_access_rule WHERE access_rule_id = ANY($1)")
                .bind(&plan.orphan_ids)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM access_rule WHERE id = ANY($1)")
                .bind(&plan.orphan_ids)
                .execute(&mut *tx)
                .await?;
            info!(count = plan.orphan_ids.len(), "removed orphaned access rules");
        }

        for (role, rule_ids) in [
            (ROLE_USERS, &plan.attach_users),
            (ROLE_ANONYMOUS, &plan.attach_anonymous),
        ] {
            for rule_id in rule_ids {
                sqlx::query(
                    "INSERT INTO role_access_rule (role_id, access_rule_id)
                     VALUES ($1, $2) ON CONFLICT DO NOTHING",
                )
                .bind(role)
                .bind(rule_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        info!(rules = declared.len(), "access rules synchronized");
        Ok(())
    }

    /// Incremental sync for one plugin's registration: upsert and
    /// admin-assign only. No orphan pass, because only this plugin's rules
    /// are visible here.
    pub async fn sync_plugin_rules(&self, rules: &[AccessRule]) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        for rule in rules {
            sqlx::query(
                "INSERT INTO access_rule (id, description, is_authenticated_default, is_public_default)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE SET description = EXCLUDED.description",
            )
            .bind(&rule.id)
            .bind(&rule.description)
            .bind(rule.is_authenticated_default)
            .bind(rule.is_public_default)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO role_access_rule (role_id, access_rule_id)
                 VALUES ($1, $2) ON CONFLICT DO NOTHING",
            )
            .bind(ROLE_ADMIN)
            .bind(&rule.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Remove every rule a deregistered plugin owned, by id prefix.
    pub async fn remove_plugin_rules(&self, plugin_id: &str) -> Result<(), AppError> {
        let prefix = format!("{plugin_id}.");
        let mut tx = self.pool.begin().await?;

        let ids: Vec<String> = sqlx::query("SELECT id FROM access_rule WHERE id LIKE $1 || '%'")
            .bind(&prefix)
            .fetch_all(&mut *tx)
            .await?
            .into_iter()
            .map(|r| r.get("id"))
            .collect();

        if !ids.is_empty() {
            sqlx::query("DELETE FROM role_access_rule WHERE access_rule_id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM access_rule WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        info!(plugin = %plugin_id, count = ids.len(), "removed deregistered plugin's access rules");
        Ok(())
    }

    /// Subscribe to the registration/deregistration hooks on a work queue
    /// so exactly one instance applies each sync. Failures are retried by
    /// the queue's policy.
    pub async fn attach(self: Arc<Self>, bus: &EventBus) -> Result<(), plinth_events::EventError> {
        let service = self.clone();
        let on_registered: Listener = Arc::new(move |payload| {
            let service = service.clone();
            Box::pin(async move {
                let event: AccessRulesRegistered = serde_json::from_value(payload)?;
                debug!(plugin = %event.plugin_id, rules = event.rules.len(), "syncing registered rules");
                service.sync_plugin_rules(&event.rules).await?;
                Ok(())
            })
        });
        bus.subscribe(
            ACCESS_PLUGIN_ID,
            hooks::ACCESS_RULES_REGISTERED,
            SubscribeOptions::work_queue("ruleSync"),
            on_registered,
        )
        .await?;

        let service = self;
        let on_deregistered: Listener = Arc::new(move |payload| {
            let service = service.clone();
            Box::pin(async move {
                let event: PluginEvent = serde_json::from_value(payload)?;
                service.remove_plugin_rules(&event.plugin_id).await?;
                Ok(())
            })
        });
        bus.subscribe(
            ACCESS_PLUGIN_ID,
            hooks::PLUGIN_DEREGISTERED,
            SubscribeOptions::work_queue("ruleCleanup"),
            on_deregistered,
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, auth_default: bool, public_default: bool) -> AccessRule {
        AccessRule {
            id: id.into(),
            description: format!("rule {id}"),
            is_authenticated_default: auth_default,
            is_public_default: public_default,
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn orphans_are_rules_no_longer_declared() {
        let declared = [rule("x.a", false, false)];
        let existing = ids(&["x.a", "x.b"]);
        let plan = plan_full_sync(&declared, &existing, &HashSet::new(), &HashSet::new());

        assert_eq!(plan.orphan_ids, ids(&["x.b"]));
        assert_eq!(plan.upserts.len(), 1);
    }

    #[test]
    fn defaults_attach_unless_disabled() {
        let declared = [
            rule("x.a", true, false),
            rule("x.b", true, false),
            rule("x.c", false, true),
        ];
        let disabled_auth: HashSet<String> = ids(&["x.b"]).into_iter().collect();

        let plan = plan_full_sync(&declared, &[], &disabled_auth, &HashSet::new());
        assert_eq!(plan.attach_users, ids(&["x.a"]));
        assert_eq!(plan.attach_anonymous, ids(&["x.c"]));
    }

    #[test]
    fn disabled_public_defaults_stay_disabled() {
        let declared = [rule("x.pub", false, true)];
        let disabled_public: HashSet<String> = ids(&["x.pub"]).into_iter().collect();

        let plan = plan_full_sync(&declared, &[], &HashSet::new(), &disabled_public);
        assert!(plan.attach_anonymous.is_empty());
    }

    #[test]
    fn planning_twice_is_idempotent() {
        let declared = [rule("x.a", true, false), rule("y.b", false, false)];
        let existing = ids(&["x.a", "y.b", "z.gone"]);

        let first = plan_full_sync(&declared, &existing, &HashSet::new(), &HashSet::new());
        // After the first sync applied, the DB matches the declarations.
        let after: Vec<String> = first.upserts.iter().map(|r| r.id.clone()).collect();
        let second = plan_full_sync(&declared, &after, &HashSet::new(), &HashSet::new());

        assert!(second.orphan_ids.is_empty());
        assert_eq!(second.upserts, first.upserts);
        assert_eq!(second.attach_users, first.attach_users);
    }

    #[test]
    fn empty_declarations_orphan_everything() {
        let existing = ids(&["x.a", "x.b"]);
        let plan = plan_full_sync(&[], &existing, &HashSet::new(), &HashSet::new());
        assert_eq!(plan.orphan_ids, existing);
        assert!(plan.upserts.is_empty());
    }
}
