//! Plugin migration support.
//!
//! Plugin migrations run on one pooled connection with a session-level
//! `SET search_path` (not `SET LOCAL`): the migrator spans statements and
//! manages its own transactions, so a transaction-scoped setting would not
//! survive. The connection's `search_path` is reset to `public` before it
//! returns to the pool so no later borrower inherits the plugin schema.

use futures_util::future::BoxFuture;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::postgres::{PgConnection, PgPool};
use tracing::info;

use crate::error::DataError;
use crate::scoped::plugin_schema;

/// Create the plugin schema if needed and apply its migrations.
///
/// The migration bookkeeping table lands in the plugin schema itself, so
/// each plugin tracks its own applied versions.
pub async fn run_plugin_migrations(
    pool: &PgPool,
    plugin_id: &str,
    migrator: &Migrator,
) -> Result<(), DataError> {
    let schema = plugin_schema(plugin_id)?;
    let mut conn = pool.acquire().await?;

    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!("SET search_path = \"{schema}\", public"))
        .execute(&mut *conn)
        .await?;

    let result = migrator.run(&mut *conn).await;

    // Reset before the connection goes back to the pool, even when the
    // migrator failed part-way.
    sqlx::query("SET search_path = public")
        .execute(&mut *conn)
        .await?;

    result?;
    info!(plugin = %plugin_id, schema = %schema, "plugin migrations applied");
    Ok(())
}

/// Drop a plugin's schema and everything in it. Uninstall path only.
pub async fn drop_plugin_schema(pool: &PgPool, plugin_id: &str) -> Result<(), DataError> {
    let schema = plugin_schema(plugin_id)?;
    sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{schema}\" CASCADE"))
        .execute(pool)
        .await?;
    info!(plugin = %plugin_id, schema = %schema, "plugin schema dropped");
    Ok(())
}
