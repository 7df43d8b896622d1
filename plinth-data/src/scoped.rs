//! The scoped database handle.

use futures_util::future::BoxFuture;
use sqlx::postgres::{PgConnection, PgPool, PgRow};
use sqlx::Row;
use tracing::trace;

use crate::error::DataError;

/// Returns the schema name owned by a plugin, validating the plugin id.
///
/// Plugin ids feed a quoted SQL identifier, so the character set is
/// restricted up front rather than relying on quoting alone.
pub fn plugin_schema(plugin_id: &str) -> Result<String, DataError> {
    if plugin_id.is_empty()
        || !plugin_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DataError::IsolationViolation(format!(
            "'{plugin_id}' is not a valid plugin id"
        )));
    }
    Ok(format!("plugin_{plugin_id}"))
}

fn scope_statement(schema: &str) -> String {
    format!("SET LOCAL search_path = \"{schema}\", public")
}

/// Raw SQL may not manage `search_path` itself; that is the handle's job.
fn check_sql(sql: &str) -> Result<(), DataError> {
    if sql.to_ascii_lowercase().contains("search_path") {
        return Err(DataError::IsolationViolation(
            "statements may not manipulate search_path through a scoped handle".into(),
        ));
    }
    Ok(())
}

/// A database handle bound to one plugin schema.
///
/// Every entry point starts an explicit transaction on the shared pool,
/// scopes `search_path` with `SET LOCAL`, runs the work on the transaction
/// connection, and commits. Errors roll back (sqlx rolls back on drop).
///
/// String-based helpers cover unparameterized statements; anything that
/// binds values goes through [`transaction`](Self::transaction), which
/// exposes the scoped connection for `sqlx::query(...).bind(...)` chains.
#[derive(Clone)]
pub struct ScopedDb {
    pool: PgPool,
    schema: String,
}

impl ScopedDb {
    /// Create a handle for `plugin_id`'s schema.
    pub fn new(pool: PgPool, plugin_id: &str) -> Result<Self, DataError> {
        Ok(Self {
            pool,
            schema: plugin_schema(plugin_id)?,
        })
    }

    /// The schema this handle is scoped to.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Begin a transaction with `search_path` already scoped.
    async fn begin_scoped(&self) -> Result<sqlx::Transaction<'static, sqlx::Postgres>, DataError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(&scope_statement(&self.schema))
            .execute(&mut *tx)
            .await?;
        trace!(schema = %self.schema, "search_path scoped");
        Ok(tx)
    }

    /// Run `f` inside a transaction whose `search_path` is already scoped.
    ///
    /// This is the general entry point: the closure receives the
    /// transaction's connection and may run any number of statements; they
    /// all see the plugin schema first and `public` second.
    ///
    /// ```ignore
    /// let widget = db
    ///     .transaction(|conn: &mut PgConnection| {
    ///         Box::pin(async move {
    ///             Ok(sqlx::query_as::<_, Widget>("SELECT * FROM widget WHERE id = $1")
    ///                 .bind(7)
    ///                 .fetch_one(conn)
    ///                 .await?)
    ///         })
    ///     })
    ///     .await?;
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> Result<T, DataError>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, DataError>> + Send,
    {
        let mut tx = self.begin_scoped().await?;
        let out = f(&mut *tx).await?;
        tx.commit().await?;
        Ok(out)
    }

    /// Execute one statement, returning the number of affected rows.
    pub async fn execute(&self, sql: &str) -> Result<u64, DataError> {
        check_sql(sql)?;
        let mut tx = self.begin_scoped().await?;
        let done = sqlx::query(sql).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(done.rows_affected())
    }

    /// Fetch all rows of one statement.
    pub async fn fetch_all(&self, sql: &str) -> Result<Vec<PgRow>, DataError> {
        check_sql(sql)?;
        let mut tx = self.begin_scoped().await?;
        let rows = sqlx::query(sql).fetch_all(&mut *tx).await?;
        tx.commit().await?;
        Ok(rows)
    }

    /// Fetch exactly one row; [`DataError::NotFound`] otherwise.
    pub async fn fetch_one(&self, sql: &str) -> Result<PgRow, DataError> {
        self.fetch_optional(sql).await?.ok_or(DataError::NotFound)
    }

    /// Fetch at most one row.
    pub async fn fetch_optional(&self, sql: &str) -> Result<Option<PgRow>, DataError> {
        check_sql(sql)?;
        let mut tx = self.begin_scoped().await?;
        let row = sqlx::query(sql).fetch_optional(&mut *tx).await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Count the rows of a table in the plugin schema.
    pub async fn count(&self, table: &str) -> Result<i64, DataError> {
        if !table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || table.is_empty()
        {
            return Err(DataError::IsolationViolation(format!(
                "'{table}' is not a valid table name"
            )));
        }
        let sql = format!("SELECT COUNT(*) AS n FROM \"{table}\"");
        let row = self.fetch_one(&sql).await?;
        Ok(row.try_get::<i64, _>("n")?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_name_is_prefixed() {
        assert_eq!(plugin_schema("catalog").unwrap(), "plugin_catalog");
        assert_eq!(plugin_schema("p-x").unwrap(), "plugin_p-x");
    }

    #[test]
    fn schema_rejects_hostile_ids() {
        for bad in ["", "a\"b", "a;drop schema public", "a b", "a'b"] {
            assert!(
                matches!(plugin_schema(bad), Err(DataError::IsolationViolation(_))),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn scope_statement_quotes_schema() {
        assert_eq!(
            scope_statement("plugin_p-x"),
            "SET LOCAL search_path = \"plugin_p-x\", public"
        );
    }

    #[test]
    fn raw_sql_may_not_touch_search_path() {
        assert!(check_sql("SELECT 1").is_ok());
        assert!(matches!(
            check_sql("SET search_path = public"),
            Err(DataError::IsolationViolation(_))
        ));
        assert!(matches!(
            check_sql("set SEARCH_PATH to other"),
            Err(DataError::IsolationViolation(_))
        ));
    }
}
