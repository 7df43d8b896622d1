//! Schema-isolated Postgres access for plinth plugins.
//!
//! Every plugin owns one schema, `plugin_<pluginId>`, on the shared
//! connection pool. [`ScopedDb`] hands a plugin a handle whose every entry
//! point runs inside an explicit transaction that first executes
//!
//! ```sql
//! SET LOCAL search_path = "plugin_<pluginId>", public
//! ```
//!
//! `SET LOCAL` is scoped to the current transaction; in autocommit mode each
//! statement is its own transaction and a preceding `SET LOCAL` would be a
//! no-op for the statement after it. Wrapping both in one explicit
//! transaction joins them, which is the whole isolation invariant.
//!
//! Plugin migrations are the one exception: migration tooling spans
//! statements and manages its own transactions, so
//! [`run_plugin_migrations`] uses a session-level `SET search_path` on a
//! single connection and resets it to `public` before the connection goes
//! back to the pool.

pub mod error;
pub mod migrate;
pub mod scoped;

pub use error::DataError;
pub use migrate::{drop_plugin_schema, run_plugin_migrations};
pub use scoped::{plugin_schema, ScopedDb};
