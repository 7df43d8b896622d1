//! The plinth platform process.
//!
//! Boot order matters: the rule-sync work queues subscribe before the host
//! boots so the `accessRulesRegistered` emissions of Phase 3 are consumed,
//! and the full sync runs after boot so it sees every declared rule.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

use plinth_core::{platform_router, serve, PlatformConfig, PlatformState, PluginHost};
use plinth_events::{EventBus, InMemoryBroker};
use plinth_security::{AuthService, RuleSyncService, ServiceTokenKeys};

mod plugins;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = PlatformConfig::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("core migrations applied");

    plinth_security::seed(&pool, &config.brand).await?;

    // One bus per process; the instance id tags broadcast consumer groups.
    let instance_id = uuid::Uuid::new_v4().to_string();
    let broker = InMemoryBroker::new();
    let bus = EventBus::new(broker, &instance_id);

    // Rule sync listens on work queues before any hook can fire.
    let rule_sync = Arc::new(RuleSyncService::new(pool.clone()));
    rule_sync.clone().attach(&bus).await?;

    let keys = Arc::new(ServiceTokenKeys::generate(&instance_id));
    let host = PluginHost::new(
        pool.clone(),
        bus.clone(),
        config.clone(),
        keys.clone(),
        plugins::plugin_table(),
    );
    host.boot().await?;

    rule_sync.full_sync(&host.all_declared_rules()).await?;

    let authenticator = Arc::new(AuthService::new(pool, keys.clone(), None));
    let router = platform_router(PlatformState {
        host,
        authenticator,
        jwks: keys,
    });

    serve(router, "0.0.0.0:7007").await?;
    Ok(())
}
