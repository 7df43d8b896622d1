//! # plinth-core: the plugin host
//!
//! The core of the plinth platform: typed service resolution, buffered
//! extension points, the three-phase plugin lifecycle with
//! dependency-ordered initialization, per-request context assembly, and
//! the platform HTTP surface.
//!
//! Access control lives in `plinth-security` and plugs into the host
//! through the [`auth::Authenticator`] seam; hook delivery lives in
//! `plinth-events`; schema-isolated data access lives in `plinth-data`.

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod extension;
pub mod fetch;
pub mod health;
pub mod http;
pub mod lifecycle;
pub mod metadata;
pub mod openapi;
pub mod plugin;
pub mod plugin_config;
pub mod registry;
pub mod signals;

pub use auth::{Authenticator, Caller, JwksSource, Principal, ServiceTokenIssuer};
pub use config::{BrokerConfig, ConfigError, PlatformConfig};
pub use context::{core_services, RequestContext};
pub use error::{AppError, BootError};
pub use extension::{ExtensionPoint, ExtensionPointManager, ExtensionRef};
pub use fetch::FetchClient;
pub use health::{HealthCheckRegistry, HealthIndicator, HealthStatus, ScopedHealthRegistry};
pub use http::{platform_router, serve, PlatformState};
pub use lifecycle::{
    AccessRulesRegistered, DeregistrationRequested, InstallRequested, PluginEvent, PluginHost,
};
pub use metadata::{PluginKind, PluginMetadata};
pub use plugin::{
    AccessRule, AccessRuleSpec, AfterReadyContext, BackendPlugin, HookBinder, InitContext,
    InitSpec, OperationSpec, RegistrationEnv, RouterContract, ServiceAccess, UserType,
};
pub use plugin_config::{ConfigService, SecretCipher};
pub use registry::{services, ServiceError, ServiceRef, ServiceRegistry};
pub use signals::{Signal, SignalHub};
