//! # plinth: the facade crate
//!
//! Re-exports the platform's crates under one roof. Plugin authors depend
//! on this crate and import from [`prelude`].

pub use plinth_core as core;
pub use plinth_data as data;
pub use plinth_events as events;
pub use plinth_security as security;

pub use plinth_core::{
    AppError, BackendPlugin, BootError, PlatformConfig, PluginHost, RequestContext,
};

pub mod prelude {
    //! Everything a plugin module typically needs.
    pub use plinth_core::{
        core_services, services, AccessRuleSpec, AppError, BackendPlugin, Caller, ExtensionRef,
        InitContext, InitSpec, OperationSpec, PluginMetadata, RegistrationEnv, RequestContext,
        RouterContract, ServiceRef, UserType,
    };
    pub use plinth_data::ScopedDb;
    pub use plinth_events::{DeliveryMode, EventBus, SubscribeOptions};
}
