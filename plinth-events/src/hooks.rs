//! Well-known hook names used by the platform core.
//!
//! Hook names are wire identifiers and travel between processes; they keep
//! the camelCase form they have on the broker.

/// Emitted once per plugin after its init phase completed.
pub const PLUGIN_INITIALIZED: &str = "pluginInitialized";

/// Emitted per plugin with the plugin's declared access rules.
pub const ACCESS_RULES_REGISTERED: &str = "accessRulesRegistered";

/// Broadcast requesting every instance to load a newly installed plugin.
pub const PLUGIN_INSTALLATION_REQUESTED: &str = "pluginInstallationRequested";

/// Instance-local: a plugin is about to be loaded on this instance.
pub const PLUGIN_INSTALLING: &str = "pluginInstalling";

/// Emitted after a dynamically installed plugin finished loading.
pub const PLUGIN_INSTALLED: &str = "pluginInstalled";

/// Broadcast requesting every instance to tear a plugin down.
pub const PLUGIN_DEREGISTRATION_REQUESTED: &str = "pluginDeregistrationRequested";

/// Instance-local: a plugin is about to be torn down on this instance.
/// Listeners run in LIFO order so dependents clean up before their provider.
pub const PLUGIN_DEREGISTERING: &str = "pluginDeregistering";

/// Emitted after a plugin was fully removed from this instance.
pub const PLUGIN_DEREGISTERED: &str = "pluginDeregistered";

/// Emitted after a user row and its dependents were deleted.
pub const USER_DELETED: &str = "userDeleted";
