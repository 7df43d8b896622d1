use serde::{Deserialize, Serialize};

/// Which side of the platform a plugin package belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Backend,
    Frontend,
    Common,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::Backend => "backend",
            PluginKind::Frontend => "frontend",
            PluginKind::Common => "common",
        }
    }
}

/// Identity and provenance of one plugin, as reconciled with the `plugin`
/// table at boot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    /// The plugin id. Access rules, schemas and API paths derive from it.
    pub name: String,
    /// Package path inside the workspace (locals) or install location
    /// (remote installs).
    pub path: String,
    pub kind: PluginKind,
    pub enabled: bool,
    /// `true` for remotely installed plugins, which may be deregistered at
    /// runtime. Workspace plugins are part of the platform and may not.
    pub is_uninstallable: bool,
}

impl PluginMetadata {
    /// The schema this plugin's scoped queries run against.
    pub fn schema(&self) -> String {
        format!("plugin_{}", self.name)
    }

    /// Qualify a plugin-local access-rule id.
    pub fn qualify_rule(&self, local: &str) -> String {
        format!("{}.{}", self.name, local)
    }
}
