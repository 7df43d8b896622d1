//! Access-rule and system-role identities.

/// System roles, seeded at boot and protected from deletion.
pub const ROLE_ADMIN: &str = "admin";
pub const ROLE_USERS: &str = "users";
pub const ROLE_ANONYMOUS: &str = "anonymous";
pub const ROLE_APPLICATIONS: &str = "applications";

pub const SYSTEM_ROLES: [&str; 4] = [ROLE_ADMIN, ROLE_USERS, ROLE_ANONYMOUS, ROLE_APPLICATIONS];

/// The rule the `admin` role implicitly holds.
pub const WILDCARD_RULE: &str = "*";

/// Id of the seeded initial admin. Checked by equality for the
/// non-deletion rule.
pub const INITIAL_ADMIN_ID: &str = "initial-admin-id";

/// Whether `id` is a well-formed namespaced rule id: `<pluginId>.<local>`
/// with a non-empty plugin id and a non-empty, dot-free local part.
pub fn is_qualified_rule_id(id: &str) -> bool {
    match id.split_once('.') {
        Some((plugin, local)) => !plugin.is_empty() && !local.is_empty() && !local.contains('.'),
        None => false,
    }
}

/// The plugin owning a namespaced rule id.
pub fn rule_plugin(id: &str) -> Option<&str> {
    id.split_once('.').map(|(plugin, _)| plugin)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_ids_have_one_dot() {
        assert!(is_qualified_rule_id("catalog.read"));
        assert!(!is_qualified_rule_id("read"));
        assert!(!is_qualified_rule_id(".read"));
        assert!(!is_qualified_rule_id("catalog."));
        assert!(!is_qualified_rule_id("a.b.c"));
    }

    #[test]
    fn rule_plugin_extracts_namespace() {
        assert_eq!(rule_plugin("catalog.read"), Some("catalog"));
        assert_eq!(rule_plugin("bare"), None);
    }
}
