//! # plinth-security: access control
//!
//! The access-control subsystem every plinth plugin consumes: the
//! users/roles/access-rules/teams data model, synchronization of
//! code-declared plugin rules into the database, request authentication
//! (service tokens, application bearer tokens, session strategies), and
//! permission evaluation including team-scoped resources.
//!
//! It plugs into the host through `plinth-core`'s `Authenticator`,
//! `JwksSource` and `ServiceTokenIssuer` seams.

pub mod applications;
pub mod auth;
pub mod authz;
pub mod models;
pub mod onboarding;
pub mod roles;
pub mod rules;
pub mod seed;
pub mod service_token;
pub mod strategy;
pub mod sync;
pub mod teams;
pub mod tokens;
pub mod users;

pub use applications::{ApplicationService, IssuedApplication};
pub use auth::{AnonymousRuleCache, AuthService};
pub use authz::{evaluate_team_access, PermissionService, ResourceAction};
pub use models::{
    AccessRuleRow, ApplicationRow, RoleRow, SessionRow, TeamGrant, TeamRow, UserRow,
};
pub use onboarding::OnboardingService;
pub use roles::RoleService;
pub use rules::{
    is_qualified_rule_id, rule_plugin, INITIAL_ADMIN_ID, ROLE_ADMIN, ROLE_ANONYMOUS,
    ROLE_APPLICATIONS, ROLE_USERS, SYSTEM_ROLES, WILDCARD_RULE,
};
pub use seed::seed;
pub use service_token::{ServiceTokenClaims, ServiceTokenKeys};
pub use strategy::{validate_password, AuthenticationStrategy, SessionUser};
pub use sync::{plan_full_sync, RuleSyncService, SyncPlan};
pub use teams::TeamService;
pub use tokens::{format_token, generate_secret, parse_token, ParsedApplicationToken};
pub use users::UserService;
