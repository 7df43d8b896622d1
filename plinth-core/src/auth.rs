//! Authentication seams.
//!
//! The core assembles a [`Caller`] for every request but does not know how
//! to authenticate one; the access-control subsystem implements
//! [`Authenticator`] and the platform binary wires it in. This keeps the
//! host free of credential-validation details the same way the identity
//! traits decouple guards from a concrete identity type.

use async_trait::async_trait;
use axum::http::HeaderMap;
use uuid::Uuid;

use crate::error::AppError;

/// An authenticated principal with its effective permissions resolved.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    /// Effective access rules: the union across the principal's roles.
    /// Holding `admin` collapses to the single wildcard `*`.
    pub access_rules: Vec<String>,
    /// Teams the principal belongs to.
    pub team_ids: Vec<Uuid>,
}

impl Principal {
    /// Whether the principal's rules satisfy every required rule.
    pub fn has_rules(&self, required: &[&str]) -> bool {
        if self.access_rules.iter().any(|r| r == "*") {
            return true;
        }
        required
            .iter()
            .all(|req| self.access_rules.iter().any(|r| r == req))
    }
}

/// The resolved caller of a request. Exactly one authenticator wins;
/// otherwise the caller is anonymous.
#[derive(Debug, Clone)]
pub enum Caller {
    /// An internally signed service token from an inter-plugin call.
    Service { plugin_id: String },
    /// An external application presenting a `ck_` bearer token.
    Application(Principal),
    /// A session user validated by the authentication strategy.
    User(Principal),
    /// No authenticator succeeded. Carries the `anonymous` role's rules so
    /// public-default rules still evaluate.
    Anonymous { access_rules: Vec<String> },
}

impl Caller {
    pub fn anonymous() -> Self {
        Caller::Anonymous {
            access_rules: Vec::new(),
        }
    }

    pub fn principal(&self) -> Option<&Principal> {
        match self {
            Caller::Application(p) | Caller::User(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Caller::Anonymous { .. })
    }
}

/// Resolves the caller of a request from its headers.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    /// Never errors for *absent* credentials (that is an anonymous caller);
    /// errors only for credentials that are present and invalid.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Caller, AppError>;
}

/// Supplies the platform's service-token public keys for
/// `/.well-known/jwks.json`.
pub trait JwksSource: Send + Sync + 'static {
    fn jwks(&self) -> serde_json::Value;
}

/// Mints short-lived service tokens for outbound inter-plugin calls.
pub trait ServiceTokenIssuer: Send + Sync + 'static {
    fn issue(&self, plugin_id: &str) -> Result<String, AppError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(rules: &[&str]) -> Principal {
        Principal {
            id: "u1".into(),
            name: None,
            email: None,
            access_rules: rules.iter().map(|r| r.to_string()).collect(),
            team_ids: vec![],
        }
    }

    #[test]
    fn wildcard_satisfies_everything() {
        let p = principal(&["*"]);
        assert!(p.has_rules(&["catalog.read", "catalog.manage"]));
    }

    #[test]
    fn all_required_rules_must_be_present() {
        let p = principal(&["catalog.read"]);
        assert!(p.has_rules(&["catalog.read"]));
        assert!(!p.has_rules(&["catalog.read", "catalog.manage"]));
    }

    #[test]
    fn empty_requirement_always_passes() {
        assert!(principal(&[]).has_rules(&[]));
    }
}
