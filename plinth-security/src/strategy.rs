//! Session authentication strategy contract and the credential policy.
//!
//! Concrete strategies (social/OAuth providers) are external collaborators;
//! the platform validates sessions through this trait and enriches the
//! returned user with roles, rules and teams.

use async_trait::async_trait;
use http::HeaderMap;

use plinth_core::AppError;

/// A user as resolved by a session strategy, before enrichment.
#[derive(Debug, Clone)]
pub struct SessionUser {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
}

/// Validates the session credentials carried by a request (cookie, bearer
/// session token - the strategy's choice).
#[async_trait]
pub trait AuthenticationStrategy: Send + Sync + 'static {
    /// `Ok(None)` when the request carries no session for this strategy;
    /// an error only for credentials that are present and invalid.
    async fn authenticate(&self, headers: &HeaderMap) -> Result<Option<SessionUser>, AppError>;
}

/// Password policy for the credential strategy: at least 8 characters, one
/// uppercase letter and one digit.
pub fn validate_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < 8 {
        return Err(AppError::BadRequest(
            "password must be at least 8 characters".into(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(AppError::BadRequest(
            "password must contain an uppercase letter".into(),
        ));
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        return Err(AppError::BadRequest("password must contain a digit".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_a_conforming_password() {
        assert!(validate_password("Sup3rsecret").is_ok());
    }

    #[test]
    fn rejects_short_passwords() {
        assert!(validate_password("Ab1").is_err());
    }

    #[test]
    fn rejects_missing_uppercase() {
        assert!(validate_password("lowercase1").is_err());
    }

    #[test]
    fn rejects_missing_digit() {
        assert!(validate_password("NoDigitsHere").is_err());
    }
}
