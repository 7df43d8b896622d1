//! Application bearer tokens and secret hashing.
//!
//! The wire format is exactly `ck_<36-char-uuid>_<secret>`: a fixed-width
//! canonical hyphenated uuid, then everything after the following `_` is
//! the secret. Secrets are stored only as password hashes.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

use plinth_core::AppError;

const TOKEN_PREFIX: &str = "ck_";
const UUID_LEN: usize = 36;
const SECRET_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedApplicationToken {
    pub application_id: Uuid,
    pub secret: String,
}

/// Render a token in the wire format.
pub fn format_token(application_id: &Uuid, secret: &str) -> String {
    format!("{TOKEN_PREFIX}{application_id}_{secret}")
}

/// Parse a bearer value into its application id and secret. `None` for
/// anything that is not exactly the token shape.
pub fn parse_token(token: &str) -> Option<ParsedApplicationToken> {
    let rest = token.strip_prefix(TOKEN_PREFIX)?;
    if rest.len() <= UUID_LEN {
        return None;
    }
    let (uuid_part, remainder) = rest.split_at(UUID_LEN);
    let secret = remainder.strip_prefix('_')?;
    if secret.is_empty() {
        return None;
    }
    // Only the canonical hyphenated form is fixed-width 36; reject other
    // serializations so the stored and presented ids always line up.
    if uuid_part.as_bytes()[8] != b'-' {
        return None;
    }
    let application_id = Uuid::parse_str(uuid_part).ok()?;
    Some(ParsedApplicationToken {
        application_id,
        secret: secret.to_string(),
    })
}

/// Whether a bearer value is shaped like an application token at all.
pub fn looks_like_token(token: &str) -> bool {
    token.starts_with(TOKEN_PREFIX)
}

/// Generate a fresh application secret.
pub fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

/// Hash a secret (or password) for storage.
pub fn hash_secret(secret: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AppError::Internal(format!("secret hashing failed: {e}")))
}

/// Constant-shape verification against a stored hash. Malformed hashes
/// verify as false rather than erroring.
pub fn verify_secret(secret: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_the_wire_format() {
        let id = Uuid::new_v4();
        let secret = generate_secret();
        let token = format_token(&id, &secret);

        let parsed = parse_token(&token).unwrap();
        assert_eq!(parsed.application_id, id);
        assert_eq!(parsed.secret, secret);
    }

    #[test]
    fn secrets_may_contain_underscores() {
        let id = Uuid::new_v4();
        let token = format_token(&id, "se_cr_et");
        assert_eq!(parse_token(&token).unwrap().secret, "se_cr_et");
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let id = Uuid::new_v4();
        for bad in [
            "".to_string(),
            "ck_".to_string(),
            format!("ck_{id}"),
            format!("ck_{id}_"),
            format!("bearer_{id}_secret"),
            "ck_not-a-uuid-not-a-uuid-not-a-uuid-xx_s".to_string(),
            format!("ck_{}_s", id.simple()),
        ] {
            assert!(parse_token(&bad).is_none(), "accepted {bad:?}");
        }
    }

    #[test]
    fn verify_matches_only_the_original_secret() {
        let hash = hash_secret("s3cret").unwrap();
        assert!(verify_secret("s3cret", &hash));
        assert!(!verify_secret("other", &hash));
        assert!(!verify_secret("s3cret", "not-a-hash"));
    }
}
