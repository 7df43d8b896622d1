//! Service tokens for inter-plugin calls.
//!
//! Short-lived RS256 JWTs carrying a `service` claim with the emitting
//! plugin's id. The key pair is generated per process; the public key is
//! published at `/.well-known/jwks.json` so sidecars can verify tokens
//! without a shared secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::json;

use plinth_core::{AppError, JwksSource, ServiceTokenIssuer};

/// Service tokens are valid for five minutes.
const SERVICE_TOKEN_TTL_SECS: i64 = 300;

const ISSUER: &str = "plinth";

const KEY_BITS: usize = 2048;

/// A public key's modulus and exponent, base64url-encoded the way a JWK
/// carries them. The same pair feeds the verifying key and the published
/// JWKS document.
fn jwk_components(key: &RsaPublicKey) -> (String, String) {
    (
        URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceTokenClaims {
    /// The emitting plugin's id.
    pub service: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// RSA key pair for signing and verifying service tokens.
pub struct ServiceTokenKeys {
    kid: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    /// JWK `n`/`e` of the public key, kept for the JWKS document.
    n: String,
    e: String,
}

impl ServiceTokenKeys {
    /// Generate a fresh key pair. Keys are per-process; a fleet stays
    /// verifiable because every instance publishes its key under its own
    /// `kid`.
    pub fn generate(kid: &str) -> Self {
        let private = RsaPrivateKey::new(&mut OsRng, KEY_BITS).expect("RSA key generation failed");
        Self::from_private_key(private, kid)
    }

    fn from_private_key(private: RsaPrivateKey, kid: &str) -> Self {
        let (n, e) = jwk_components(&private.to_public_key());
        let pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .expect("PKCS8 export of a freshly generated key");

        Self {
            kid: kid.to_string(),
            encoding_key: EncodingKey::from_rsa_pem(pem.as_bytes())
                .expect("signing key from exported PEM"),
            decoding_key: DecodingKey::from_rsa_components(&n, &e)
                .expect("verifying key from JWK components"),
            n,
            e,
        }
    }

    /// Sign a token asserting `plugin_id` as the calling service.
    pub fn sign(&self, plugin_id: &str) -> Result<String, AppError> {
        let now = Utc::now().timestamp();
        let claims = ServiceTokenClaims {
            service: plugin_id.to_string(),
            iss: ISSUER.to_string(),
            iat: now,
            exp: now + SERVICE_TOKEN_TTL_SECS,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.kid.clone());
        encode(&header, &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("service token signing failed: {e}")))
    }

    /// Verify a token and return its claims. Expired or foreign tokens fail.
    pub fn verify(&self, token: &str) -> Result<ServiceTokenClaims, AppError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[ISSUER]);
        validation.validate_aud = false;

        decode::<ServiceTokenClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::Unauthorized(format!("invalid service token: {e}")))
    }

    /// The JWKS document for the public key.
    pub fn jwks_json(&self) -> serde_json::Value {
        json!({
            "keys": [{
                "kty": "RSA",
                "alg": "RS256",
                "use": "sig",
                "kid": self.kid,
                "n": self.n,
                "e": self.e,
            }]
        })
    }
}

impl JwksSource for ServiceTokenKeys {
    fn jwks(&self) -> serde_json::Value {
        self.jwks_json()
    }
}

impl ServiceTokenIssuer for ServiceTokenKeys {
    fn issue(&self, plugin_id: &str) -> Result<String, AppError> {
        self.sign(plugin_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let keys = ServiceTokenKeys::generate("svc-1");
        let token = keys.sign("catalog").unwrap();

        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.service, "catalog");
        assert_eq!(claims.iss, ISSUER);
        assert!(claims.exp - claims.iat == SERVICE_TOKEN_TTL_SECS);
    }

    #[test]
    fn foreign_keys_do_not_verify() {
        let keys = ServiceTokenKeys::generate("svc-1");
        let other = ServiceTokenKeys::generate("svc-2");
        let token = keys.sign("catalog").unwrap();
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn garbage_does_not_verify() {
        let keys = ServiceTokenKeys::generate("svc-1");
        assert!(keys.verify("not-a-jwt").is_err());
    }

    #[test]
    fn jwks_document_carries_the_kid() {
        let keys = ServiceTokenKeys::generate("svc-1");
        let jwks = keys.jwks_json();
        assert_eq!(jwks["keys"][0]["kid"], "svc-1");
        assert_eq!(jwks["keys"][0]["alg"], "RS256");
    }
}
