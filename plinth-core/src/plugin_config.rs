//! Versioned, encrypted-at-rest per-plugin configuration.
//!
//! Plugins read and write JSON config blobs keyed by `(plugin_id,
//! config_id)`. A config schema marks secret fields with `"x-secret": true`;
//! those values are encrypted recursively before they hit the database and
//! transparently decrypted on read. Everything else is stored as-is so the
//! rows stay inspectable.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use serde_json::Value;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::sync::Arc;
use tracing::warn;

use crate::error::AppError;

/// Prefix marking an encrypted string value inside a stored blob.
const ENC_PREFIX: &str = "enc:";

/// AES-256-GCM cipher for secret config values.
pub struct SecretCipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl SecretCipher {
    /// Build from a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, AppError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| AppError::Internal(format!("config encryption key is not base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AppError> {
        let unbound = UnboundKey::new(&AES_256_GCM, bytes)
            .map_err(|_| AppError::Internal("config encryption key must be 32 bytes".into()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Generate an ephemeral key. Encrypted values do not survive a
    /// restart with a fresh key, so production sets an explicit one.
    pub fn ephemeral() -> Self {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes).expect("system rng unavailable");
        warn!("no config encryption key set, generated an ephemeral one");
        Self::from_bytes(&bytes).expect("freshly generated key is valid")
    }

    fn encrypt(&self, plaintext: &str) -> Result<String, AppError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| AppError::Internal("rng failure".into()))?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| AppError::Internal("secret encryption failed".into()))?;

        let mut combined = nonce_bytes.to_vec();
        combined.extend_from_slice(&in_out);
        Ok(format!("{ENC_PREFIX}{}", BASE64.encode(combined)))
    }

    fn decrypt(&self, stored: &str) -> Result<String, AppError> {
        let encoded = stored
            .strip_prefix(ENC_PREFIX)
            .ok_or_else(|| AppError::Internal("value is not encrypted".into()))?;
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| AppError::Internal(format!("corrupt encrypted value: {e}")))?;
        if combined.len() < NONCE_LEN {
            return Err(AppError::Internal("corrupt encrypted value".into()));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
            .map_err(|_| AppError::Internal("corrupt encrypted value".into()))?;
        let mut in_out = ciphertext.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| AppError::Internal("secret decryption failed".into()))?;
        String::from_utf8(plain.to_vec())
            .map_err(|_| AppError::Internal("decrypted value is not utf-8".into()))
    }
}

/// Walk `value` alongside `schema`, encrypting every string under a
/// property marked `"x-secret": true`. Arrays apply the `items` schema to
/// each element.
fn encrypt_marked(
    cipher: &SecretCipher,
    value: &mut Value,
    schema: &Value,
) -> Result<(), AppError> {
    if schema.get("x-secret").and_then(Value::as_bool) == Some(true) {
        if let Value::String(s) = value {
            if !s.starts_with(ENC_PREFIX) {
                *value = Value::String(cipher.encrypt(s)?);
            }
        }
        return Ok(());
    }

    match value {
        Value::Object(map) => {
            let properties = schema.get("properties");
            for (key, child) in map.iter_mut() {
                if let Some(child_schema) = properties.and_then(|p| p.get(key)) {
                    encrypt_marked(cipher, child, child_schema)?;
                }
            }
        }
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for item in items.iter_mut() {
                    encrypt_marked(cipher, item, item_schema)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Decrypt every `enc:`-prefixed string in the tree.
fn decrypt_all(cipher: &SecretCipher, value: &mut Value) -> Result<(), AppError> {
    match value {
        Value::String(s) if s.starts_with(ENC_PREFIX) => {
            *value = Value::String(cipher.decrypt(s)?);
        }
        Value::Object(map) => {
            for child in map.values_mut() {
                decrypt_all(cipher, child)?;
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                decrypt_all(cipher, item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Read/write access to plugin config rows. Handed to plugins through the
/// service registry; each call is scoped by the plugin id.
#[derive(Clone)]
pub struct ConfigService {
    pool: PgPool,
    cipher: Arc<SecretCipher>,
}

impl ConfigService {
    pub fn new(pool: PgPool, cipher: Arc<SecretCipher>) -> Self {
        Self { pool, cipher }
    }

    /// Fetch a config blob with secrets decrypted. `None` when unset.
    pub async fn get(&self, plugin_id: &str, config_id: &str) -> Result<Option<Value>, AppError> {
        let row = sqlx::query(
            "SELECT data FROM plugin_config WHERE plugin_id = $1 AND config_id = $2",
        )
        .bind(plugin_id)
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let mut data: Value = row.try_get("data").map_err(AppError::from)?;
                decrypt_all(&self.cipher, &mut data)?;
                Ok(Some(data))
            }
            None => Ok(None),
        }
    }

    /// Store a config blob, encrypting fields the schema marks as secret,
    /// and bump the version.
    pub async fn set(
        &self,
        plugin_id: &str,
        config_id: &str,
        mut data: Value,
        schema: &Value,
    ) -> Result<(), AppError> {
        encrypt_marked(&self.cipher, &mut data, schema)?;

        sqlx::query(
            "INSERT INTO plugin_config (plugin_id, config_id, version, data, updated_at)
             VALUES ($1, $2, 1, $3, now())
             ON CONFLICT (plugin_id, config_id)
             DO UPDATE SET data = EXCLUDED.data,
                           version = plugin_config.version + 1,
                           updated_at = now()",
        )
        .bind(plugin_id)
        .bind(config_id)
        .bind(&data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cipher() -> SecretCipher {
        SecretCipher::from_bytes(&[7u8; 32]).unwrap()
    }

    #[test]
    fn round_trips_a_secret() {
        let c = cipher();
        let stored = c.encrypt("hunter2").unwrap();
        assert!(stored.starts_with(ENC_PREFIX));
        assert_eq!(c.decrypt(&stored).unwrap(), "hunter2");
    }

    #[test]
    fn marked_fields_are_encrypted_recursively() {
        let c = cipher();
        let schema = json!({
            "properties": {
                "endpoint": { "type": "string" },
                "token": { "type": "string", "x-secret": true },
                "nested": {
                    "properties": {
                        "password": { "type": "string", "x-secret": true }
                    }
                }
            }
        });
        let mut value = json!({
            "endpoint": "https://example.test",
            "token": "tok-123",
            "nested": { "password": "pw" }
        });

        encrypt_marked(&c, &mut value, &schema).unwrap();
        assert_eq!(value["endpoint"], "https://example.test");
        assert!(value["token"].as_str().unwrap().starts_with(ENC_PREFIX));
        assert!(value["nested"]["password"]
            .as_str()
            .unwrap()
            .starts_with(ENC_PREFIX));

        decrypt_all(&c, &mut value).unwrap();
        assert_eq!(value["token"], "tok-123");
        assert_eq!(value["nested"]["password"], "pw");
    }

    #[test]
    fn array_items_follow_the_items_schema() {
        let c = cipher();
        let schema = json!({
            "properties": {
                "keys": { "items": { "x-secret": true } }
            }
        });
        let mut value = json!({ "keys": ["a", "b"] });
        encrypt_marked(&c, &mut value, &schema).unwrap();
        for key in value["keys"].as_array().unwrap() {
            assert!(key.as_str().unwrap().starts_with(ENC_PREFIX));
        }
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let stored = cipher().encrypt("s").unwrap();
        let other = SecretCipher::from_bytes(&[9u8; 32]).unwrap();
        assert!(other.decrypt(&stored).is_err());
    }
}
