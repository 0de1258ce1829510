//! Auth and tenant management: JWT issuance/validation and bcrypt password
//! hashing generalized from the teacher's `auth.rs` (which hardcoded its
//! signing key) to read `AuthConfig::jwt_secret_key`; API-key hashing and
//! tenant CRUD are new, grounded on spec.md §3's `Tenant`/`ApiKeyRecord`
//! shapes and backed by a dedicated sled tree via `Storage`'s database.

use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::{AidbError, AidbResult};
use crate::models::{ApiKeyRecord, AuthPayload, Tenant, TenantQuotas};

pub fn hash_password(password: &str) -> AidbResult<String> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| AidbError::Internal(e.to_string()))
}

pub fn verify_password(password: &str, hash: &str) -> AidbResult<bool> {
    bcrypt::verify(password, hash).map_err(|e| AidbError::Internal(e.to_string()))
}

pub fn create_jwt(auth: &AuthConfig, username: &str) -> AidbResult<String> {
    let expiration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AidbError::Internal(e.to_string()))?
        .as_secs() as usize
        + (auth.jwt_expiration_hours.max(0) as usize) * 3600;

    let claims = AuthPayload { sub: username.to_owned(), exp: expiration };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(auth.jwt_secret_key.as_bytes()))
        .map_err(|e| AidbError::Unauthenticated(e.to_string()))
}

pub fn validate_jwt(auth: &AuthConfig, token: &str) -> AidbResult<AuthPayload> {
    let token_data = decode::<AuthPayload>(
        token,
        &DecodingKey::from_secret(auth.jwt_secret_key.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| AidbError::Unauthenticated(e.to_string()))?;
    Ok(token_data.claims)
}

/// A freshly minted API key: only the plaintext `key` is returned to the
/// caller at creation time, never stored — only its hash is persisted
/// in the `ApiKeyRecord`.
pub struct IssuedApiKey {
    pub record: ApiKeyRecord,
    pub plaintext: String,
}

pub fn issue_api_key() -> IssuedApiKey {
    let plaintext = format!("aidb_{}", Uuid::new_v4().simple());
    let record = ApiKeyRecord {
        id: Uuid::new_v4().to_string(),
        key_hash: hash_api_key(&plaintext),
        created_at: Utc::now(),
        last_used_at: None,
    };
    IssuedApiKey { record, plaintext }
}

/// API keys are hashed with SHA-256 rather than bcrypt: they are
/// high-entropy random tokens, not user-chosen passwords, so a slow KDF
/// buys nothing and would make every authenticated request pay bcrypt's cost.
pub fn hash_api_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_api_key(plaintext: &str, tenant: &Tenant) -> Option<String> {
    let hash = hash_api_key(plaintext);
    tenant.api_keys.iter().find(|k| k.key_hash == hash).map(|k| k.id.clone())
}

/// Creates a new tenant with empty quotas; the caller fills them in via
/// `update_quotas` once provisioning details are known.
pub fn new_tenant(id: impl Into<String>) -> Tenant {
    Tenant {
        id: id.into(),
        active: true,
        permissions: vec!["read".into(), "write".into()],
        quotas: TenantQuotas::default(),
        rate_limit_overrides: std::collections::HashMap::new(),
        api_keys: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_config() -> AuthConfig {
        AuthConfig { jwt_secret_key: "test-secret".into(), jwt_expiration_hours: 1 }
    }

    #[test]
    fn jwt_round_trips_username() {
        let cfg = auth_config();
        let token = create_jwt(&cfg, "alice").unwrap();
        let claims = validate_jwt(&cfg, &token).unwrap();
        assert_eq!(claims.sub, "alice");
    }

    #[test]
    fn jwt_rejects_token_signed_with_different_secret() {
        let cfg_a = auth_config();
        let cfg_b = AuthConfig { jwt_secret_key: "other-secret".into(), jwt_expiration_hours: 1 };
        let token = create_jwt(&cfg_a, "alice").unwrap();
        assert!(validate_jwt(&cfg_b, &token).is_err());
    }

    #[test]
    fn password_hash_round_trips_and_rejects_wrong_password() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash).unwrap());
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn api_key_verifies_against_issuing_tenant() {
        let issued = issue_api_key();
        let mut tenant = new_tenant("t1");
        tenant.api_keys.push(issued.record.clone());
        assert_eq!(verify_api_key(&issued.plaintext, &tenant), Some(issued.record.id));
        assert_eq!(verify_api_key("wrong-key", &tenant), None);
    }
}
