use crate::error::{EngineError, EngineResult};
use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;

// ─── Claims ───────────────────────────────────────────────────

/// Claims carried by every internally-signed token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    #[serde(rename = "sub")]
    pub subject: String,
    #[serde(rename = "exp")]
    pub expiration: i64,
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(rename = "iss")]
    pub issuer: String,
    #[serde(rename = "admin")]
    pub is_admin: bool,
    #[serde(rename = "auth_grps")]
    pub authorized_groups: Vec<String>,
    #[serde(rename = "p_grp")]
    pub primary_group: String,
    #[serde(rename = "home", default)]
    pub home: Option<String>,
    #[serde(rename = "cus", default)]
    pub custom_claims: Map<String, Value>,
}

impl JwtClaims {
    /// The entity the token authenticates.
    pub fn entity(&self) -> &str {
        &self.subject
    }

    pub fn seconds_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        self.expiration - now.timestamp()
    }
}

/// What a caller asks the manager to mint.
#[derive(Clone, Debug, Default)]
pub struct TokenRequest {
    pub entity: String,
    pub authorized_groups: Vec<String>,
    pub primary_group: String,
    pub home: Option<String>,
    pub is_admin: bool,
    pub custom_claims: Map<String, Value>,
}

// ─── Signer collaborator ──────────────────────────────────────

/// Opaque signing service. The manager never sees key material; it hands
/// the unsigned `header.payload` string to the signer and carries the
/// returned signature bytes.
pub trait TokenSigner: Send + Sync {
    /// Identifier placed in the token header (`kid`).
    fn key_id(&self) -> &str;

    /// Algorithm label placed in the token header (`alg`).
    fn algorithm(&self) -> &str;

    fn sign(&self, data: &str) -> Result<Vec<u8>>;

    fn verify(&self, data: &str, signature: &[u8]) -> Result<bool>;
}

/// Deterministic keyed-digest signer for local runs and tests.
pub struct LocalKeySigner {
    key_id: String,
    key: Vec<u8>,
}

impl LocalKeySigner {
    pub fn new(key_id: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id: key_id.into(),
            key: key.into(),
        }
    }

    fn digest(&self, data: &str) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(data.as_bytes());
        hasher.update(&self.key);
        hasher.finalize().to_vec()
    }
}

impl TokenSigner for LocalKeySigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn algorithm(&self) -> &str {
        "LOCAL-SHA256"
    }

    fn sign(&self, data: &str) -> Result<Vec<u8>> {
        Ok(self.digest(data))
    }

    fn verify(&self, data: &str, signature: &[u8]) -> Result<bool> {
        Ok(self.digest(data) == signature)
    }
}

// ─── Manager ──────────────────────────────────────────────────

/// Assembles and verifies compact tokens (`header.payload.signature`,
/// base64url without padding) over the opaque signer.
pub struct InternalJwtManager {
    signer: Arc<dyn TokenSigner>,
    issuer: String,
    expiry_minutes: i64,
}

impl InternalJwtManager {
    pub fn new(signer: Arc<dyn TokenSigner>, expiry_minutes: i64) -> Self {
        Self {
            signer,
            issuer: "ratio".to_string(),
            expiry_minutes,
        }
    }

    fn encode_segment(value: &Value) -> String {
        URL_SAFE_NO_PAD.encode(value.to_string().as_bytes())
    }

    /// Decode one base64url segment back into JSON.
    pub fn decode_segment(segment: &str) -> EngineResult<Value> {
        let bytes = URL_SAFE_NO_PAD
            .decode(segment)
            .map_err(|err| EngineError::JwtVerification(format!("invalid segment encoding: {err}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| EngineError::JwtVerification(format!("invalid segment JSON: {err}")))
    }

    /// Mint a token with the manager's default expiry.
    pub fn create_token(&self, request: TokenRequest) -> EngineResult<(String, DateTime<Utc>)> {
        self.create_token_with_expiry(request, self.expiry_minutes)
    }

    /// Mint a token that expires `expiry_minutes` from now.
    pub fn create_token_with_expiry(
        &self,
        request: TokenRequest,
        expiry_minutes: i64,
    ) -> EngineResult<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now + Duration::minutes(expiry_minutes);

        let claims = JwtClaims {
            subject: request.entity,
            expiration: expires_at.timestamp(),
            issued_at: now.timestamp(),
            issuer: self.issuer.clone(),
            is_admin: request.is_admin,
            authorized_groups: request.authorized_groups,
            primary_group: request.primary_group,
            home: request.home,
            custom_claims: request.custom_claims,
        };

        let header = json!({
            "alg": self.signer.algorithm(),
            "typ": "JWT",
            "kid": self.signer.key_id(),
        });

        let payload = serde_json::to_value(&claims)
            .map_err(|err| EngineError::JwtVerification(format!("claims serialization: {err}")))?;

        let unsigned = format!(
            "{}.{}",
            Self::encode_segment(&header),
            Self::encode_segment(&payload)
        );

        let signature = self
            .signer
            .sign(&unsigned)
            .map_err(|err| EngineError::JwtVerification(format!("signing failed: {err}")))?;

        Ok((
            format!("{unsigned}.{}", URL_SAFE_NO_PAD.encode(signature)),
            expires_at,
        ))
    }

    /// Verify a token's signature and expiry, returning its claims.
    pub fn verify_token(&self, token: &str) -> EngineResult<JwtClaims> {
        let mut parts = token.split('.');
        let (Some(header_b64), Some(payload_b64), Some(signature_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(EngineError::JwtVerification("invalid JWT format".into()));
        };

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|err| EngineError::JwtVerification(format!("invalid signature encoding: {err}")))?;

        let unsigned = format!("{header_b64}.{payload_b64}");
        let valid = self
            .signer
            .verify(&unsigned, &signature)
            .map_err(|err| EngineError::JwtVerification(format!("verification error: {err}")))?;
        if !valid {
            return Err(EngineError::JwtVerification("invalid signature".into()));
        }

        let claims: JwtClaims = serde_json::from_value(Self::decode_segment(payload_b64)?)
            .map_err(|err| EngineError::JwtVerification(format!("invalid claims: {err}")))?;

        if Utc::now().timestamp() >= claims.expiration {
            return Err(EngineError::JwtVerification("token has expired".into()));
        }

        Ok(claims)
    }

    /// Decode a token's claims without verifying the signature or
    /// expiry. Only the refresh path uses this, to recover the claims of
    /// a recently-expired token.
    pub fn decode_claims_unverified(token: &str) -> EngineResult<JwtClaims> {
        let mut parts = token.split('.');
        let payload_b64 = parts
            .nth(1)
            .ok_or_else(|| EngineError::JwtVerification("invalid JWT format".into()))?;
        serde_json::from_value(Self::decode_segment(payload_b64)?)
            .map_err(|err| EngineError::JwtVerification(format!("invalid claims: {err}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_manager(expiry_minutes: i64) -> InternalJwtManager {
        InternalJwtManager::new(
            Arc::new(LocalKeySigner::new("test-key", b"secret".to_vec())),
            expiry_minutes,
        )
    }

    fn request(entity: &str) -> TokenRequest {
        TokenRequest {
            entity: entity.to_string(),
            authorized_groups: vec!["engineers".to_string()],
            primary_group: "engineers".to_string(),
            home: Some("/home/ada".to_string()),
            is_admin: false,
            custom_claims: Map::new(),
        }
    }

    #[test]
    fn test_create_and_verify_round_trip() {
        let manager = test_manager(15);
        let (token, expires_at) = manager.create_token(request("ada")).unwrap();

        let claims = manager.verify_token(&token).unwrap();
        assert_eq!(claims.entity(), "ada");
        assert_eq!(claims.primary_group, "engineers");
        assert_eq!(claims.home.as_deref(), Some("/home/ada"));
        assert_eq!(claims.expiration, expires_at.timestamp());
        assert_eq!(claims.issuer, "ratio");
    }

    #[test]
    fn test_tampered_token_rejected() {
        let manager = test_manager(15);
        let (token, _) = manager.create_token(request("ada")).unwrap();

        let mut parts: Vec<&str> = token.split('.').collect();
        let forged_payload = InternalJwtManager::encode_segment(&json!({
            "sub": "mallory", "exp": 9999999999i64, "iat": 0, "iss": "ratio",
            "admin": true, "auth_grps": [], "p_grp": "root"
        }));
        parts[1] = &forged_payload;
        let forged = parts.join(".");

        let err = manager.verify_token(&forged).unwrap_err();
        assert!(matches!(err, EngineError::JwtVerification(_)));
    }

    #[test]
    fn test_expired_token_rejected_but_decodable() {
        let manager = test_manager(15);
        let (token, _) = manager
            .create_token_with_expiry(request("ada"), -10)
            .unwrap();

        let err = manager.verify_token(&token).unwrap_err();
        assert!(err.to_string().contains("expired"));

        let claims = InternalJwtManager::decode_claims_unverified(&token).unwrap();
        assert_eq!(claims.entity(), "ada");
    }

    #[test]
    fn test_malformed_token_rejected() {
        let manager = test_manager(15);
        assert!(manager.verify_token("not-a-jwt").is_err());
        assert!(manager.verify_token("a.b").is_err());
        assert!(manager.verify_token("a.b.c.d").is_err());
    }
}
