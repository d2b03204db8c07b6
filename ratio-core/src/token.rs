use crate::error::{EngineError, EngineResult};
use crate::jwt::{InternalJwtManager, JwtClaims, TokenRequest};
use chrono::Utc;
use serde_json::json;

/// Lifetime of freshly minted execution tokens.
pub const EXECUTION_TOKEN_EXPIRY_MINUTES: i64 = 15;

/// A token this close to expiry gets re-signed on handler entry.
const REFRESH_WINDOW_SECS: i64 = 300;

/// An already-expired token is still refreshable this long after expiry.
const EXPIRED_GRACE_SECS: i64 = 3600;

/// Mint a 15-minute execution token from a caller token: same entity,
/// groups, home and admin flag, plus the execution marker claims.
pub fn create_execution_token(
    manager: &InternalJwtManager,
    original_token: &str,
) -> EngineResult<String> {
    let claims = manager.verify_token(original_token)?;

    let mut custom_claims = claims.custom_claims.clone();
    custom_claims.insert("token_type".to_string(), json!("execution"));
    custom_claims.insert("created_from".to_string(), json!("original_token"));
    custom_claims.insert(
        "execution_created_at".to_string(),
        json!(Utc::now().to_rfc3339()),
    );

    let (token, _) = manager.create_token_with_expiry(
        TokenRequest {
            entity: claims.subject.clone(),
            authorized_groups: claims.authorized_groups.clone(),
            primary_group: claims.primary_group.clone(),
            home: claims.home.clone(),
            is_admin: claims.is_admin,
            custom_claims,
        },
        EXECUTION_TOKEN_EXPIRY_MINUTES,
    )?;

    tracing::debug!(entity = %claims.subject, "created execution token");

    Ok(token)
}

/// Check a token on handler entry, refreshing transparently:
///
/// - still valid with > 5 minutes left → returned as-is;
/// - valid but within 5 minutes of expiry → re-signed for 15 minutes;
/// - expired less than an hour ago → re-signed for 15 minutes;
/// - anything else → `JwtVerification`.
pub fn token_check_and_refresh(
    manager: &InternalJwtManager,
    token: &str,
) -> EngineResult<String> {
    match manager.verify_token(token) {
        Ok(claims) => {
            let remaining = claims.seconds_until_expiry(Utc::now());
            if remaining > REFRESH_WINDOW_SECS {
                return Ok(token.to_string());
            }

            tracing::debug!(
                remaining_secs = remaining,
                "refreshing near-expiry token"
            );
            refresh_token(manager, &claims)
        }
        Err(EngineError::JwtVerification(_)) => {
            let claims = InternalJwtManager::decode_claims_unverified(token).map_err(|err| {
                EngineError::JwtVerification(format!("cannot refresh invalid token: {err}"))
            })?;

            let expired_for = Utc::now().timestamp() - claims.expiration;
            if expired_for > EXPIRED_GRACE_SECS {
                return Err(EngineError::JwtVerification(
                    "token expired too long ago".into(),
                ));
            }

            tracing::debug!("refreshing recently expired token");
            refresh_token(manager, &claims)
        }
        Err(other) => Err(other),
    }
}

/// Re-sign the claims for a fresh 15 minutes, preserving the execution
/// marker (adding it when the original token lacked one).
fn refresh_token(manager: &InternalJwtManager, claims: &JwtClaims) -> EngineResult<String> {
    let mut custom_claims = claims.custom_claims.clone();

    let is_execution = custom_claims
        .get("token_type")
        .and_then(|v| v.as_str())
        .map(|t| t == "execution")
        .unwrap_or(false);
    if !is_execution {
        custom_claims.insert("token_type".to_string(), json!("execution"));
        custom_claims.insert("created_from".to_string(), json!("refresh"));
    }
    custom_claims.insert("refreshed_at".to_string(), json!(Utc::now().to_rfc3339()));

    let (token, _) = manager.create_token_with_expiry(
        TokenRequest {
            entity: claims.subject.clone(),
            authorized_groups: claims.authorized_groups.clone(),
            primary_group: claims.primary_group.clone(),
            home: claims.home.clone(),
            is_admin: claims.is_admin,
            custom_claims,
        },
        EXECUTION_TOKEN_EXPIRY_MINUTES,
    )?;

    Ok(token)
}
