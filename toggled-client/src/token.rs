//! HS256 bearer tokens signed with the connection string's access key.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::Serialize;

use crate::types::{Error, Result};

/// A signed, time-limited bearer token.
#[derive(Clone)]
pub struct AccessToken {
    pub value: String,
    pub audience: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("audience", &self.audience)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[derive(Serialize)]
struct Claims<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    nameid: Option<&'a str>,
    nbf: i64,
    exp: i64,
    iat: i64,
    aud: &'a str,
}

/// Claims use whole seconds, so anything shorter would expire on issue.
const MIN_LIFETIME: Duration = Duration::from_secs(1);

/// Mints tokens from a shared secret. No issuer claim is set.
#[derive(Clone)]
pub struct TokenIssuer {
    secret: Arc<str>,
}

impl TokenIssuer {
    pub fn new(secret: impl Into<Arc<str>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Issue a token for `audience`, optionally naming `subject`, valid for
    /// `lifetime` from now.
    pub fn issue(
        &self,
        audience: &str,
        subject: Option<&str>,
        lifetime: Duration,
    ) -> Result<AccessToken> {
        if self.secret.is_empty() {
            return Err(Error::Signing("access key is empty".to_string()));
        }
        if lifetime < MIN_LIFETIME {
            return Err(Error::Signing(format!(
                "token lifetime {lifetime:?} is shorter than {MIN_LIFETIME:?}"
            )));
        }
        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|e| Error::Signing(format!("invalid token lifetime: {e}")))?;
        let now = Utc::now();
        let expires_at = now
            .checked_add_signed(lifetime)
            .ok_or_else(|| Error::Signing("token lifetime overflows".to_string()))?;

        let claims = Claims {
            nameid: subject,
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            aud: audience,
        };
        let value = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| Error::Signing(format!("failed to encode token: {e}")))?;

        Ok(AccessToken {
            value,
            audience: audience.to_string(),
            expires_at,
        })
    }
}

impl fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenIssuer").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};

    use super::*;

    fn decode_claims(token: &str, secret: &str, audience: &str) -> serde_json::Value {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[audience]);
        decode::<serde_json::Value>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )
        .unwrap()
        .claims
    }

    #[test]
    fn issues_hs256_token() {
        let audience = "https://example.com/client/?hub=flags";
        let token = TokenIssuer::new("secret")
            .issue(audience, Some("host-1"), Duration::from_secs(3600))
            .unwrap();

        assert_eq!(token.value.split('.').count(), 3);
        let header = decode_header(&token.value).unwrap();
        assert_eq!(header.alg, Algorithm::HS256);
        assert_eq!(header.typ.as_deref(), Some("JWT"));

        let claims = decode_claims(&token.value, "secret", audience);
        assert_eq!(claims["aud"], audience);
        assert_eq!(claims["nameid"], "host-1");
        assert!(claims.get("iss").is_none());
        assert_eq!(claims["exp"].as_i64(), Some(token.expires_at.timestamp()));
        assert_eq!(claims["nbf"], claims["iat"]);
    }

    #[test]
    fn subject_claim_omitted_without_subject() {
        let token = TokenIssuer::new("secret")
            .issue("aud", None, Duration::from_secs(60))
            .unwrap();
        let claims = decode_claims(&token.value, "secret", "aud");
        assert!(claims.get("nameid").is_none());
    }

    #[test]
    fn expiry_is_in_the_future() {
        let before = Utc::now();
        let token = TokenIssuer::new("secret")
            .issue("aud", None, Duration::from_secs(3600))
            .unwrap();
        assert!(token.expires_at > before);
        assert!(token.expires_at <= Utc::now() + chrono::Duration::seconds(3600));
        assert_eq!(token.audience, "aud");
    }

    #[test]
    fn shortest_lifetime_still_expires_after_issue() {
        let token = TokenIssuer::new("secret")
            .issue("aud", None, Duration::from_secs(1))
            .unwrap();
        let claims = decode_claims(&token.value, "secret", "aud");
        assert!(claims["exp"].as_i64() > claims["nbf"].as_i64());
    }

    #[test]
    fn sub_second_lifetime_is_a_signing_error() {
        for lifetime in [Duration::ZERO, Duration::from_millis(999)] {
            let err = TokenIssuer::new("secret")
                .issue("aud", None, lifetime)
                .unwrap_err();
            assert!(matches!(err, Error::Signing(_)), "{lifetime:?}: {err:?}");
        }
    }

    #[test]
    fn empty_secret_is_a_signing_error() {
        let err = TokenIssuer::new("")
            .issue("aud", None, Duration::from_secs(60))
            .unwrap_err();
        assert!(matches!(err, Error::Signing(_)));
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let token = TokenIssuer::new("secret")
            .issue("aud", Some("me"), Duration::from_secs(60))
            .unwrap();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&["aud"]);
        let result = decode::<serde_json::Value>(
            &token.value,
            &DecodingKey::from_secret(b"other"),
            &validation,
        );
        assert!(result.is_err());
    }

    #[test]
    fn debug_redacts_token_value() {
        let token = TokenIssuer::new("secret")
            .issue("aud", None, Duration::from_secs(60))
            .unwrap();
        assert!(!format!("{token:?}").contains(&token.value));
    }
}
