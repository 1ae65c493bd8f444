//! Session tokens and roles.
//!
//! Sessions are HS256 JWTs carrying the principal's identity and role. The
//! sync core does not depend on this module; the service uses it to decide
//! which mutations a caller may issue.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Errors that can occur during session handling
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Missing session token")]
    MissingToken,

    #[error("Admin role required")]
    Forbidden,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for auth operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Role of a signed-in user
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Session token claims
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub sub: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Role,
    /// Issued at timestamp
    pub iat: u64,
    /// Expiration timestamp
    pub exp: u64,
}

/// The authenticated caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Role,
}

impl Principal {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

impl From<Claims> for Principal {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            name: claims.name,
            email: claims.email,
            role: claims.role,
        }
    }
}

/// Fails unless the caller is an admin
pub fn require_admin(principal: &Principal) -> AuthResult<()> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

/// Configuration for session tokens
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// HMAC secret shared by issuer and verifier
    pub secret: String,
    /// Default token TTL in seconds
    pub token_ttl_seconds: u64,
}

impl SessionConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            token_ttl_seconds: 24 * 60 * 60,
        }
    }

    /// Set token TTL
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.token_ttl_seconds = seconds;
        self
    }

    pub fn validate(&self) -> AuthResult<()> {
        if self.secret.is_empty() {
            return Err(AuthError::InvalidConfig("session secret is empty".to_string()));
        }
        Ok(())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Verifies session tokens
#[derive(Clone)]
pub struct SessionVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl SessionVerifier {
    pub fn new(config: &SessionConfig) -> AuthResult<Self> {
        config.validate()?;
        Ok(Self {
            key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        })
    }

    pub fn verify(&self, token: &str) -> AuthResult<Principal> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims.into())
    }
}

/// Mints session tokens
pub struct SessionIssuer {
    config: SessionConfig,
}

impl SessionIssuer {
    pub fn new(config: SessionConfig) -> AuthResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn issue(&self, principal: &Principal, ttl_seconds: Option<u64>) -> AuthResult<String> {
        let now = now_secs();
        let claims = Claims {
            sub: principal.id.clone(),
            name: principal.name.clone(),
            email: principal.email.clone(),
            role: principal.role,
            iat: now,
            exp: now + ttl_seconds.unwrap_or(self.config.token_ttl_seconds),
        };

        let header = Header::new(Algorithm::HS256);
        let key = EncodingKey::from_secret(self.config.secret.as_bytes());
        Ok(encode(&header, &claims, &key)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new("test-session-secret-that-is-long-enough")
    }

    fn admin() -> Principal {
        Principal {
            id: "u1".to_string(),
            name: Some("Admin".to_string()),
            email: Some("admin@example.com".to_string()),
            role: Role::Admin,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let issuer = SessionIssuer::new(config()).unwrap();
        let verifier = SessionVerifier::new(&config()).unwrap();

        let token = issuer.issue(&admin(), None).unwrap();
        let principal = verifier.verify(&token).unwrap();

        assert_eq!(principal, admin());
        assert!(require_admin(&principal).is_ok());
    }

    #[test]
    fn test_user_is_not_admin() {
        let mut user = admin();
        user.role = Role::User;
        assert!(matches!(require_admin(&user), Err(AuthError::Forbidden)));
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let issuer = SessionIssuer::new(config()).unwrap();
        let verifier = SessionVerifier::new(&SessionConfig::new("another-secret")).unwrap();

        let token = issuer.issue(&admin(), None).unwrap();
        assert!(matches!(verifier.verify(&token), Err(AuthError::Jwt(_))));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let key = EncodingKey::from_secret(config().secret.as_bytes());
        let claims = Claims {
            sub: "u1".into(),
            name: None,
            email: None,
            role: Role::Admin,
            iat: 1_000,
            exp: 2_000,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &key).unwrap();

        let verifier = SessionVerifier::new(&config()).unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn test_missing_role_defaults_to_user() {
        let claims: Claims =
            serde_json::from_str(r#"{"sub":"u2","iat":1,"exp":2}"#).unwrap();
        assert_eq!(claims.role, Role::User);
    }

    #[test]
    fn test_empty_secret_is_invalid() {
        assert!(SessionVerifier::new(&SessionConfig::new("")).is_err());
    }
}
