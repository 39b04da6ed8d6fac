//! Access-token verification

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::middleware::AuthError;

/// Claims of an access token issued by the auth service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, AuthError> {
        Uuid::parse_str(&self.sub).map_err(|_| AuthError::InvalidToken)
    }
}

/// Verifies HS256 access tokens. Issuing tokens belongs to the auth service.
#[derive(Clone)]
pub struct JwtManager {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Access token rejected");
                AuthError::InvalidToken
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    fn token(sub: &str, exp: usize, secret: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            email: Some("reader@example.com".to_string()),
            exp,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token_yields_user() {
        let user = Uuid::new_v4();
        let manager = JwtManager::new(SECRET);
        let claims = manager
            .validate_token(&token(&user.to_string(), 9_999_999_999, SECRET))
            .unwrap();
        assert_eq!(claims.user_id().unwrap(), user);
        assert_eq!(claims.email.as_deref(), Some("reader@example.com"));
    }

    #[test]
    fn test_expired_or_foreign_tokens_rejected() {
        let manager = JwtManager::new(SECRET);
        let user = Uuid::new_v4().to_string();
        assert!(manager.validate_token(&token(&user, 1, SECRET)).is_err());
        assert!(manager
            .validate_token(&token(&user, 9_999_999_999, "another-secret"))
            .is_err());
        assert!(manager.validate_token("not-a-jwt").is_err());
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let manager = JwtManager::new(SECRET);
        let claims = manager
            .validate_token(&token("service-account", 9_999_999_999, SECRET))
            .unwrap();
        assert!(claims.user_id().is_err());
    }
}
