//! Token validation for the handshake.
//!
//! Same shared-secret HS256 path as a typical bearer-JWT auth middleware,
//! with none of the DID-document resolution or multi-algorithm support a
//! multi-tenant service would need, since this gateway only ever has one
//! audience — itself.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, GatewayResult};

/// Claims a validated credential must carry to identify on the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the authenticated user id.
    pub sub: String,
    /// Upstream session hint, if the issuer pins one (optional).
    #[serde(default)]
    pub session: Option<String>,
    #[serde(rename = "type")]
    pub token_type: String,
    pub exp: i64,
}

/// Verifies a bearer credential presented in an Identify frame and produces
/// the claims the connection actor needs to register with the hub. A trait
/// so tests can substitute a fixed-claims stand-in instead of signing real
/// JWTs.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> GatewayResult<Claims>;
}

/// HS256 shared-secret validator (spec's assumed deployment: a single
/// trusted issuer shares a signing secret with the gateway).
pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

/// The only token type this gateway accepts on Identify/Resume — a refresh
/// token or any other issuer-minted type is a mismatched-type auth failure.
const ACCESS_TOKEN_TYPE: &str = "access";

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> GatewayResult<Claims> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| GatewayError::Auth(e.to_string()))?;
        if claims.token_type != ACCESS_TOKEN_TYPE {
            return Err(GatewayError::Auth(format!("wrong token type: {}", claims.token_type)));
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn sign(secret: &str, claims: &Claims) -> String {
        encode(&Header::new(jsonwebtoken::Algorithm::HS256), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[test]
    fn validates_well_formed_token() {
        let claims = Claims {
            sub: "user-1".into(),
            session: None,
            token_type: "access".into(),
            exp: (chrono::Utc::now().timestamp() + 3600),
        };
        let token = sign("topsecret", &claims);
        let validator = JwtValidator::new("topsecret");
        let decoded = validator.validate(&token).unwrap();
        assert_eq!(decoded.sub, "user-1");
    }

    #[test]
    fn rejects_token_signed_with_wrong_secret() {
        let claims = Claims {
            sub: "user-1".into(),
            session: None,
            token_type: "access".into(),
            exp: (chrono::Utc::now().timestamp() + 3600),
        };
        let token = sign("right-secret", &claims);
        let validator = JwtValidator::new("wrong-secret");
        let err = validator.validate(&token).unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[test]
    fn rejects_mismatched_token_type() {
        let claims = Claims {
            sub: "user-1".into(),
            session: None,
            token_type: "refresh".into(),
            exp: (chrono::Utc::now().timestamp() + 3600),
        };
        let token = sign("topsecret", &claims);
        let validator = JwtValidator::new("topsecret");
        let err = validator.validate(&token).unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[test]
    fn rejects_expired_token() {
        let claims = Claims {
            sub: "user-1".into(),
            session: None,
            token_type: "access".into(),
            exp: (chrono::Utc::now().timestamp() - 10),
        };
        let token = sign("topsecret", &claims);
        let validator = JwtValidator::new("topsecret");
        assert!(validator.validate(&token).is_err());
    }
}
