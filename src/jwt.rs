use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const USER_ACCESS: &str = "access";

#[derive(Error, Debug)]
pub enum JwtError {
    #[error("Token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("Token subject is not a user id")]
    InvalidSubject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub aud: String,
    pub exp: i64,
    pub iat: i64,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid, JwtError> {
        Uuid::parse_str(&self.sub).map_err(|_| JwtError::InvalidSubject)
    }
}

/// Checks signature, expiry and audience of an HS256 token.
pub fn validate_token(token: &str, secret: &str, audience: &str) -> Result<Claims, JwtError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[audience]);
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )?;
    Ok(data.claims)
}

/// Issues an access token for `user_id`. Used by local tooling and tests; production
/// tokens come from the identity service sharing `JWT_SECRET`.
pub fn create_token(
    user_id: Uuid,
    secret: &str,
    audience: &str,
    ttl: Duration,
) -> Result<String, JwtError> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        aud: audience.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
    };
    Ok(encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}
