use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

use crate::models::{AuthPayload, User};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("password hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    Ok(hash(password, DEFAULT_COST)?)
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    Ok(verify(password, hash)?)
}

/// Signs and checks the HS256 bearer tokens handed out at login.
#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_secs: u64,
}

impl TokenKeys {
    pub fn new(secret: &[u8], ttl_secs: u64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl_secs,
        }
    }

    pub fn issue(&self, user: &User) -> Result<String, AuthError> {
        let now = u64::try_from(Utc::now().timestamp()).unwrap_or_default();
        let claims = AuthPayload {
            sub: user.id,
            email: user.email.clone(),
            exp: usize::try_from(now.saturating_add(self.ttl_secs)).unwrap_or(usize::MAX),
        };

        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn validate(&self, token: &str) -> Result<AuthPayload, AuthError> {
        let token_data = decode::<AuthPayload>(
            token,
            &self.decoding,
            &Validation::new(Algorithm::HS256),
        )?;
        Ok(token_data.claims)
    }
}
