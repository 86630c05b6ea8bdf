use crate::{
    api::AppState,
    config::AuthConfig,
    error::{MarketError, Result},
    model::Role,
    UserId,
};
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Subject used in tokens issued to the configured administrator.
pub const ADMIN_SUBJECT: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: Role,
    pub exp: usize,
    pub iat: usize,
}

pub struct AuthService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_ttl: Duration,
    admin_username: String,
    admin_password: Option<String>,
}

impl AuthService {
    pub fn new(config: &AuthConfig) -> Self {
        let secret = match config.jwt_secret.as_deref().filter(|s| !s.is_empty()) {
            Some(secret) => secret.to_string(),
            None => {
                tracing::warn!("no JWT secret configured; tokens will not survive a restart");
                hex::encode(rand::thread_rng().gen::<[u8; 32]>())
            }
        };

        let admin_password = config.admin_password.clone().filter(|p| !p.is_empty());
        if admin_password.is_none() {
            tracing::warn!("no admin password configured; admin login is disabled");
        }

        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_ttl: Duration::hours(config.token_ttl_hours),
            admin_username: config.admin_username.clone(),
            admin_password,
        }
    }

    pub fn hash_password(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
        Ok(hash.to_string())
    }

    pub fn verify_password(&self, password: &str, stored_hash: &str) -> Result<bool> {
        let parsed = PasswordHash::new(stored_hash)?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }

    pub fn issue_token(&self, subject: &str, email: &str, role: Role) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            email: email.to_string(),
            role,
            exp: (now + self.token_ttl).timestamp() as usize,
            iat: now.timestamp() as usize,
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| MarketError::Internal(format!("Failed to generate JWT: {}", e)))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }

    pub fn check_admin_credentials(&self, username: &str, password: &str) -> bool {
        let Some(expected) = self.admin_password.as_deref().filter(|p| !p.is_empty()) else {
            return false;
        };
        // Compare digests so the comparison time does not depend on the secret's prefix.
        let username_ok = Sha256::digest(username.as_bytes()) == Sha256::digest(self.admin_username.as_bytes());
        let password_ok = Sha256::digest(password.as_bytes()) == Sha256::digest(expected.as_bytes());
        username_ok && password_ok
    }

    pub fn admin_email(&self) -> String {
        format!("{}@medcycle.local", self.admin_username)
    }
}

/// Any caller presenting a valid bearer token.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub subject: String,
    pub email: String,
    pub role: Role,
}

impl AuthUser {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn user_id(&self) -> Result<UserId> {
        UserId::parse_str(&self.subject)
            .map_err(|_| MarketError::Auth("Invalid token subject".to_string()))
    }
}

fn bearer_token(parts: &Parts) -> Result<&str> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| MarketError::Auth("Access token required".to_string()))?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| MarketError::Auth("Access token required".to_string()))
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = MarketError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let token = bearer_token(parts)?;
        let claims = state.auth.validate_token(token)?;
        Ok(AuthUser {
            subject: claims.sub,
            email: claims.email,
            role: claims.role,
        })
    }
}

/// An approved organization account.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: UserId,
    pub email: String,
}

#[async_trait]
impl FromRequestParts<AppState> for Member {
    type Rejection = MarketError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if user.role != Role::SenderReceiver {
            return Err(MarketError::Forbidden("Approved member account required".to_string()));
        }
        Ok(Member {
            id: user.user_id()?,
            email: user.email,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Admin {
    pub subject: String,
}

#[async_trait]
impl FromRequestParts<AppState> for Admin {
    type Rejection = MarketError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let user = AuthUser::from_request_parts(parts, state).await?;
        if !user.is_admin() {
            return Err(MarketError::Forbidden("Admin access required".to_string()));
        }
        Ok(Admin { subject: user.subject })
    }
}
