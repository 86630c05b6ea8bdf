use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MarketError>;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Auth(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Insufficient stock for {medicine}: requested {requested}, available {available}")]
    InsufficientStock {
        medicine: String,
        requested: i64,
        available: i64,
    },

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),

    #[error("Payment error: {0}")]
    Payment(String),

    #[error("Model service error: {0}")]
    Model(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MarketError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            MarketError::Validation(_) | MarketError::Serialization(_) => StatusCode::BAD_REQUEST,
            MarketError::Auth(_) => StatusCode::UNAUTHORIZED,
            MarketError::Forbidden(_) => StatusCode::FORBIDDEN,
            MarketError::NotFound(_) => StatusCode::NOT_FOUND,
            MarketError::Conflict(_)
            | MarketError::InsufficientStock { .. }
            | MarketError::InvalidTransition(_) => StatusCode::CONFLICT,
            MarketError::Payment(_) | MarketError::Model(_) | MarketError::Network(_) => {
                StatusCode::BAD_GATEWAY
            }
            MarketError::Config(_)
            | MarketError::Database(_)
            | MarketError::Io(_)
            | MarketError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for MarketError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
            "Internal server error".to_string()
        } else {
            if status == StatusCode::BAD_GATEWAY {
                tracing::warn!(error = %self, "upstream service failed");
            }
            self.to_string()
        };

        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::Serialization(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for MarketError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        MarketError::Auth(format!("Invalid or expired token: {}", err))
    }
}

impl From<toml::de::Error> for MarketError {
    fn from(err: toml::de::Error) -> Self {
        MarketError::Config(err.to_string())
    }
}

impl From<uuid::Error> for MarketError {
    fn from(err: uuid::Error) -> Self {
        MarketError::Validation(err.to_string())
    }
}

impl From<std::io::Error> for MarketError {
    fn from(err: std::io::Error) -> Self {
        MarketError::Io(err.to_string())
    }
}

impl From<argon2::password_hash::Error> for MarketError {
    fn from(err: argon2::password_hash::Error) -> Self {
        MarketError::Internal(format!("password hashing failed: {}", err))
    }
}

impl From<async_openai::error::OpenAIError> for MarketError {
    fn from(err: async_openai::error::OpenAIError) -> Self {
        MarketError::Model(err.to_string())
    }
}
