use crate::error::{MarketError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub payments: PaymentsConfig,
    pub llm: LLMConfig,
    pub storage: StorageConfig,
    pub marketplace: MarketplaceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    pub token_ttl_hours: i64,
    pub admin_username: String,
    pub admin_password: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct PaymentsConfig {
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_api_base: String,
    pub currency: String,
    /// Enables `POST /api/orders/:id/pay`, which marks an order paid without a provider.
    pub allow_test_payments: bool,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LLMConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct MarketplaceConfig {
    pub delivery_fee: f64,
    /// Listings closer to expiry than this are flagged for the reviewing admin.
    pub min_expiry_months: u32,
    pub min_address_length: usize,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://medcycle.db".to_string(),
            max_connections: 10,
            acquire_timeout_seconds: 30,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            token_ttl_hours: 24,
            admin_username: "admin".to_string(),
            admin_password: None,
        }
    }
}

impl Default for PaymentsConfig {
    fn default() -> Self {
        Self {
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            stripe_api_base: "https://api.stripe.com".to_string(),
            currency: "inr".to_string(),
            allow_test_payments: true,
        }
    }
}

impl Default for LLMConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            api_key: None,
            api_base: None,
            max_tokens: 500,
            timeout_seconds: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            max_upload_bytes: 5 * 1024 * 1024,
        }
    }
}

impl Default for MarketplaceConfig {
    fn default() -> Self {
        Self {
            delivery_fee: 50.0,
            min_expiry_months: 3,
            min_address_length: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| MarketError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)?;

        Ok(config)
    }

    /// Loads `path` when it exists, falls back to defaults otherwise, then applies
    /// environment overrides.
    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = if path.as_ref().exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.database.url = url;
        }

        if let Ok(jwt_secret) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = Some(jwt_secret);
        }

        if let Ok(password) = std::env::var("ADMIN_PASSWORD") {
            self.auth.admin_password = Some(password);
        }

        if let Ok(stripe_key) = std::env::var("STRIPE_SECRET_KEY") {
            self.payments.stripe_secret_key = Some(stripe_key);
        }

        if let Ok(webhook_secret) = std::env::var("STRIPE_WEBHOOK_SECRET") {
            self.payments.stripe_webhook_secret = Some(webhook_secret);
        }

        if let Ok(llm_key) = std::env::var("OPENAI_API_KEY") {
            self.llm.api_key = Some(llm_key);
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(MarketError::Config("Server port cannot be 0".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(MarketError::Config("Database URL cannot be empty".to_string()));
        }

        if self.llm.model.is_empty() {
            return Err(MarketError::Config("LLM model cannot be empty".to_string()));
        }

        if self.auth.token_ttl_hours <= 0 {
            return Err(MarketError::Config("Token TTL must be positive".to_string()));
        }

        if self.storage.max_upload_bytes == 0 {
            return Err(MarketError::Config("Upload limit cannot be 0".to_string()));
        }

        if self.marketplace.delivery_fee < 0.0 || !self.marketplace.delivery_fee.is_finite() {
            return Err(MarketError::Config("Delivery fee cannot be negative".to_string()));
        }

        Ok(())
    }

    pub fn get_server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn is_stripe_configured(&self) -> bool {
        self.payments.stripe_secret_key.is_some()
    }

    pub fn is_llm_configured(&self) -> bool {
        self.llm.api_key.as_deref().is_some_and(|key| !key.is_empty())
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| MarketError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| MarketError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}
