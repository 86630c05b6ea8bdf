//! # MedCycle - near-expiry medicine redistribution marketplace
//!
//! Hospitals, pharmacies and medical shops list surplus stock that is close to expiry;
//! other approved organizations search for it, check out through a cart and pay.
//!
//! ## Architecture
//!
//! - **API**: axum JSON routes under `/api` with bearer-token auth
//! - **Database**: SQLite via sqlx; checkout reserves stock in one transaction
//! - **Auth**: argon2 password hashes and HS256 JWTs; admin approval gates every account
//! - **Verification**: label reading through a chat model, compared locally with the listing
//! - **Payments**: Stripe payment intents, refunds and signed webhooks
//! - **Geo**: coarse PIN-code proximity for ranking search results

pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod geo;
pub mod model;
pub mod payments;
pub mod uploads;
pub mod verification;

pub use api::{build_router, AppState};
pub use config::AppConfig;
pub use database::Database;
pub use error::{MarketError, Result};
pub use model::{Medicine, Order, OrderDetail, User};
pub use payments::PaymentGateway;
pub use verification::VerificationService;

pub type UserId = uuid::Uuid;
pub type MedicineId = uuid::Uuid;
pub type OrderId = uuid::Uuid;
