//! HTTP surface: JSON routes under `/api`, health check and uploaded images.

mod admin;
mod cart;
mod medicines;
mod orders;
mod users;
mod webhooks;

use crate::{
    auth::AuthService,
    config::AppConfig,
    database::Database,
    error::Result,
    payments::PaymentGateway,
    uploads::UPLOADS_ROUTE,
    verification::VerificationService,
};
use axum::{
    extract::DefaultBodyLimit,
    response::Json,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub auth: Arc<AuthService>,
    pub verifier: Arc<VerificationService>,
    pub payments: PaymentGateway,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let db = Database::connect(&config.database).await?;
        Ok(Self::with_database(config, db))
    }

    pub fn with_database(config: AppConfig, db: Database) -> Self {
        Self {
            db,
            auth: Arc::new(AuthService::new(&config.auth)),
            verifier: Arc::new(VerificationService::new(&config.llm, &config.marketplace)),
            payments: PaymentGateway::new(config.payments.clone()),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    // Listing photos arrive base64 encoded inside JSON, a third larger than the raw file.
    let body_limit = state.config.storage.max_upload_bytes / 3 * 4 + 64 * 1024;

    let api = Router::new()
        .route("/auth/register", post(users::register))
        .route("/auth/login", post(users::login))
        .route("/auth/admin-login", post(users::admin_login))
        .route("/auth/me", get(users::me))
        .route("/medicines", post(medicines::create))
        .route("/medicines/search", get(medicines::search))
        .route("/medicines/mine", get(medicines::mine))
        .route("/medicines/:id", get(medicines::get_one))
        .route("/cart", post(cart::add).get(cart::list))
        .route("/cart/:id", axum::routing::put(cart::update).delete(cart::remove))
        .route("/orders", post(orders::checkout).get(orders::list))
        .route("/orders/sales", get(orders::sales))
        .route("/orders/:id", get(orders::get_one))
        .route("/orders/:id/payment-intent", post(orders::create_payment_intent))
        .route("/orders/:id/confirm-payment", post(orders::confirm_payment))
        .route("/orders/:id/pay", post(orders::test_payment))
        .route("/orders/:id/cancel", post(orders::cancel))
        .route("/orders/:id/delivery", post(orders::update_delivery))
        .route("/webhooks/stripe", post(webhooks::stripe))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/pending-users", get(admin::pending_users))
        .route("/admin/users", get(admin::users))
        .route("/admin/users/:id/approve", post(admin::approve_user))
        .route("/admin/users/:id/reject", post(admin::reject_user))
        .route("/admin/pending-medicines", get(admin::pending_medicines))
        .route("/admin/medicines", get(admin::medicines))
        .route("/admin/medicines/:id/approve", post(admin::approve_medicine))
        .route("/admin/medicines/:id/reject", post(admin::reject_medicine))
        .route("/admin/orders/:id/refund", post(admin::refund_order));

    Router::new()
        .nest("/api", api)
        .route("/health", get(health_check))
        .nest_service(UPLOADS_ROUTE, ServeDir::new(&state.config.storage.upload_dir))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "healthy"}))
}
