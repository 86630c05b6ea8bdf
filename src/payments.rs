use crate::{
    config::PaymentsConfig,
    error::{MarketError, Result},
    model::Order,
    OrderId,
};
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use uuid::Uuid;

/// Maximum age of a signed webhook before it is refused.
pub const WEBHOOK_TOLERANCE_SECONDS: i64 = 300;

pub const TEST_PAYMENT_PREFIX: &str = "test_";

/// Converts a major-unit amount into the provider's integer minor units.
pub fn to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub fn test_payment_id() -> String {
    format!("{}{}", TEST_PAYMENT_PREFIX, Uuid::new_v4().simple())
}

pub fn is_test_payment(payment_id: &str) -> bool {
    payment_id.starts_with(TEST_PAYMENT_PREFIX)
}

/// Intent ids end up in request paths, so only `pi_` followed by `[A-Za-z0-9_]` is accepted.
pub fn check_intent_id(intent_id: &str) -> Result<&str> {
    let valid = intent_id
        .strip_prefix("pi_")
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    if valid {
        Ok(intent_id)
    } else {
        Err(MarketError::Validation("Invalid payment intent id".to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl PaymentIntent {
    pub fn is_succeeded(&self) -> bool {
        self.status == "succeeded"
    }

    pub fn is_canceled(&self) -> bool {
        self.status == "canceled"
    }

    pub fn order_id(&self) -> Option<OrderId> {
        self.metadata.get("order_id").and_then(|id| Uuid::parse_str(id).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub amount: i64,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Clone)]
pub struct PaymentGateway {
    config: PaymentsConfig,
    client: Client,
}

impl PaymentGateway {
    pub fn new(config: PaymentsConfig) -> Self {
        if config.stripe_secret_key.is_none() {
            tracing::info!(
                test_payments = config.allow_test_payments,
                "Stripe not configured, card payments disabled"
            );
        }

        Self {
            config,
            client: Client::new(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.config.stripe_secret_key.is_some()
    }

    /// Test payments are only offered while no real provider is configured.
    pub fn allows_test_payments(&self) -> bool {
        self.config.allow_test_payments && !self.is_configured()
    }

    fn secret_key(&self) -> Result<&str> {
        self.config
            .stripe_secret_key
            .as_deref()
            .ok_or_else(|| MarketError::Payment("Stripe is not configured".to_string()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.config.stripe_api_base.trim_end_matches('/'), path)
    }

    /// Creates a payment intent for the stored order total.
    pub async fn create_payment_intent(&self, order: &Order, receipt_email: Option<&str>) -> Result<PaymentIntent> {
        let amount = to_minor_units(order.total_amount);
        if amount <= 0 {
            return Err(MarketError::Validation("Order total must be positive".to_string()));
        }

        let mut form = vec![
            ("amount", amount.to_string()),
            ("currency", self.config.currency.clone()),
            ("metadata[order_id]", order.id.to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];
        if let Some(email) = receipt_email {
            form.push(("receipt_email", email.to_string()));
        }

        let response = self
            .client
            .post(self.url("payment_intents"))
            .bearer_auth(self.secret_key()?)
            .form(&form)
            .send()
            .await?;

        let intent: PaymentIntent = Self::parse(response).await?;
        tracing::info!(order_id = %order.id, intent = %intent.id, amount, "payment intent created");
        Ok(intent)
    }

    pub async fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent> {
        let response = self
            .client
            .get(self.url(&format!("payment_intents/{}", check_intent_id(intent_id)?)))
            .bearer_auth(self.secret_key()?)
            .send()
            .await?;

        Self::parse(response).await
    }

    /// Cancels an intent that has not been captured. The provider refuses once it has succeeded.
    pub async fn cancel_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent> {
        let response = self
            .client
            .post(self.url(&format!("payment_intents/{}/cancel", check_intent_id(intent_id)?)))
            .bearer_auth(self.secret_key()?)
            .send()
            .await?;

        let intent: PaymentIntent = Self::parse(response).await?;
        tracing::info!(intent = %intent.id, status = %intent.status, "payment intent cancelled");
        Ok(intent)
    }

    pub async fn refund(&self, intent_id: &str) -> Result<Refund> {
        let intent_id = check_intent_id(intent_id)?;
        let response = self
            .client
            .post(self.url("refunds"))
            .bearer_auth(self.secret_key()?)
            .form(&[("payment_intent", intent_id)])
            .send()
            .await?;

        let refund: Refund = Self::parse(response).await?;
        tracing::info!(intent = %intent_id, refund = %refund.id, status = %refund.status, "refund issued");
        Ok(refund)
    }

    async fn parse<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<StripeErrorBody>(&body)
            .ok()
            .and_then(|e| match (e.error.message, e.error.kind) {
                (Some(message), _) => Some(message),
                (None, kind) => kind,
            })
            .unwrap_or_else(|| format!("HTTP {}", status));
        Err(MarketError::Payment(message))
    }

    pub fn verify_webhook(&self, payload: &[u8], signature_header: &str) -> Result<WebhookEvent> {
        let secret = self
            .config
            .stripe_webhook_secret
            .as_deref()
            .ok_or_else(|| MarketError::Payment("Webhook secret is not configured".to_string()))?;

        verify_webhook_signature(payload, signature_header, secret, chrono::Utc::now().timestamp())?;
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against the raw body.
pub fn verify_webhook_signature(payload: &[u8], header: &str, secret: &str, now: i64) -> Result<()> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| MarketError::Auth("Malformed webhook signature".to_string()))?;
    if signatures.is_empty() {
        return Err(MarketError::Auth("Malformed webhook signature".to_string()));
    }
    if (now - timestamp).abs() > WEBHOOK_TOLERANCE_SECONDS {
        return Err(MarketError::Auth("Webhook timestamp outside tolerance".to_string()));
    }

    let matched = signatures.iter().any(|signature| {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    });

    if matched {
        Ok(())
    } else {
        Err(MarketError::Auth("Invalid webhook signature".to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentOutcome {
    Succeeded { order_id: OrderId, payment_id: String },
    Failed { order_id: OrderId, payment_id: String },
    Ignored,
}

impl WebhookEvent {
    pub fn outcome(&self) -> PaymentOutcome {
        let succeeded = match self.event_type.as_str() {
            "payment_intent.succeeded" => true,
            "payment_intent.payment_failed" => false,
            _ => return PaymentOutcome::Ignored,
        };

        let Ok(intent) = serde_json::from_value::<PaymentIntent>(self.data.object.clone()) else {
            return PaymentOutcome::Ignored;
        };
        let Some(order_id) = intent.order_id() else {
            return PaymentOutcome::Ignored;
        };

        if succeeded {
            PaymentOutcome::Succeeded {
                order_id,
                payment_id: intent.id,
            }
        } else {
            PaymentOutcome::Failed {
                order_id,
                payment_id: intent.id,
            }
        }
    }
}
