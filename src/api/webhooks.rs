use super::AppState;
use crate::{
    error::{MarketError, Result},
    model::{DeliveryStatus, PaymentStatus},
    payments::PaymentOutcome,
    OrderId,
};
use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Json,
};

pub async fn stripe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| MarketError::Auth("Missing Stripe-Signature header".to_string()))?;

    let event = state.payments.verify_webhook(&body, signature)?;

    let (order_id, payment_id, status) = match event.outcome() {
        PaymentOutcome::Succeeded { order_id, payment_id } => (order_id, payment_id, PaymentStatus::Paid),
        PaymentOutcome::Failed { order_id, payment_id } => (order_id, payment_id, PaymentStatus::Failed),
        PaymentOutcome::Ignored => {
            tracing::debug!(event = %event.id, kind = %event.event_type, "webhook ignored");
            return Ok(Json(serde_json::json!({ "received": true })));
        }
    };

    // Late or repeated events must not make the provider retry forever.
    match state.db.update_order_payment(order_id, Some(&payment_id), status).await {
        Ok(order) => {
            tracing::info!(event = %event.id, order_id = %order.id, status = status.as_str(), "webhook applied");
        }
        Err(MarketError::InvalidTransition(reason)) if status == PaymentStatus::Paid => {
            refund_if_cancelled(&state, order_id, &payment_id, &reason).await?;
        }
        Err(e @ (MarketError::NotFound(_) | MarketError::InvalidTransition(_))) => {
            tracing::warn!(event = %event.id, order_id = %order_id, error = %e, "webhook not applied");
        }
        Err(e) => return Err(e),
    }

    Ok(Json(serde_json::json!({ "received": true })))
}

/// A charge that lands on an order the buyer already cancelled is sent back.
/// Refund failures surface as errors so the provider redelivers the event.
async fn refund_if_cancelled(state: &AppState, order_id: OrderId, payment_id: &str, reason: &str) -> Result<()> {
    let Some(order) = state.db.get_order(order_id).await? else {
        return Ok(());
    };
    let unpaid = matches!(order.payment_status, PaymentStatus::Pending | PaymentStatus::Failed);
    if order.delivery_status != DeliveryStatus::Cancelled || !unpaid {
        tracing::warn!(order_id = %order_id, payment_id = %payment_id, reason, "payment not applied");
        return Ok(());
    }

    let refund = state.payments.refund(payment_id).await?;
    state.db.mark_cancelled_order_refunded(order_id, payment_id).await?;
    tracing::info!(order_id = %order_id, refund = %refund.id, "charge on cancelled order refunded");
    Ok(())
}
