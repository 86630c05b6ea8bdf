use super::AppState;
use crate::{
    auth::{AuthUser, Member},
    error::{MarketError, Result},
    model::{CheckoutRequest, DeliveryStatus, Order, OrderDetail, PaymentStatus, Role, Sale},
    payments::{self, PaymentIntent},
    OrderId, UserId,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentResponse {
    pub client_secret: Option<String>,
    pub payment_intent_id: String,
    pub amount: f64,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    pub payment_intent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
}

async fn buyer_order(state: &AppState, buyer_id: UserId, order_id: OrderId) -> Result<Order> {
    state
        .db
        .get_order(order_id)
        .await?
        .filter(|order| order.buyer_id == buyer_id)
        .ok_or_else(|| MarketError::NotFound("Order".to_string()))
}

pub async fn checkout(
    State(state): State<AppState>,
    member: Member,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<OrderDetail>)> {
    let address = request.delivery_address.trim();
    let min_length = state.config.marketplace.min_address_length;
    if address.chars().count() < min_length {
        return Err(MarketError::Validation(format!(
            "Delivery address must be at least {} characters",
            min_length
        )));
    }

    let detail = state
        .db
        .checkout(member.id, address, state.config.marketplace.delivery_fee)
        .await?;

    Ok((StatusCode::CREATED, Json(detail)))
}

pub async fn list(State(state): State<AppState>, member: Member) -> Result<Json<Vec<Order>>> {
    Ok(Json(state.db.list_orders_for_buyer(member.id).await?))
}

pub async fn sales(State(state): State<AppState>, member: Member) -> Result<Json<Vec<Sale>>> {
    Ok(Json(state.db.list_sales(member.id).await?))
}

pub async fn get_one(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<OrderId>,
) -> Result<Json<OrderDetail>> {
    let detail = state
        .db
        .get_order_detail(order_id)
        .await?
        .ok_or_else(|| MarketError::NotFound("Order".to_string()))?;

    if !user.is_admin() {
        let user_id = user.user_id()?;
        if detail.order.buyer_id != user_id && !detail.involves_sender(user_id) {
            return Err(MarketError::Forbidden("Not your order".to_string()));
        }
    }

    Ok(Json(detail))
}

pub async fn create_payment_intent(
    State(state): State<AppState>,
    member: Member,
    Path(order_id): Path<OrderId>,
) -> Result<Json<PaymentIntentResponse>> {
    let order = buyer_order(&state, member.id, order_id).await?;
    if !order.is_payable() {
        return Err(MarketError::InvalidTransition("order is not awaiting payment".to_string()));
    }

    let intent = state
        .payments
        .create_payment_intent(&order, Some(&member.email))
        .await?;
    if let Err(e) = state.db.attach_payment_id(order.id, &intent.id).await {
        if let Err(cancel_err) = state.payments.cancel_payment_intent(&intent.id).await {
            tracing::error!(order_id = %order.id, intent = %intent.id, error = %cancel_err, "unattached intent left open");
        }
        return Err(e);
    }

    Ok(Json(PaymentIntentResponse {
        client_secret: intent.client_secret,
        payment_intent_id: intent.id,
        amount: order.total_amount,
        currency: intent.currency,
    }))
}

fn check_intent_matches(intent: &PaymentIntent, order: &Order) -> Result<()> {
    if intent.order_id() != Some(order.id) {
        return Err(MarketError::Validation("Payment does not belong to this order".to_string()));
    }
    if intent.amount != payments::to_minor_units(order.total_amount) {
        return Err(MarketError::Validation("Payment amount does not match the order".to_string()));
    }
    Ok(())
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    member: Member,
    Path(order_id): Path<OrderId>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<Json<Order>> {
    let order = buyer_order(&state, member.id, order_id).await?;
    if order.payment_status == PaymentStatus::Paid {
        return Ok(Json(order));
    }

    let intent = state
        .payments
        .retrieve_payment_intent(&request.payment_intent_id)
        .await?;
    check_intent_matches(&intent, &order)?;

    if !intent.is_succeeded() {
        return Err(MarketError::Conflict(format!("Payment not completed: {}", intent.status)));
    }

    let order = state
        .db
        .update_order_payment(order.id, Some(&intent.id), PaymentStatus::Paid)
        .await?;
    Ok(Json(order))
}

/// Marks an order paid without a provider. Only available while test payments are enabled.
pub async fn test_payment(
    State(state): State<AppState>,
    member: Member,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Order>> {
    if !state.payments.allows_test_payments() {
        return Err(MarketError::Forbidden("Test payments are disabled".to_string()));
    }

    let order = buyer_order(&state, member.id, order_id).await?;
    if !order.is_payable() {
        return Err(MarketError::InvalidTransition("order is not awaiting payment".to_string()));
    }

    let payment_id = payments::test_payment_id();
    let order = state
        .db
        .update_order_payment(order.id, Some(&payment_id), PaymentStatus::Paid)
        .await?;
    tracing::info!(order_id = %order.id, payment_id = %payment_id, "test payment recorded");
    Ok(Json(order))
}

/// Cancels an unpaid order. An open card intent is cancelled with the provider first,
/// which fails once the customer has been charged.
pub async fn cancel(
    State(state): State<AppState>,
    member: Member,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Order>> {
    let order = buyer_order(&state, member.id, order_id).await?;

    if let Some(intent_id) = order.open_intent() {
        let intent = state.payments.cancel_payment_intent(intent_id).await?;
        if !intent.is_canceled() {
            return Err(MarketError::Conflict(format!("Payment is {}", intent.status)));
        }
        state.db.release_payment_id(order.id, &intent.id).await?;
    }

    Ok(Json(state.db.cancel_order(member.id, order_id).await?))
}

/// Admins and senders with items in the order move it along the delivery track.
pub async fn update_delivery(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<OrderId>,
    Json(update): Json<DeliveryUpdate>,
) -> Result<Json<Order>> {
    let detail = state
        .db
        .get_order_detail(order_id)
        .await?
        .ok_or_else(|| MarketError::NotFound("Order".to_string()))?;

    let allowed = user.is_admin()
        || (user.role == Role::SenderReceiver && detail.involves_sender(user.user_id()?));
    if !allowed {
        return Err(MarketError::Forbidden("Only the sender or an admin can update delivery".to_string()));
    }

    Ok(Json(state.db.update_order_delivery(order_id, update.status).await?))
}
