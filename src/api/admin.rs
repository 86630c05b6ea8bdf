use super::AppState;
use crate::{
    auth::Admin,
    error::{MarketError, Result},
    model::{MedicineView, Order, PaymentStatus, SystemStats, User},
    payments, MedicineId, OrderId, UserId,
};
use axum::{
    extract::{Path, State},
    response::Json,
};

pub async fn stats(State(state): State<AppState>, _admin: Admin) -> Result<Json<SystemStats>> {
    Ok(Json(state.db.system_stats().await?))
}

pub async fn pending_users(State(state): State<AppState>, _admin: Admin) -> Result<Json<Vec<User>>> {
    Ok(Json(state.db.list_pending_users().await?))
}

pub async fn users(State(state): State<AppState>, _admin: Admin) -> Result<Json<Vec<User>>> {
    Ok(Json(state.db.list_users().await?))
}

pub async fn approve_user(
    State(state): State<AppState>,
    admin: Admin,
    Path(user_id): Path<UserId>,
) -> Result<Json<User>> {
    let user = state.db.approve_user(user_id).await?;
    tracing::info!(user_id = %user_id, by = %admin.subject, "user approved");
    Ok(Json(user))
}

pub async fn reject_user(
    State(state): State<AppState>,
    admin: Admin,
    Path(user_id): Path<UserId>,
) -> Result<Json<User>> {
    let user = state.db.reject_user(user_id).await?;
    tracing::info!(user_id = %user_id, by = %admin.subject, "user rejected");
    Ok(Json(user))
}

pub async fn pending_medicines(State(state): State<AppState>, _admin: Admin) -> Result<Json<Vec<MedicineView>>> {
    Ok(Json(state.db.list_pending_medicines().await?))
}

pub async fn medicines(State(state): State<AppState>, _admin: Admin) -> Result<Json<Vec<MedicineView>>> {
    Ok(Json(state.db.list_medicines().await?))
}

pub async fn approve_medicine(
    State(state): State<AppState>,
    admin: Admin,
    Path(medicine_id): Path<MedicineId>,
) -> Result<Json<MedicineView>> {
    let view = state.db.approve_medicine(medicine_id, &admin.subject).await?;
    tracing::info!(medicine_id = %medicine_id, by = %admin.subject, "listing approved");
    Ok(Json(view))
}

pub async fn reject_medicine(
    State(state): State<AppState>,
    admin: Admin,
    Path(medicine_id): Path<MedicineId>,
) -> Result<Json<MedicineView>> {
    let view = state.db.reject_medicine(medicine_id).await?;
    tracing::info!(medicine_id = %medicine_id, by = %admin.subject, "listing rejected");
    Ok(Json(view))
}

pub async fn refund_order(
    State(state): State<AppState>,
    admin: Admin,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Order>> {
    let order = state
        .db
        .get_order(order_id)
        .await?
        .ok_or_else(|| MarketError::NotFound("Order".to_string()))?;

    if order.payment_status != PaymentStatus::Paid {
        return Err(MarketError::InvalidTransition("only paid orders can be refunded".to_string()));
    }

    if let Some(payment_id) = order.payment_id.as_deref().filter(|id| !payments::is_test_payment(id)) {
        state.payments.refund(payment_id).await?;
    }

    let order = state
        .db
        .update_order_payment(order_id, None, PaymentStatus::Refunded)
        .await?;
    tracing::info!(order_id = %order_id, by = %admin.subject, "order refunded");
    Ok(Json(order))
}
