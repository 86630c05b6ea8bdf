use super::AppState;
use crate::{
    auth::Member,
    error::Result,
    model::{round_money, AddToCart, CartItem, CartLine, UpdateCartItem},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartSummary {
    pub items: Vec<CartLine>,
    pub subtotal: f64,
    pub delivery_fee: f64,
    pub total: f64,
}

pub async fn add(
    State(state): State<AppState>,
    member: Member,
    Json(request): Json<AddToCart>,
) -> Result<(StatusCode, Json<CartItem>)> {
    let item = state.db.add_to_cart(member.id, &request).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

pub async fn list(State(state): State<AppState>, member: Member) -> Result<Json<CartSummary>> {
    let items = state.db.list_cart(member.id).await?;
    let subtotal = round_money(items.iter().map(|line| line.line_total).sum());
    let delivery_fee = if items.is_empty() {
        0.0
    } else {
        round_money(state.config.marketplace.delivery_fee)
    };

    Ok(Json(CartSummary {
        items,
        subtotal,
        delivery_fee,
        total: round_money(subtotal + delivery_fee),
    }))
}

pub async fn update(
    State(state): State<AppState>,
    member: Member,
    Path(item_id): Path<Uuid>,
    Json(request): Json<UpdateCartItem>,
) -> Result<Json<serde_json::Value>> {
    match state.db.update_cart_item(member.id, item_id, request.quantity).await? {
        Some(item) => Ok(Json(serde_json::json!({ "item": item }))),
        None => Ok(Json(serde_json::json!({ "message": "Item removed from cart" }))),
    }
}

pub async fn remove(
    State(state): State<AppState>,
    member: Member,
    Path(item_id): Path<Uuid>,
) -> Result<StatusCode> {
    state.db.remove_from_cart(member.id, item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
