//! Order and order-item endpoints
//!
//! - POST  /api/orders
//! - GET   /api/orders/{order_id}
//! - GET   /api/orders/{order_id}/status-log
//! - PATCH /api/orders/{order_id}/status
//! - PATCH /api/order-items/{item_id}/status

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::info;

use crate::entities::order_status_logs;
use crate::error::{CoreError, CoreResult};
use crate::models::order::{
    ItemTransitionOutcome, OrderTransitionOutcome, OrderWithItems, PlaceOrderRequest,
    UpdateStatusRequest,
};
use crate::models::status::{ItemStatus, OrderStatus};
use crate::services::order_intake::NewOrder;
use crate::services::order_state::ChangeContext;
use crate::services::table_resolver::resolve_table;
use crate::AppState;

pub async fn place_order(
    State(state): State<AppState>,
    Json(payload): Json<PlaceOrderRequest>,
) -> CoreResult<(StatusCode, Json<OrderWithItems>)> {
    let table_id = resolve_table(&state.db, &payload.table.to_string()).await?;

    let placed = state
        .intake
        .place_order(NewOrder {
            table_id,
            customer_name: payload.customer_name,
            customer_phone: payload.customer_phone,
            notes: payload.notes,
            actor: payload.actor,
            items: payload.items,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(placed)))
}

pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<i32>,
) -> CoreResult<Json<OrderWithItems>> {
    Ok(Json(state.orders.get_order(order_id).await?))
}

pub async fn get_order_status_log(
    State(state): State<AppState>,
    Path(order_id): Path<i32>,
) -> CoreResult<Json<Vec<order_status_logs::Model>>> {
    // 404 rather than an empty list for unknown orders
    state.orders.get_order(order_id).await?;
    Ok(Json(state.orders.status_log(order_id).await?))
}

pub async fn update_order_status(
    State(state): State<AppState>,
    Path(order_id): Path<i32>,
    Json(payload): Json<UpdateStatusRequest>,
) -> CoreResult<Json<OrderTransitionOutcome>> {
    let target: OrderStatus = payload.status.parse().map_err(CoreError::InvalidStatus)?;
    info!(order_id = order_id, status = %target, "Order status change requested");

    let outcome = state
        .orders
        .transition_order(order_id, target, ChangeContext::new(payload.actor, payload.note))
        .await?;
    Ok(Json(outcome))
}

pub async fn update_item_status(
    State(state): State<AppState>,
    Path(item_id): Path<i32>,
    Json(payload): Json<UpdateStatusRequest>,
) -> CoreResult<Json<ItemTransitionOutcome>> {
    let target: ItemStatus = payload.status.parse().map_err(CoreError::InvalidStatus)?;
    info!(item_id = item_id, status = %target, "Item status change requested");

    let outcome = state
        .orders
        .transition_item(item_id, target, ChangeContext::new(payload.actor, payload.note))
        .await?;
    Ok(Json(outcome))
}
