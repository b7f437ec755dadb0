//! Bill consolidation and checkout endpoints
//!
//! - GET  /api/tables/{table}/open-orders
//! - POST /api/bills/ensure-open
//! - GET  /api/bills/{bill_id}
//! - POST /api/bills/{bill_id}/confirm-checkout
//! - POST /api/bills/{bill_id}/mark-paid

use axum::{
    extract::{Path, State},
    Json,
};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::models::bill::{
    BillDetail, CheckoutOutcome, ConfirmCheckoutRequest, EnsureOpenBillRequest,
    EnsureOpenBillResponse, MarkPaidRequest, PaymentOutcome,
};
use crate::models::order::OrderWithItems;
use crate::models::status::PaymentMethod;
use crate::services::table_resolver::resolve_table;
use crate::AppState;

pub async fn list_open_orders(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> CoreResult<Json<Vec<OrderWithItems>>> {
    let table_id = resolve_table(&state.db, &table).await?;
    Ok(Json(state.bills.list_open_orders(table_id).await?))
}

pub async fn ensure_open_bill(
    State(state): State<AppState>,
    Json(payload): Json<EnsureOpenBillRequest>,
) -> CoreResult<Json<EnsureOpenBillResponse>> {
    let table_id = resolve_table(&state.db, &payload.table.to_string()).await?;
    let bill = state.bills.ensure_open_bill(table_id).await?;
    Ok(Json(EnsureOpenBillResponse { bill }))
}

pub async fn get_bill(
    State(state): State<AppState>,
    Path(bill_id): Path<i32>,
) -> CoreResult<Json<BillDetail>> {
    Ok(Json(state.bills.bill_detail(bill_id).await?))
}

pub async fn confirm_checkout(
    State(state): State<AppState>,
    Path(bill_id): Path<i32>,
    payload: Option<Json<ConfirmCheckoutRequest>>,
) -> CoreResult<Json<CheckoutOutcome>> {
    let actor = payload.and_then(|Json(body)| body.actor);
    info!(bill_id = bill_id, "Checkout requested");
    Ok(Json(state.checkout.confirm_checkout(bill_id, actor).await?))
}

pub async fn mark_paid(
    State(state): State<AppState>,
    Path(bill_id): Path<i32>,
    Json(payload): Json<MarkPaidRequest>,
) -> CoreResult<Json<PaymentOutcome>> {
    let method: PaymentMethod = payload.method.parse().map_err(CoreError::Validation)?;
    info!(bill_id = bill_id, method = method.as_str(), "Payment requested");
    Ok(Json(
        state.checkout.mark_paid(bill_id, method, payload.actor).await?,
    ))
}
