//! Bill, checkout and payment request/response models

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::{bills, payments};
use crate::models::order::{OrderWithItems, RawTableRef};
use crate::models::status::{BillStatus, PaymentMethod};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureOpenBillRequest {
    pub table: RawTableRef,
}

/// `bill` is null when the table has nothing billable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsureOpenBillResponse {
    pub bill: Option<BillSummary>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfirmCheckoutRequest {
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkPaidRequest {
    pub method: String,
    #[serde(default)]
    pub actor: Option<String>,
}

/// Consolidated view of a table's bill after recomputation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillSummary {
    pub bill_id: i32,
    pub bill_code: String,
    pub table_id: i32,
    pub status: BillStatus,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total_amount: Decimal,
    /// Linked orders that are still active, ascending
    pub order_ids: Vec<i32>,
}

impl BillSummary {
    pub fn from_model(bill: &bills::Model, order_ids: Vec<i32>) -> Self {
        Self {
            bill_id: bill.id,
            bill_code: bill.bill_code.clone(),
            table_id: bill.table_id,
            status: bill.status,
            subtotal: bill.subtotal,
            discount: bill.discount,
            total_amount: bill.total_amount,
            order_ids,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillDetail {
    pub bill: bills::Model,
    pub orders: Vec<OrderWithItems>,
    pub payments: Vec<payments::Model>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutOutcome {
    pub bill: bills::Model,
    pub completed_order_ids: Vec<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub payment_id: i32,
    pub bill_id: i32,
    pub bill_code: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub paid_time: DateTime<Utc>,
}
