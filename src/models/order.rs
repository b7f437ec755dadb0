//! Order and order-item request/response models

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::entities::{order_items, orders};
use crate::models::status::OrderStatus;

/// Table reference as sent by clients: numeric id or a label such as "T4"
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTableRef {
    Id(i64),
    Label(String),
}

impl std::fmt::Display for RawTableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawTableRef::Id(id) => write!(f, "{}", id),
            RawTableRef::Label(label) => f.write_str(label),
        }
    }
}

/// PATCH body for both order and item status updates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub note: Option<String>,
    /// Staff member making the change, recorded in the status log
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderRequest {
    pub table: RawTableRef,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    pub items: Vec<PlaceOrderItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderItem {
    pub food_id: i32,
    pub quantity: i32,
    /// Menu price at the time of ordering
    pub unit_price: Decimal,
}

/// An order together with all of its items, cancelled ones included
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderWithItems {
    pub order: orders::Model,
    pub items: Vec<order_items::Model>,
}

impl OrderWithItems {
    pub fn has_billable_items(&self) -> bool {
        self.items.iter().any(|item| item.is_billable())
    }

    /// Σ subtotal over non-cancelled items
    pub fn billable_total(&self) -> Decimal {
        billable_total(&self.items)
    }
}

/// Σ subtotal over non-cancelled items, rounded to cents
pub fn billable_total(items: &[order_items::Model]) -> Decimal {
    items
        .iter()
        .filter(|item| item.is_billable())
        .map(|item| item.subtotal)
        .sum::<Decimal>()
        .round_dp(2)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemTransitionOutcome {
    pub item: order_items::Model,
    pub order_id: i32,
    pub order_total: Decimal,
    pub order_status: OrderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderTransitionOutcome {
    pub order: orders::Model,
    pub previous_status: OrderStatus,
    /// Items flipped to cancelled by an order-level cancel
    pub cancelled_item_ids: Vec<i32>,
}
