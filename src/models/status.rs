//! Status enums for tables, orders, order items, bills and payments
//!
//! Orders and items share one lifecycle:
//!
//! ```text
//! pending → preparing → served
//!    ↘          ↘         ↘
//!     cancelled  cancelled  cancelled
//! ```
//!
//! `completed` is terminal and only reachable through checkout, which bypasses
//! the tables below.

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Order status, persisted as lowercase text
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "preparing")]
    Preparing,
    #[sea_orm(string_value = "served")]
    Served,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// Order item status, persisted as lowercase text
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "preparing")]
    Preparing,
    #[sea_orm(string_value = "served")]
    Served,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

/// Bill status: open → pending_payment → paid
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    #[sea_orm(string_value = "open")]
    Open,
    #[sea_orm(string_value = "pending_payment")]
    PendingPayment,
    #[sea_orm(string_value = "paid")]
    Paid,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    #[sea_orm(string_value = "available")]
    Available,
    #[sea_orm(string_value = "occupied")]
    Occupied,
}

/// How a bill was settled. Bookkeeping only, no gateway behind it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, DeriveActiveEnum, Serialize, Deserialize,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    #[sea_orm(string_value = "cash")]
    Cash,
    #[sea_orm(string_value = "card")]
    Card,
    #[sea_orm(string_value = "transfer")]
    Transfer,
    #[sea_orm(string_value = "qr")]
    Qr,
    #[sea_orm(string_value = "other")]
    Other,
}

/// Payment rows are only ever written once a bill settles
pub const PAYMENT_STATUS_PAID: &str = "paid";

/// Allowed order transitions. Completion is deliberately absent.
pub const ORDER_TRANSITIONS: &[(OrderStatus, &[OrderStatus])] = &[
    (
        OrderStatus::Pending,
        &[OrderStatus::Preparing, OrderStatus::Cancelled],
    ),
    (
        OrderStatus::Preparing,
        &[OrderStatus::Served, OrderStatus::Cancelled],
    ),
    (OrderStatus::Served, &[OrderStatus::Cancelled]),
    (OrderStatus::Completed, &[]),
    (OrderStatus::Cancelled, &[]),
];

/// Allowed item transitions, same shape as [`ORDER_TRANSITIONS`]
pub const ITEM_TRANSITIONS: &[(ItemStatus, &[ItemStatus])] = &[
    (
        ItemStatus::Pending,
        &[ItemStatus::Preparing, ItemStatus::Cancelled],
    ),
    (
        ItemStatus::Preparing,
        &[ItemStatus::Served, ItemStatus::Cancelled],
    ),
    (ItemStatus::Served, &[ItemStatus::Cancelled]),
    (ItemStatus::Completed, &[]),
    (ItemStatus::Cancelled, &[]),
];

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Served => "served",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    /// pending, preparing or served
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            OrderStatus::Pending | OrderStatus::Preparing | OrderStatus::Served
        )
    }

    pub fn is_closed(&self) -> bool {
        !self.is_active()
    }

    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        ORDER_TRANSITIONS
            .iter()
            .find(|(from, _)| from == self)
            .is_some_and(|(_, allowed)| allowed.contains(&target))
    }

    pub fn active() -> [OrderStatus; 3] {
        [
            OrderStatus::Pending,
            OrderStatus::Preparing,
            OrderStatus::Served,
        ]
    }
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Preparing => "preparing",
            ItemStatus::Served => "served",
            ItemStatus::Completed => "completed",
            ItemStatus::Cancelled => "cancelled",
        }
    }

    pub fn can_transition_to(&self, target: ItemStatus) -> bool {
        ITEM_TRANSITIONS
            .iter()
            .find(|(from, _)| from == self)
            .is_some_and(|(_, allowed)| allowed.contains(&target))
    }
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Open => "open",
            BillStatus::PendingPayment => "pending_payment",
            BillStatus::Paid => "paid",
        }
    }
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Qr => "qr",
            PaymentMethod::Other => "other",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for BillStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "preparing" => Ok(OrderStatus::Preparing),
            "served" => Ok(OrderStatus::Served),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" => Ok(OrderStatus::Cancelled),
            _ => Err(format!("Unknown order status: {}", s)),
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(ItemStatus::Pending),
            "preparing" => Ok(ItemStatus::Preparing),
            "served" => Ok(ItemStatus::Served),
            "completed" => Ok(ItemStatus::Completed),
            "cancelled" => Ok(ItemStatus::Cancelled),
            _ => Err(format!("Unknown item status: {}", s)),
        }
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" => Ok(PaymentMethod::Card),
            "transfer" => Ok(PaymentMethod::Transfer),
            "qr" => Ok(PaymentMethod::Qr),
            "other" => Ok(PaymentMethod::Other),
            _ => Err(format!("Unknown payment method: {}", s)),
        }
    }
}

/// Per-status item counts for one order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ItemStatusCounts {
    pub pending: usize,
    pub preparing: usize,
    pub served: usize,
    pub completed: usize,
    pub cancelled: usize,
}

impl ItemStatusCounts {
    pub fn tally<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ItemStatus>,
    {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Preparing => counts.preparing += 1,
                ItemStatus::Served => counts.served += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.pending + self.preparing + self.served + self.completed + self.cancelled
    }

    /// Derive the owning order's status.
    ///
    /// Never yields `completed`; an order with some items served and others
    /// still cooking reports `served`.
    pub fn derive_order_status(&self) -> OrderStatus {
        if self.cancelled == self.total() {
            OrderStatus::Cancelled
        } else if self.served > 0 || self.completed > 0 {
            OrderStatus::Served
        } else {
            OrderStatus::Preparing
        }
    }
}
