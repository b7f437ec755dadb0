//! Domain events pushed to live subscribers and audit records
//!
//! Both are produced after a transaction commits. Losing one never affects
//! the stored state.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::status::{BillStatus, ItemStatus, OrderStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    OrderCreated {
        order_id: i32,
        table_id: i32,
        total_amount: Decimal,
    },
    OrderUpdated {
        order_id: i32,
        table_id: i32,
        status: OrderStatus,
        total_amount: Decimal,
    },
    ItemUpdated {
        item_id: i32,
        order_id: i32,
        table_id: i32,
        status: ItemStatus,
    },
    BillUpdated {
        bill_id: i32,
        table_id: i32,
        bill_code: String,
        status: BillStatus,
        total_amount: Decimal,
    },
}

impl DomainEvent {
    /// Table the event belongs to
    pub fn table_id(&self) -> i32 {
        match self {
            DomainEvent::OrderCreated { table_id, .. }
            | DomainEvent::OrderUpdated { table_id, .. }
            | DomainEvent::ItemUpdated { table_id, .. }
            | DomainEvent::BillUpdated { table_id, .. } => *table_id,
        }
    }
}

/// One row for the external activity log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub actor: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub action: String,
    pub details: serde_json::Value,
}

impl AuditRecord {
    pub fn new(
        actor: Option<String>,
        entity_type: &str,
        entity_id: impl ToString,
        action: &str,
        details: serde_json::Value,
    ) -> Self {
        Self {
            actor,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            action: action.to_string(),
            details,
        }
    }
}
