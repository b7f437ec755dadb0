//! Order placement
//!
//! Orders arrive from the waiter/customer front ends with prices already
//! snapshotted from the menu. Placing an order marks the table occupied.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde_json::json;
use tracing::info;

use crate::entities::{dining_tables, order_items, orders, prelude::*};
use crate::error::{CoreError, CoreResult};
use crate::models::event::{AuditRecord, DomainEvent};
use crate::models::order::{billable_total, OrderWithItems, PlaceOrderItem};
use crate::models::status::{ItemStatus, OrderStatus, TableStatus};
use crate::services::bill_consolidation::lock_table;
use crate::services::notifier::EventDispatcher;
use crate::services::order_state::append_status_log;

/// Upper bound on a single line; guards against fat-fingered quantities
pub const MAX_ITEM_QUANTITY: i32 = 999;

/// Largest amount a `decimal(12,2)` money column holds
pub const MAX_MONEY_AMOUNT: Decimal = dec!(9999999999.99);

#[derive(Debug, Clone)]
pub struct NewOrder {
    pub table_id: i32,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub notes: Option<String>,
    pub actor: Option<String>,
    pub items: Vec<PlaceOrderItem>,
}

#[derive(Clone)]
pub struct OrderIntakeService {
    db: DatabaseConnection,
    events: EventDispatcher,
}

impl OrderIntakeService {
    pub fn new(db: DatabaseConnection, events: EventDispatcher) -> Self {
        Self { db, events }
    }

    pub async fn place_order(&self, new_order: NewOrder) -> CoreResult<OrderWithItems> {
        validate_items(&new_order.items)?;

        let txn = self.db.begin().await?;
        let table = lock_table(&txn, new_order.table_id).await?;
        let now = Utc::now();

        let order = orders::ActiveModel {
            table_id: Set(table.id),
            status: Set(OrderStatus::Pending),
            total_amount: Set(Decimal::ZERO),
            customer_name: Set(new_order.customer_name.clone()),
            customer_phone: Set(new_order.customer_phone.clone()),
            notes: Set(new_order.notes.clone()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let mut items = Vec::with_capacity(new_order.items.len());
        for line in &new_order.items {
            let unit_price = line.unit_price.round_dp(2);
            let subtotal = line_subtotal(unit_price, line.quantity)?;
            let item = order_items::ActiveModel {
                order_id: Set(order.id),
                food_id: Set(line.food_id),
                quantity: Set(line.quantity),
                unit_price: Set(unit_price),
                subtotal: Set(subtotal),
                status: Set(ItemStatus::Pending),
                cancelled_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
                ..Default::default()
            }
            .insert(&txn)
            .await?;
            items.push(item);
        }

        let mut model: orders::ActiveModel = order.into();
        model.total_amount = Set(billable_total(&items));
        let order = model.update(&txn).await?;

        append_status_log(
            &txn,
            order.id,
            None,
            OrderStatus::Pending.as_str(),
            new_order.actor.clone(),
            Some("order placed".to_string()),
        )
        .await?;

        if table.status != TableStatus::Occupied {
            DiningTables::update_many()
                .set(dining_tables::ActiveModel {
                    status: Set(TableStatus::Occupied),
                    updated_at: Set(now),
                    ..Default::default()
                })
                .filter(dining_tables::Column::Id.eq(table.id))
                .exec(&txn)
                .await?;
        }

        txn.commit().await?;

        info!(
            order_id = order.id,
            table_id = order.table_id,
            items = items.len(),
            total = %order.total_amount,
            "Order placed"
        );

        self.events.emit(
            vec![DomainEvent::OrderCreated {
                order_id: order.id,
                table_id: order.table_id,
                total_amount: order.total_amount,
            }],
            vec![AuditRecord::new(
                new_order.actor,
                "order",
                order.id,
                "order.created",
                json!({ "table_id": order.table_id, "total_amount": order.total_amount }),
            )],
        );

        Ok(OrderWithItems { order, items })
    }
}

fn validate_items(items: &[PlaceOrderItem]) -> CoreResult<()> {
    if items.is_empty() {
        return Err(CoreError::Validation("order has no items".to_string()));
    }
    let mut total = Decimal::ZERO;
    for (idx, item) in items.iter().enumerate() {
        if item.food_id <= 0 {
            return Err(CoreError::Validation(format!(
                "item {}: invalid food id {}",
                idx, item.food_id
            )));
        }
        if item.quantity < 1 || item.quantity > MAX_ITEM_QUANTITY {
            return Err(CoreError::Validation(format!(
                "item {}: quantity must be between 1 and {}",
                idx, MAX_ITEM_QUANTITY
            )));
        }
        if item.unit_price.is_sign_negative() {
            return Err(CoreError::Validation(format!(
                "item {}: unit price must not be negative",
                idx
            )));
        }
        if item.unit_price > MAX_MONEY_AMOUNT {
            return Err(CoreError::Validation(format!(
                "item {}: unit price exceeds {}",
                idx, MAX_MONEY_AMOUNT
            )));
        }
        let subtotal = line_subtotal(item.unit_price.round_dp(2), item.quantity)
            .map_err(|_| CoreError::Validation(format!("item {}: line amount too large", idx)))?;
        total = total
            .checked_add(subtotal)
            .filter(|t| *t <= MAX_MONEY_AMOUNT)
            .ok_or_else(|| CoreError::Validation("order total too large".to_string()))?;
    }
    Ok(())
}

/// `unit_price × quantity`, bounded by the money column range
fn line_subtotal(unit_price: Decimal, quantity: i32) -> CoreResult<Decimal> {
    unit_price
        .checked_mul(Decimal::from(quantity))
        .map(|amount| amount.round_dp(2))
        .filter(|amount| *amount <= MAX_MONEY_AMOUNT)
        .ok_or_else(|| CoreError::Validation("line amount too large".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(quantity: i32, price: Decimal) -> PlaceOrderItem {
        PlaceOrderItem {
            food_id: 1,
            quantity,
            unit_price: price,
        }
    }

    #[test]
    fn test_validate_rejects_empty_order() {
        assert!(matches!(validate_items(&[]), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_validate_quantity_bounds() {
        assert!(validate_items(&[line(0, dec!(10))]).is_err());
        assert!(validate_items(&[line(1000, dec!(10))]).is_err());
        assert!(validate_items(&[line(2, dec!(10))]).is_ok());
    }

    #[test]
    fn test_validate_negative_price() {
        assert!(validate_items(&[line(1, dec!(-0.01))]).is_err());
        assert!(validate_items(&[line(1, dec!(0))]).is_ok());
    }

    #[test]
    fn test_validate_rejects_price_beyond_column_range() {
        let huge = Decimal::MAX;
        assert!(matches!(
            validate_items(&[line(2, huge)]),
            Err(CoreError::Validation(_))
        ));
        assert!(validate_items(&[line(1, dec!(10000000000))]).is_err());
    }

    #[test]
    fn test_validate_rejects_line_and_order_overflow() {
        // Price fits, price × quantity does not
        assert!(validate_items(&[line(999, dec!(9999999999.99))]).is_err());
        // Each line fits, the sum does not
        assert!(validate_items(&[
            line(1, dec!(6000000000)),
            line(1, dec!(6000000000)),
        ])
        .is_err());
        assert!(validate_items(&[line(3, dec!(12.50))]).is_ok());
    }
}
