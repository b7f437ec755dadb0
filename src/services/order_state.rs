//! Order/Item state controller
//!
//! Applies kitchen status changes to items and orders. Every change runs in a
//! single transaction that also appends to `order_status_logs` and recomputes
//! the owning order's total and derived status. Writers always lock the order
//! row before touching its items.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::json;
use tracing::{debug, info};

use crate::entities::{order_items, order_status_logs, orders, prelude::*};
use crate::error::{CoreError, CoreResult};
use crate::models::event::{AuditRecord, DomainEvent};
use crate::models::order::{
    billable_total, ItemTransitionOutcome, OrderTransitionOutcome, OrderWithItems,
};
use crate::models::status::{ItemStatus, ItemStatusCounts, OrderStatus};
use crate::services::notifier::EventDispatcher;

/// Who asked for a change and why
#[derive(Debug, Clone, Default)]
pub struct ChangeContext {
    pub actor: Option<String>,
    pub note: Option<String>,
}

impl ChangeContext {
    pub fn new(actor: Option<String>, note: Option<String>) -> Self {
        Self {
            actor: actor.filter(|a| !a.trim().is_empty()),
            note: note.filter(|n| !n.trim().is_empty()),
        }
    }
}

#[derive(Clone)]
pub struct OrderStateService {
    db: DatabaseConnection,
    events: EventDispatcher,
}

impl OrderStateService {
    pub fn new(db: DatabaseConnection, events: EventDispatcher) -> Self {
        Self { db, events }
    }

    /// Move one item to `target`, then recompute the order's total and status
    pub async fn transition_item(
        &self,
        item_id: i32,
        target: ItemStatus,
        ctx: ChangeContext,
    ) -> CoreResult<ItemTransitionOutcome> {
        if item_id <= 0 {
            return Err(CoreError::Validation(format!("invalid item id {}", item_id)));
        }

        let txn = self.db.begin().await?;
        let (outcome, order) = apply_item_transition(&txn, item_id, target, &ctx).await?;
        txn.commit().await?;

        info!(
            item_id = item_id,
            order_id = order.id,
            status = %target,
            order_status = %order.status,
            order_total = %order.total_amount,
            "Item status updated"
        );

        self.events.emit(
            vec![
                DomainEvent::ItemUpdated {
                    item_id,
                    order_id: order.id,
                    table_id: order.table_id,
                    status: target,
                },
                order_updated(&order),
            ],
            vec![AuditRecord::new(
                ctx.actor.clone(),
                "order_item",
                item_id,
                "order_item.status_changed",
                json!({ "order_id": order.id, "status": target, "note": ctx.note }),
            )],
        );

        Ok(outcome)
    }

    /// Order-level transition. `completed` is only reachable through checkout.
    pub async fn transition_order(
        &self,
        order_id: i32,
        target: OrderStatus,
        ctx: ChangeContext,
    ) -> CoreResult<OrderTransitionOutcome> {
        if order_id <= 0 {
            return Err(CoreError::Validation(format!("invalid order id {}", order_id)));
        }
        if target == OrderStatus::Completed {
            return Err(CoreError::PolicyViolation(
                "orders are completed only through checkout".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let outcome = apply_order_transition(&txn, order_id, target, &ctx).await?;
        txn.commit().await?;

        info!(
            order_id = order_id,
            from = %outcome.previous_status,
            to = %target,
            cancelled_items = outcome.cancelled_item_ids.len(),
            "Order status updated"
        );

        let mut events = vec![order_updated(&outcome.order)];
        events.extend(outcome.cancelled_item_ids.iter().map(|item_id| {
            DomainEvent::ItemUpdated {
                item_id: *item_id,
                order_id,
                table_id: outcome.order.table_id,
                status: ItemStatus::Cancelled,
            }
        }));
        self.events.emit(
            events,
            vec![AuditRecord::new(
                ctx.actor.clone(),
                "order",
                order_id,
                "order.status_changed",
                json!({
                    "from": outcome.previous_status,
                    "to": target,
                    "note": ctx.note,
                }),
            )],
        );

        Ok(outcome)
    }

    pub async fn get_order(&self, order_id: i32) -> CoreResult<OrderWithItems> {
        let order = Orders::find_by_id(order_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| CoreError::not_found("order", order_id))?;
        let items = load_items(&self.db, order.id).await?;
        Ok(OrderWithItems { order, items })
    }

    pub async fn status_log(&self, order_id: i32) -> CoreResult<Vec<order_status_logs::Model>> {
        Ok(OrderStatusLogs::find()
            .filter(order_status_logs::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_logs::Column::Id)
            .all(&self.db)
            .await?)
    }
}

pub(crate) fn order_updated(order: &orders::Model) -> DomainEvent {
    DomainEvent::OrderUpdated {
        order_id: order.id,
        table_id: order.table_id,
        status: order.status,
        total_amount: order.total_amount,
    }
}

async fn apply_item_transition<C: ConnectionTrait>(
    db: &C,
    item_id: i32,
    target: ItemStatus,
    ctx: &ChangeContext,
) -> CoreResult<(ItemTransitionOutcome, orders::Model)> {
    let peek = OrderItems::find_by_id(item_id)
        .one(db)
        .await?
        .ok_or_else(|| CoreError::not_found("order item", item_id))?;

    let order = lock_order(db, peek.order_id).await?;
    if order.status.is_closed() {
        return Err(CoreError::conflict(format!(
            "order {} is {} and no longer accepts item changes",
            order.id, order.status
        )));
    }

    // Re-read under the order lock
    let item = OrderItems::find_by_id(item_id)
        .one(db)
        .await?
        .ok_or_else(|| CoreError::not_found("order item", item_id))?;

    if !item.status.can_transition_to(target) {
        return Err(CoreError::InvalidTransition {
            from: item.status.to_string(),
            to: target.to_string(),
        });
    }

    let now = Utc::now();
    let from = item.status;
    let mut active = item.into_active_model();
    active.status = Set(target);
    active.cancelled_at = Set((target == ItemStatus::Cancelled).then_some(now));
    active.updated_at = Set(now);
    let item = active.update(db).await?;

    let note = match &ctx.note {
        Some(note) => format!("item #{}: {}", item.id, note),
        None => format!("item #{}", item.id),
    };
    append_status_log(
        db,
        order.id,
        Some(from.as_str()),
        target.as_str(),
        ctx.actor.clone(),
        Some(note),
    )
    .await?;

    let order = refresh_order(db, order).await?;

    Ok((
        ItemTransitionOutcome {
            item,
            order_id: order.id,
            order_total: order.total_amount,
            order_status: order.status,
        },
        order,
    ))
}

async fn apply_order_transition<C: ConnectionTrait>(
    db: &C,
    order_id: i32,
    target: OrderStatus,
    ctx: &ChangeContext,
) -> CoreResult<OrderTransitionOutcome> {
    let order = lock_order(db, order_id).await?;
    let previous_status = order.status;

    if order.status.is_closed() {
        return Err(CoreError::conflict(format!(
            "order {} is already {}",
            order.id, order.status
        )));
    }
    if !order.status.can_transition_to(target) {
        return Err(CoreError::InvalidTransition {
            from: order.status.to_string(),
            to: target.to_string(),
        });
    }

    if target == OrderStatus::Cancelled {
        let (order, cancelled_item_ids) =
            cancel_order_cascade(db, order, ctx.actor.clone(), ctx.note.clone()).await?;
        return Ok(OrderTransitionOutcome {
            order,
            previous_status,
            cancelled_item_ids,
        });
    }

    let now = Utc::now();
    let mut active = order.into_active_model();
    active.status = Set(target);
    active.updated_at = Set(now);
    let order = active.update(db).await?;

    append_status_log(
        db,
        order.id,
        Some(previous_status.as_str()),
        target.as_str(),
        ctx.actor.clone(),
        ctx.note.clone(),
    )
    .await?;

    Ok(OrderTransitionOutcome {
        order,
        previous_status,
        cancelled_item_ids: Vec::new(),
    })
}

/// `SELECT … FOR UPDATE` on the order row
pub(crate) async fn lock_order<C: ConnectionTrait>(
    db: &C,
    order_id: i32,
) -> CoreResult<orders::Model> {
    Orders::find_by_id(order_id)
        .lock_exclusive()
        .one(db)
        .await?
        .ok_or_else(|| CoreError::not_found("order", order_id))
}

pub(crate) async fn load_items<C: ConnectionTrait>(
    db: &C,
    order_id: i32,
) -> Result<Vec<order_items::Model>, sea_orm::DbErr> {
    OrderItems::find()
        .filter(order_items::Column::OrderId.eq(order_id))
        .order_by_asc(order_items::Column::Id)
        .all(db)
        .await
}

/// Recompute total and derived status from the order's current items
pub(crate) async fn refresh_order<C: ConnectionTrait>(
    db: &C,
    order: orders::Model,
) -> CoreResult<orders::Model> {
    let items = load_items(db, order.id).await?;
    let total = billable_total(&items);
    let status = ItemStatusCounts::tally(items.iter().map(|i| i.status)).derive_order_status();

    if order.total_amount == total && order.status == status {
        return Ok(order);
    }

    debug!(
        order_id = order.id,
        old_total = %order.total_amount,
        new_total = %total,
        old_status = %order.status,
        new_status = %status,
        "Recomputed order"
    );

    let mut active = order.into_active_model();
    active.total_amount = Set(total);
    active.status = Set(status);
    active.updated_at = Set(Utc::now());
    Ok(active.update(db).await?)
}

/// Cancel every live item, zero the total and log the order transition.
///
/// Returns the updated order and the ids of the items that were cancelled.
pub(crate) async fn cancel_order_cascade<C: ConnectionTrait>(
    db: &C,
    order: orders::Model,
    actor: Option<String>,
    note: Option<String>,
) -> CoreResult<(orders::Model, Vec<i32>)> {
    let now = Utc::now();
    let from = order.status;

    let live_item_ids: Vec<i32> = OrderItems::find()
        .select_only()
        .column(order_items::Column::Id)
        .filter(order_items::Column::OrderId.eq(order.id))
        .filter(order_items::Column::Status.ne(ItemStatus::Cancelled))
        .order_by_asc(order_items::Column::Id)
        .into_tuple()
        .all(db)
        .await?;

    if !live_item_ids.is_empty() {
        OrderItems::update_many()
            .set(order_items::ActiveModel {
                status: Set(ItemStatus::Cancelled),
                cancelled_at: Set(Some(now)),
                updated_at: Set(now),
                ..Default::default()
            })
            .filter(order_items::Column::Id.is_in(live_item_ids.clone()))
            .exec(db)
            .await?;
    }

    let mut active = order.into_active_model();
    active.status = Set(OrderStatus::Cancelled);
    active.total_amount = Set(Decimal::ZERO);
    active.updated_at = Set(now);
    let order = active.update(db).await?;

    append_status_log(
        db,
        order.id,
        Some(from.as_str()),
        OrderStatus::Cancelled.as_str(),
        actor,
        note,
    )
    .await?;

    Ok((order, live_item_ids))
}

pub(crate) async fn append_status_log<C: ConnectionTrait>(
    db: &C,
    order_id: i32,
    from_status: Option<&str>,
    to_status: &str,
    changed_by: Option<String>,
    note: Option<String>,
) -> Result<order_status_logs::Model, sea_orm::DbErr> {
    order_status_logs::ActiveModel {
        order_id: Set(order_id),
        from_status: Set(from_status.map(str::to_string)),
        to_status: Set(to_status.to_string()),
        changed_by: Set(changed_by),
        note: Set(note),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await
}
