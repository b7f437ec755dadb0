//! Checkout and payment finalizer
//!
//! Drives a bill open → pending_payment → paid. Both steps take the table row
//! lock and then the bill row lock (same order as consolidation), so two
//! concurrent confirmations or settlements of one bill serialize and the
//! loser observes the new status.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde_json::json;
use tracing::{info, warn};

use crate::entities::{bill_orders, bills, dining_tables, orders, payments, prelude::*};
use crate::error::{CoreError, CoreResult};
use crate::models::bill::{CheckoutOutcome, PaymentOutcome};
use crate::models::event::{AuditRecord, DomainEvent};
use crate::models::status::{BillStatus, OrderStatus, PaymentMethod, TableStatus, PAYMENT_STATUS_PAID};
use crate::services::bill_consolidation::{
    cancel_ghost_orders, delete_bill, detach_inactive_links, linked_order_ids, lock_table,
    recompute_bill,
};
use crate::services::order_state::{append_status_log, order_updated};
use crate::services::notifier::EventDispatcher;

#[derive(Clone)]
pub struct CheckoutService {
    db: DatabaseConnection,
    events: EventDispatcher,
}

impl CheckoutService {
    pub fn new(db: DatabaseConnection, events: EventDispatcher) -> Self {
        Self { db, events }
    }

    /// Freeze an open bill for payment, complete its orders and free the table
    pub async fn confirm_checkout(
        &self,
        bill_id: i32,
        actor: Option<String>,
    ) -> CoreResult<CheckoutOutcome> {
        if bill_id <= 0 {
            return Err(CoreError::Validation(format!("invalid bill id {}", bill_id)));
        }

        let txn = self.db.begin().await?;
        let bill = lock_bill(&txn, bill_id).await?;

        if bill.status != BillStatus::Open {
            return Err(CoreError::conflict(format!(
                "bill {} is {}, expected open",
                bill.bill_code, bill.status
            )));
        }

        // Refresh against whatever changed since the bill was last consolidated.
        // Linked orders stay locked until commit so item changes cannot slip
        // in between the recompute and the completion below.
        let linked = linked_order_ids(&txn, bill.id).await?;
        lock_orders(&txn, &linked).await?;
        let ghosts = cancel_ghost_orders(&txn, &linked, actor.clone()).await?;
        detach_inactive_links(&txn, bill.id).await?;
        let (bill, order_ids) = recompute_bill(&txn, bill).await?;

        if bill.subtotal <= rust_decimal::Decimal::ZERO {
            return Err(CoreError::conflict("nothing to checkout"));
        }

        let now = Utc::now();
        let mut model = bill.into_active_model();
        model.status = Set(BillStatus::PendingPayment);
        model.updated_at = Set(now);
        let bill = model.update(&txn).await?;

        let strays: Vec<i32> = Bills::find()
            .select_only()
            .column(bills::Column::Id)
            .filter(bills::Column::TableId.eq(bill.table_id))
            .filter(bills::Column::Status.eq(BillStatus::Open))
            .filter(bills::Column::Id.ne(bill.id))
            .into_tuple()
            .all(&txn)
            .await?;
        for stray_id in &strays {
            warn!(bill_id = stray_id, table_id = bill.table_id, "Deleting stray open bill at checkout");
            delete_bill(&txn, *stray_id).await?;
        }

        let to_complete = Orders::find()
            .filter(orders::Column::Id.is_in(order_ids))
            .filter(orders::Column::Status.is_in(OrderStatus::active()))
            .order_by_asc(orders::Column::Id)
            .lock_exclusive()
            .all(&txn)
            .await?;

        let mut completed = Vec::with_capacity(to_complete.len());
        for order in to_complete {
            let from = order.status;
            let mut model = order.into_active_model();
            model.status = Set(OrderStatus::Completed);
            model.updated_at = Set(now);
            let order = model.update(&txn).await?;
            append_status_log(
                &txn,
                order.id,
                Some(from.as_str()),
                OrderStatus::Completed.as_str(),
                actor.clone(),
                Some(format!("checkout {}", bill.bill_code)),
            )
            .await?;
            completed.push(order);
        }

        release_table(&txn, bill.table_id).await?;
        txn.commit().await?;

        let completed_order_ids: Vec<i32> = completed.iter().map(|o| o.id).collect();
        info!(
            bill_id = bill.id,
            bill_code = %bill.bill_code,
            total = %bill.total_amount,
            completed_orders = ?completed_order_ids,
            ghost_orders = ghosts.len(),
            stray_bills = strays.len(),
            "Checkout confirmed"
        );

        let mut events: Vec<DomainEvent> = ghosts.iter().map(order_updated).collect();
        events.extend(completed.iter().map(order_updated));
        events.push(bill_updated(&bill));
        self.events.emit(
            events,
            vec![AuditRecord::new(
                actor,
                "bill",
                bill.id,
                "bill.checkout_confirmed",
                json!({
                    "bill_code": bill.bill_code,
                    "total_amount": bill.total_amount,
                    "completed_order_ids": completed_order_ids,
                }),
            )],
        );

        Ok(CheckoutOutcome {
            bill,
            completed_order_ids,
        })
    }

    /// Settle a bill awaiting payment. A second call fails with `Conflict`.
    pub async fn mark_paid(
        &self,
        bill_id: i32,
        method: PaymentMethod,
        actor: Option<String>,
    ) -> CoreResult<PaymentOutcome> {
        if bill_id <= 0 {
            return Err(CoreError::Validation(format!("invalid bill id {}", bill_id)));
        }

        let txn = self.db.begin().await?;
        let bill = lock_bill(&txn, bill_id).await?;

        match bill.status {
            BillStatus::PendingPayment => {}
            BillStatus::Paid => {
                return Err(CoreError::conflict(format!(
                    "bill {} is already paid",
                    bill.bill_code
                )));
            }
            BillStatus::Open => {
                return Err(CoreError::conflict(format!(
                    "bill {} has not been checked out",
                    bill.bill_code
                )));
            }
        }

        // Informational only; the bill is the settlement key
        let first_order_id: Option<i32> = BillOrders::find()
            .select_only()
            .column(bill_orders::Column::OrderId)
            .filter(bill_orders::Column::BillId.eq(bill.id))
            .order_by_asc(bill_orders::Column::Id)
            .into_tuple()
            .one(&txn)
            .await?;

        let now = Utc::now();
        let payment = payments::ActiveModel {
            bill_id: Set(bill.id),
            order_id: Set(first_order_id),
            method: Set(method),
            amount: Set(bill.total_amount),
            status: Set(PAYMENT_STATUS_PAID.to_string()),
            paid_time: Set(now),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(&txn)
        .await?;

        let mut model = bill.into_active_model();
        model.status = Set(BillStatus::Paid);
        model.updated_at = Set(now);
        let bill = model.update(&txn).await?;

        release_table(&txn, bill.table_id).await?;
        txn.commit().await?;

        info!(
            bill_id = bill.id,
            bill_code = %bill.bill_code,
            payment_id = payment.id,
            amount = %payment.amount,
            method = method.as_str(),
            "Bill paid"
        );

        self.events.emit(
            vec![bill_updated(&bill)],
            vec![AuditRecord::new(
                actor,
                "bill",
                bill.id,
                "bill.paid",
                json!({
                    "bill_code": bill.bill_code,
                    "payment_id": payment.id,
                    "method": method,
                    "amount": payment.amount,
                }),
            )],
        );

        Ok(PaymentOutcome {
            payment_id: payment.id,
            bill_id: bill.id,
            bill_code: bill.bill_code,
            method,
            amount: payment.amount,
            paid_time: payment.paid_time,
        })
    }
}

/// Table lock, then `SELECT … FOR UPDATE` on the bill
async fn lock_bill<C: ConnectionTrait>(db: &C, bill_id: i32) -> CoreResult<bills::Model> {
    let peek = Bills::find_by_id(bill_id)
        .one(db)
        .await?
        .ok_or_else(|| CoreError::not_found("bill", bill_id))?;
    lock_table(db, peek.table_id).await?;

    Bills::find_by_id(bill_id)
        .lock_exclusive()
        .one(db)
        .await?
        .ok_or_else(|| CoreError::not_found("bill", bill_id))
}

/// `SELECT … FOR UPDATE` on a set of orders, ascending by id
async fn lock_orders<C: ConnectionTrait>(db: &C, order_ids: &[i32]) -> Result<(), sea_orm::DbErr> {
    if order_ids.is_empty() {
        return Ok(());
    }
    Orders::find()
        .filter(orders::Column::Id.is_in(order_ids.to_vec()))
        .order_by_asc(orders::Column::Id)
        .lock_exclusive()
        .all(db)
        .await?;
    Ok(())
}

async fn release_table<C: ConnectionTrait>(db: &C, table_id: i32) -> Result<(), sea_orm::DbErr> {
    DiningTables::update_many()
        .set(dining_tables::ActiveModel {
            status: Set(TableStatus::Available),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(dining_tables::Column::Id.eq(table_id))
        .exec(db)
        .await?;
    Ok(())
}

fn bill_updated(bill: &bills::Model) -> DomainEvent {
    DomainEvent::BillUpdated {
        bill_id: bill.id,
        table_id: bill.table_id,
        bill_code: bill.bill_code.clone(),
        status: bill.status,
        total_amount: bill.total_amount,
    }
}
