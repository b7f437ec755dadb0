//! Bill consolidation service
//!
//! Keeps exactly one open bill per table in sync with the table's active,
//! billable orders:
//!
//! 1. delete open bills with nothing billable behind them
//! 2. cancel active orders whose items are all cancelled
//! 3. bail out (no bill) when nothing billable is left
//! 4. detach links to orders that are no longer active
//! 5. reuse the open bill or allocate a new `T{table}-{yyyymmdd}-{seq}` code
//! 6. attach every unlinked billable order
//! 7. recompute totals
//!
//! The whole run is one transaction holding the table row lock, so calling it
//! repeatedly or concurrently converges on the same bill.

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::OnConflict, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection,
    DbErr, EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr,
    TransactionTrait,
};
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_BILL_CODE_MAX_ATTEMPTS;
use crate::entities::{bill_orders, bills, dining_tables, orders, payments, prelude::*};
use crate::error::{CoreError, CoreResult};
use crate::models::bill::{BillDetail, BillSummary};
use crate::models::event::{AuditRecord, DomainEvent};
use crate::models::order::OrderWithItems;
use crate::models::status::{BillStatus, OrderStatus};
use crate::services::notifier::EventDispatcher;
use crate::services::order_state::{cancel_order_cascade, order_updated};

const GHOST_ORDER_NOTE: &str = "auto-cancelled: no billable items left";

#[derive(Clone)]
pub struct BillConsolidationService {
    db: DatabaseConnection,
    events: EventDispatcher,
    max_code_attempts: u32,
}

/// Everything one consolidation run changed besides the bill itself
#[derive(Debug, Default)]
struct ConsolidationReport {
    deleted_bill_ids: Vec<i32>,
    cancelled_orders: Vec<orders::Model>,
    detached_order_ids: Vec<i32>,
    created: bool,
}

impl BillConsolidationService {
    pub fn new(db: DatabaseConnection, events: EventDispatcher) -> Self {
        Self {
            db,
            events,
            max_code_attempts: DEFAULT_BILL_CODE_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_code_attempts(mut self, attempts: u32) -> Self {
        self.max_code_attempts = attempts.max(1);
        self
    }

    /// Find or create the table's open bill and bring it up to date.
    ///
    /// Returns `None` when the table has no active order with a live item.
    pub async fn ensure_open_bill(&self, table_id: i32) -> CoreResult<Option<BillSummary>> {
        if table_id <= 0 {
            return Err(CoreError::Validation(format!("invalid table id {}", table_id)));
        }

        let txn = self.db.begin().await?;
        lock_table(&txn, table_id).await?;
        let mut report = ConsolidationReport::default();
        let summary = consolidate(&txn, table_id, self.max_code_attempts, &mut report).await?;
        txn.commit().await?;

        info!(
            table_id = table_id,
            bill_id = summary.as_ref().map(|s| s.bill_id),
            total = %summary.as_ref().map(|s| s.total_amount).unwrap_or_default(),
            created = report.created,
            deleted_bills = report.deleted_bill_ids.len(),
            cancelled_orders = report.cancelled_orders.len(),
            detached_orders = report.detached_order_ids.len(),
            "Consolidated table bill"
        );

        let mut events: Vec<DomainEvent> =
            report.cancelled_orders.iter().map(order_updated).collect();
        let mut audits = Vec::new();
        if let Some(summary) = &summary {
            events.push(DomainEvent::BillUpdated {
                bill_id: summary.bill_id,
                table_id,
                bill_code: summary.bill_code.clone(),
                status: summary.status,
                total_amount: summary.total_amount,
            });
            if report.created {
                audits.push(AuditRecord::new(
                    None,
                    "bill",
                    summary.bill_id,
                    "bill.opened",
                    json!({ "bill_code": summary.bill_code, "table_id": table_id }),
                ));
            }
        }
        self.events.emit(events, audits);

        Ok(summary)
    }

    /// Active orders of the table that still have at least one live item
    pub async fn list_open_orders(&self, table_id: i32) -> CoreResult<Vec<OrderWithItems>> {
        DiningTables::find_by_id(table_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| CoreError::not_found("table", table_id))?;

        let orders = active_orders_with_items(&self.db, table_id).await?;
        Ok(orders
            .into_iter()
            .filter(OrderWithItems::has_billable_items)
            .collect())
    }

    /// Bill with its linked orders and any recorded payments
    pub async fn bill_detail(&self, bill_id: i32) -> CoreResult<BillDetail> {
        let bill = Bills::find_by_id(bill_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| CoreError::not_found("bill", bill_id))?;

        let order_ids = linked_order_ids(&self.db, bill.id).await?;
        let orders = orders_with_items(&self.db, &order_ids).await?;
        let payments = Payments::find()
            .filter(payments::Column::BillId.eq(bill.id))
            .order_by_asc(payments::Column::Id)
            .all(&self.db)
            .await?;

        Ok(BillDetail {
            bill,
            orders,
            payments,
        })
    }
}

async fn consolidate<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    table_id: i32,
    max_code_attempts: u32,
    report: &mut ConsolidationReport,
) -> CoreResult<Option<BillSummary>> {
    // Step 1: ghost bills
    for bill in open_bills(db, table_id).await? {
        let linked = linked_order_ids(db, bill.id).await?;
        let billable = billable_order_ids(db, &linked).await?;
        if billable.is_empty() {
            debug!(bill_id = bill.id, bill_code = %bill.bill_code, "Deleting ghost bill");
            delete_bill(db, bill.id).await?;
            report.deleted_bill_ids.push(bill.id);
        }
    }

    // Step 2: ghost orders
    let mut billable_orders = Vec::new();
    for entry in active_orders_with_items(db, table_id).await? {
        if entry.has_billable_items() {
            billable_orders.push(entry);
        } else {
            let (order, _) = cancel_order_cascade(
                db,
                entry.order,
                None,
                Some(GHOST_ORDER_NOTE.to_string()),
            )
            .await?;
            debug!(order_id = order.id, "Cancelled ghost order");
            report.cancelled_orders.push(order);
        }
    }

    // Step 3
    if billable_orders.is_empty() {
        return Ok(None);
    }

    // Step 4
    let surviving = open_bills(db, table_id).await?;
    for bill in &surviving {
        report
            .detached_order_ids
            .extend(detach_inactive_links(db, bill.id).await?);
    }

    // Step 5
    let billable_ids: Vec<i32> = billable_orders.iter().map(|o| o.order.id).collect();
    let bill = match pick_open_bill(db, &surviving, &billable_ids).await? {
        Some(bill) => {
            merge_stray_bills(db, &bill, &surviving).await?;
            bill
        }
        None => {
            if let Some(pending) = awaiting_payment(db, table_id).await? {
                return Err(CoreError::conflict(format!(
                    "bill {} for table {} is awaiting payment",
                    pending.bill_code, table_id
                )));
            }
            // No reusable bill; anything left over is a stray
            for stray in &surviving {
                delete_bill(db, stray.id).await?;
                report.deleted_bill_ids.push(stray.id);
            }
            report.created = true;
            allocate_bill(db, table_id, Utc::now().date_naive(), max_code_attempts).await?
        }
    };

    // Step 6
    let already_linked: HashSet<i32> = linked_order_ids(db, bill.id).await?.into_iter().collect();
    for order_id in billable_ids.iter().filter(|id| !already_linked.contains(id)) {
        attach_order(db, bill.id, *order_id).await?;
    }

    // Step 7
    let (bill, order_ids) = recompute_bill(db, bill).await?;
    Ok(Some(BillSummary::from_model(&bill, order_ids)))
}

/// `SELECT … FOR UPDATE` on the dining table row
pub(crate) async fn lock_table<C: ConnectionTrait>(
    db: &C,
    table_id: i32,
) -> CoreResult<dining_tables::Model> {
    DiningTables::find_by_id(table_id)
        .lock_exclusive()
        .one(db)
        .await?
        .ok_or_else(|| CoreError::not_found("table", table_id))
}

async fn open_bills<C: ConnectionTrait>(db: &C, table_id: i32) -> Result<Vec<bills::Model>, DbErr> {
    Bills::find()
        .filter(bills::Column::TableId.eq(table_id))
        .filter(bills::Column::Status.eq(BillStatus::Open))
        .order_by_asc(bills::Column::Id)
        .all(db)
        .await
}

async fn awaiting_payment<C: ConnectionTrait>(
    db: &C,
    table_id: i32,
) -> Result<Option<bills::Model>, DbErr> {
    Bills::find()
        .filter(bills::Column::TableId.eq(table_id))
        .filter(bills::Column::Status.eq(BillStatus::PendingPayment))
        .one(db)
        .await
}

pub(crate) async fn linked_order_ids<C: ConnectionTrait>(
    db: &C,
    bill_id: i32,
) -> Result<Vec<i32>, DbErr> {
    BillOrders::find()
        .select_only()
        .column(bill_orders::Column::OrderId)
        .filter(bill_orders::Column::BillId.eq(bill_id))
        .order_by_asc(bill_orders::Column::OrderId)
        .into_tuple()
        .all(db)
        .await
}

/// Orders with their items, ascending by id
pub(crate) async fn orders_with_items<C: ConnectionTrait>(
    db: &C,
    order_ids: &[i32],
) -> Result<Vec<OrderWithItems>, DbErr> {
    if order_ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = Orders::find()
        .filter(orders::Column::Id.is_in(order_ids.to_vec()))
        .order_by_asc(orders::Column::Id)
        .find_with_related(OrderItems)
        .all(db)
        .await?;
    Ok(rows
        .into_iter()
        .map(|(order, items)| OrderWithItems { order, items })
        .collect())
}

async fn active_orders_with_items<C: ConnectionTrait>(
    db: &C,
    table_id: i32,
) -> Result<Vec<OrderWithItems>, DbErr> {
    let rows = Orders::find()
        .filter(orders::Column::TableId.eq(table_id))
        .filter(orders::Column::Status.is_in(OrderStatus::active()))
        .order_by_asc(orders::Column::Id)
        .find_with_related(OrderItems)
        .all(db)
        .await?;
    Ok(rows
        .into_iter()
        .map(|(order, items)| OrderWithItems { order, items })
        .collect())
}

/// Subset of `order_ids` that is active and has a live item
async fn billable_order_ids<C: ConnectionTrait>(
    db: &C,
    order_ids: &[i32],
) -> Result<Vec<i32>, DbErr> {
    Ok(orders_with_items(db, order_ids)
        .await?
        .into_iter()
        .filter(|o| o.order.status.is_active() && o.has_billable_items())
        .map(|o| o.order.id)
        .collect())
}

/// Remove links to orders that left the active statuses; returns their ids
pub(crate) async fn detach_inactive_links<C: ConnectionTrait>(
    db: &C,
    bill_id: i32,
) -> Result<Vec<i32>, DbErr> {
    let linked = linked_order_ids(db, bill_id).await?;
    if linked.is_empty() {
        return Ok(Vec::new());
    }

    let active: HashSet<i32> = Orders::find()
        .select_only()
        .column(orders::Column::Id)
        .filter(orders::Column::Id.is_in(linked.clone()))
        .filter(orders::Column::Status.is_in(OrderStatus::active()))
        .into_tuple::<i32>()
        .all(db)
        .await?
        .into_iter()
        .collect();

    let stale: Vec<i32> = linked.into_iter().filter(|id| !active.contains(id)).collect();
    if !stale.is_empty() {
        BillOrders::delete_many()
            .filter(bill_orders::Column::BillId.eq(bill_id))
            .filter(bill_orders::Column::OrderId.is_in(stale.clone()))
            .exec(db)
            .await?;
        debug!(bill_id = bill_id, orders = ?stale, "Detached inactive orders from bill");
    }
    Ok(stale)
}

/// Cancel linked active orders that have no live items left
pub(crate) async fn cancel_ghost_orders<C: ConnectionTrait>(
    db: &C,
    order_ids: &[i32],
    actor: Option<String>,
) -> CoreResult<Vec<orders::Model>> {
    let mut cancelled = Vec::new();
    for entry in orders_with_items(db, order_ids).await? {
        if entry.order.status.is_active() && !entry.has_billable_items() {
            let (order, _) = cancel_order_cascade(
                db,
                entry.order,
                actor.clone(),
                Some(GHOST_ORDER_NOTE.to_string()),
            )
            .await?;
            cancelled.push(order);
        }
    }
    Ok(cancelled)
}

/// Set subtotal = total = Σ live item subtotals over linked active orders.
///
/// Returns the (possibly unchanged) bill and the active order ids it covers.
pub(crate) async fn recompute_bill<C: ConnectionTrait>(
    db: &C,
    bill: bills::Model,
) -> Result<(bills::Model, Vec<i32>), DbErr> {
    let linked = linked_order_ids(db, bill.id).await?;
    let active: Vec<OrderWithItems> = orders_with_items(db, &linked)
        .await?
        .into_iter()
        .filter(|o| o.order.status.is_active())
        .collect();

    let subtotal = active
        .iter()
        .map(OrderWithItems::billable_total)
        .sum::<Decimal>()
        .round_dp(2);
    let order_ids: Vec<i32> = active.iter().map(|o| o.order.id).collect();

    if bill.subtotal == subtotal && bill.total_amount == subtotal && bill.discount.is_zero() {
        return Ok((bill, order_ids));
    }

    let mut model = bill.into_active_model();
    model.subtotal = Set(subtotal);
    model.discount = Set(Decimal::ZERO);
    model.total_amount = Set(subtotal);
    model.updated_at = Set(Utc::now());
    Ok((model.update(db).await?, order_ids))
}

/// Drop a bill together with its links
pub(crate) async fn delete_bill<C: ConnectionTrait>(db: &C, bill_id: i32) -> Result<(), DbErr> {
    BillOrders::delete_many()
        .filter(bill_orders::Column::BillId.eq(bill_id))
        .exec(db)
        .await?;
    Bills::delete_by_id(bill_id).exec(db).await?;
    Ok(())
}

/// Lowest-id open bill that already carries one of `billable_ids`
async fn pick_open_bill<C: ConnectionTrait>(
    db: &C,
    open: &[bills::Model],
    billable_ids: &[i32],
) -> Result<Option<bills::Model>, DbErr> {
    if open.is_empty() {
        return Ok(None);
    }
    let carrying: BTreeSet<i32> = BillOrders::find()
        .select_only()
        .column(bill_orders::Column::BillId)
        .filter(bill_orders::Column::OrderId.is_in(billable_ids.to_vec()))
        .into_tuple::<i32>()
        .all(db)
        .await?
        .into_iter()
        .collect();

    Ok(open.iter().find(|b| carrying.contains(&b.id)).cloned())
}

/// Fold any other open bill of the table into `keep`
async fn merge_stray_bills<C: ConnectionTrait>(
    db: &C,
    keep: &bills::Model,
    open: &[bills::Model],
) -> Result<(), DbErr> {
    for stray in open.iter().filter(|b| b.id != keep.id) {
        warn!(
            bill_id = stray.id,
            kept_bill_id = keep.id,
            table_id = keep.table_id,
            "Merging stray open bill"
        );
        BillOrders::update_many()
            .set(bill_orders::ActiveModel {
                bill_id: Set(keep.id),
                ..Default::default()
            })
            .filter(bill_orders::Column::BillId.eq(stray.id))
            .exec(db)
            .await?;
        Bills::delete_by_id(stray.id).exec(db).await?;
    }
    Ok(())
}

/// Insert-if-absent on the unique `order_id`
async fn attach_order<C: ConnectionTrait>(db: &C, bill_id: i32, order_id: i32) -> Result<(), DbErr> {
    let inserted = BillOrders::insert(bill_orders::ActiveModel {
        bill_id: Set(bill_id),
        order_id: Set(order_id),
        created_at: Set(Utc::now()),
        ..Default::default()
    })
    .on_conflict(
        OnConflict::column(bill_orders::Column::OrderId)
            .do_nothing()
            .to_owned(),
    )
    .exec_without_returning(db)
    .await?;

    if inserted == 0 {
        debug!(bill_id = bill_id, order_id = order_id, "Order already attached elsewhere");
    }
    Ok(())
}

/// Insert a new open bill, retrying on bill-code collisions.
///
/// Each attempt runs in a savepoint so a unique violation leaves the outer
/// transaction usable.
async fn allocate_bill<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    table_id: i32,
    day: NaiveDate,
    max_attempts: u32,
) -> CoreResult<bills::Model> {
    let prefix = bill_code_prefix(table_id, day);
    let used: Vec<String> = Bills::find()
        .select_only()
        .column(bills::Column::BillCode)
        .filter(bills::Column::BillCode.starts_with(&prefix))
        .into_tuple()
        .all(db)
        .await?;
    insert_bill_from(db, table_id, day, next_sequence(&prefix, &used), max_attempts).await
}

/// Try `first_seq`, `first_seq + 1`, … until an insert succeeds or the
/// attempts run out
async fn insert_bill_from<C: ConnectionTrait + TransactionTrait>(
    db: &C,
    table_id: i32,
    day: NaiveDate,
    first_seq: u32,
    max_attempts: u32,
) -> CoreResult<bills::Model> {
    let mut seq = first_seq;
    for attempt in 1..=max_attempts {
        let code = format_bill_code(table_id, day, seq);
        let now = Utc::now();
        let savepoint = db.begin().await?;
        let insert = bills::ActiveModel {
            table_id: Set(table_id),
            bill_code: Set(code.clone()),
            status: Set(BillStatus::Open),
            subtotal: Set(Decimal::ZERO),
            discount: Set(Decimal::ZERO),
            total_amount: Set(Decimal::ZERO),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&savepoint)
        .await;

        match insert {
            Ok(bill) => {
                savepoint.commit().await?;
                info!(bill_id = bill.id, bill_code = %code, attempt = attempt, "Opened bill");
                return Ok(bill);
            }
            Err(err) if is_unique_violation(&err) => {
                savepoint.rollback().await?;
                warn!(bill_code = %code, attempt = attempt, "Bill code taken, retrying");
                seq += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }

    Err(CoreError::AllocationFailed {
        attempts: max_attempts,
    })
}

fn is_unique_violation(err: &DbErr) -> bool {
    matches!(err.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

pub fn bill_code_prefix(table_id: i32, day: NaiveDate) -> String {
    format!("T{}-{}-", table_id, day.format("%Y%m%d"))
}

pub fn format_bill_code(table_id: i32, day: NaiveDate, seq: u32) -> String {
    format!("{}{:03}", bill_code_prefix(table_id, day), seq)
}

/// One past the highest numeric suffix among `codes` sharing `prefix`
pub fn next_sequence(prefix: &str, codes: &[String]) -> u32 {
    codes
        .iter()
        .filter_map(|code| code.strip_prefix(prefix))
        .filter(|suffix| !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()))
        .filter_map(|suffix| suffix.parse::<u32>().ok())
        .max()
        .unwrap_or(0)
        + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).unwrap()
    }

    #[test]
    fn test_format_bill_code() {
        assert_eq!(format_bill_code(1, day(), 1), "T1-20261016-001");
        assert_eq!(format_bill_code(12, day(), 42), "T12-20261016-042");
    }

    #[test]
    fn test_next_sequence_empty() {
        assert_eq!(next_sequence("T1-20261016-", &[]), 1);
    }

    #[test]
    fn test_next_sequence_takes_highest_suffix() {
        let codes = vec![
            "T1-20261016-001".to_string(),
            "T1-20261016-007".to_string(),
            "T1-20261016-003".to_string(),
        ];
        assert_eq!(next_sequence("T1-20261016-", &codes), 8);
    }

    #[test]
    fn test_next_sequence_ignores_foreign_codes() {
        // T11 shares the T1 text prefix only up to the dash
        let codes = vec![
            "T11-20261016-009".to_string(),
            "T1-20261015-004".to_string(),
            "T1-20261016-abc".to_string(),
        ];
        assert_eq!(next_sequence("T1-20261016-", &codes), 1);
    }

    async fn db_with_table() -> (DatabaseConnection, i32) {
        use sea_orm::{ConnectOptions, Database};
        use sea_orm_migration::MigratorTrait;

        let mut options = ConnectOptions::new("sqlite::memory:");
        options.max_connections(1).sqlx_logging(false);
        let db = Database::connect(options).await.unwrap();
        migration::Migrator::up(&db, None).await.unwrap();

        let now = Utc::now();
        let table = dining_tables::ActiveModel {
            name: Set("Alloc".to_string()),
            status: Set(crate::models::status::TableStatus::Available),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(&db)
        .await
        .unwrap();
        (db, table.id)
    }

    #[tokio::test]
    async fn test_code_collision_exhausts_attempts() {
        let (db, table_id) = db_with_table().await;
        let txn = db.begin().await.unwrap();
        insert_bill_from(&txn, table_id, day(), 1, 1).await.unwrap();

        // 001 is taken and only one attempt is allowed
        let err = insert_bill_from(&txn, table_id, day(), 1, 1).await.unwrap_err();
        assert!(matches!(err, CoreError::AllocationFailed { attempts: 1 }));
        assert!(err.is_retryable());

        // The failed savepoint left the transaction usable
        let next = insert_bill_from(&txn, table_id, day(), 1, 2).await.unwrap();
        assert_eq!(next.bill_code, format_bill_code(table_id, day(), 2));
        txn.commit().await.unwrap();
    }
}
