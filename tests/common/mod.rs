#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use dinein_backend::entities::{bill_orders, bills, dining_tables, order_items, orders};
use dinein_backend::models::event::{AuditRecord, DomainEvent};
use dinein_backend::models::order::OrderWithItems;
use dinein_backend::models::status::{BillStatus, ItemStatus, ItemStatusCounts, TableStatus};
use dinein_backend::services::notifier::{AuditSink, BroadcastNotifier, NotificationSink, SinkError};
use dinein_backend::AppState;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, DatabaseConnection, DbErr, Set};
use sea_orm_migration::MigratorTrait;
use std::env;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

static TABLE_SEQ: AtomicU32 = AtomicU32::new(0);

/// Set up test database connection
/// Uses TEST_DATABASE_URL or an in-memory SQLite database with migrations applied
pub async fn setup_test_db() -> Result<DatabaseConnection, DbErr> {
    let database_url = env::var("TEST_DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string());

    let mut options = ConnectOptions::new(database_url.clone());
    if database_url.starts_with("sqlite") {
        // Every in-memory connection is its own database
        options.max_connections(1).min_connections(1);
    } else {
        options.max_connections(5);
    }
    options.sqlx_logging(false);

    let db = Database::connect(options).await?;
    migration::Migrator::up(&db, None).await?;
    Ok(db)
}

/// Captures everything the services emit
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub events: Arc<Mutex<Vec<DomainEvent>>>,
    pub audits: Arc<Mutex<Vec<AuditRecord>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn audit_actions(&self) -> Vec<String> {
        self.audits
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.action.clone())
            .collect()
    }

    /// Delivery is asynchronous; poll until `n` audit records arrived
    pub async fn wait_for_audits(&self, n: usize) -> Vec<String> {
        for _ in 0..100 {
            if self.audits.lock().unwrap().len() >= n {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.audit_actions()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, event: DomainEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

#[async_trait]
impl AuditSink for RecordingSink {
    async fn record(&self, record: AuditRecord) -> Result<(), SinkError> {
        self.audits.lock().unwrap().push(record);
        Ok(())
    }
}

pub async fn test_state() -> (AppState, RecordingSink) {
    let db = setup_test_db().await.expect("Failed to set up test DB");
    let sink = RecordingSink::default();
    let state = AppState::with_sinks(
        db,
        BroadcastNotifier::new(16),
        Arc::new(sink.clone()),
        Arc::new(sink.clone()),
        10,
    );
    (state, sink)
}

/// Insert a dining table with a name unique across test runs
pub async fn seed_table(db: &DatabaseConnection, prefix: &str) -> dining_tables::Model {
    let now = Utc::now();
    let name = format!(
        "{}-{}-{}",
        prefix,
        now.timestamp_micros(),
        TABLE_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    dining_tables::ActiveModel {
        name: Set(name),
        status: Set(TableStatus::Available),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to seed table")
}

/// (food_id, quantity, unit_price, status)
pub type ItemSeed = (i32, i32, Decimal, ItemStatus);

/// Insert an order whose total and status already agree with its items
pub async fn seed_order(
    db: &DatabaseConnection,
    table_id: i32,
    items: &[ItemSeed],
) -> OrderWithItems {
    let now = Utc::now();
    let total: Decimal = items
        .iter()
        .filter(|(_, _, _, status)| *status != ItemStatus::Cancelled)
        .map(|(_, qty, price, _)| *price * Decimal::from(*qty))
        .sum();
    let status = ItemStatusCounts::tally(items.iter().map(|i| i.3)).derive_order_status();

    let order = orders::ActiveModel {
        table_id: Set(table_id),
        status: Set(status),
        total_amount: Set(total.round_dp(2)),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to seed order");

    let mut rows = Vec::with_capacity(items.len());
    for (food_id, quantity, unit_price, status) in items {
        let row = order_items::ActiveModel {
            order_id: Set(order.id),
            food_id: Set(*food_id),
            quantity: Set(*quantity),
            unit_price: Set(*unit_price),
            subtotal: Set((*unit_price * Decimal::from(*quantity)).round_dp(2)),
            status: Set(*status),
            cancelled_at: Set((*status == ItemStatus::Cancelled).then_some(now)),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await
        .expect("Failed to seed order item");
        rows.push(row);
    }

    OrderWithItems { order, items: rows }
}

/// Insert an open bill with `code`, linked to `order_ids`, totals left at zero
pub async fn seed_open_bill(
    db: &DatabaseConnection,
    table_id: i32,
    code: &str,
    order_ids: &[i32],
) -> bills::Model {
    let now = Utc::now();
    let bill = bills::ActiveModel {
        table_id: Set(table_id),
        bill_code: Set(code.to_string()),
        status: Set(BillStatus::Open),
        subtotal: Set(Decimal::ZERO),
        discount: Set(Decimal::ZERO),
        total_amount: Set(Decimal::ZERO),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("Failed to seed bill");

    for order_id in order_ids {
        bill_orders::ActiveModel {
            bill_id: Set(bill.id),
            order_id: Set(*order_id),
            created_at: Set(now),
            ..Default::default()
        }
        .insert(db)
        .await
        .expect("Failed to seed bill link");
    }
    bill
}
