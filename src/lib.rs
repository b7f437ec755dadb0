// src/lib.rs

use std::sync::Arc;

use axum::{
    routing::{get, patch, post},
    Router,
};
use sea_orm::DatabaseConnection;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use services::{
    bill_consolidation::BillConsolidationService,
    checkout::CheckoutService,
    notifier::{AuditSink, BroadcastNotifier, EventDispatcher, NotificationSink, TracingAuditSink},
    order_intake::OrderIntakeService,
    order_state::OrderStateService,
};

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub orders: OrderStateService,
    pub bills: BillConsolidationService,
    pub checkout: CheckoutService,
    pub intake: OrderIntakeService,
    pub broadcaster: BroadcastNotifier,
    pub events: EventDispatcher,
}

impl AppState {
    /// Wire services with the broadcast notifier and the tracing audit sink
    pub fn new(db: DatabaseConnection, bill_code_max_attempts: u32, event_capacity: usize) -> Self {
        let broadcaster = BroadcastNotifier::new(event_capacity);
        let events = EventDispatcher::new(
            Arc::new(broadcaster.clone()),
            Arc::new(TracingAuditSink),
        );
        Self::from_parts(db, broadcaster, events, bill_code_max_attempts)
    }

    /// Same wiring with caller-provided sinks. Live WebSocket subscribers only
    /// see events if `notifier` forwards to `broadcaster`.
    pub fn with_sinks(
        db: DatabaseConnection,
        broadcaster: BroadcastNotifier,
        notifier: Arc<dyn NotificationSink>,
        audit: Arc<dyn AuditSink>,
        bill_code_max_attempts: u32,
    ) -> Self {
        let events = EventDispatcher::new(notifier, audit);
        Self::from_parts(db, broadcaster, events, bill_code_max_attempts)
    }

    fn from_parts(
        db: DatabaseConnection,
        broadcaster: BroadcastNotifier,
        events: EventDispatcher,
        bill_code_max_attempts: u32,
    ) -> Self {
        Self {
            orders: OrderStateService::new(db.clone(), events.clone()),
            bills: BillConsolidationService::new(db.clone(), events.clone())
                .with_max_code_attempts(bill_code_max_attempts),
            checkout: CheckoutService::new(db.clone(), events.clone()),
            intake: OrderIntakeService::new(db.clone(), events.clone()),
            db,
            broadcaster,
            events,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Orders
        .route("/api/orders", post(handlers::orders::place_order))
        .route("/api/orders/{order_id}", get(handlers::orders::get_order))
        .route(
            "/api/orders/{order_id}/status",
            patch(handlers::orders::update_order_status),
        )
        .route(
            "/api/orders/{order_id}/status-log",
            get(handlers::orders::get_order_status_log),
        )
        .route(
            "/api/order-items/{item_id}/status",
            patch(handlers::orders::update_item_status),
        )
        // Tables & bills
        .route(
            "/api/tables/{table}/open-orders",
            get(handlers::bills::list_open_orders),
        )
        .route("/api/bills/ensure-open", post(handlers::bills::ensure_open_bill))
        .route("/api/bills/{bill_id}", get(handlers::bills::get_bill))
        .route(
            "/api/bills/{bill_id}/confirm-checkout",
            post(handlers::bills::confirm_checkout),
        )
        .route("/api/bills/{bill_id}/mark-paid", post(handlers::bills::mark_paid))
        // Live events
        .route("/api/events/ws", get(handlers::events_ws::events_websocket))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

pub mod config;
pub mod error;

pub mod entities {
    pub mod prelude;
    pub mod bill_orders;
    pub mod bills;
    pub mod dining_tables;
    pub mod order_items;
    pub mod order_status_logs;
    pub mod orders;
    pub mod payments;
}

pub mod models {
    pub mod bill;
    pub mod event;
    pub mod order;
    pub mod status;
}

pub mod services {
    pub mod bill_consolidation;
    pub mod checkout;
    pub mod notifier;
    pub mod order_intake;
    pub mod order_state;
    pub mod table_resolver;
}

pub mod handlers {
    pub mod bills;
    pub mod events_ws;
    pub mod orders;
}
