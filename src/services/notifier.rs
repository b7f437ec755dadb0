//! Fire-and-forget delivery of domain events and audit records
//!
//! Services hand their events to [`EventDispatcher::emit`] after the
//! transaction commits. Delivery runs on a spawned task; sink failures are
//! logged and counted, never returned to the caller.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::models::event::{AuditRecord, DomainEvent};

#[derive(Debug, thiserror::Error)]
#[error("sink error: {0}")]
pub struct SinkError(pub String);

/// Push channel towards live subscribers (kitchen screens, waiter tablets)
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: DomainEvent) -> Result<(), SinkError>;
}

/// Activity-log collaborator
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), SinkError>;
}

/// Broadcast channel fan-out; the WebSocket handler subscribes to it
#[derive(Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<DomainEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[async_trait]
impl NotificationSink for BroadcastNotifier {
    async fn publish(&self, event: DomainEvent) -> Result<(), SinkError> {
        // No subscribers is not a failure
        if self.tx.send(event).is_err() {
            debug!("No live subscribers for domain event");
        }
        Ok(())
    }
}

/// Writes audit records as structured log lines on the `audit` target
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> Result<(), SinkError> {
        info!(
            target: "audit",
            actor = record.actor.as_deref().unwrap_or("system"),
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            action = %record.action,
            details = %record.details,
            "audit"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct EventDispatcher {
    notifier: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditSink>,
    failures: Arc<AtomicU64>,
}

impl EventDispatcher {
    pub fn new(notifier: Arc<dyn NotificationSink>, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            notifier,
            audit,
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver events then audit records, in order, on a background task
    pub fn emit(&self, events: Vec<DomainEvent>, audits: Vec<AuditRecord>) {
        if events.is_empty() && audits.is_empty() {
            return;
        }

        let notifier = Arc::clone(&self.notifier);
        let audit = Arc::clone(&self.audit);
        let failures = Arc::clone(&self.failures);

        tokio::spawn(async move {
            for event in events {
                if let Err(e) = notifier.publish(event).await {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, "Failed to publish domain event");
                }
            }
            for record in audits {
                let action = record.action.clone();
                if let Err(e) = audit.record(record).await {
                    failures.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %e, action = %action, "Failed to record audit entry");
                }
            }
        });
    }

    /// Sink failures swallowed since startup
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn publish(&self, _event: DomainEvent) -> Result<(), SinkError> {
            Err(SinkError("push gateway down".to_string()))
        }
    }

    #[async_trait]
    impl AuditSink for FailingSink {
        async fn record(&self, _record: AuditRecord) -> Result<(), SinkError> {
            Err(SinkError("activity log down".to_string()))
        }
    }

    fn sample_event() -> DomainEvent {
        DomainEvent::OrderUpdated {
            order_id: 1,
            table_id: 1,
            status: crate::models::status::OrderStatus::Served,
            total_amount: dec!(20),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let notifier = BroadcastNotifier::new(16);
        let mut rx = notifier.subscribe();
        let dispatcher = EventDispatcher::new(
            Arc::new(notifier.clone()),
            Arc::new(TracingAuditSink),
        );

        dispatcher.emit(vec![sample_event()], vec![]);

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event delivered in time")
            .unwrap();
        assert_eq!(received, sample_event());
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted_not_raised() {
        let dispatcher = EventDispatcher::new(Arc::new(FailingSink), Arc::new(FailingSink));

        dispatcher.emit(
            vec![sample_event()],
            vec![AuditRecord::new(None, "bill", 1, "bill.paid", serde_json::json!({}))],
        );

        for _ in 0..50 {
            if dispatcher.failure_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(dispatcher.failure_count(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let notifier = BroadcastNotifier::new(4);
        assert_eq!(notifier.subscriber_count(), 0);
        assert!(notifier.publish(sample_event()).await.is_ok());
    }
}
