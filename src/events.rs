//! In-process domain event bus.
//!
//! Subscribers are invoked sequentially in publish order, a failing handler
//! is logged and does not stop its siblings, and there is no persistence or
//! redelivery — at-most-once, best-effort.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::models::{Position, Signal, Trade};

/// Domain events published by the pipeline. New variants are additive;
/// existing ones keep their shape once another module depends on them.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    SignalEmitted(Signal),
    SignalExpired { signal_id: i64 },
    TradeExecuted(Trade),
    TradeFailed { trade_id: i64, reason: String },
    TradeNeedsReconciliation { trade_id: i64 },
    PositionOpened(Position),
    PositionClosed(Position),
    CircuitOpened { exchange: String },
    CircuitClosed { exchange: String },
    WhaleSharingDisabled { whale_id: i64 },
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &DomainEvent);
}

impl<F> EventHandler for F
where
    F: Fn(&DomainEvent) + Send + Sync,
{
    fn handle(&self, event: &DomainEvent) {
        self(event)
    }
}

/// Key used to group subscribers by the *kind* of event, mirroring the
/// Python bus keying subscribers by `Type[DomainEvent]` even though Rust's
/// `DomainEvent` is a single enum rather than a class hierarchy.
fn event_kind(event: &DomainEvent) -> &'static str {
    match event {
        DomainEvent::SignalEmitted(_) => "signal_emitted",
        DomainEvent::SignalExpired { .. } => "signal_expired",
        DomainEvent::TradeExecuted(_) => "trade_executed",
        DomainEvent::TradeFailed { .. } => "trade_failed",
        DomainEvent::TradeNeedsReconciliation { .. } => "trade_needs_reconciliation",
        DomainEvent::PositionOpened(_) => "position_opened",
        DomainEvent::PositionClosed(_) => "position_closed",
        DomainEvent::CircuitOpened { .. } => "circuit_opened",
        DomainEvent::CircuitClosed { .. } => "circuit_closed",
        DomainEvent::WhaleSharingDisabled { .. } => "whale_sharing_disabled",
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<&'static str, Vec<Arc<dyn EventHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, kind: &'static str, handler: Arc<dyn EventHandler>) {
        self.subscribers
            .write()
            .entry(kind)
            .or_insert_with(Vec::new)
            .push(handler);
    }

    pub fn clear_subscribers(&self) {
        self.subscribers.write().clear();
    }

    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.subscribers
            .read()
            .get(kind)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Publish a single event. Each handler's failure is isolated: a
    /// panic-free handler error only ever logs, it never aborts delivery
    /// to the remaining subscribers.
    pub fn publish(&self, event: DomainEvent) {
        let kind = event_kind(&event);
        let handlers = self.subscribers.read().get(kind).cloned();
        let Some(handlers) = handlers else { return };
        for handler in handlers {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler.handle(&event);
            }));
            if result.is_err() {
                warn!(event_kind = kind, "event handler panicked, continuing");
            }
        }
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = DomainEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn delivers_to_all_subscribers_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b"] {
            let seen = seen.clone();
            bus.subscribe(
                "signal_expired",
                Arc::new(move |_: &DomainEvent| seen.lock().push(tag)),
            );
        }

        bus.publish(DomainEvent::SignalExpired { signal_id: 1 });
        assert_eq!(*seen.lock(), vec!["a", "b"]);
    }

    #[test]
    fn a_failing_handler_does_not_block_siblings() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe("signal_expired", Arc::new(|_: &DomainEvent| panic!("boom")));
        let seen2 = seen.clone();
        bus.subscribe(
            "signal_expired",
            Arc::new(move |_: &DomainEvent| seen2.lock().push("after")),
        );

        bus.publish(DomainEvent::SignalExpired { signal_id: 1 });
        assert_eq!(*seen.lock(), vec!["after"]);
    }

    #[test]
    fn unsubscribed_event_kind_is_a_noop() {
        let bus = EventBus::new();
        bus.publish(DomainEvent::CircuitClosed {
            exchange: "BINANCE".into(),
        });
    }
}
