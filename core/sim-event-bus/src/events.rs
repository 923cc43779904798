//! Event contract and event type definitions for the simulation

use serde::{Deserialize, Serialize};
use std::any::{Any, TypeId};
use std::fmt;
use uuid::Uuid;

/// Current wall-clock time in nanoseconds since the Unix epoch.
pub fn now_ns() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0)
}

/// The two timestamps every event record carries.
///
/// `occurred_at_ns` is event time (when the real-world fact happened, which in a
/// backtest is historical time), `created_at_ns` is when this record was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStamp {
    pub occurred_at_ns: i64,
    pub created_at_ns: i64,
}

impl EventStamp {
    /// Stamp an event that occurred at `occurred_at_ns`, created now.
    pub fn new(occurred_at_ns: i64) -> Self {
        Self {
            occurred_at_ns,
            created_at_ns: now_ns(),
        }
    }
}

/// Contract every record published on the bus must satisfy.
///
/// Events are immutable after construction and are shared between the publisher
/// and every subscribed mailbox as `Arc<dyn Event>` without copying. The bus
/// dispatches purely on the record's runtime type ([`TypeId`]); it is agnostic
/// to the field set beyond the two timestamps.
pub trait Event: Any + Send + Sync + fmt::Debug {
    /// Stable name of this event type, used for stats and log fields.
    fn event_type(&self) -> &'static str;

    /// Event time in nanoseconds (when the underlying fact happened).
    fn occurred_at_ns(&self) -> i64;

    /// Record creation time in nanoseconds.
    fn created_at_ns(&self) -> i64;
}

impl dyn Event {
    /// Whether this event is a value of type `E`.
    pub fn is<E: Event>(&self) -> bool {
        (self as &dyn Any).type_id() == TypeId::of::<E>()
    }

    /// Downcast to a concrete event type. Handlers subscribed to several event
    /// types use this to recover the record they were delivered.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        (self as &dyn Any).downcast_ref::<E>()
    }
}

macro_rules! impl_event {
    ($($ty:ty => $name:literal),+ $(,)?) => {$(
        impl $crate::events::Event for $ty {
            fn event_type(&self) -> &'static str {
                $name
            }

            fn occurred_at_ns(&self) -> i64 {
                self.stamp.occurred_at_ns
            }

            fn created_at_ns(&self) -> i64 {
                self.stamp.created_at_ns
            }
        }
    )+};
}

pub(crate) use impl_event;

// ============================================================================
// Market Data Events
// ============================================================================

/// Aggregated market data bar (prices are fixed-point integers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OhlcvEvent {
    pub stamp: EventStamp,
    pub symbol: String,
    pub timeframe: String,
    pub open: i64,
    pub high: i64,
    pub low: i64,
    pub close: i64,
    pub volume: Option<i64>,
}

// ============================================================================
// Broker Request Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

/// New order submitted to the (simulated) broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitOrderEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: TradeSide,
    pub quantity: f64,
    pub limit_price: Option<i64>,
    pub stop_price: Option<i64>,
}

/// Modification of a working order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModifyOrderEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub symbol: String,
    pub quantity: f64,
    pub limit_price: Option<i64>,
    pub stop_price: Option<i64>,
}

/// Cancellation of a working order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelOrderEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub symbol: String,
}

// ============================================================================
// Broker Response Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAcceptedEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub broker_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRejectedEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub broker_order_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderExpiredEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub broker_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationAcceptedEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub broker_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModificationRejectedEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub broker_order_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationAcceptedEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub broker_order_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancellationRejectedEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub broker_order_id: Option<String>,
    pub reason: String,
}

/// Execution report for a (partial) fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillEvent {
    pub stamp: EventStamp,
    pub internal_order_id: Uuid,
    pub broker_order_id: Option<String>,
    pub internal_fill_id: Uuid,
    pub broker_fill_id: Option<String>,
    pub side: TradeSide,
    pub filled_quantity: f64,
    pub fill_price: i64,
    pub commission: Option<i64>,
    pub exchange: String,
}

impl_event! {
    OhlcvEvent => "Ohlcv",
    SubmitOrderEvent => "SubmitOrder",
    ModifyOrderEvent => "ModifyOrder",
    CancelOrderEvent => "CancelOrder",
    OrderAcceptedEvent => "OrderAccepted",
    OrderRejectedEvent => "OrderRejected",
    OrderExpiredEvent => "OrderExpired",
    ModificationAcceptedEvent => "ModificationAccepted",
    ModificationRejectedEvent => "ModificationRejected",
    CancellationAcceptedEvent => "CancellationAccepted",
    CancellationRejectedEvent => "CancellationRejected",
    FillEvent => "Fill",
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_stamp_sets_creation_time() {
        let before = now_ns();
        let stamp = EventStamp::new(42);
        let after = now_ns();

        assert_eq!(stamp.occurred_at_ns, 42);
        assert!(stamp.created_at_ns >= before && stamp.created_at_ns <= after);
    }

    #[test]
    fn test_downcast_recovers_concrete_event() {
        let event = OhlcvEvent {
            stamp: EventStamp::new(1),
            symbol: "ES".to_string(),
            timeframe: "1m".to_string(),
            open: 6000,
            high: 6010,
            low: 5995,
            close: 6005,
            volume: Some(1250),
        };
        let dynamic: &dyn Event = &event;

        assert!(dynamic.is::<OhlcvEvent>());
        assert!(!dynamic.is::<FillEvent>());
        assert_eq!(dynamic.event_type(), "Ohlcv");

        let recovered = dynamic.downcast_ref::<OhlcvEvent>().unwrap();
        assert_eq!(recovered.close, 6005);
    }
}
