//! # Sim Event Bus
//!
//! Typed in-process publish/subscribe bus wiring together the autonomous
//! components of an event-driven simulation (market-data handlers, strategy
//! logic, execution simulators). Components never call each other: each one is
//! a [`Subscriber`] with its own mailbox and dedicated thread, reacting to
//! immutable event records fanned out by the [`EventBus`].
//!
//! ## Features
//!
//! - **Typed dispatch**: subscriptions are keyed by the event's runtime type
//! - **Thread-per-subscriber**: unbounded FIFO mailbox drained by a dedicated thread
//! - **Non-blocking publish**: fan-out enqueues and returns, never waits on handlers
//! - **Quiescence barrier**: `wait_until_idle` blocks a driving thread until the
//!   whole system has finished reacting, including events subscribers publish to
//!   each other while draining
//! - **Fault containment**: a failing or panicking handler never kills its worker
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use sim_event_bus::{Event, EventBus, EventStamp, OhlcvEvent, Subscriber};
//!
//! let bus = EventBus::new();
//! let seen = Arc::new(AtomicUsize::new(0));
//!
//! let counter = Arc::clone(&seen);
//! let worker = Subscriber::spawn(&bus, "bar-counter", move |event: &dyn Event| -> anyhow::Result<()> {
//!     let bar = event.downcast_ref::<OhlcvEvent>().expect("subscribed to bars only");
//!     counter.fetch_add(1, Ordering::SeqCst);
//!     println!("{} closed at {}", bar.symbol, bar.close);
//!     Ok(())
//! });
//! bus.subscribe::<OhlcvEvent>(&worker);
//!
//! bus.publish(OhlcvEvent {
//!     stamp: EventStamp::new(1_700_000_000_000_000_000),
//!     symbol: "ES".to_string(),
//!     timeframe: "1m".to_string(),
//!     open: 6000,
//!     high: 6010,
//!     low: 5995,
//!     close: 6005,
//!     volume: Some(1250),
//! });
//!
//! // Returns only once every worker has finished reacting, including any
//! // events workers published to each other along the way.
//! bus.wait_until_idle();
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//!
//! worker.shutdown();
//! ```

pub mod bus;
pub mod events;
pub mod subscriber;

// Re-exports
pub use bus::{EventBus, EventStats};
pub use events::{
    now_ns, CancelOrderEvent, CancellationAcceptedEvent, CancellationRejectedEvent, Event,
    EventStamp, FillEvent, ModificationAcceptedEvent, ModificationRejectedEvent, ModifyOrderEvent,
    OhlcvEvent, OrderAcceptedEvent, OrderExpiredEvent, OrderRejectedEvent, OrderType,
    SubmitOrderEvent, TradeSide,
};
pub use subscriber::{EventHandler, HandlerError, Subscriber, SubscriberId};
