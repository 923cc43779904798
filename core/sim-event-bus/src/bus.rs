//! Core event bus: subscription registry, fan-out publish, quiescence barrier

use crate::events::Event;
use crate::subscriber::{Subscriber, SubscriberId, SubscriberInner};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// Per-event-type publish counters.
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// Publish calls for this event type.
    pub published: u64,
    /// Successful mailbox enqueues across all subscribed workers.
    pub delivered: u64,
    /// Deliveries discarded because the target worker had stopped.
    pub dropped: u64,
}

/// Event type -> workers registered for it, keyed by worker id so subscribing
/// twice is a plain overwrite. The bus holds only weak references; workers own
/// their own lifetime.
type Registry = HashMap<TypeId, HashMap<SubscriberId, Weak<SubscriberInner>>>;

struct BusInner {
    registry: Mutex<Registry>,
    stats: DashMap<&'static str, EventStats>,
}

/// In-process typed publish/subscribe bus.
///
/// Explicitly constructed and injected into each worker, never a process-wide
/// singleton, so independent buses can coexist in one process and in tests.
/// Cheap to clone; all clones share the same registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(HashMap::new()),
                stats: DashMap::new(),
            }),
        }
    }

    /// Register `subscriber` for events of type `E`. Idempotent.
    pub fn subscribe<E: Event>(&self, subscriber: &Subscriber) {
        let mut registry = self.inner.registry.lock();
        registry
            .entry(TypeId::of::<E>())
            .or_default()
            .insert(subscriber.id(), subscriber.downgrade());
        debug!(
            subscriber = subscriber.name(),
            event_type = std::any::type_name::<E>(),
            "subscription added"
        );
    }

    /// Remove `subscriber` from every event type's set. Idempotent; called
    /// from the worker's shutdown so a stopped worker is never dispatched to.
    pub fn unsubscribe(&self, subscriber: &Subscriber) {
        let mut registry = self.inner.registry.lock();
        for workers in registry.values_mut() {
            workers.remove(&subscriber.id());
        }
        debug!(subscriber = subscriber.name(), "subscriptions removed");
    }

    /// Fan `event` out to every worker currently registered for its type.
    ///
    /// The subscriber snapshot is copied under the registry lock and delivery
    /// happens outside it: enqueueing may wake a handler that itself publishes,
    /// which needs the lock again. Delivery is fire-and-forget; this never
    /// blocks on handler execution.
    pub fn publish<E: Event>(&self, event: E) {
        let event: Arc<dyn Event> = Arc::new(event);
        let event_type = event.event_type();
        let targets = self.targets_for(TypeId::of::<E>());

        let mut delivered = 0;
        let mut dropped = 0;
        for worker in &targets {
            if worker.receive(Arc::clone(&event)) {
                delivered += 1;
            } else {
                dropped += 1;
            }
        }
        if targets.is_empty() {
            trace!(event_type, "published event has no subscribers");
        }

        let mut stats = self.inner.stats.entry(event_type).or_default();
        stats.published += 1;
        stats.delivered += delivered;
        stats.dropped += dropped;
    }

    /// Block until no worker registered on this bus has a queued or in-flight
    /// event. Meant for the driving thread between external inputs; must not
    /// be called from inside a handler.
    ///
    /// Draining one worker can publish into the mailbox of a worker that was
    /// already checked, so a single pass is unsound. Each pass drains every
    /// worker and then re-snapshots to verify; only a pass that finds the
    /// whole set idle terminates the loop. The registry lock is never held
    /// while blocking, otherwise a handler stuck publishing (which needs the
    /// lock) could never finish and the wait would deadlock.
    pub fn wait_until_idle(&self) {
        loop {
            let workers = self.all_workers();
            for worker in &workers {
                worker.wait_until_idle();
            }

            let workers = self.all_workers();
            if workers.iter().all(|worker| worker.is_idle()) {
                break;
            }
        }
    }

    /// Publish counters per event type, in no particular order.
    pub fn stats(&self) -> Vec<(&'static str, EventStats)> {
        self.inner
            .stats
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Snapshot of live workers registered for `type_id`, pruning any whose
    /// worker has been dropped.
    fn targets_for(&self, type_id: TypeId) -> Vec<Arc<SubscriberInner>> {
        let mut registry = self.inner.registry.lock();
        let Some(workers) = registry.get_mut(&type_id) else {
            return Vec::new();
        };
        let mut targets = Vec::with_capacity(workers.len());
        workers.retain(|_, weak| match weak.upgrade() {
            Some(worker) => {
                targets.push(worker);
                true
            }
            None => false,
        });
        targets
    }

    /// Snapshot of the union of all registered workers, deduplicated across
    /// event types.
    fn all_workers(&self) -> Vec<Arc<SubscriberInner>> {
        let mut registry = self.inner.registry.lock();
        let mut seen: HashMap<SubscriberId, Arc<SubscriberInner>> = HashMap::new();
        for workers in registry.values_mut() {
            workers.retain(|id, weak| match weak.upgrade() {
                Some(worker) => {
                    seen.entry(*id).or_insert(worker);
                    true
                }
                None => false,
            });
        }
        seen.into_values().collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{impl_event, EventStamp};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Debug)]
    struct TickEvent {
        stamp: EventStamp,
        price: i64,
    }

    #[derive(Debug)]
    struct SignalEvent {
        stamp: EventStamp,
        strength: i64,
    }

    impl_event! {
        TickEvent => "Tick",
        SignalEvent => "Signal",
    }

    fn tick(occurred_at_ns: i64, price: i64) -> TickEvent {
        TickEvent {
            stamp: EventStamp::new(occurred_at_ns),
            price,
        }
    }

    fn recording_worker(bus: &EventBus, name: &str) -> (Subscriber, Arc<Mutex<Vec<i64>>>) {
        let prices = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&prices);
        let worker = Subscriber::spawn(bus, name, move |event: &dyn Event| -> anyhow::Result<()> {
            let tick = event.downcast_ref::<TickEvent>().unwrap();
            sink.lock().push(tick.price);
            Ok(())
        });
        (worker, prices)
    }

    #[test]
    fn test_subscriber_receives_exact_record() {
        let bus = EventBus::new();
        let records = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&records);
        let worker = Subscriber::spawn(&bus, "ticks", move |event: &dyn Event| -> anyhow::Result<()> {
            let tick = event.downcast_ref::<TickEvent>().expect("unexpected event type");
            sink.lock()
                .push((tick.stamp.occurred_at_ns, tick.stamp.created_at_ns, tick.price));
            Ok(())
        });
        bus.subscribe::<TickEvent>(&worker);

        bus.publish(TickEvent {
            stamp: EventStamp {
                occurred_at_ns: 1,
                created_at_ns: 2,
            },
            price: 600_025,
        });
        bus.wait_until_idle();

        assert_eq!(*records.lock(), vec![(1, 2, 600_025)]);
        worker.shutdown();
    }

    #[test]
    fn test_events_arrive_in_publish_order() {
        let bus = EventBus::new();
        let (worker, prices) = recording_worker(&bus, "ordered");
        bus.subscribe::<TickEvent>(&worker);

        for price in 0..500 {
            bus.publish(tick(price, price));
        }
        bus.wait_until_idle();

        let expected: Vec<i64> = (0..500).collect();
        assert_eq!(*prices.lock(), expected);
        worker.shutdown();
    }

    #[test]
    fn test_idempotent_subscribe_delivers_once() {
        let bus = EventBus::new();
        let (worker, prices) = recording_worker(&bus, "deduped");
        bus.subscribe::<TickEvent>(&worker);
        bus.subscribe::<TickEvent>(&worker);

        bus.publish(tick(1, 42));
        bus.wait_until_idle();

        assert_eq!(*prices.lock(), vec![42]);
        worker.shutdown();
    }

    #[test]
    fn test_fan_out_reaches_every_subscriber() {
        let bus = EventBus::new();
        let (first, first_prices) = recording_worker(&bus, "first");
        let (second, second_prices) = recording_worker(&bus, "second");
        bus.subscribe::<TickEvent>(&first);
        bus.subscribe::<TickEvent>(&second);

        bus.publish(tick(1, 7));
        bus.wait_until_idle();

        assert_eq!(*first_prices.lock(), vec![7]);
        assert_eq!(*second_prices.lock(), vec![7]);
        first.shutdown();
        second.shutdown();
    }

    #[test]
    fn test_no_delivery_after_shutdown() {
        let bus = EventBus::new();
        let (worker, prices) = recording_worker(&bus, "gone");
        bus.subscribe::<TickEvent>(&worker);

        bus.publish(tick(1, 1));
        bus.wait_until_idle();
        worker.shutdown();

        bus.publish(tick(2, 2));
        bus.wait_until_idle();

        assert_eq!(*prices.lock(), vec![1]);
    }

    #[test]
    fn test_chained_publication_blocks_wait_until_idle() {
        let bus = EventBus::new();
        let signals_seen = Arc::new(AtomicUsize::new(0));

        // Strategy worker: reacts to a tick by thinking for a while and then
        // publishing a signal, which lands after the driver has started
        // waiting. A single drain pass would miss it.
        let strategy_bus = bus.clone();
        let strategy = Subscriber::spawn(&bus, "strategy", move |event: &dyn Event| -> anyhow::Result<()> {
            let tick = event.downcast_ref::<TickEvent>().unwrap();
            thread::sleep(Duration::from_millis(25));
            strategy_bus.publish(SignalEvent {
                stamp: EventStamp::new(tick.stamp.occurred_at_ns),
                strength: tick.price,
            });
            Ok(())
        });

        let router_seen = Arc::clone(&signals_seen);
        let router = Subscriber::spawn(&bus, "router", move |event: &dyn Event| -> anyhow::Result<()> {
            assert!(event.is::<SignalEvent>());
            thread::sleep(Duration::from_millis(10));
            router_seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.subscribe::<TickEvent>(&strategy);
        bus.subscribe::<SignalEvent>(&router);

        bus.publish(tick(1, 100));
        bus.wait_until_idle();

        // The wait may only return once the derived signal has been handled.
        assert_eq!(signals_seen.load(Ordering::SeqCst), 1);
        assert!(strategy.is_idle());
        assert!(router.is_idle());
        strategy.shutdown();
        router.shutdown();
    }

    #[test]
    fn test_wait_until_idle_with_no_subscribers_returns() {
        let bus = EventBus::new();
        bus.publish(tick(1, 1));
        bus.wait_until_idle();
    }

    #[test]
    fn test_buses_are_independent() {
        let left = EventBus::new();
        let right = EventBus::new();
        let (worker, prices) = recording_worker(&left, "left-only");
        left.subscribe::<TickEvent>(&worker);

        right.publish(tick(1, 9));
        right.wait_until_idle();
        left.wait_until_idle();

        assert!(prices.lock().is_empty());
        worker.shutdown();
    }

    #[test]
    fn test_stats_track_publishes_and_deliveries() {
        let bus = EventBus::new();
        let (worker, _prices) = recording_worker(&bus, "counted");
        bus.subscribe::<TickEvent>(&worker);

        bus.publish(tick(1, 1));
        bus.publish(tick(2, 2));
        bus.publish(SignalEvent {
            stamp: EventStamp::new(3),
            strength: 0,
        });
        bus.wait_until_idle();

        let stats = bus.stats();
        let ticks = &stats.iter().find(|(name, _)| *name == "Tick").unwrap().1;
        assert_eq!(ticks.published, 2);
        assert_eq!(ticks.delivered, 2);
        assert_eq!(ticks.dropped, 0);

        let signals = &stats.iter().find(|(name, _)| *name == "Signal").unwrap().1;
        assert_eq!(signals.published, 1);
        assert_eq!(signals.delivered, 0);
        worker.shutdown();
    }

    #[test]
    fn test_concurrent_publishers_lose_no_events() {
        let bus = EventBus::new();
        let (worker, prices) = recording_worker(&bus, "busy");
        bus.subscribe::<TickEvent>(&worker);

        let mut publishers = Vec::new();
        for lane in 0..4 {
            let bus = bus.clone();
            publishers.push(thread::spawn(move || {
                for step in 0..250 {
                    bus.publish(tick(step, lane * 1000 + step));
                }
            }));
        }
        for publisher in publishers {
            publisher.join().unwrap();
        }
        bus.wait_until_idle();

        let mut prices = prices.lock().clone();
        prices.sort_unstable();
        let mut expected: Vec<i64> = (0..4).flat_map(|lane| (0..250).map(move |step| lane * 1000 + step)).collect();
        expected.sort_unstable();
        assert_eq!(prices, expected);
        worker.shutdown();
    }
}
