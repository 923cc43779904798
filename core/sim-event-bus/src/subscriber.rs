//! Mailbox worker: one unbounded FIFO queue and one dedicated thread per subscriber

use crate::bus::EventBus;
use crate::events::Event;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, error};

/// Unique identifier for a mailbox worker within the process.
pub type SubscriberId = u64;

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

fn next_subscriber_id() -> SubscriberId {
    NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed)
}

/// What went wrong while a handler processed an event.
///
/// Routed to [`EventHandler::on_error`]; never propagated to the publisher and
/// never fatal to the worker thread.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("event handler failed: {0}")]
    Failed(anyhow::Error),
    #[error("event handler panicked: {0}")]
    Panicked(String),
}

/// Reaction logic a mailbox worker runs for each delivered event.
///
/// `on_event` executes on the worker's dedicated thread, one event at a time,
/// in mailbox FIFO order. It may publish further events through a bus handle it
/// owns; it must not call any blocking wait on its own worker.
pub trait EventHandler {
    fn on_event(&mut self, event: &dyn Event) -> anyhow::Result<()>;

    /// Hook for errors (and caught panics) raised by `on_event`. The default
    /// logs and moves on; the worker keeps draining either way.
    fn on_error(&mut self, error: HandlerError) {
        debug!(error = %error, "unhandled event handler error");
    }
}

impl<F> EventHandler for F
where
    F: FnMut(&dyn Event) -> anyhow::Result<()>,
{
    fn on_event(&mut self, event: &dyn Event) -> anyhow::Result<()> {
        self(event)
    }
}

/// Mailbox element: either a delivery or the stop marker that ends the loop.
enum Envelope {
    Deliver(Arc<dyn Event>),
    Stop,
}

/// Count of enqueued-but-unfinished mailbox items, with a condvar for waiters.
///
/// An item stays unfinished while queued and while its handler runs, so a
/// zero count means the mailbox is drained and nothing is in flight.
struct IdleTracker {
    pending: Mutex<usize>,
    drained: Condvar,
}

impl IdleTracker {
    fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    fn enqueued(&self) {
        *self.pending.lock() += 1;
    }

    fn mark_done(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.drained.notify_all();
        }
    }

    fn is_idle(&self) -> bool {
        *self.pending.lock() == 0
    }

    fn wait_until_idle(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.drained.wait(&mut pending);
        }
    }
}

pub(crate) struct SubscriberInner {
    id: SubscriberId,
    name: String,
    tx: flume::Sender<Envelope>,
    running: AtomicBool,
    tracker: Arc<IdleTracker>,
    bus: EventBus,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriberInner {
    /// Enqueue an event for this worker. Returns false if the worker has
    /// stopped and the event was discarded. Never blocks.
    pub(crate) fn receive(&self, event: Arc<dyn Event>) -> bool {
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        // Count before sending so the consumer cannot finish the item first
        // and drive the count below zero.
        self.tracker.enqueued();
        if self.tx.send(Envelope::Deliver(event)).is_err() {
            // Event loop already exited; roll the count back.
            self.tracker.mark_done();
            return false;
        }
        true
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.tracker.is_idle()
    }

    /// Block until the mailbox is drained and no handler is in flight. A
    /// stopped worker is idle by definition, and an item enqueued just before
    /// shutdown may never be processed, so return immediately in that case.
    pub(crate) fn wait_until_idle(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        self.tracker.wait_until_idle();
    }
}

/// Autonomous worker owning one mailbox and one dedicated thread.
///
/// Cheap to clone; all clones refer to the same worker. The thread starts in
/// the constructor, so the worker accepts events from the first instant; it
/// runs until [`shutdown`](Subscriber::shutdown) or until every handle
/// (including the bus's registry references) is gone.
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    /// Start a worker on `bus` with a dedicated thread named `name`.
    ///
    /// The worker is not subscribed to anything yet; register interest with
    /// [`EventBus::subscribe`].
    pub fn spawn<H>(bus: &EventBus, name: impl Into<String>, handler: H) -> Self
    where
        H: EventHandler + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = flume::unbounded();
        let tracker = Arc::new(IdleTracker::new());

        let loop_tracker = Arc::clone(&tracker);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || event_loop(rx, loop_tracker, handler))
            .expect("failed to spawn subscriber thread");

        let inner = Arc::new(SubscriberInner {
            id: next_subscriber_id(),
            name,
            tx,
            running: AtomicBool::new(true),
            tracker,
            bus: bus.clone(),
            thread: Mutex::new(Some(handle)),
        });
        debug!(subscriber = %inner.name, id = inner.id, "subscriber started");
        Self { inner }
    }

    pub fn id(&self) -> SubscriberId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Non-blocking idle check: no queued and no in-flight event.
    pub fn is_idle(&self) -> bool {
        self.inner.is_idle()
    }

    /// Block until this worker has no queued and no in-flight event. Returns
    /// immediately once the worker is stopped.
    pub fn wait_until_idle(&self) {
        self.inner.wait_until_idle()
    }

    /// Stop the worker: unsubscribe it from the bus, refuse further events,
    /// enqueue the stop marker, and join the thread. Idempotent. Safe to call
    /// from within the worker's own handler, in which case the join is skipped
    /// and the thread exits on its own after the stop marker.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.running.load(Ordering::Acquire) {
            return;
        }
        // Unsubscribe first so the bus never dispatches to a stopped worker,
        // then flip the flag so `receive` rejects stragglers before the stop
        // marker is consumed.
        inner.bus.unsubscribe(self);
        inner.running.store(false, Ordering::Release);

        inner.tracker.enqueued();
        if inner.tx.send(Envelope::Stop).is_err() {
            inner.tracker.mark_done();
        }

        let handle = inner.thread.lock().take();
        if let Some(handle) = handle {
            // A thread cannot join itself.
            if handle.thread().id() != thread::current().id() {
                if handle.join().is_err() {
                    error!(subscriber = %inner.name, "subscriber thread terminated abnormally");
                }
            }
        }
        debug!(subscriber = %inner.name, id = inner.id, "subscriber stopped");
    }

    pub(crate) fn inner(&self) -> &Arc<SubscriberInner> {
        &self.inner
    }

    pub(crate) fn downgrade(&self) -> Weak<SubscriberInner> {
        Arc::downgrade(&self.inner)
    }
}

fn event_loop<H>(rx: flume::Receiver<Envelope>, tracker: Arc<IdleTracker>, mut handler: H)
where
    H: EventHandler,
{
    // recv errors once every sender is gone, which only happens when the
    // worker's handles (and the bus's weak references) have all been dropped.
    while let Ok(envelope) = rx.recv() {
        match envelope {
            Envelope::Stop => {
                tracker.mark_done();
                // Anything that raced in behind the stop marker will never be
                // processed; account for it so the unfinished count still
                // reaches zero and idle waiters are released.
                for _discarded in rx.try_iter() {
                    tracker.mark_done();
                }
                break;
            }
            Envelope::Deliver(event) => {
                dispatch(&mut handler, &event);
                // The item stays unfinished through handler execution, so this
                // runs after dispatch no matter how the handler fared.
                tracker.mark_done();
            }
        }
    }
}

fn dispatch<H: EventHandler>(handler: &mut H, event: &Arc<dyn Event>) {
    let error = match panic::catch_unwind(AssertUnwindSafe(|| handler.on_event(event.as_ref()))) {
        Ok(Ok(())) => return,
        Ok(Err(err)) => HandlerError::Failed(err),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(
                event_type = event.event_type(),
                panic = %message,
                "event handler panicked"
            );
            HandlerError::Panicked(message)
        }
    };
    // Contain the hook as well so an override cannot kill the worker thread
    // or skip the unfinished-count decrement.
    if panic::catch_unwind(AssertUnwindSafe(|| handler.on_error(error))).is_err() {
        error!("on_error hook panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
