//! The priority event queue: multiple producers, exactly one consumer.
//!
//! Events live in FIFO buckets keyed by priority; extraction always takes the
//! front of the lowest non-empty bucket. Producers hold the mutex only to
//! insert; the consumer holds it only to extract, and otherwise blocks on a
//! condition variable with a bounded timeout so signal observation makes
//! progress even on an idle queue.

use crate::events::QuitEvent;
use ichor_types::{
    AnyEvent, DEFAULT_EVENT_PRIORITY, EventEnvelope, EventId, INTERNAL_EVENT_PRIORITY, Priority,
    ServiceId,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Condvar wait bound; keeps the consumer responsive to the sigint flag.
const WAKEUP_TIMEOUT: Duration = Duration::from_millis(500);
/// Busy-poll window in spinlock mode before falling back to the condvar.
const SPIN_WINDOW: Duration = Duration::from_millis(10);
/// How long a quit event may sit undrained before the loop hard-quits.
pub(crate) const DRAIN_DEADLINE: Duration = Duration::from_secs(5);
/// A second SIGINT inside this window forces the process down.
const HARD_EXIT_WINDOW: Duration = Duration::from_secs(5);

static SIGINT_QUIT: AtomicBool = AtomicBool::new(false);
static SIGNAL_HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);
static FIRST_SIGINT_AT: Mutex<Option<Instant>> = Mutex::new(None);

/// Request a process-wide graceful shutdown, exactly as a single SIGINT would.
/// Every queue observes the flag on its next wakeup and injects one quit event.
pub fn request_shutdown() {
    SIGINT_QUIT.store(true, Ordering::Release);
}

fn shutdown_requested() -> bool {
    SIGINT_QUIT.load(Ordering::Acquire)
}

#[cfg(test)]
pub(crate) fn reset_shutdown_for_tests() {
    SIGINT_QUIT.store(false, Ordering::Release);
}

fn on_sigint() {
    if let Ok(mut first) = FIRST_SIGINT_AT.lock() {
        if let Some(at) = *first {
            if at.elapsed() <= HARD_EXIT_WINDOW {
                // Second SIGINT inside the window: the user means it.
                std::process::exit(130);
            }
        }
        *first = Some(Instant::now());
    }
    SIGINT_QUIT.store(true, Ordering::Release);
    tracing::debug!("sigint observed; graceful shutdown requested");
}

/// Install the process-wide SIGINT handler once. Subsequent calls are no-ops.
pub fn capture_sigint() {
    if SIGNAL_HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Err(error) = ctrlc::set_handler(on_sigint) {
        tracing::error!(%error, "could not install SIGINT handler");
    }
}

struct QueueInner {
    buckets: BTreeMap<Priority, VecDeque<EventEnvelope>>,
    len: usize,
    /// Set when the sigint-driven quit event was injected; arms the 5 s
    /// hard-quit window.
    quit_event_sent_at: Option<Instant>,
}

/// Priority-ordered multi-producer / single-consumer event queue.
pub struct EventQueue {
    inner: Mutex<QueueInner>,
    wakeup: Condvar,
    next_event_id: AtomicU64,
    quit: AtomicBool,
    /// True while the consumer is processing a popped event; used together
    /// with emptiness to decide the queue is idle.
    in_flight: AtomicBool,
    spin_before_sleep: bool,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_spinlock(false)
    }

    /// Spinlock mode busy-polls briefly before sleeping, trading CPU for
    /// sub-millisecond pop latency under load.
    pub fn with_spinlock(spin_before_sleep: bool) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                buckets: BTreeMap::new(),
                len: 0,
                quit_event_sent_at: None,
            }),
            wakeup: Condvar::new(),
            next_event_id: AtomicU64::new(1),
            quit: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            spin_before_sleep,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push at the default priority. Returns the queue-assigned event id.
    pub fn push_event<E: AnyEvent>(&self, originating: ServiceId, payload: E) -> EventId {
        self.push_prioritized_event(originating, DEFAULT_EVENT_PRIORITY, payload)
    }

    pub fn push_prioritized_event<E: AnyEvent>(
        &self,
        originating: ServiceId,
        priority: Priority,
        payload: E,
    ) -> EventId {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        let envelope = EventEnvelope::new(id, originating, priority, Box::new(payload));
        {
            let mut inner = self.lock_inner();
            Self::insert(&mut inner, envelope);
        }
        self.wakeup.notify_all();
        id
    }

    fn insert(inner: &mut QueueInner, envelope: EventEnvelope) {
        inner
            .buckets
            .entry(envelope.priority())
            .or_default()
            .push_back(envelope);
        inner.len += 1;
    }

    fn extract(inner: &mut QueueInner) -> Option<EventEnvelope> {
        let mut entry = inner.buckets.first_entry()?;
        let envelope = entry.get_mut().pop_front();
        if entry.get().is_empty() {
            entry.remove();
        }
        if envelope.is_some() {
            inner.len -= 1;
        }
        envelope
    }

    pub fn len(&self) -> usize {
        self.lock_inner().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-queue hard quit: the next `next_event` call returns `None`
    /// regardless of pending events.
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Release);
        self.wakeup.notify_all();
    }

    /// Inject the single sigint-driven quit event, once.
    fn maybe_enqueue_quit(&self, inner: &mut QueueInner) {
        if shutdown_requested() && inner.quit_event_sent_at.is_none() {
            let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
            Self::insert(
                inner,
                EventEnvelope::new(
                    id,
                    ServiceId::FRAMEWORK,
                    INTERNAL_EVENT_PRIORITY,
                    Box::new(QuitEvent),
                ),
            );
            inner.quit_event_sent_at = Some(Instant::now());
            tracing::debug!("shutdown flag observed; quit event enqueued");
        }
    }

    fn should_quit(&self, inner: &QueueInner) -> bool {
        if let Some(sent_at) = inner.quit_event_sent_at {
            if shutdown_requested() && sent_at.elapsed() >= DRAIN_DEADLINE {
                tracing::warn!("queue did not drain within the quit deadline; hard quitting");
                self.quit.store(true, Ordering::Release);
            }
        }
        self.quit.load(Ordering::Acquire)
    }

    /// Blocking pop for the dispatch loop. Returns `None` when the loop must
    /// exit (hard quit or clean shutdown).
    pub fn next_event(&self) -> Option<EventEnvelope> {
        let mut inner = self.lock_inner();
        loop {
            self.maybe_enqueue_quit(&mut inner);
            if self.should_quit(&inner) {
                return None;
            }
            if let Some(envelope) = Self::extract(&mut inner) {
                self.in_flight.store(true, Ordering::Release);
                return Some(envelope);
            }
            if self.spin_before_sleep {
                drop(inner);
                let spin_start = Instant::now();
                loop {
                    let guard = self.lock_inner();
                    if guard.len > 0 || spin_start.elapsed() >= SPIN_WINDOW {
                        inner = guard;
                        break;
                    }
                    drop(guard);
                    std::hint::spin_loop();
                }
                if inner.len > 0 {
                    continue;
                }
            }
            inner = self
                .wakeup
                .wait_timeout(inner, WAKEUP_TIMEOUT)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Mark the event returned by the last `next_event` as fully processed.
    pub fn dispatch_complete(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    /// Non-blocking extraction; test and teardown helper.
    pub fn try_pop(&self) -> Option<EventEnvelope> {
        Self::extract(&mut self.lock_inner())
    }

    /// Wait until the queue is empty and nothing is being dispatched.
    ///
    /// Returns false on timeout. Two consecutive idle observations are
    /// required so an event that finished just as we looked cannot fake
    /// idleness while its follow-ups are still being pushed.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut idle_seen = false;
        loop {
            let idle = self.lock_inner().len == 0 && !self.in_flight.load(Ordering::Acquire);
            if idle && idle_seen {
                return true;
            }
            idle_seen = idle;
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}
