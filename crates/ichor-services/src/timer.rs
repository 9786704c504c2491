//! Interval timer service.
//!
//! A [`TimerService`] owns a ticker thread that sleeps for the configured
//! interval and pushes a [`TimerTickEvent`] targeted at the owning service.
//! The user callback always runs on the dispatch thread, inside the timer's
//! own event handler, and only while the timer is running: a callback that
//! calls [`TimerHandle::stop_timer`] therefore runs exactly once even when
//! further ticks are already queued.

use ichor_runtime::{
    AsyncGenerator, EventHandler, EventHandlerRegistration, EventQueue, Service, ServiceContext,
    ServiceRegistration, StartOutcome,
};
use ichor_types::{AnyEvent, EventTypeId, IchorBehaviour, ServiceId};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

/// Tick emitted by the ticker thread, targeted at its owning service.
#[derive(Debug)]
pub struct TimerTickEvent;

impl AnyEvent for TimerTickEvent {
    fn event_type(&self) -> EventTypeId {
        EventTypeId::of::<TimerTickEvent>()
    }

    fn name(&self) -> &'static str {
        "TimerTickEvent"
    }
}

/// Timer control interface.
pub trait Timer {
    fn set_interval(&self, interval: Duration);
    fn start_timer(&self);
    fn stop_timer(&self);
    fn is_timer_running(&self) -> bool;
}

struct TimerShared {
    interval_us: AtomicU64,
    running: AtomicBool,
    /// At most one ticker thread alive per timer.
    ticker_live: AtomicBool,
    callback: Mutex<Option<Box<dyn FnMut() + Send>>>,
    /// Owner id and queue, filled in when the service starts.
    attachment: Mutex<Option<(ServiceId, Weak<EventQueue>)>>,
}

/// Cheap, `Send` control handle shared between the service, the ticker thread
/// and user code (including the callback itself).
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl Default for TimerHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                interval_us: AtomicU64::new(
                    u64::try_from(Duration::from_secs(1).as_micros()).unwrap_or(u64::MAX),
                ),
                running: AtomicBool::new(false),
                ticker_live: AtomicBool::new(false),
                callback: Mutex::new(None),
                attachment: Mutex::new(None),
            }),
        }
    }

    pub fn set_callback(&self, callback: impl FnMut() + Send + 'static) {
        *self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(callback));
    }

    fn attach(&self, owner: ServiceId, queue: Weak<EventQueue>) {
        *self
            .shared
            .attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((owner, queue));
    }

    fn detach(&self) {
        *self
            .shared
            .attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn spawn_ticker_if_attached(&self) {
        let Some((owner, queue)) = self
            .shared
            .attachment
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        else {
            return;
        };
        if self.shared.ticker_live.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::downgrade(&self.shared);
        std::thread::spawn(move || loop {
            let Some(strong) = shared.upgrade() else {
                break;
            };
            let interval = Duration::from_micros(strong.interval_us.load(Ordering::Acquire));
            drop(strong);
            std::thread::sleep(interval);

            let Some(strong) = shared.upgrade() else {
                break;
            };
            if !strong.running.load(Ordering::Acquire) {
                strong.ticker_live.store(false, Ordering::SeqCst);
                break;
            }
            let Some(queue) = queue.upgrade() else {
                strong.ticker_live.store(false, Ordering::SeqCst);
                break;
            };
            queue.push_event(owner, TimerTickEvent);
        });
    }

    fn invoke_callback(&self) {
        let mut guard = self
            .shared
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = guard.as_mut() {
            callback();
        }
    }
}

impl Timer for TimerHandle {
    fn set_interval(&self, interval: Duration) {
        let micros = u64::try_from(interval.as_micros()).unwrap_or(u64::MAX);
        self.shared.interval_us.store(micros, Ordering::Release);
    }

    fn start_timer(&self) {
        if !self.shared.running.swap(true, Ordering::SeqCst) {
            self.spawn_ticker_if_attached();
        }
    }

    fn stop_timer(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
    }

    fn is_timer_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }
}

/// The managed service wrapping a [`TimerHandle`].
pub struct TimerService {
    handle: TimerHandle,
    registration: Option<EventHandlerRegistration>,
}

impl TimerService {
    pub fn new(handle: TimerHandle) -> Self {
        Self {
            handle,
            registration: None,
        }
    }

    pub fn handle(&self) -> TimerHandle {
        self.handle.clone()
    }

    /// Registration publishing `dyn Timer` over the given handle.
    pub fn registration(handle: TimerHandle) -> ServiceRegistration<TimerService> {
        ServiceRegistration::new(move || TimerService::new(handle))
            .provides(|rc| rc as Rc<RefCell<dyn Timer>>)
    }
}

impl Service for TimerService {
    fn start(&mut self, ctx: &ServiceContext) -> StartOutcome {
        self.handle
            .attach(ctx.service_id(), Arc::downgrade(ctx.queue()));
        self.registration =
            Some(ctx.register_event_handler_for_origin::<TimerTickEvent, Self>(ctx.service_id()));
        if self.handle.is_timer_running() {
            // start_timer() was called before the service was wired up.
            self.handle.spawn_ticker_if_attached();
        }
        StartOutcome::Ok
    }

    fn stop(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        self.handle.stop_timer();
        self.handle.detach();
        self.registration = None;
        StartOutcome::Ok
    }
}

impl Timer for TimerService {
    fn set_interval(&self, interval: Duration) {
        self.handle.set_interval(interval);
    }

    fn start_timer(&self) {
        self.handle.start_timer();
    }

    fn stop_timer(&self) {
        self.handle.stop_timer();
    }

    fn is_timer_running(&self) -> bool {
        self.handle.is_timer_running()
    }
}

impl EventHandler<TimerTickEvent> for TimerService {
    fn handle_event(
        &mut self,
        _event: &TimerTickEvent,
        _ctx: &ServiceContext,
    ) -> AsyncGenerator<IchorBehaviour> {
        // Ticks queued after a stop are dropped here, which is what makes
        // stop-from-inside-the-callback exactly-once.
        if self.handle.is_timer_running() {
            self.handle.invoke_callback();
        }
        AsyncGenerator::ready(IchorBehaviour::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ichor_runtime::{DependencyManager, QuitEvent, RunFunctionEvent};

    #[test]
    fn interval_and_running_flags_round_trip() {
        let handle = TimerHandle::new();
        handle.set_interval(Duration::from_millis(5));
        assert!(!handle.is_timer_running());
        handle.start_timer();
        assert!(handle.is_timer_running());
        handle.stop_timer();
        assert!(!handle.is_timer_running());
    }

    #[test_log::test]
    fn callback_stopping_its_own_timer_runs_exactly_once() {
        let count = Arc::new(AtomicU64::new(0));
        let handle = TimerHandle::new();
        handle.set_interval(Duration::from_millis(5));
        {
            let count = count.clone();
            let stopper = handle.clone();
            handle.set_callback(move || {
                count.fetch_add(1, Ordering::SeqCst);
                stopper.stop_timer();
            });
        }
        handle.start_timer();

        let queue = Arc::new(EventQueue::new());
        let thread_queue = queue.clone();
        let registration_handle = handle.clone();
        let join = std::thread::spawn(move || {
            let mut manager = DependencyManager::new(thread_queue);
            manager.create_service_manager(TimerService::registration(registration_handle));
            manager.run(false);
        });

        // Give the ticker room for several would-be intervals.
        std::thread::sleep(Duration::from_millis(100));
        queue.push_event(ServiceId::FRAMEWORK, QuitEvent);
        join.join().expect("dispatch thread");

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!handle.is_timer_running());
    }

    #[test]
    fn ticks_keep_arriving_until_stopped() {
        let count = Arc::new(AtomicU64::new(0));
        let handle = TimerHandle::new();
        handle.set_interval(Duration::from_millis(5));
        {
            let count = count.clone();
            handle.set_callback(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        handle.start_timer();

        let queue = Arc::new(EventQueue::new());
        let thread_queue = queue.clone();
        let registration_handle = handle.clone();
        let join = std::thread::spawn(move || {
            let mut manager = DependencyManager::new(thread_queue);
            manager.create_service_manager(TimerService::registration(registration_handle));
            manager.run(false);
        });

        std::thread::sleep(Duration::from_millis(100));
        let stopper = handle.clone();
        queue.push_event(
            ServiceId::FRAMEWORK,
            RunFunctionEvent::new(move |_dm| stopper.stop_timer()),
        );
        queue.push_event(ServiceId::FRAMEWORK, QuitEvent);
        join.join().expect("dispatch thread");

        assert!(count.load(Ordering::SeqCst) >= 2, "repeating timer fired repeatedly");
    }
}
