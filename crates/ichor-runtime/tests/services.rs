//! End-to-end service scenarios: a dispatch thread runs the manager while the
//! test thread observes through Arc-backed counters and closure events.

use ichor_runtime::{
    AsyncGenerator, DependencyManager, EventQueue, ManagerHandle, QuitEvent, RunFunctionEvent,
    Service, ServiceContext, ServiceRegistration, StartOutcome, StopServiceEvent,
};
use ichor_runtime::{EventHandler, EventHandlerRegistration, EventInterceptor};
use ichor_types::{
    AnyEvent, EventTypeId, IchorBehaviour, ServiceId, ServiceRef, ServiceState, StartError,
};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread::JoinHandle;
use std::time::Duration;

const IDLE_WAIT: Duration = Duration::from_secs(2);

/// Spawn a dispatch thread, register services inside it, run until quit.
fn run_manager(
    setup: impl FnOnce(&mut DependencyManager) + Send + 'static,
) -> (Arc<EventQueue>, ManagerHandle, JoinHandle<()>) {
    let queue = Arc::new(EventQueue::new());
    let thread_queue = queue.clone();
    let (tx, rx) = std::sync::mpsc::channel();
    let join = std::thread::spawn(move || {
        let mut manager = DependencyManager::new(thread_queue);
        tx.send(manager.handle()).expect("handle receiver alive");
        setup(&mut manager);
        manager.run(false);
    });
    let handle = rx.recv().expect("manager handle");
    assert!(handle.wait_until_running(Duration::from_secs(2)));
    (queue, handle, join)
}

fn push_assert(queue: &Arc<EventQueue>, assert: impl FnOnce(&mut DependencyManager) + Send + 'static) {
    queue.push_event(ServiceId::FRAMEWORK, RunFunctionEvent::new(assert));
}

fn settle(queue: &Arc<EventQueue>) {
    assert!(queue.wait_until_idle(IDLE_WAIT), "queue did not drain in time");
}

// ---- shared test services ---------------------------------------------------

trait Useless {}

struct UselessService {
    log: EventLog,
    label: &'static str,
}

impl Service for UselessService {
    fn start(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        self.log.record(self.label, "start");
        StartOutcome::Ok
    }

    fn stop(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        self.log.record(self.label, "stop");
        StartOutcome::Ok
    }
}

impl Useless for UselessService {}

fn useless_registration(log: EventLog, label: &'static str) -> ServiceRegistration<UselessService> {
    ServiceRegistration::new(move || UselessService { log, label })
        .provides(|rc| rc as Rc<RefCell<dyn Useless>>)
}

/// Order-preserving record of lifecycle observations across threads.
#[derive(Clone, Default)]
struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    fn record(&self, who: &str, what: &str) {
        self.0.lock().expect("log lock").push(format!("{who}.{what}"));
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().expect("log lock").clone()
    }
}

// ---- scenario: quit pushed from a start hook --------------------------------

struct QuitOnStartService {
    log: EventLog,
    seen: u64,
}

impl Service for QuitOnStartService {
    fn start(&mut self, ctx: &ServiceContext) -> StartOutcome {
        assert_eq!(self.seen, 1, "required dependency injected before start");
        self.log.record("quitter", "start");
        ctx.push_event(QuitEvent);
        StartOutcome::Ok
    }

    fn stop(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        self.log.record("quitter", "stop");
        StartOutcome::Ok
    }
}

#[test_log::test]
fn quit_on_start_with_dependencies_unwinds_in_reverse_order() {
    let log = EventLog::default();
    let setup_log = log.clone();
    let (_queue, handle, join) = run_manager(move |dm| {
        dm.create_service_manager(useless_registration(setup_log.clone(), "useless"));
        let reg = ServiceRegistration::new({
            let log = setup_log.clone();
            move || QuitOnStartService { log, seen: 0 }
        })
        .requires::<dyn Useless, _, _>(
            |svc: &mut QuitOnStartService, _iface, _who: &ServiceRef| svc.seen += 1,
            |svc: &mut QuitOnStartService, _iface, _who: &ServiceRef| svc.seen -= 1,
        );
        dm.create_service_manager(reg);
    });

    join.join().expect("dispatch thread");
    assert!(!handle.is_running());
    similar_asserts::assert_eq!(
        log.entries(),
        vec!["useless.start", "quitter.start", "quitter.stop", "useless.stop"]
    );
}

// ---- scenario: failing start keeps the service registered -------------------

trait FailProbe {
    fn attempts(&self) -> u64;
}

struct FailOnStartService {
    attempts: Arc<AtomicU64>,
}

impl Service for FailOnStartService {
    fn start(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        StartOutcome::Err(StartError::Failed)
    }
}

impl FailProbe for FailOnStartService {
    fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[test]
fn start_failure_does_not_remove_the_service() {
    let attempts = Arc::new(AtomicU64::new(0));
    let setup_attempts = attempts.clone();
    let (queue, handle, join) = run_manager(move |dm| {
        dm.create_service_manager(
            ServiceRegistration::new(move || FailOnStartService {
                attempts: setup_attempts,
            })
            .provides(|rc| rc as Rc<RefCell<dyn FailProbe>>),
        );
    });

    settle(&queue);
    push_assert(&queue, |dm| {
        assert!(dm.started_services::<dyn FailProbe>().is_empty());
        let all = dm.all_services_of_type::<dyn FailProbe>();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0.borrow().attempts(), 1);
        assert_eq!(dm.start_count(all[0].1.id), Some(1));
        dm.event_queue().push_event(ServiceId::FRAMEWORK, QuitEvent);
    });

    join.join().expect("dispatch thread");
    assert!(!handle.is_running());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

// ---- scenarios: dependency counting -----------------------------------------

trait CountProbe {
    fn current(&self) -> u64;
}

struct DependencyCountService {
    count: Arc<AtomicU64>,
}

impl Service for DependencyCountService {}

impl CountProbe for DependencyCountService {
    fn current(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }
}

fn counting_registration(
    count: Arc<AtomicU64>,
    required: bool,
) -> ServiceRegistration<DependencyCountService> {
    let add_count = count.clone();
    let remove_count = count.clone();
    let reg = ServiceRegistration::new(move || DependencyCountService { count });
    let add = move |_svc: &mut DependencyCountService,
                    _iface: Rc<RefCell<dyn Useless>>,
                    _who: &ServiceRef| {
        add_count.fetch_add(1, Ordering::SeqCst);
    };
    let remove = move |_svc: &mut DependencyCountService,
                       _iface: Rc<RefCell<dyn Useless>>,
                       _who: &ServiceRef| {
        remove_count.fetch_sub(1, Ordering::SeqCst);
    };
    if required {
        reg.requires::<dyn Useless, _, _>(add, remove)
    } else {
        reg.optional::<dyn Useless, _, _>(add, remove)
    }
}

fn run_dependency_count_scenario(required: bool) {
    let count = Arc::new(AtomicU64::new(0));
    let setup_count = count.clone();
    let second_provider = Arc::new(AtomicU64::new(0));
    let setup_second = second_provider.clone();
    let log = EventLog::default();
    let setup_log = log.clone();

    let (queue, _handle, join) = run_manager(move |dm| {
        dm.create_service_manager(useless_registration(setup_log.clone(), "u1"));
        let second = dm.create_service_manager(useless_registration(setup_log.clone(), "u2"));
        setup_second.store(second.0, Ordering::SeqCst);
        dm.create_service_manager(counting_registration(setup_count, required));
    });

    settle(&queue);
    push_assert(&queue, move |dm| {
        let started = dm.started_services::<dyn CountProbe>();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].borrow().current(), 2);
    });
    settle(&queue);

    let second = ServiceId(second_provider.load(Ordering::SeqCst));
    queue.push_event(ServiceId::FRAMEWORK, StopServiceEvent { service: second });
    settle(&queue);

    push_assert(&queue, move |dm| {
        let started = dm.started_services::<dyn CountProbe>();
        assert_eq!(started.len(), 1, "consumer must still be active");
        assert_eq!(started[0].borrow().current(), 1);
        dm.event_queue().push_event(ServiceId::FRAMEWORK, QuitEvent);
    });
    join.join().expect("dispatch thread");
    assert_eq!(count.load(Ordering::SeqCst), 0, "all injections withdrawn on shutdown");
}

#[test]
fn required_dependency_tracks_each_provider() {
    run_dependency_count_scenario(true);
}

#[test]
fn optional_dependency_tracks_each_provider_without_stopping() {
    run_dependency_count_scenario(false);
}

// ---- scenario: handlers registered during handling --------------------------

#[derive(Debug)]
struct TestEvent;

impl AnyEvent for TestEvent {
    fn event_type(&self) -> EventTypeId {
        EventTypeId::of::<TestEvent>()
    }

    fn name(&self) -> &'static str {
        "TestEvent"
    }
}

struct AddHandlerDuringHandlingService {
    fired: Arc<AtomicU64>,
    registrations: Vec<EventHandlerRegistration>,
    added_extra: bool,
}

impl Service for AddHandlerDuringHandlingService {
    fn start(&mut self, ctx: &ServiceContext) -> StartOutcome {
        self.registrations
            .push(ctx.register_event_handler::<TestEvent, Self>());
        StartOutcome::Ok
    }

    fn stop(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        self.registrations.clear();
        StartOutcome::Ok
    }
}

impl EventHandler<TestEvent> for AddHandlerDuringHandlingService {
    fn handle_event(
        &mut self,
        _event: &TestEvent,
        ctx: &ServiceContext,
    ) -> AsyncGenerator<IchorBehaviour> {
        self.fired.fetch_add(1, Ordering::SeqCst);
        if !self.added_extra {
            self.added_extra = true;
            self.registrations
                .push(ctx.register_event_handler::<TestEvent, Self>());
        }
        AsyncGenerator::ready(IchorBehaviour::Done)
    }
}

#[test]
fn handlers_added_during_handling_miss_the_inflight_event() {
    let fired = Arc::new(AtomicU64::new(0));
    let setup_fired = fired.clone();
    let (queue, _handle, join) = run_manager(move |dm| {
        for _ in 0..2 {
            let fired = setup_fired.clone();
            dm.create_service_manager(ServiceRegistration::new(move || {
                AddHandlerDuringHandlingService {
                    fired,
                    registrations: Vec::new(),
                    added_extra: false,
                }
            }));
        }
    });

    settle(&queue);
    queue.push_event(ServiceId::FRAMEWORK, TestEvent);
    settle(&queue);
    assert_eq!(
        fired.load(Ordering::SeqCst),
        2,
        "handlers registered mid-dispatch must not see the in-flight event"
    );

    queue.push_event(ServiceId::FRAMEWORK, TestEvent);
    settle(&queue);
    assert_eq!(fired.load(Ordering::SeqCst), 6, "all four handlers fire next time");

    queue.push_event(ServiceId::FRAMEWORK, QuitEvent);
    join.join().expect("dispatch thread");
}

// ---- scenario: a start hook that suspends mid-flight ------------------------

#[derive(Clone, Default)]
struct Trigger(Arc<Mutex<TriggerState>>);

#[derive(Default)]
struct TriggerState {
    fired: bool,
    waker: Option<Waker>,
}

impl Trigger {
    fn fire(&self) {
        let waker = {
            let mut state = self.0.lock().expect("trigger lock");
            state.fired = true;
            state.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn wait(&self) -> TriggerWait {
        TriggerWait(self.clone())
    }
}

struct TriggerWait(Trigger);

impl Future for TriggerWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.0 .0.lock().expect("trigger lock");
        if state.fired {
            Poll::Ready(())
        } else {
            state.waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

trait SlowProbe {}

struct SlowStartService {
    trigger: Trigger,
}

impl Service for SlowStartService {
    fn start(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        let trigger = self.trigger.clone();
        StartOutcome::pending(async move {
            trigger.wait().await;
            Ok(())
        })
    }
}

impl SlowProbe for SlowStartService {}

#[test_log::test]
fn suspended_start_resumes_when_its_waker_fires() {
    let trigger = Trigger::default();
    let setup_trigger = trigger.clone();
    let (queue, _handle, join) = run_manager(move |dm| {
        dm.create_service_manager(
            ServiceRegistration::new(move || SlowStartService {
                trigger: setup_trigger,
            })
            .provides(|rc| rc as Rc<RefCell<dyn SlowProbe>>),
        );
    });

    settle(&queue);
    push_assert(&queue, |dm| {
        let all = dm.all_services_of_type::<dyn SlowProbe>();
        assert_eq!(all.len(), 1);
        assert_eq!(
            dm.service_state(all[0].1.id),
            Some(ServiceState::Starting),
            "service parks mid-start until the trigger fires"
        );
        assert!(dm.started_services::<dyn SlowProbe>().is_empty());
    });
    settle(&queue);

    trigger.fire();
    settle(&queue);
    push_assert(&queue, |dm| {
        assert_eq!(dm.started_services::<dyn SlowProbe>().len(), 1);
        dm.event_queue().push_event(ServiceId::FRAMEWORK, QuitEvent);
    });
    join.join().expect("dispatch thread");
}

// ---- scenario: registration from inside a start hook ------------------------

struct NestedService;

impl Service for NestedService {}

impl Useless for NestedService {}

struct SpawningService;

impl Service for SpawningService {
    fn start(&mut self, ctx: &ServiceContext) -> StartOutcome {
        ctx.create_service(
            ServiceRegistration::new(|| NestedService)
                .provides(|rc| rc as Rc<RefCell<dyn Useless>>),
        );
        StartOutcome::Ok
    }
}

#[test]
fn service_registered_from_a_start_hook_gets_started() {
    let (queue, _handle, join) = run_manager(|dm| {
        dm.create_service_manager(ServiceRegistration::new(|| SpawningService));
    });

    settle(&queue);
    push_assert(&queue, |dm| {
        assert_eq!(dm.service_count(), 2);
        assert_eq!(dm.started_services::<dyn Useless>().len(), 1);
        dm.event_queue().push_event(ServiceId::FRAMEWORK, QuitEvent);
    });
    join.join().expect("dispatch thread");
}

// ---- scenario: interceptor veto ---------------------------------------------

struct VetoService {
    vetoed: Arc<AtomicU64>,
    post_unprocessed: Arc<AtomicU64>,
    registration: Option<ichor_runtime::EventInterceptorRegistration>,
}

impl Service for VetoService {
    fn start(&mut self, ctx: &ServiceContext) -> StartOutcome {
        self.registration = Some(ctx.register_interceptor::<Self>(EventTypeId::of::<TestEvent>()));
        StartOutcome::Ok
    }

    fn stop(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        self.registration = None;
        StartOutcome::Ok
    }
}

impl EventInterceptor for VetoService {
    fn pre_intercept(&mut self, _event: &ichor_types::EventEnvelope, _ctx: &ServiceContext) -> bool {
        self.vetoed.fetch_add(1, Ordering::SeqCst);
        false
    }

    fn post_intercept(
        &mut self,
        _event: &ichor_types::EventEnvelope,
        processed: bool,
        _ctx: &ServiceContext,
    ) {
        if !processed {
            self.post_unprocessed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct CountingHandlerService {
    fired: Arc<AtomicU64>,
    registration: Option<EventHandlerRegistration>,
}

impl Service for CountingHandlerService {
    fn start(&mut self, ctx: &ServiceContext) -> StartOutcome {
        self.registration = Some(ctx.register_event_handler::<TestEvent, Self>());
        StartOutcome::Ok
    }

    fn stop(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        self.registration = None;
        StartOutcome::Ok
    }
}

impl EventHandler<TestEvent> for CountingHandlerService {
    fn handle_event(
        &mut self,
        _event: &TestEvent,
        _ctx: &ServiceContext,
    ) -> AsyncGenerator<IchorBehaviour> {
        self.fired.fetch_add(1, Ordering::SeqCst);
        AsyncGenerator::ready(IchorBehaviour::Done)
    }
}

#[test]
fn pre_interceptor_veto_drops_the_event_but_post_still_runs() {
    let vetoed = Arc::new(AtomicU64::new(0));
    let post_unprocessed = Arc::new(AtomicU64::new(0));
    let fired = Arc::new(AtomicU64::new(0));
    let (setup_vetoed, setup_post, setup_fired) =
        (vetoed.clone(), post_unprocessed.clone(), fired.clone());

    let (queue, _handle, join) = run_manager(move |dm| {
        let vetoed = setup_vetoed.clone();
        let post_unprocessed = setup_post.clone();
        dm.create_service_manager(ServiceRegistration::new(move || VetoService {
            vetoed,
            post_unprocessed,
            registration: None,
        }));
        let fired = setup_fired.clone();
        dm.create_service_manager(ServiceRegistration::new(move || CountingHandlerService {
            fired,
            registration: None,
        }));
    });

    settle(&queue);
    queue.push_event(ServiceId::FRAMEWORK, TestEvent);
    settle(&queue);

    assert_eq!(vetoed.load(Ordering::SeqCst), 1);
    assert_eq!(post_unprocessed.load(Ordering::SeqCst), 1);
    assert_eq!(fired.load(Ordering::SeqCst), 0, "vetoed event reaches no handler");

    queue.push_event(ServiceId::FRAMEWORK, QuitEvent);
    join.join().expect("dispatch thread");
}
