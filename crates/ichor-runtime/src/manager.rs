//! The dependency manager: service registry plus the dispatch loop.
//!
//! Owns every [`LifecycleManager`], the interface index, the handler and
//! interceptor registries and one event queue. The dispatch thread is the
//! sole consumer of the queue and the sole resumer of suspended generators;
//! other threads interact purely by pushing events.

use crate::events::{
    ContinueServiceEvent, DependencyOfflineEvent, DependencyOnlineEvent, InsertServiceEvent,
    QuitEvent, RemoveServiceEvent, RunFunctionEvent, StartServiceEvent, StopServiceEvent,
};
use crate::generator::{AsyncGenerator, Driven, drive};
use crate::lifecycle::{LifecycleManager, unwire, wire};
use crate::queue::{self, EventQueue};
use crate::registration::{Service, ServiceRegistration};
use crate::registry::EventRegistries;
use ichor_types::{
    ESCALATION_RANGE, EventEnvelope, EventId, INTERNAL_EVENT_PRIORITY, IchorBehaviour, InterfaceId,
    Priority, ServiceId, ServiceRef, ServiceState, StartBehaviour,
};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::task::{Wake, Waker};
use std::time::{Duration, Instant};

#[derive(Default)]
struct InterfaceEntry {
    providers: Vec<ServiceId>,
    consumers: Vec<ServiceId>,
}

/// A generator parked mid-flight, keyed by the event that spawned it.
enum SuspendedOperation {
    Start {
        service: ServiceId,
        generator: AsyncGenerator<StartBehaviour>,
    },
    Stop {
        service: ServiceId,
        generator: AsyncGenerator<StartBehaviour>,
    },
    DependencyOnline {
        consumer: ServiceId,
        generator: AsyncGenerator<StartBehaviour>,
    },
    DependencyOffline {
        consumer: ServiceId,
        stop_priority: Priority,
        generator: AsyncGenerator<StartBehaviour>,
    },
    Handler {
        service: ServiceId,
        generator: AsyncGenerator<IchorBehaviour>,
    },
}

impl SuspendedOperation {
    fn involves(&self, id: ServiceId) -> bool {
        match self {
            Self::Start { service, .. }
            | Self::Stop { service, .. }
            | Self::Handler { service, .. } => *service == id,
            Self::DependencyOnline { consumer, .. }
            | Self::DependencyOffline { consumer, .. } => *consumer == id,
        }
    }
}

struct ManagerStatus {
    running: Mutex<bool>,
    changed: Condvar,
}

/// Cross-thread observer for a manager owned by its dispatch thread.
#[derive(Clone)]
pub struct ManagerHandle {
    status: Arc<ManagerStatus>,
}

impl ManagerHandle {
    pub fn is_running(&self) -> bool {
        *self
            .status
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until the dispatch loop is running, or the timeout elapses.
    pub fn wait_until_running(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut running = self
            .status
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*running {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            running = self
                .status
                .changed
                .wait_timeout(running, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
        true
    }
}

/// Waker handed to suspended generators: a wake re-enters them by pushing a
/// continuation event onto the owning queue.
struct QueueWaker {
    queue: std::sync::Weak<EventQueue>,
    event_id: EventId,
}

impl Wake for QueueWaker {
    fn wake(self: Arc<Self>) {
        if let Some(queue) = self.queue.upgrade() {
            queue.push_prioritized_event(
                ServiceId::FRAMEWORK,
                INTERNAL_EVENT_PRIORITY,
                ContinueServiceEvent {
                    resumes: self.event_id,
                },
            );
        }
    }
}

pub struct DependencyManager {
    queue: Arc<EventQueue>,
    services: HashMap<ServiceId, Rc<RefCell<LifecycleManager>>>,
    interface_index: HashMap<InterfaceId, InterfaceEntry>,
    registries: Rc<RefCell<EventRegistries>>,
    suspended: HashMap<EventId, Vec<SuspendedOperation>>,
    status: Arc<ManagerStatus>,
    /// First observation of a quit event; arms the drain deadline.
    quit_seen_at: Option<Instant>,
}

impl DependencyManager {
    pub fn new(queue: Arc<EventQueue>) -> Self {
        Self {
            queue,
            services: HashMap::new(),
            interface_index: HashMap::new(),
            registries: Rc::new(RefCell::new(EventRegistries::new())),
            suspended: HashMap::new(),
            status: Arc::new(ManagerStatus {
                running: Mutex::new(false),
                changed: Condvar::new(),
            }),
            quit_seen_at: None,
        }
    }

    pub fn event_queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            status: self.status.clone(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle().is_running()
    }

    fn set_running(&self, running: bool) {
        let mut guard = self
            .status
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = running;
        self.status.changed.notify_all();
    }

    /// Construct, wrap and register a service; its start rides an internal
    /// event so registration is legal at any time, including mid-dispatch.
    pub fn create_service_manager<S: Service>(
        &mut self,
        registration: ServiceRegistration<S>,
    ) -> ServiceId {
        let manager = LifecycleManager::new(registration);
        let id = manager.service_id();
        for interface in manager.provided_interfaces() {
            self.interface_index
                .entry(interface)
                .or_default()
                .providers
                .push(id);
        }
        for slot in manager.dependencies.slots() {
            self.interface_index
                .entry(slot.interface)
                .or_default()
                .consumers
                .push(id);
        }
        tracing::debug!(service = %id, name = manager.info.name, "service registered");
        self.services.insert(id, Rc::new(RefCell::new(manager)));
        self.queue.push_prioritized_event(
            ServiceId::FRAMEWORK,
            INTERNAL_EVENT_PRIORITY,
            StartServiceEvent { service: id },
        );
        id
    }

    /// Run the dispatch loop until quit, then tear the registry down in
    /// reverse priority order.
    pub fn run(&mut self, capture_sigint: bool) {
        if capture_sigint {
            queue::capture_sigint();
        }
        self.set_running(true);
        tracing::debug!("dispatch loop entered");
        while let Some(envelope) = self.queue.next_event() {
            self.process_event(envelope);
            self.queue.dispatch_complete();
        }
        tracing::debug!("dispatch loop exited");
        self.teardown();
        self.set_running(false);
    }

    fn waker_for(&self, event_id: EventId) -> Waker {
        Waker::from(Arc::new(QueueWaker {
            queue: Arc::downgrade(&self.queue),
            event_id,
        }))
    }

    fn manager(&self, id: ServiceId) -> Option<Rc<RefCell<LifecycleManager>>> {
        self.services.get(&id).cloned()
    }

    pub(crate) fn process_event(&mut self, envelope: EventEnvelope) {
        let interceptors = self.registries.borrow().interceptors_for(envelope.event_type());
        let mut allowed = true;
        for entry in &interceptors {
            if !(entry.pre)(&envelope) {
                allowed = false;
            }
        }
        // Quit-family events may be vetoed out of handler routing but never
        // out of framework processing; the runtime must not lose them.
        let is_quit = envelope.downcast_ref::<QuitEvent>().is_some();
        let processed = allowed || is_quit;
        if processed {
            self.dispatch_event(&envelope);
        } else {
            tracing::trace!(event = envelope.name(), "event vetoed by interceptor");
        }
        for entry in &interceptors {
            (entry.post)(&envelope, processed);
        }
    }

    fn dispatch_event(&mut self, envelope: &EventEnvelope) {
        if let Some(event) = envelope.downcast_ref::<StartServiceEvent>() {
            self.handle_start_service(event.service, envelope.id());
        } else if let Some(event) = envelope.downcast_ref::<StopServiceEvent>() {
            self.handle_stop_service(event.service, envelope.priority(), envelope.id());
        } else if let Some(event) = envelope.downcast_ref::<RemoveServiceEvent>() {
            self.handle_remove_service(event.service, envelope.priority());
        } else if let Some(event) = envelope.downcast_ref::<DependencyOnlineEvent>() {
            self.handle_dependency_online(event.provider, envelope.id());
        } else if let Some(event) = envelope.downcast_ref::<DependencyOfflineEvent>() {
            self.handle_dependency_offline(event.provider, envelope.priority(), envelope.id());
        } else if envelope.downcast_ref::<QuitEvent>().is_some() {
            self.handle_quit(envelope.priority());
        } else if let Some(event) = envelope.downcast_ref::<ContinueServiceEvent>() {
            self.handle_continue(event.resumes);
        } else if let Some(event) = envelope.downcast_ref::<RunFunctionEvent>() {
            if let Some(fun) = event.take() {
                fun(self);
            }
        } else if let Some(event) = envelope.downcast_ref::<InsertServiceEvent>() {
            if let Some(install) = event.take() {
                install(self);
            }
        } else {
            self.route_to_handlers(envelope);
        }
    }

    fn route_to_handlers(&mut self, envelope: &EventEnvelope) {
        let handlers = self.registries.borrow().handlers_for(envelope.event_type());
        tracing::trace!(
            event = envelope.name(),
            handlers = handlers.len(),
            "routing event"
        );
        for entry in handlers {
            if let Some(origin) = entry.origin_filter {
                if origin != envelope.originating_service() {
                    continue;
                }
            }
            let waker = self.waker_for(envelope.id());
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                let mut generator = (entry.callback)(envelope)?;
                generator.set_waker(waker);
                match drive(&mut generator) {
                    Driven::Suspended => Some(generator),
                    Driven::Completed(_) | Driven::Exhausted => None,
                }
            }));
            match outcome {
                Ok(Some(generator)) => {
                    self.suspended
                        .entry(envelope.id())
                        .or_default()
                        .push(SuspendedOperation::Handler {
                            service: entry.service,
                            generator,
                        });
                }
                Ok(None) => {}
                Err(payload) => {
                    tracing::error!(
                        event = envelope.name(),
                        service = %entry.service,
                        panic = panic_message(&payload),
                        "handler panicked; event dropped for this handler"
                    );
                }
            }
        }
    }

    /// Inject every already-active provider into the declared slots of a
    /// freshly starting service.
    fn wire_active_providers(&self, manager: &Rc<RefCell<LifecycleManager>>) {
        let interfaces: Vec<InterfaceId> = manager
            .borrow()
            .dependencies
            .slots()
            .iter()
            .map(|s| s.interface)
            .collect();
        for interface in interfaces {
            let providers = self
                .interface_index
                .get(&interface)
                .map(|e| e.providers.clone())
                .unwrap_or_default();
            for provider_id in providers {
                let Some(provider) = self.manager(provider_id) else {
                    continue;
                };
                if provider.borrow().state() == ServiceState::Active {
                    wire(manager, &provider, interface);
                }
            }
        }
    }

    fn handle_start_service(&mut self, target: ServiceId, event_id: EventId) {
        let Some(manager) = self.manager(target) else {
            tracing::warn!(service = %target, "start requested for unknown service");
            return;
        };
        self.wire_active_providers(&manager);
        let generator =
            LifecycleManager::start(manager, self.queue.clone(), self.registries.clone());
        self.drive_start_like(
            SuspendedOperation::Start {
                service: target,
                generator,
            },
            event_id,
        );
    }

    fn handle_dependency_online(&mut self, provider_id: ServiceId, event_id: EventId) {
        let Some(provider) = self.manager(provider_id) else {
            return;
        };
        if provider.borrow().state() != ServiceState::Active {
            return;
        }
        let interfaces: Vec<InterfaceId> = provider.borrow().provided_interfaces().collect();
        for interface in interfaces {
            let mut consumers: Vec<(u64, ServiceId)> = self
                .interface_index
                .get(&interface)
                .map(|e| e.consumers.clone())
                .unwrap_or_default()
                .into_iter()
                .filter(|id| *id != provider_id)
                .filter_map(|id| {
                    self.manager(id)
                        .map(|m| (m.borrow().priority(), id))
                })
                .collect();
            consumers.sort();
            for (_, consumer_id) in consumers {
                let Some(consumer) = self.manager(consumer_id) else {
                    continue;
                };
                let generator = LifecycleManager::dependency_online(
                    consumer,
                    provider.clone(),
                    interface,
                    self.queue.clone(),
                    self.registries.clone(),
                );
                self.drive_start_like(
                    SuspendedOperation::DependencyOnline {
                        consumer: consumer_id,
                        generator,
                    },
                    event_id,
                );
            }
        }
    }

    fn handle_dependency_offline(
        &mut self,
        provider_id: ServiceId,
        priority: Priority,
        event_id: EventId,
    ) {
        let Some(provider) = self.manager(provider_id) else {
            return;
        };
        // Reverse service-priority order over the current dependee set.
        let mut consumers: Vec<(u64, ServiceId)> = provider
            .borrow()
            .dependees
            .iter()
            .filter_map(|id| self.manager(*id).map(|m| (m.borrow().priority(), *id)))
            .collect();
        consumers.sort_by(|a, b| b.cmp(a));

        for (_, consumer_id) in consumers {
            let Some(consumer) = self.manager(consumer_id) else {
                continue;
            };
            let interfaces: Vec<InterfaceId> = provider
                .borrow()
                .provided_interfaces()
                .filter(|i| consumer.borrow().dependencies.declares(*i))
                .collect();
            for interface in interfaces {
                let generator =
                    LifecycleManager::dependency_offline(consumer.clone(), provider.clone(), interface);
                self.drive_offline(consumer_id, priority, generator, event_id);
            }
        }
    }

    fn drive_offline(
        &mut self,
        consumer: ServiceId,
        priority: Priority,
        mut generator: AsyncGenerator<StartBehaviour>,
        event_id: EventId,
    ) {
        generator.set_waker(self.waker_for(event_id));
        match panic::catch_unwind(AssertUnwindSafe(|| drive(&mut generator))) {
            Ok(Driven::Completed(StartBehaviour::Started)) => {
                // A required slot emptied out: the consumer must stop.
                self.queue.push_prioritized_event(
                    ServiceId::FRAMEWORK,
                    escalate(priority, 1),
                    StopServiceEvent { service: consumer },
                );
            }
            Ok(Driven::Completed(StartBehaviour::Done)) | Ok(Driven::Exhausted) => {}
            Ok(Driven::Suspended) => {
                self.suspended
                    .entry(event_id)
                    .or_default()
                    .push(SuspendedOperation::DependencyOffline {
                        consumer,
                        stop_priority: priority,
                        generator,
                    });
            }
            Err(payload) => {
                tracing::error!(
                    service = %consumer,
                    panic = panic_message(&payload),
                    "dependency-offline pass panicked"
                );
            }
        }
    }

    /// Drive a start-flavored generator (plain start or dependency-online);
    /// a `Started` completion advances the service into active duty.
    fn drive_start_like(&mut self, mut operation: SuspendedOperation, event_id: EventId) {
        let waker = self.waker_for(event_id);
        let (service, outcome) = match &mut operation {
            SuspendedOperation::Start { service, generator }
            | SuspendedOperation::DependencyOnline {
                consumer: service,
                generator,
            } => {
                generator.set_waker(waker);
                let service = *service;
                (
                    service,
                    panic::catch_unwind(AssertUnwindSafe(|| drive(generator))),
                )
            }
            _ => unreachable!("drive_start_like only accepts start-flavored operations"),
        };
        match outcome {
            Ok(Driven::Completed(StartBehaviour::Started)) => self.finish_start(service),
            Ok(Driven::Completed(StartBehaviour::Done)) | Ok(Driven::Exhausted) => {}
            Ok(Driven::Suspended) => {
                self.suspended.entry(event_id).or_default().push(operation);
            }
            Err(payload) => {
                tracing::error!(
                    service = %service,
                    panic = panic_message(&payload),
                    "start pass panicked; service state left as-is"
                );
            }
        }
    }

    /// Start hook succeeded: advance `Injecting -> Active` and fan the new
    /// provider out to interested consumers.
    fn finish_start(&mut self, service: ServiceId) {
        let Some(manager) = self.manager(service) else {
            return;
        };
        if !manager.borrow_mut().set_injected() {
            return;
        }
        tracing::debug!(service = %service, name = manager.borrow().info.name, "service active");
        self.queue.push_prioritized_event(
            ServiceId::FRAMEWORK,
            escalate(INTERNAL_EVENT_PRIORITY, 1),
            DependencyOnlineEvent { provider: service },
        );
    }

    fn handle_stop_service(&mut self, target: ServiceId, priority: Priority, event_id: EventId) {
        let Some(manager) = self.manager(target) else {
            return;
        };
        if manager.borrow().state() != ServiceState::Active {
            tracing::trace!(service = %target, "stop ignored; service not active");
            return;
        }
        if !manager.borrow().dependees.is_empty() {
            // Consumers go offline first; our own stop is re-queued behind
            // the cascade in the escalation band.
            self.queue.push_prioritized_event(
                ServiceId::FRAMEWORK,
                escalate(priority, 1),
                DependencyOfflineEvent { provider: target },
            );
            self.queue.push_prioritized_event(
                ServiceId::FRAMEWORK,
                escalate(priority, 10),
                StopServiceEvent { service: target },
            );
            tracing::debug!(service = %target, "stop deferred until dependees are offline");
            return;
        }
        if !manager.borrow_mut().set_uninjected() {
            return;
        }
        self.uninject_providers_of(&manager);
        let generator =
            LifecycleManager::stop(manager, self.queue.clone(), self.registries.clone());
        self.drive_stop(target, generator, event_id);
    }

    fn drive_stop(
        &mut self,
        service: ServiceId,
        mut generator: AsyncGenerator<StartBehaviour>,
        event_id: EventId,
    ) {
        generator.set_waker(self.waker_for(event_id));
        match panic::catch_unwind(AssertUnwindSafe(|| drive(&mut generator))) {
            Ok(Driven::Completed(_)) | Ok(Driven::Exhausted) => {}
            Ok(Driven::Suspended) => {
                self.suspended
                    .entry(event_id)
                    .or_default()
                    .push(SuspendedOperation::Stop { service, generator });
            }
            Err(payload) => {
                tracing::error!(
                    service = %service,
                    panic = panic_message(&payload),
                    "stop pass panicked"
                );
            }
        }
    }

    /// Withdraw every provider injected into `consumer`; part of its stop.
    fn uninject_providers_of(&self, consumer: &Rc<RefCell<LifecycleManager>>) {
        let slots: Vec<(InterfaceId, Vec<ServiceId>)> = consumer
            .borrow()
            .dependencies
            .slots()
            .iter()
            .map(|s| (s.interface, s.providers().to_vec()))
            .collect();
        for (interface, providers) in slots {
            for provider_id in providers {
                if let Some(provider) = self.manager(provider_id) {
                    unwire(consumer, &provider, interface);
                }
            }
        }
    }

    fn handle_remove_service(&mut self, target: ServiceId, priority: Priority) {
        let Some(manager) = self.manager(target) else {
            return;
        };
        match manager.borrow().state() {
            ServiceState::Active => {
                self.queue.push_prioritized_event(
                    ServiceId::FRAMEWORK,
                    escalate(priority, 1),
                    StopServiceEvent { service: target },
                );
                self.queue.push_prioritized_event(
                    ServiceId::FRAMEWORK,
                    escalate(priority, 11),
                    RemoveServiceEvent { service: target },
                );
                return;
            }
            ServiceState::Installed => {}
            other => {
                // Mid-transition; try again after the in-flight step settles.
                tracing::trace!(service = %target, state = %other, "remove re-queued");
                self.queue.push_prioritized_event(
                    ServiceId::FRAMEWORK,
                    escalate(priority, 1),
                    RemoveServiceEvent { service: target },
                );
                return;
            }
        }
        for entry in self.interface_index.values_mut() {
            entry.providers.retain(|id| *id != target);
            entry.consumers.retain(|id| *id != target);
        }
        self.interface_index.retain(|_, e| {
            !e.providers.is_empty() || !e.consumers.is_empty()
        });
        self.registries.borrow_mut().drop_service(target);
        self.suspended.retain(|_, ops| {
            ops.retain(|op| !op.involves(target));
            !ops.is_empty()
        });
        manager.borrow_mut().force_uninstalled();
        self.services.remove(&target);
        tracing::debug!(service = %target, "service removed");
    }

    fn handle_quit(&mut self, priority: Priority) {
        let seen_at = *self.quit_seen_at.get_or_insert_with(Instant::now);
        let all_stopped = self.services.values().all(|m| {
            matches!(
                m.borrow().state(),
                ServiceState::Installed | ServiceState::Uninstalled
            )
        });
        if all_stopped {
            tracing::debug!("quit: all services stopped; leaving the dispatch loop");
            self.queue.request_quit();
            return;
        }
        if seen_at.elapsed() >= queue::DRAIN_DEADLINE {
            tracing::warn!("quit drain exceeded its deadline; hard quitting");
            self.queue.request_quit();
            return;
        }
        // Reverse priority order; the stop cascade takes consumers down
        // before their providers.
        let mut active: Vec<(u64, ServiceId)> = self
            .services
            .iter()
            .filter(|(_, m)| m.borrow().state() == ServiceState::Active)
            .map(|(id, m)| (m.borrow().priority(), *id))
            .collect();
        active.sort_by(|a, b| b.cmp(a));
        for (_, id) in active {
            self.queue.push_prioritized_event(
                ServiceId::FRAMEWORK,
                escalate(priority, 1),
                StopServiceEvent { service: id },
            );
        }
        // Re-check once the stops have drained.
        self.queue
            .push_prioritized_event(ServiceId::FRAMEWORK, escalate(priority, 11), QuitEvent);
    }

    fn handle_continue(&mut self, resumes: EventId) {
        let Some(operations) = self.suspended.remove(&resumes) else {
            return;
        };
        for operation in operations {
            match operation {
                SuspendedOperation::Handler {
                    service,
                    mut generator,
                } => {
                    generator.set_waker(self.waker_for(resumes));
                    match panic::catch_unwind(AssertUnwindSafe(|| drive(&mut generator))) {
                        Ok(Driven::Suspended) => {
                            self.suspended
                                .entry(resumes)
                                .or_default()
                                .push(SuspendedOperation::Handler { service, generator });
                        }
                        Ok(_) => {}
                        Err(payload) => {
                            tracing::error!(
                                service = %service,
                                panic = panic_message(&payload),
                                "resumed handler panicked"
                            );
                        }
                    }
                }
                SuspendedOperation::Stop { service, generator } => {
                    self.drive_stop(service, generator, resumes);
                }
                SuspendedOperation::DependencyOffline {
                    consumer,
                    stop_priority,
                    generator,
                } => {
                    self.drive_offline(consumer, stop_priority, generator, resumes);
                }
                operation @ (SuspendedOperation::Start { .. }
                | SuspendedOperation::DependencyOnline { .. }) => {
                    self.drive_start_like(operation, resumes);
                }
            }
        }
    }

    /// Forced teardown after the loop exits: stop whatever is still active,
    /// reverse priority order, bounded by the drain deadline.
    fn teardown(&mut self) {
        let deadline = Instant::now() + queue::DRAIN_DEADLINE;
        // Outstanding generators are cancelled, not resumed.
        self.suspended.clear();
        let mut order: Vec<(u64, ServiceId)> = self
            .services
            .iter()
            .map(|(id, m)| (m.borrow().priority(), *id))
            .collect();
        order.sort_by(|a, b| b.cmp(a));
        for (_, id) in order {
            self.stop_service_blocking(id, deadline);
        }
        self.registries.borrow_mut().clear();
        for (_, manager) in self.services.drain() {
            manager.borrow_mut().force_uninstalled();
        }
    }

    fn stop_service_blocking(&self, id: ServiceId, deadline: Instant) {
        let Some(manager) = self.manager(id) else {
            return;
        };
        if manager.borrow().state() != ServiceState::Active {
            return;
        }
        if !manager.borrow_mut().set_uninjected() {
            return;
        }
        self.uninject_providers_of(&manager);
        let mut generator =
            LifecycleManager::stop(manager, self.queue.clone(), self.registries.clone());
        loop {
            match panic::catch_unwind(AssertUnwindSafe(|| drive(&mut generator))) {
                Ok(Driven::Suspended) => {
                    if Instant::now() >= deadline {
                        tracing::warn!(service = %id, "stop did not finish before the teardown deadline");
                        return;
                    }
                    std::thread::sleep(Duration::from_millis(1));
                }
                Ok(_) => return,
                Err(payload) => {
                    tracing::error!(
                        service = %id,
                        panic = panic_message(&payload),
                        "stop panicked during teardown"
                    );
                    return;
                }
            }
        }
    }

    // ---- queries -----------------------------------------------------------

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn service_state(&self, id: ServiceId) -> Option<ServiceState> {
        self.manager(id).map(|m| m.borrow().state())
    }

    /// Start attempts recorded for a service, successful or not.
    pub fn start_count(&self, id: ServiceId) -> Option<u64> {
        self.manager(id).map(|m| m.borrow().info.start_count)
    }

    pub fn service_reference(&self, id: ServiceId) -> Option<ServiceRef> {
        self.manager(id).map(|m| m.borrow().service_ref())
    }

    /// Active services publishing interface `I`, as typed handles.
    pub fn started_services<I: ?Sized + 'static>(&self) -> Vec<Rc<RefCell<I>>> {
        self.services_of_type::<I>(true)
            .into_iter()
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Every registered service publishing interface `I`, regardless of state.
    pub fn all_services_of_type<I: ?Sized + 'static>(&self) -> Vec<(Rc<RefCell<I>>, ServiceRef)> {
        self.services_of_type::<I>(false)
    }

    fn services_of_type<I: ?Sized + 'static>(
        &self,
        active_only: bool,
    ) -> Vec<(Rc<RefCell<I>>, ServiceRef)> {
        let interface = InterfaceId::of::<I>();
        let Some(entry) = self.interface_index.get(&interface) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for id in &entry.providers {
            let Some(manager) = self.manager(*id) else {
                continue;
            };
            let manager = manager.borrow();
            if active_only && manager.state() != ServiceState::Active {
                continue;
            }
            let Some(boxed) = manager.make_interface(interface) else {
                continue;
            };
            let Ok(handle) = boxed.downcast::<Rc<RefCell<I>>>() else {
                continue;
            };
            out.push((*handle, manager.service_ref()));
        }
        out
    }
}

/// Ordering key for a framework re-push triggered while dispatching an event
/// of `priority`. Offsets are clamped to the reserved escalation band, so a
/// cascade step can never leapfrog more than `ESCALATION_RANGE` priorities
/// past its trigger.
fn escalate(priority: Priority, offset: Priority) -> Priority {
    priority.saturating_add(offset.min(ESCALATION_RANGE))
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ServiceContext;
    use crate::registration::StartOutcome;
    use std::cell::Cell;

    /// Drain the queue synchronously on the current thread.
    fn pump(manager: &mut DependencyManager) {
        while let Some(envelope) = manager.queue.try_pop() {
            manager.process_event(envelope);
        }
    }

    trait Marker {}

    #[derive(Default)]
    struct Plain {
        started: Cell<u32>,
    }

    impl Service for Plain {
        fn start(&mut self, _ctx: &ServiceContext) -> StartOutcome {
            self.started.set(self.started.get() + 1);
            StartOutcome::Ok
        }
    }

    impl Marker for Plain {}

    #[derive(Default)]
    struct Consumer {
        seen: Cell<u32>,
    }

    impl Service for Consumer {}

    fn consumer_registration(required: bool) -> ServiceRegistration<Consumer> {
        let reg = ServiceRegistration::new(Consumer::default);
        let add = |svc: &mut Consumer, _iface: Rc<RefCell<dyn Marker>>, _who: &ServiceRef| {
            svc.seen.set(svc.seen.get() + 1);
        };
        let remove = |svc: &mut Consumer, _iface: Rc<RefCell<dyn Marker>>, _who: &ServiceRef| {
            svc.seen.set(svc.seen.get() - 1);
        };
        if required {
            reg.requires::<dyn Marker, _, _>(add, remove)
        } else {
            reg.optional::<dyn Marker, _, _>(add, remove)
        }
    }

    #[test]
    fn zero_dependency_service_starts_on_the_first_tick() {
        let mut dm = DependencyManager::new(Arc::new(EventQueue::new()));
        let id = dm.create_service_manager(
            ServiceRegistration::new(Plain::default)
                .provides(|rc| rc as Rc<RefCell<dyn Marker>>),
        );
        assert_eq!(dm.service_state(id), Some(ServiceState::Installed));

        pump(&mut dm);
        assert_eq!(dm.service_state(id), Some(ServiceState::Active));
        assert_eq!(dm.start_count(id), Some(1));
        assert_eq!(dm.started_services::<dyn Marker>().len(), 1);
    }

    #[test]
    fn consumer_waits_for_its_required_provider() {
        let mut dm = DependencyManager::new(Arc::new(EventQueue::new()));
        let consumer = dm.create_service_manager(consumer_registration(true));
        pump(&mut dm);
        assert_eq!(dm.service_state(consumer), Some(ServiceState::Installed));

        let provider = dm.create_service_manager(
            ServiceRegistration::new(Plain::default)
                .provides(|rc| rc as Rc<RefCell<dyn Marker>>),
        );
        pump(&mut dm);
        assert_eq!(dm.service_state(provider), Some(ServiceState::Active));
        assert_eq!(dm.service_state(consumer), Some(ServiceState::Active));
    }

    #[test]
    fn provider_stop_cascades_to_required_consumers() {
        let mut dm = DependencyManager::new(Arc::new(EventQueue::new()));
        let provider = dm.create_service_manager(
            ServiceRegistration::new(Plain::default)
                .provides(|rc| rc as Rc<RefCell<dyn Marker>>),
        );
        let consumer = dm.create_service_manager(consumer_registration(true));
        pump(&mut dm);
        assert_eq!(dm.service_state(consumer), Some(ServiceState::Active));

        dm.queue.push_event(ServiceId::FRAMEWORK, StopServiceEvent { service: provider });
        pump(&mut dm);
        assert_eq!(dm.service_state(provider), Some(ServiceState::Installed));
        assert_eq!(dm.service_state(consumer), Some(ServiceState::Installed));

        // The provider coming back restarts the consumer.
        dm.queue.push_event(ServiceId::FRAMEWORK, StartServiceEvent { service: provider });
        pump(&mut dm);
        assert_eq!(dm.service_state(consumer), Some(ServiceState::Active));
        assert_eq!(dm.start_count(consumer), Some(2));
    }

    #[test]
    fn optional_consumer_stays_active_when_the_provider_leaves() {
        let mut dm = DependencyManager::new(Arc::new(EventQueue::new()));
        let provider = dm.create_service_manager(
            ServiceRegistration::new(Plain::default)
                .provides(|rc| rc as Rc<RefCell<dyn Marker>>),
        );
        let consumer = dm.create_service_manager(consumer_registration(false));
        pump(&mut dm);
        assert_eq!(dm.service_state(consumer), Some(ServiceState::Active));

        dm.queue.push_event(ServiceId::FRAMEWORK, StopServiceEvent { service: provider });
        pump(&mut dm);
        assert_eq!(dm.service_state(provider), Some(ServiceState::Installed));
        assert_eq!(dm.service_state(consumer), Some(ServiceState::Active));
    }

    #[test]
    fn remove_unregisters_an_installed_service() {
        let mut dm = DependencyManager::new(Arc::new(EventQueue::new()));
        let id = dm.create_service_manager(
            ServiceRegistration::new(Plain::default)
                .provides(|rc| rc as Rc<RefCell<dyn Marker>>),
        );
        pump(&mut dm);
        assert_eq!(dm.service_count(), 1);

        dm.queue.push_event(ServiceId::FRAMEWORK, StopServiceEvent { service: id });
        dm.queue.push_prioritized_event(
            ServiceId::FRAMEWORK,
            INTERNAL_EVENT_PRIORITY + 11,
            RemoveServiceEvent { service: id },
        );
        pump(&mut dm);
        assert_eq!(dm.service_count(), 0);
        assert!(dm.all_services_of_type::<dyn Marker>().is_empty());
    }
}
