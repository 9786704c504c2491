//! Per-service lifecycle management.
//!
//! One [`LifecycleManager`] owns each registered service: its identity,
//! state, properties, published interface casters, declared dependency slots
//! (with the user's add/remove hooks) and the set of dependees currently
//! holding an injection of it. The dependency manager talks to services
//! exclusively through this surface; every operation that may run user code
//! returns an [`AsyncGenerator`] so the dispatcher can park it mid-flight.

use crate::context::ServiceContext;
use crate::events::StartServiceFailedEvent;
use crate::generator::AsyncGenerator;
use crate::queue::EventQueue;
use crate::registration::{
    DependencyHookFn, LifecycleHookFn, Service, ServiceCell, ServiceRegistration, StartOutcome,
    service_downcast,
};
use crate::registry::EventRegistries;
use ichor_types::{
    Dependency, DependencyInfo, INTERNAL_EVENT_PRIORITY, InterfaceId, Properties, ServiceGid,
    ServiceId, ServiceRef, ServiceState, StartBehaviour, next_service_id,
};
use std::any::{Any, type_name};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

pub(crate) struct ServiceInfo {
    pub id: ServiceId,
    pub gid: ServiceGid,
    pub name: &'static str,
    pub priority: u64,
    pub state: ServiceState,
    /// Start attempts, successful or not. Observable for testing.
    pub start_count: u64,
}

struct ProvidedInterface {
    interface: InterfaceId,
    #[allow(dead_code)]
    name: &'static str,
    caster: Box<dyn Fn(&ServiceCell) -> Box<dyn Any> + Send>,
}

struct SlotHooks {
    add: Rc<DependencyHookFn>,
    remove: Rc<DependencyHookFn>,
}

pub struct LifecycleManager {
    pub(crate) info: ServiceInfo,
    properties: Rc<RefCell<Properties>>,
    service: ServiceCell,
    start_hook: Rc<LifecycleHookFn>,
    stop_hook: Rc<LifecycleHookFn>,
    provided: Vec<ProvidedInterface>,
    pub(crate) dependencies: DependencyInfo,
    /// Parallel to `dependencies` slots; split out because hooks are runtime
    /// closures while the slot list is plain data.
    hooks: Vec<SlotHooks>,
    /// Consumers currently holding an injection of this service.
    pub(crate) dependees: BTreeSet<ServiceId>,
}

impl LifecycleManager {
    pub(crate) fn new<S: Service>(registration: ServiceRegistration<S>) -> Self {
        let service: Rc<RefCell<S>> = Rc::new(RefCell::new((registration.factory)()));
        let cell: ServiceCell = service;

        let start_hook: Rc<LifecycleHookFn> = Rc::new(|cell: &ServiceCell, ctx: &ServiceContext| {
            service_downcast::<S>(cell).borrow_mut().start(ctx)
        });
        let stop_hook: Rc<LifecycleHookFn> = Rc::new(|cell: &ServiceCell, ctx: &ServiceContext| {
            service_downcast::<S>(cell).borrow_mut().stop(ctx)
        });

        let mut slots = Vec::with_capacity(registration.dependencies.len());
        let mut hooks = Vec::with_capacity(registration.dependencies.len());
        for spec in registration.dependencies {
            slots.push(Dependency::new(spec.interface, spec.name, spec.required));
            let add: Box<DependencyHookFn> = spec.add;
            let remove: Box<DependencyHookFn> = spec.remove;
            hooks.push(SlotHooks {
                add: Rc::from(add),
                remove: Rc::from(remove),
            });
        }
        let dependencies = if slots.is_empty() {
            // Zero-dependency fast path: no satisfaction tracking at all.
            DependencyInfo::empty()
        } else {
            DependencyInfo::new(slots)
        };

        let provided = registration
            .provided
            .into_iter()
            .map(|p| ProvidedInterface {
                interface: p.interface,
                name: p.name,
                caster: p.caster,
            })
            .collect();

        Self {
            info: ServiceInfo {
                id: next_service_id(),
                gid: Uuid::new_v4(),
                name: type_name::<S>(),
                priority: registration.priority,
                state: ServiceState::Installed,
                start_count: 0,
            },
            properties: Rc::new(RefCell::new(registration.properties)),
            service: cell,
            start_hook,
            stop_hook,
            provided,
            dependencies,
            hooks,
            dependees: BTreeSet::new(),
        }
    }

    pub fn service_id(&self) -> ServiceId {
        self.info.id
    }

    pub fn state(&self) -> ServiceState {
        self.info.state
    }

    pub fn priority(&self) -> u64 {
        self.info.priority
    }

    pub fn service_ref(&self) -> ServiceRef {
        ServiceRef {
            id: self.info.id,
            gid: self.info.gid,
            name: self.info.name,
            priority: self.info.priority,
        }
    }

    pub(crate) fn provided_interfaces(&self) -> impl Iterator<Item = InterfaceId> + '_ {
        self.provided.iter().map(|p| p.interface)
    }

    pub fn provides(&self, interface: InterfaceId) -> bool {
        self.provided.iter().any(|p| p.interface == interface)
    }

    /// Produce a fresh type-tagged handle of `interface` over this service.
    pub(crate) fn make_interface(&self, interface: InterfaceId) -> Option<Box<dyn Any>> {
        self.provided
            .iter()
            .find(|p| p.interface == interface)
            .map(|p| (p.caster)(&self.service))
    }

    /// A consumer wants this service injected: produce the tagged handle and
    /// record the dependee edge.
    pub(crate) fn insert_self_into(
        &mut self,
        interface: InterfaceId,
        consumer: ServiceId,
    ) -> Option<Box<dyn Any>> {
        let injected = self.make_interface(interface)?;
        self.dependees.insert(consumer);
        Some(injected)
    }

    /// Inverse of [`Self::insert_self_into`]: produce the handle the remove
    /// hook gets and forget the dependee edge.
    pub(crate) fn remove_self_from(
        &mut self,
        interface: InterfaceId,
        consumer: ServiceId,
    ) -> Option<Box<dyn Any>> {
        let injected = self.make_interface(interface)?;
        self.dependees.remove(&consumer);
        Some(injected)
    }

    pub(crate) fn context(
        &self,
        queue: &Arc<EventQueue>,
        registries: &Rc<RefCell<EventRegistries>>,
    ) -> ServiceContext {
        ServiceContext {
            id: self.info.id,
            gid: self.info.gid,
            name: self.info.name,
            priority: self.info.priority,
            service: self.service.clone(),
            properties: self.properties.clone(),
            queue: queue.clone(),
            registries: registries.clone(),
        }
    }

    fn transition(&mut self, next: ServiceState) {
        if !self.info.state.can_transition_to(next) {
            // Reaching an illegal transition is a framework bug, not a
            // recoverable condition.
            panic!(
                "illegal state transition {} -> {next} for {}",
                self.info.state, self.info.name
            );
        }
        tracing::trace!(
            service = %self.info.id,
            name = self.info.name,
            from = %self.info.state,
            to = %next,
            "state transition"
        );
        self.info.state = next;
    }

    pub(crate) fn force_uninstalled(&mut self) {
        if self.info.state == ServiceState::Installed {
            self.transition(ServiceState::Uninstalled);
        }
    }

    /// Advance `Injecting -> Active`; rejected from any other state.
    pub fn set_injected(&mut self) -> bool {
        if self.info.state != ServiceState::Injecting {
            return false;
        }
        self.transition(ServiceState::Active);
        true
    }

    /// Advance `Active -> Uninjecting`; rejected from any other state.
    pub fn set_uninjected(&mut self) -> bool {
        if self.info.state != ServiceState::Active {
            return false;
        }
        self.transition(ServiceState::Uninjecting);
        true
    }

    /// The start path shared by [`Self::start`] and [`Self::dependency_online`].
    ///
    /// RefCell borrows are scoped so none is held across an await: the user's
    /// start future may park for many dispatch ticks.
    async fn run_start(
        this: Rc<RefCell<LifecycleManager>>,
        queue: Arc<EventQueue>,
        registries: Rc<RefCell<EventRegistries>>,
    ) -> StartBehaviour {
        let (hook, cell, ctx) = {
            let mut mgr = this.borrow_mut();
            if mgr.info.state != ServiceState::Installed
                || !mgr.dependencies.all_required_satisfied()
            {
                return StartBehaviour::Done;
            }
            mgr.transition(ServiceState::Starting);
            mgr.info.start_count += 1;
            (
                mgr.start_hook.clone(),
                mgr.service.clone(),
                mgr.context(&queue, &registries),
            )
        };

        let outcome = hook(&cell, &ctx);
        let result = match outcome {
            StartOutcome::Ok => Ok(()),
            StartOutcome::Err(error) => Err(error),
            StartOutcome::Pending(future) => future.await,
        };

        let mut mgr = this.borrow_mut();
        match result {
            Ok(()) => {
                mgr.transition(ServiceState::Injecting);
                StartBehaviour::Started
            }
            Err(error) => {
                tracing::debug!(
                    service = %mgr.info.id,
                    name = mgr.info.name,
                    %error,
                    "start failed; service returns to installed"
                );
                mgr.transition(ServiceState::Installed);
                let id = mgr.info.id;
                drop(mgr);
                queue.push_prioritized_event(
                    ServiceId::FRAMEWORK,
                    INTERNAL_EVENT_PRIORITY,
                    StartServiceFailedEvent { service: id, error },
                );
                StartBehaviour::Done
            }
        }
    }

    /// Drive the user's start hook through `Installed -> Starting ->
    /// (Injecting | Installed)`. A no-op generator when the service is not
    /// startable right now.
    pub(crate) fn start(
        this: Rc<RefCell<LifecycleManager>>,
        queue: Arc<EventQueue>,
        registries: Rc<RefCell<EventRegistries>>,
    ) -> AsyncGenerator<StartBehaviour> {
        AsyncGenerator::new(move |_yield| Self::run_start(this, queue, registries))
    }

    /// Drive the user's stop hook through `Uninjecting -> Stopping ->
    /// Installed`. A stop failure is logged and the service is forced back to
    /// installed anyway.
    pub(crate) fn stop(
        this: Rc<RefCell<LifecycleManager>>,
        queue: Arc<EventQueue>,
        registries: Rc<RefCell<EventRegistries>>,
    ) -> AsyncGenerator<StartBehaviour> {
        AsyncGenerator::new(move |_yield| async move {
            let (hook, cell, ctx) = {
                let mut mgr = this.borrow_mut();
                if mgr.info.state != ServiceState::Uninjecting {
                    return StartBehaviour::Done;
                }
                mgr.transition(ServiceState::Stopping);
                (
                    mgr.stop_hook.clone(),
                    mgr.service.clone(),
                    mgr.context(&queue, &registries),
                )
            };

            let outcome = hook(&cell, &ctx);
            let result = match outcome {
                StartOutcome::Ok => Ok(()),
                StartOutcome::Err(error) => Err(error),
                StartOutcome::Pending(future) => future.await,
            };

            let mut mgr = this.borrow_mut();
            if let Err(error) = result {
                tracing::error!(
                    service = %mgr.info.id,
                    name = mgr.info.name,
                    %error,
                    "stop failed; forcing service back to installed"
                );
            }
            mgr.transition(ServiceState::Installed);
            StartBehaviour::Started
        })
    }

    /// A provider of one of this service's declared interfaces became active:
    /// inject it, and if that completed the required set, initiate start.
    pub(crate) fn dependency_online(
        consumer: Rc<RefCell<LifecycleManager>>,
        provider: Rc<RefCell<LifecycleManager>>,
        interface: InterfaceId,
        queue: Arc<EventQueue>,
        registries: Rc<RefCell<EventRegistries>>,
    ) -> AsyncGenerator<StartBehaviour> {
        AsyncGenerator::new(move |_yield| async move {
            if !wire(&consumer, &provider, interface) {
                return StartBehaviour::Done;
            }
            Self::run_start(consumer, queue, registries).await
        })
    }

    /// A provider is going away: withdraw the injection. Yields `Started`
    /// when the loss leaves a required slot empty and the consumer must stop.
    pub(crate) fn dependency_offline(
        consumer: Rc<RefCell<LifecycleManager>>,
        provider: Rc<RefCell<LifecycleManager>>,
        interface: InterfaceId,
    ) -> AsyncGenerator<StartBehaviour> {
        AsyncGenerator::new(move |_yield| async move {
            if !unwire(&consumer, &provider, interface) {
                return StartBehaviour::Done;
            }
            let mgr = consumer.borrow();
            let must_stop = mgr.info.state == ServiceState::Active
                && !mgr.dependencies.all_required_satisfied();
            if must_stop {
                StartBehaviour::Started
            } else {
                StartBehaviour::Done
            }
        })
    }
}

/// Inject `provider` into `consumer`'s slot for `interface`.
///
/// Records the dependee edge on the provider, marks the slot, and runs the
/// consumer's add hook with a fresh type-tagged handle. Returns false when
/// the consumer has no matching slot or already holds this provider.
pub(crate) fn wire(
    consumer: &Rc<RefCell<LifecycleManager>>,
    provider: &Rc<RefCell<LifecycleManager>>,
    interface: InterfaceId,
) -> bool {
    let provider_ref = provider.borrow().service_ref();
    let (consumer_id, slot_index) = {
        let mgr = consumer.borrow();
        let Some(index) = mgr.dependencies.slot_for(interface) else {
            return false;
        };
        if mgr.dependencies.slot(index).holds(provider_ref.id) {
            return false;
        }
        (mgr.info.id, index)
    };
    let Some(injected) = provider.borrow_mut().insert_self_into(interface, consumer_id) else {
        return false;
    };

    let (cell, hook) = {
        let mut mgr = consumer.borrow_mut();
        mgr.dependencies.slot_mut(slot_index).mark_online(provider_ref.id);
        (mgr.service.clone(), mgr.hooks[slot_index].add.clone())
    };
    tracing::trace!(
        consumer = %consumer_id,
        provider = %provider_ref.id,
        %interface,
        "dependency injected"
    );
    // Hook runs with no manager borrow held; it may push events freely.
    hook(&cell, injected, &provider_ref);
    true
}

/// Withdraw `provider` from `consumer`'s slot for `interface`; the inverse of
/// [`wire`]. Returns false when no injection was present.
pub(crate) fn unwire(
    consumer: &Rc<RefCell<LifecycleManager>>,
    provider: &Rc<RefCell<LifecycleManager>>,
    interface: InterfaceId,
) -> bool {
    let provider_ref = provider.borrow().service_ref();
    let (consumer_id, slot_index) = {
        let mgr = consumer.borrow();
        let Some(index) = mgr.dependencies.slot_for(interface) else {
            return false;
        };
        if !mgr.dependencies.slot(index).holds(provider_ref.id) {
            return false;
        }
        (mgr.info.id, index)
    };
    let Some(injected) = provider.borrow_mut().remove_self_from(interface, consumer_id) else {
        return false;
    };

    let (cell, hook) = {
        let mut mgr = consumer.borrow_mut();
        mgr.dependencies.slot_mut(slot_index).mark_offline(provider_ref.id);
        (mgr.service.clone(), mgr.hooks[slot_index].remove.clone())
    };
    tracing::trace!(
        consumer = %consumer_id,
        provider = %provider_ref.id,
        %interface,
        "dependency withdrawn"
    );
    hook(&cell, injected, &provider_ref);
    true
}
