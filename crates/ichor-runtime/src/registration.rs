//! Service author surface: the [`Service`] trait and the registration builder.
//!
//! Registration erases the concrete service type behind `Send` closures so a
//! prepared [`ServiceRegistration`] can ride an event onto the dispatch
//! thread, where the service is actually constructed. Interface provision is
//! a pointer-with-type-tag handshake: per interface, a caster closure turns
//! the concrete service cell into an `Rc<RefCell<dyn Interface>>` boxed as
//! `dyn Any`, and the consumer's hook downcasts it back by the same tag.

use crate::context::ServiceContext;
use ichor_types::{InterfaceId, Properties, ServiceRef, StartError};
use std::any::{Any, type_name};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;

/// Default service priority; handlers of equal-priority services run in
/// registration order.
pub const DEFAULT_SERVICE_PRIORITY: u64 = 1000;

/// Future driven inside a lifecycle generator when a hook suspends.
pub type ServiceFuture = Pin<Box<dyn Future<Output = Result<(), StartError>>>>;

/// Result of a start or stop hook.
pub enum StartOutcome {
    /// Completed synchronously with success.
    Ok,
    /// Completed synchronously with failure.
    Err(StartError),
    /// The hook needs to suspend; the runtime awaits the future across
    /// dispatch ticks.
    Pending(ServiceFuture),
}

impl StartOutcome {
    pub fn pending(fut: impl Future<Output = Result<(), StartError>> + 'static) -> Self {
        Self::Pending(Box::pin(fut))
    }
}

impl From<Result<(), StartError>> for StartOutcome {
    fn from(result: Result<(), StartError>) -> Self {
        match result {
            Ok(()) => Self::Ok,
            Err(error) => Self::Err(error),
        }
    }
}

/// A user-defined long-lived unit managed by the runtime.
///
/// `start` runs exactly once per `Installed -> Starting` transition, `stop`
/// exactly once per `Uninjecting -> Stopping` transition; the runtime's state
/// machine forbids re-entry. Both default to synchronous success.
pub trait Service: 'static {
    fn start(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        StartOutcome::Ok
    }

    fn stop(&mut self, _ctx: &ServiceContext) -> StartOutcome {
        StartOutcome::Ok
    }
}

/// The type-erased service instance: `Rc<RefCell<S>>` behind `dyn Any`.
pub(crate) type ServiceCell = Rc<dyn Any>;

pub(crate) type InterfaceCaster = Box<dyn Fn(&ServiceCell) -> Box<dyn Any> + Send>;
pub(crate) type DependencyHookFn = dyn Fn(&ServiceCell, Box<dyn Any>, &ServiceRef);
pub(crate) type BoxedDependencyHook = Box<dyn Fn(&ServiceCell, Box<dyn Any>, &ServiceRef) + Send>;
pub(crate) type LifecycleHookFn = dyn Fn(&ServiceCell, &ServiceContext) -> StartOutcome;

/// Recover the concrete service from the erased cell.
pub(crate) fn service_downcast<S: Service>(cell: &ServiceCell) -> Rc<RefCell<S>> {
    cell.clone()
        .downcast::<RefCell<S>>()
        .unwrap_or_else(|_| panic!("service cell does not hold {}", type_name::<S>()))
}

pub(crate) struct ProvidedSpec {
    pub interface: InterfaceId,
    pub name: &'static str,
    pub caster: InterfaceCaster,
}

pub(crate) struct DependencySpec {
    pub interface: InterfaceId,
    pub name: &'static str,
    pub required: bool,
    pub add: BoxedDependencyHook,
    pub remove: BoxedDependencyHook,
}

/// Builder describing a service to be constructed and wired by the manager.
pub struct ServiceRegistration<S: Service> {
    pub(crate) factory: Box<dyn FnOnce() -> S + Send>,
    pub(crate) properties: Properties,
    pub(crate) priority: u64,
    pub(crate) provided: Vec<ProvidedSpec>,
    pub(crate) dependencies: Vec<DependencySpec>,
}

impl<S: Service> ServiceRegistration<S> {
    pub fn new(factory: impl FnOnce() -> S + Send + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            properties: Properties::new(),
            priority: DEFAULT_SERVICE_PRIORITY,
            provided: Vec::new(),
            dependencies: Vec::new(),
        }
    }

    /// Publish interface `I` (typically `dyn SomeTrait`), with `cast`
    /// producing the trait-object view of the concrete service. Registering
    /// the same interface twice on one service aborts.
    pub fn provides<I>(
        mut self,
        cast: impl Fn(Rc<RefCell<S>>) -> Rc<RefCell<I>> + Send + 'static,
    ) -> Self
    where
        I: ?Sized + 'static,
    {
        let interface = InterfaceId::of::<I>();
        if self.provided.iter().any(|p| p.interface == interface) {
            panic!("interface {} provided twice", type_name::<I>());
        }
        let caster: InterfaceCaster = Box::new(move |cell| {
            let concrete = service_downcast::<S>(cell);
            Box::new(cast(concrete)) as Box<dyn Any>
        });
        self.provided.push(ProvidedSpec {
            interface,
            name: type_name::<I>(),
            caster,
        });
        self
    }

    /// Declare a required dependency on interface `I`. The service cannot
    /// become active until at least one provider of `I` is active.
    pub fn requires<I, A, R>(self, add: A, remove: R) -> Self
    where
        I: ?Sized + 'static,
        A: Fn(&mut S, Rc<RefCell<I>>, &ServiceRef) + Send + 'static,
        R: Fn(&mut S, Rc<RefCell<I>>, &ServiceRef) + Send + 'static,
    {
        self.dependency(true, add, remove)
    }

    /// Declare an optional dependency on interface `I`. The service runs
    /// regardless, and is notified of every matching provider add/remove.
    pub fn optional<I, A, R>(self, add: A, remove: R) -> Self
    where
        I: ?Sized + 'static,
        A: Fn(&mut S, Rc<RefCell<I>>, &ServiceRef) + Send + 'static,
        R: Fn(&mut S, Rc<RefCell<I>>, &ServiceRef) + Send + 'static,
    {
        self.dependency(false, add, remove)
    }

    fn dependency<I, A, R>(mut self, required: bool, add: A, remove: R) -> Self
    where
        I: ?Sized + 'static,
        A: Fn(&mut S, Rc<RefCell<I>>, &ServiceRef) + Send + 'static,
        R: Fn(&mut S, Rc<RefCell<I>>, &ServiceRef) + Send + 'static,
    {
        let interface = InterfaceId::of::<I>();
        if self.dependencies.iter().any(|d| d.interface == interface) {
            panic!(
                "interface {} declared twice as a dependency",
                type_name::<I>()
            );
        }
        self.dependencies.push(DependencySpec {
            interface,
            name: type_name::<I>(),
            required,
            add: erase_hook::<S, I, A>(add),
            remove: erase_hook::<S, I, R>(remove),
        });
        self
    }

    pub fn with_properties(mut self, properties: Properties) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_priority(mut self, priority: u64) -> Self {
        self.priority = priority;
        self
    }
}

fn erase_hook<S, I, H>(hook: H) -> BoxedDependencyHook
where
    S: Service,
    I: ?Sized + 'static,
    H: Fn(&mut S, Rc<RefCell<I>>, &ServiceRef) + Send + 'static,
{
    Box::new(move |cell, injected, provider| {
        let concrete = service_downcast::<S>(cell);
        let interface = match injected.downcast::<Rc<RefCell<I>>>() {
            Ok(boxed) => *boxed,
            Err(_) => panic!(
                "injected handle does not carry {}; interface tag mismatch",
                type_name::<I>()
            ),
        };
        hook(&mut concrete.borrow_mut(), interface, provider);
    })
}
