//! Framework event types.
//!
//! These ride the same queue as user events. Lifecycle events are pushed at
//! [`INTERNAL_EVENT_PRIORITY`](ichor_types::INTERNAL_EVENT_PRIORITY); cascade
//! re-pushes use the escalation band above it.

use crate::manager::DependencyManager;
use ichor_types::{AnyEvent, EventId, EventTypeId, ServiceId, StartError};
use std::cell::RefCell;
use std::fmt;

macro_rules! impl_any_event {
    ($ty:ty) => {
        impl AnyEvent for $ty {
            fn event_type(&self) -> EventTypeId {
                EventTypeId::of::<$ty>()
            }

            fn name(&self) -> &'static str {
                stringify!($ty)
            }
        }
    };
}

/// Ask the runtime to wind down: stop all services and leave the loop.
#[derive(Debug)]
pub struct QuitEvent;
impl_any_event!(QuitEvent);

/// Begin the start transition for a registered service.
#[derive(Debug)]
pub struct StartServiceEvent {
    pub service: ServiceId,
}
impl_any_event!(StartServiceEvent);

/// Begin the stop transition for a service.
#[derive(Debug)]
pub struct StopServiceEvent {
    pub service: ServiceId,
}
impl_any_event!(StopServiceEvent);

/// Stop (if needed) and unregister a service entirely.
#[derive(Debug)]
pub struct RemoveServiceEvent {
    pub service: ServiceId,
}
impl_any_event!(RemoveServiceEvent);

/// A provider became active; fan its interfaces out to interested consumers.
#[derive(Debug)]
pub struct DependencyOnlineEvent {
    pub provider: ServiceId,
}
impl_any_event!(DependencyOnlineEvent);

/// A provider is going away; withdraw its injections from consumers.
#[derive(Debug)]
pub struct DependencyOfflineEvent {
    pub provider: ServiceId,
}
impl_any_event!(DependencyOfflineEvent);

/// Re-enter generators suspended while dispatching the named event.
/// Pushed by the waker a suspended generator's inner future holds.
#[derive(Debug)]
pub struct ContinueServiceEvent {
    pub resumes: EventId,
}
impl_any_event!(ContinueServiceEvent);

/// Informational: a service's start hook failed. The service stays registered
/// and may be retried with another [`StartServiceEvent`].
#[derive(Debug)]
pub struct StartServiceFailedEvent {
    pub service: ServiceId,
    pub error: StartError,
}
impl_any_event!(StartServiceFailedEvent);

type ManagerFn = Box<dyn FnOnce(&mut DependencyManager) + Send>;

/// Run a closure on the dispatch thread with mutable access to the manager.
///
/// The closure is taken out of the event on dispatch; the event is immutable
/// to everything else.
pub struct RunFunctionEvent {
    fun: RefCell<Option<ManagerFn>>,
}

impl RunFunctionEvent {
    pub fn new(fun: impl FnOnce(&mut DependencyManager) + Send + 'static) -> Self {
        Self {
            fun: RefCell::new(Some(Box::new(fun))),
        }
    }

    pub(crate) fn take(&self) -> Option<ManagerFn> {
        self.fun.borrow_mut().take()
    }
}

impl fmt::Debug for RunFunctionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunFunctionEvent").finish_non_exhaustive()
    }
}

impl_any_event!(RunFunctionEvent);

/// Deferred service registration, used when a service is created from inside
/// a hook or handler. The install closure runs on the dispatch thread.
pub struct InsertServiceEvent {
    install: RefCell<Option<ManagerFn>>,
}

impl InsertServiceEvent {
    pub fn new(install: impl FnOnce(&mut DependencyManager) + Send + 'static) -> Self {
        Self {
            install: RefCell::new(Some(Box::new(install))),
        }
    }

    pub(crate) fn take(&self) -> Option<ManagerFn> {
        self.install.borrow_mut().take()
    }
}

impl fmt::Debug for InsertServiceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InsertServiceEvent").finish_non_exhaustive()
    }
}

impl_any_event!(InsertServiceEvent);
