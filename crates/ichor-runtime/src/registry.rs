//! Event handler and interceptor registries.
//!
//! Handlers are stored per event type in ascending service-priority order,
//! stable among equals. The dispatcher always iterates a snapshot, so
//! subscribing or unsubscribing from inside a handler never affects the
//! in-flight event's iteration. Registration returns an owning handle whose
//! drop removes the entry.

use crate::context::ServiceContext;
use crate::generator::AsyncGenerator;
use crate::registration::Service;
use ichor_types::{AnyEvent, EventEnvelope, EventTypeId, IchorBehaviour, ServiceId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

/// Typed event handling, registered through
/// [`ServiceContext::register_event_handler`](crate::context::ServiceContext::register_event_handler).
pub trait EventHandler<E: AnyEvent>: Service {
    fn handle_event(&mut self, event: &E, ctx: &ServiceContext) -> AsyncGenerator<IchorBehaviour>;
}

/// Pre/post interception around every dispatched event matching the filter.
///
/// Returning `false` from `pre_intercept` drops the event: handlers do not
/// run, post-interceptors still do with `processed = false`.
pub trait EventInterceptor: Service {
    fn pre_intercept(&mut self, _event: &EventEnvelope, _ctx: &ServiceContext) -> bool {
        true
    }

    fn post_intercept(&mut self, _event: &EventEnvelope, _processed: bool, _ctx: &ServiceContext) {}
}

pub(crate) type HandlerCallback = Rc<dyn Fn(&EventEnvelope) -> Option<AsyncGenerator<IchorBehaviour>>>;
pub(crate) type PreInterceptFn = Rc<dyn Fn(&EventEnvelope) -> bool>;
pub(crate) type PostInterceptFn = Rc<dyn Fn(&EventEnvelope, bool)>;

#[derive(Clone)]
pub(crate) struct HandlerEntry {
    pub token: u64,
    pub service: ServiceId,
    pub priority: u64,
    /// Only dispatch events originating from this service, when set.
    pub origin_filter: Option<ServiceId>,
    pub callback: HandlerCallback,
}

#[derive(Clone)]
pub(crate) struct InterceptorEntry {
    pub token: u64,
    pub service: ServiceId,
    /// [`EventTypeId::WILDCARD`] matches every event.
    pub filter: EventTypeId,
    pub pre: PreInterceptFn,
    pub post: PostInterceptFn,
}

/// Subscription storage for one dependency manager.
#[derive(Default)]
pub struct EventRegistries {
    handlers: HashMap<EventTypeId, Vec<HandlerEntry>>,
    interceptors: Vec<InterceptorEntry>,
    next_token: u64,
}

impl EventRegistries {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_handler(
        this: &Rc<RefCell<Self>>,
        event_type: EventTypeId,
        service: ServiceId,
        priority: u64,
        origin_filter: Option<ServiceId>,
        callback: HandlerCallback,
    ) -> EventHandlerRegistration {
        let mut reg = this.borrow_mut();
        let token = reg.next_token;
        reg.next_token += 1;
        let list = reg.handlers.entry(event_type).or_default();
        // Ascending priority, stable among equals: insert after the last
        // entry whose priority is not greater than ours.
        let pos = list
            .iter()
            .rposition(|e| e.priority <= priority)
            .map_or(0, |p| p + 1);
        list.insert(
            pos,
            HandlerEntry {
                token,
                service,
                priority,
                origin_filter,
                callback,
            },
        );
        EventHandlerRegistration {
            registries: Rc::downgrade(this),
            event_type,
            token,
        }
    }

    pub(crate) fn insert_interceptor(
        this: &Rc<RefCell<Self>>,
        service: ServiceId,
        filter: EventTypeId,
        pre: PreInterceptFn,
        post: PostInterceptFn,
    ) -> EventInterceptorRegistration {
        let mut reg = this.borrow_mut();
        let token = reg.next_token;
        reg.next_token += 1;
        reg.interceptors.push(InterceptorEntry {
            token,
            service,
            filter,
            pre,
            post,
        });
        EventInterceptorRegistration {
            registries: Rc::downgrade(this),
            token,
        }
    }

    /// Snapshot of the handlers for `event_type`, in invocation order.
    pub(crate) fn handlers_for(&self, event_type: EventTypeId) -> Vec<HandlerEntry> {
        self.handlers.get(&event_type).cloned().unwrap_or_default()
    }

    /// Snapshot of the interceptors matching `event_type`, in registration
    /// order (wildcard entries interleave by registration, not grouped).
    pub(crate) fn interceptors_for(&self, event_type: EventTypeId) -> Vec<InterceptorEntry> {
        self.interceptors
            .iter()
            .filter(|e| e.filter == EventTypeId::WILDCARD || e.filter == event_type)
            .cloned()
            .collect()
    }

    /// Observable handler count for one event type.
    pub fn handler_count(&self, event_type: EventTypeId) -> usize {
        self.handlers.get(&event_type).map_or(0, Vec::len)
    }

    fn remove_handler(&mut self, event_type: EventTypeId, token: u64) {
        if let Some(list) = self.handlers.get_mut(&event_type) {
            list.retain(|e| e.token != token);
            if list.is_empty() {
                self.handlers.remove(&event_type);
            }
        }
    }

    fn remove_interceptor(&mut self, token: u64) {
        self.interceptors.retain(|e| e.token != token);
    }

    /// Drop every subscription owned by `service`; used when the service is
    /// unregistered without its registrations having been dropped first.
    pub(crate) fn drop_service(&mut self, service: ServiceId) {
        self.handlers.retain(|_, list| {
            list.retain(|e| e.service != service);
            !list.is_empty()
        });
        self.interceptors.retain(|e| e.service != service);
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
        self.interceptors.clear();
    }
}

/// Owning handle for an event handler subscription; drop unsubscribes.
#[derive(Debug)]
pub struct EventHandlerRegistration {
    registries: Weak<RefCell<EventRegistries>>,
    event_type: EventTypeId,
    token: u64,
}

impl Drop for EventHandlerRegistration {
    fn drop(&mut self) {
        if let Some(registries) = self.registries.upgrade() {
            registries.borrow_mut().remove_handler(self.event_type, self.token);
        }
    }
}

/// Owning handle for an interceptor subscription; drop unsubscribes.
#[derive(Debug)]
pub struct EventInterceptorRegistration {
    registries: Weak<RefCell<EventRegistries>>,
    token: u64,
}

impl Drop for EventInterceptorRegistration {
    fn drop(&mut self) {
        if let Some(registries) = self.registries.upgrade() {
            registries.borrow_mut().remove_interceptor(self.token);
        }
    }
}
