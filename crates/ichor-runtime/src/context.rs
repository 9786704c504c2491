//! The non-owning handle a service uses to talk back to its runtime.
//!
//! A [`ServiceContext`] is scoped to the lifecycle manager that owns the
//! service: it is constructed fresh for each hook or handler invocation and
//! holds only clonable handles (queue, registries, property cell), never a
//! borrow into the manager, so a suspendable hook can capture what it needs.

use crate::events::InsertServiceEvent;
use crate::generator::AsyncGenerator;
use crate::queue::EventQueue;
use crate::registration::{Service, ServiceCell, ServiceRegistration, service_downcast};
use crate::registry::{
    EventHandler, EventHandlerRegistration, EventInterceptor, EventInterceptorRegistration,
    EventRegistries,
};
use ichor_types::{
    AnyEvent, EventEnvelope, EventId, EventTypeId, INTERNAL_EVENT_PRIORITY, IchorBehaviour,
    Priority, Properties, ServiceGid, ServiceId, ServiceRef,
};
use std::cell::{RefCell, RefMut};
use std::rc::Rc;
use std::sync::Arc;

#[derive(Clone)]
pub struct ServiceContext {
    pub(crate) id: ServiceId,
    pub(crate) gid: ServiceGid,
    pub(crate) name: &'static str,
    pub(crate) priority: u64,
    pub(crate) service: ServiceCell,
    pub(crate) properties: Rc<RefCell<Properties>>,
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) registries: Rc<RefCell<EventRegistries>>,
}

impl ServiceContext {
    pub fn service_id(&self) -> ServiceId {
        self.id
    }

    pub fn service_gid(&self) -> ServiceGid {
        self.gid
    }

    pub fn service_name(&self) -> &'static str {
        self.name
    }

    pub fn service_priority(&self) -> u64 {
        self.priority
    }

    pub fn service_ref(&self) -> ServiceRef {
        ServiceRef {
            id: self.id,
            gid: self.gid,
            name: self.name,
            priority: self.priority,
        }
    }

    /// The service's own property map. Mutation is legal here because the
    /// context only ever exists inside the owning service's hooks.
    pub fn properties(&self) -> RefMut<'_, Properties> {
        self.properties.borrow_mut()
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Push an event originating from this service at the default priority.
    pub fn push_event<E: AnyEvent>(&self, payload: E) -> EventId {
        self.queue.push_event(self.id, payload)
    }

    pub fn push_prioritized_event<E: AnyEvent>(&self, priority: Priority, payload: E) -> EventId {
        self.queue.push_prioritized_event(self.id, priority, payload)
    }

    /// Subscribe this service to events of type `E`. The returned handle owns
    /// the subscription; dropping it unsubscribes.
    pub fn register_event_handler<E, S>(&self) -> EventHandlerRegistration
    where
        E: AnyEvent,
        S: Service + EventHandler<E>,
    {
        self.register_handler_entry::<E, S>(None)
    }

    /// Like [`register_event_handler`](Self::register_event_handler), but only
    /// events originating from `origin` are delivered.
    pub fn register_event_handler_for_origin<E, S>(
        &self,
        origin: ServiceId,
    ) -> EventHandlerRegistration
    where
        E: AnyEvent,
        S: Service + EventHandler<E>,
    {
        self.register_handler_entry::<E, S>(Some(origin))
    }

    fn register_handler_entry<E, S>(&self, origin: Option<ServiceId>) -> EventHandlerRegistration
    where
        E: AnyEvent,
        S: Service + EventHandler<E>,
    {
        let service = service_downcast::<S>(&self.service);
        let ctx = self.clone();
        let callback = move |envelope: &EventEnvelope| -> Option<AsyncGenerator<IchorBehaviour>> {
            let event = envelope.downcast_ref::<E>()?;
            Some(service.borrow_mut().handle_event(event, &ctx))
        };
        EventRegistries::insert_handler(
            &self.registries,
            EventTypeId::of::<E>(),
            self.id,
            self.priority,
            origin,
            Rc::new(callback),
        )
    }

    /// Register this service as a pre/post interceptor for `filter`
    /// ([`EventTypeId::WILDCARD`] intercepts everything).
    pub fn register_interceptor<S>(&self, filter: EventTypeId) -> EventInterceptorRegistration
    where
        S: Service + EventInterceptor,
    {
        let service = service_downcast::<S>(&self.service);
        let pre_ctx = self.clone();
        let post_service = service.clone();
        let post_ctx = self.clone();
        EventRegistries::insert_interceptor(
            &self.registries,
            self.id,
            filter,
            Rc::new(move |envelope| service.borrow_mut().pre_intercept(envelope, &pre_ctx)),
            Rc::new(move |envelope, processed| {
                post_service
                    .borrow_mut()
                    .post_intercept(envelope, processed, &post_ctx)
            }),
        )
    }

    /// Register another service from inside a hook or handler. The
    /// construction is deferred onto the dispatch thread via an internal
    /// event, so it is legal at any point during dispatch.
    pub fn create_service<S: Service>(&self, registration: ServiceRegistration<S>) {
        self.queue.push_prioritized_event(
            self.id,
            INTERNAL_EVENT_PRIORITY,
            InsertServiceEvent::new(move |manager| {
                manager.create_service_manager(registration);
            }),
        );
    }
}
