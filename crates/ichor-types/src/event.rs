use crate::interface::EventTypeId;
use crate::service_id::ServiceId;
use std::any::Any;
use std::fmt;

/// Queue-assigned monotonic event id. Event equality is by id.
pub type EventId = u64;

/// Dispatch priority; lower values dispatch earlier.
pub type Priority = u64;

/// Priority used by framework lifecycle events (start, stop, remove, quit).
/// It is also the default priority for plain pushes: user events and
/// lifecycle events interleave in push order unless explicitly prioritized.
pub const INTERNAL_EVENT_PRIORITY: Priority = 1000;

/// Default priority for `push_event` without an explicit priority.
pub const DEFAULT_EVENT_PRIORITY: Priority = INTERNAL_EVENT_PRIORITY;

/// Width of the reserved escalation band
/// `(INTERNAL_EVENT_PRIORITY, INTERNAL_EVENT_PRIORITY + ESCALATION_RANGE]`
/// used by internal cascade re-pushes.
pub const ESCALATION_RANGE: Priority = 32;

/// A dispatchable event payload.
///
/// Events are immutable value types owned by the queue until dispatch
/// completes. They must be `Send` because any thread may push; handlers only
/// ever see them on the dispatch thread.
pub trait AnyEvent: Any + Send + fmt::Debug {
    /// Stable type tag used for handler and interceptor routing.
    fn event_type(&self) -> EventTypeId;

    /// Human-readable event name for logs.
    fn name(&self) -> &'static str;
}

/// An event as it lives in the queue: payload plus dispatch metadata.
#[derive(Debug)]
pub struct EventEnvelope {
    id: EventId,
    originating: ServiceId,
    priority: Priority,
    payload: Box<dyn AnyEvent>,
}

impl EventEnvelope {
    pub fn new(
        id: EventId,
        originating: ServiceId,
        priority: Priority,
        payload: Box<dyn AnyEvent>,
    ) -> Self {
        Self {
            id,
            originating,
            priority,
            payload,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn originating_service(&self) -> ServiceId {
        self.originating
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn event_type(&self) -> EventTypeId {
        self.payload.event_type()
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }

    pub fn payload(&self) -> &dyn AnyEvent {
        self.payload.as_ref()
    }

    /// Borrow the payload as a concrete event type.
    pub fn downcast_ref<E: AnyEvent>(&self) -> Option<&E> {
        (self.payload.as_ref() as &dyn Any).downcast_ref::<E>()
    }
}

impl PartialEq for EventEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventEnvelope {}
