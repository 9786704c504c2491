pub mod dependency;
pub mod error;
pub mod event;
pub mod interface;
pub mod properties;
pub mod service_id;
pub mod state;

pub use dependency::{Dependency, DependencyInfo};
pub use error::{SendError, StartError};
pub use event::{
    AnyEvent, DEFAULT_EVENT_PRIORITY, ESCALATION_RANGE, EventEnvelope, EventId,
    INTERNAL_EVENT_PRIORITY, Priority,
};
pub use interface::{EventTypeId, InterfaceId};
pub use properties::{Properties, PropertyValue};
pub use service_id::{ServiceGid, ServiceId, ServiceRef, next_service_id};
pub use state::{IchorBehaviour, ServiceState, StartBehaviour};
