use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Process-local service identity.
///
/// Allocated from a single process-wide counter; monotonic and never reused.
/// Id 0 is reserved for the framework itself (events it originates carry it).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceId(pub u64);

impl ServiceId {
    /// Originator id used by events the runtime pushes on its own behalf.
    pub const FRAMEWORK: ServiceId = ServiceId(0);

    pub fn is_framework(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "svc-{}", self.0)
    }
}

/// Globally unique 128-bit service identity, allocated with the service and
/// deallocated with it. Stable for the service's whole lifetime.
pub type ServiceGid = Uuid;

static SERVICE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate the next process-local service id.
///
/// Relaxed ordering is enough: callers only need uniqueness and monotonicity
/// of the returned values, not synchronization with other memory.
pub fn next_service_id() -> ServiceId {
    ServiceId(SERVICE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Immutable snapshot of a service's identity, handed to dependency hooks so
/// a consumer can tell which provider instance was injected or removed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceRef {
    pub id: ServiceId,
    pub gid: ServiceGid,
    pub name: &'static str,
    pub priority: u64,
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ids_are_unique_and_monotonic() {
        let a = next_service_id();
        let b = next_service_id();
        let c = next_service_id();

        assert!(a.0 < b.0);
        assert!(b.0 < c.0);
    }

    #[test]
    fn framework_id_is_reserved() {
        assert!(ServiceId::FRAMEWORK.is_framework());
        assert!(!next_service_id().is_framework());
    }
}
