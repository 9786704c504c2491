use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::type_name;
use std::fmt;

/// Stable 64-bit hash of a nominal type name.
///
/// Computed as the first 8 bytes (little-endian) of `SHA-256(type_name)`, so
/// the value is identical across builds and platforms for the same nominal
/// name. Two distinct types hashing to the same id within one process is a
/// programming error, not a recoverable condition.
fn stable_type_hash(name: &str) -> u64 {
    let digest: [u8; 32] = Sha256::digest(name.as_bytes()).into();
    u64::from_le_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}

/// Identifies a polymorphic capability (an interface trait) a service
/// publishes or consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InterfaceId(pub u64);

impl InterfaceId {
    /// Id for interface type `I` (typically `dyn SomeTrait`).
    pub fn of<I: ?Sized + 'static>() -> Self {
        Self(stable_type_hash(type_name::<I>()))
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iface({:016x})", self.0)
    }
}

/// Identifies an event type for handler and interceptor routing.
///
/// Same construction as [`InterfaceId`]; kept as a separate type so the two
/// id spaces cannot be mixed up at call sites.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTypeId(pub u64);

impl EventTypeId {
    /// Matches every event type. Only meaningful for interceptors.
    pub const WILDCARD: EventTypeId = EventTypeId(0);

    pub fn of<E: ?Sized + 'static>() -> Self {
        Self(stable_type_hash(type_name::<E>()))
    }
}

impl fmt::Display for EventTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event({:016x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    trait Alpha {}
    trait Beta {}

    #[test]
    fn ids_are_stable_per_type() {
        assert_eq!(InterfaceId::of::<dyn Alpha>(), InterfaceId::of::<dyn Alpha>());
        assert_eq!(EventTypeId::of::<String>(), EventTypeId::of::<String>());
    }

    #[test]
    fn distinct_types_get_distinct_ids() {
        assert_ne!(InterfaceId::of::<dyn Alpha>(), InterfaceId::of::<dyn Beta>());
        assert_ne!(
            EventTypeId::of::<String>().0,
            EventTypeId::WILDCARD.0,
            "a real event type must never collide with the wildcard"
        );
    }
}
