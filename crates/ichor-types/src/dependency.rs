use crate::interface::InterfaceId;
use crate::service_id::ServiceId;

/// One declared dependency slot of a service.
///
/// `required = true` means the service cannot be active until at least one
/// provider of the interface is active. `required = false` means the service
/// runs regardless but is notified for every add/remove of a matching
/// provider. Satisfaction is tracked as the set of provider ids currently
/// injected into this slot.
#[derive(Clone, Debug)]
pub struct Dependency {
    pub interface: InterfaceId,
    pub interface_name: &'static str,
    pub required: bool,
    providers: Vec<ServiceId>,
}

impl Dependency {
    pub fn new(interface: InterfaceId, interface_name: &'static str, required: bool) -> Self {
        Self {
            interface,
            interface_name,
            required,
            providers: Vec::new(),
        }
    }

    pub fn satisfied(&self) -> bool {
        !self.providers.is_empty()
    }

    pub fn providers(&self) -> &[ServiceId] {
        &self.providers
    }

    pub fn holds(&self, provider: ServiceId) -> bool {
        self.providers.contains(&provider)
    }

    /// Record an injected provider. Idempotent per provider.
    pub fn mark_online(&mut self, provider: ServiceId) {
        if !self.providers.contains(&provider) {
            self.providers.push(provider);
        }
    }

    /// Forget an injected provider; returns whether it was present.
    pub fn mark_offline(&mut self, provider: ServiceId) -> bool {
        let before = self.providers.len();
        self.providers.retain(|p| *p != provider);
        self.providers.len() != before
    }
}

/// Ordered list of a service's declared dependency slots.
#[derive(Clone, Debug, Default)]
pub struct DependencyInfo {
    slots: Vec<Dependency>,
}

impl DependencyInfo {
    /// Shared representation for services that declare no dependencies.
    /// Allocation-free so the zero-dependency fast path stays cheap.
    pub const fn empty() -> Self {
        Self { slots: Vec::new() }
    }

    /// Build from declarations. Declaring the same interface twice on one
    /// service is a programming error and aborts.
    pub fn new(slots: Vec<Dependency>) -> Self {
        for (i, slot) in slots.iter().enumerate() {
            if slots[..i].iter().any(|s| s.interface == slot.interface) {
                panic!(
                    "interface {} declared twice as a dependency",
                    slot.interface_name
                );
            }
        }
        Self { slots }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[Dependency] {
        &self.slots
    }

    pub fn slot(&self, index: usize) -> &Dependency {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut Dependency {
        &mut self.slots[index]
    }

    /// Index of the slot declared for `interface`, if any.
    pub fn slot_for(&self, interface: InterfaceId) -> Option<usize> {
        self.slots.iter().position(|s| s.interface == interface)
    }

    /// Whether every `required` slot currently holds at least one provider.
    /// Trivially true for the zero-dependency fast path.
    pub fn all_required_satisfied(&self) -> bool {
        self.slots.is_empty() || self.slots.iter().all(|s| !s.required || s.satisfied())
    }

    pub fn declares(&self, interface: InterfaceId) -> bool {
        self.slot_for(interface).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(tag: u64) -> InterfaceId {
        InterfaceId(tag)
    }

    #[test]
    fn required_satisfaction_tracks_providers() {
        let mut info = DependencyInfo::new(vec![
            Dependency::new(iface(1), "dyn A", true),
            Dependency::new(iface(2), "dyn B", false),
        ]);
        assert!(!info.all_required_satisfied());

        info.slot_mut(0).mark_online(ServiceId(7));
        assert!(info.all_required_satisfied());

        // A second provider on the same slot keeps it satisfied after one leaves.
        info.slot_mut(0).mark_online(ServiceId(8));
        assert!(info.slot_mut(0).mark_offline(ServiceId(7)));
        assert!(info.all_required_satisfied());

        assert!(info.slot_mut(0).mark_offline(ServiceId(8)));
        assert!(!info.all_required_satisfied());
    }

    #[test]
    fn optional_slots_never_block_satisfaction() {
        let info = DependencyInfo::new(vec![Dependency::new(iface(3), "dyn C", false)]);
        assert!(info.all_required_satisfied());
    }

    #[test]
    fn mark_online_is_idempotent() {
        let mut slot = Dependency::new(iface(1), "dyn A", true);
        slot.mark_online(ServiceId(4));
        slot.mark_online(ServiceId(4));
        assert_eq!(slot.providers().len(), 1);
        assert!(!slot.mark_offline(ServiceId(5)));
    }

    #[test]
    fn empty_info_is_always_satisfied() {
        assert!(DependencyInfo::empty().all_required_satisfied());
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn duplicate_interface_declaration_aborts() {
        DependencyInfo::new(vec![
            Dependency::new(iface(1), "dyn A", true),
            Dependency::new(iface(1), "dyn A", false),
        ]);
    }
}
