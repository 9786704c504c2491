use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a managed service.
///
/// Legal transitions form a DAG:
///
/// ```text
/// Installed -> Starting -> Injecting -> Active ->
///     Uninjecting -> Stopping -> Installed (-> Uninstalled on destruction)
/// ```
///
/// A failing start or stop transition returns the service to `Installed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    /// Constructed, inactive.
    Installed,
    /// User start hook in progress.
    Starting,
    /// Start succeeded, not yet wired into all dependents.
    Injecting,
    Active,
    /// Leaving active; injections are being withdrawn.
    Uninjecting,
    /// User stop hook in progress.
    Stopping,
    /// Terminal; identity is released.
    Uninstalled,
}

impl ServiceState {
    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(&self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Installed, Starting)
                | (Starting, Injecting)
                | (Starting, Installed)
                | (Injecting, Active)
                | (Injecting, Installed)
                | (Active, Uninjecting)
                | (Uninjecting, Stopping)
                | (Stopping, Installed)
                | (Installed, Uninstalled)
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, ServiceState::Active)
    }

    /// States in which a provider->consumer edge may carry an injection.
    pub fn may_hold_injection(&self) -> bool {
        matches!(self, ServiceState::Active | ServiceState::Uninjecting)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Installed => "Installed",
            Self::Starting => "Starting",
            Self::Injecting => "Injecting",
            Self::Active => "Active",
            Self::Uninjecting => "Uninjecting",
            Self::Stopping => "Stopping",
            Self::Uninstalled => "Uninstalled",
        };
        write!(f, "{s}")
    }
}

/// Result of one lifecycle pass over a service, so the dispatcher can tell
/// whether a follow-up pass (injection, dependency fanout) is required.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartBehaviour {
    /// Nothing further to do for this service.
    Done,
    /// The service changed lifecycle state and needs a follow-up pass.
    Started,
}

/// Result of an event handler generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IchorBehaviour {
    Done,
}

#[cfg(test)]
mod tests {
    use super::ServiceState::*;

    #[test]
    fn forward_path_is_legal() {
        let path = [Installed, Starting, Injecting, Active, Uninjecting, Stopping, Installed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn failure_paths_return_to_installed() {
        assert!(Starting.can_transition_to(Installed));
        assert!(Injecting.can_transition_to(Installed));
    }

    #[test]
    fn illegal_jumps_are_rejected() {
        assert!(!Installed.can_transition_to(Active));
        assert!(!Active.can_transition_to(Installed));
        assert!(!Uninstalled.can_transition_to(Installed));
        assert!(!Active.can_transition_to(Starting));
    }

    #[test]
    fn injection_states() {
        assert!(Active.may_hold_injection());
        assert!(Uninjecting.may_hold_injection());
        assert!(!Injecting.may_hold_injection());
        assert!(!Installed.may_hold_injection());
    }
}
