use thiserror::Error;

/// Failure returned from a service's start or stop hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum StartError {
    /// The hook itself failed.
    #[error("service start hook failed")]
    Failed,
    /// A dependency the hook needs was not available.
    #[error("required dependency missing")]
    DependencyMissing,
}

/// Send failures surfaced by transport services.
///
/// Transports live outside the core; this is the error vocabulary they share
/// so consumers do not need per-transport error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("outbound queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
    #[error("unknown send failure")]
    Unknown,
}
