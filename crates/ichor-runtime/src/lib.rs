pub mod context;
pub mod events;
pub mod generator;
pub mod lifecycle;
pub mod manager;
pub mod queue;
pub mod registration;
pub mod registry;

pub use context::ServiceContext;
pub use events::{
    ContinueServiceEvent, DependencyOfflineEvent, DependencyOnlineEvent, InsertServiceEvent,
    QuitEvent, RemoveServiceEvent, RunFunctionEvent, StartServiceEvent, StartServiceFailedEvent,
    StopServiceEvent,
};
pub use generator::{AsyncGenerator, Driven, GeneratorState, Resumed, Yield, drive};
pub use manager::{DependencyManager, ManagerHandle};
pub use queue::{EventQueue, capture_sigint, request_shutdown};
pub use registration::{DEFAULT_SERVICE_PRIORITY, Service, ServiceRegistration, StartOutcome};
pub use registry::{
    EventHandler, EventHandlerRegistration, EventInterceptor, EventInterceptorRegistration,
    EventRegistries,
};
