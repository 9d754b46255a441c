pub mod heartbeat;
pub mod hooks;
pub mod lifecycle;
pub mod listener;
pub mod registry;
pub mod shutdown;
pub mod signals;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use heartbeat::{Heartbeat, HeartbeatConfig};
pub use hooks::{FnHook, LifecycleMetrics, MetricsSnapshot, ShutdownHook};
pub use lifecycle::{LifecycleController, LifecycleHandle, Registration, SHUTDOWN_GRACE};
pub use listener::{service_router, HttpListener, Listener, ServiceState};
pub use registry::{EtcdRegistry, InMemoryRegistry, RegistryClient};
pub use shutdown::ShutdownTrigger;
pub use signals::shutdown_signal;
