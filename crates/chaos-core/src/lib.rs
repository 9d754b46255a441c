pub mod build_info;
pub mod config;
pub mod discovery;
pub mod error;
pub mod lifecycle;

pub use build_info::BuildInfo;
pub use config::ChaosConfig;
pub use discovery::{Lease, LeaseState, NodeId, ServiceDescriptor};
pub use error::{ChaosError, Result};
pub use lifecycle::{LifecycleState, TerminationReason};
