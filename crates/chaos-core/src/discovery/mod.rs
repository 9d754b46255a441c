mod lease;
mod node;

pub use lease::{Lease, LeaseState};
pub use node::{NodeId, ServiceDescriptor, DEFAULT_VERSION};
