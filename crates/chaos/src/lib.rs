//! CHAOS - service lifecycle and registration runtime
//!
//! Brings an HTTP service online, publishes it to a registry with a
//! time-bounded lease, keeps the lease alive and tears everything down in a
//! bounded, ordered sequence when asked to stop.

mod runtime;

// Re-export the building blocks for applications that assemble their own controller
pub use chaos_core;
pub use chaos_runtime;

pub use runtime::prelude;
pub use runtime::{Chaos, ChaosBuilder};
