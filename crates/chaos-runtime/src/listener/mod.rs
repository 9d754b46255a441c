//! Network listeners driven by the lifecycle controller.

mod http;

pub use http::{service_router, HttpListener, ServiceState, UNMATCHED_ROUTE};

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use chaos_core::Result;

/// A bound network listener.
///
/// The controller calls [`bind`](Listener::bind) once, runs
/// [`serve`](Listener::serve) on its own task, and later calls
/// [`shutdown`](Listener::shutdown) from the shutdown sequence.
pub trait Listener: Send + Sync {
    /// Bind the socket and return the local address.
    fn bind<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<SocketAddr>> + Send + 'a>>;

    /// Accept and serve connections until shut down or a fatal error occurs.
    fn serve<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Stop accepting, drain in-flight work for up to `deadline`, then force-close.
    fn shutdown<'a>(
        &'a self,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
