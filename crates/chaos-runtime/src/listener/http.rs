use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{MatchedPath, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chaos_core::{BuildInfo, ChaosError, Result};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tower_http::LatencyUnit;
use tracing::Level;

use super::Listener;
use crate::hooks::LifecycleMetrics;
use crate::shutdown::ShutdownTrigger;

/// Metrics bucket for requests that matched no route.
pub const UNMATCHED_ROUTE: &str = "<unmatched>";

/// HTTP listener serving an axum router.
///
/// Every accepted connection runs in its own tracked task. Graceful shutdown
/// stops accepting and asks each connection to finish its in-flight request.
/// When the deadline passes the connection tasks drop their sockets, so
/// clients still waiting see the connection close.
pub struct HttpListener {
    addr: SocketAddr,
    router: Mutex<Option<Router>>,
    bound: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    graceful: CancellationToken,
    force: CancellationToken,
    connections: TaskTracker,
    serving: AtomicBool,
    stopped: watch::Sender<bool>,
}

impl HttpListener {
    /// Create a listener for `addr` serving `router`.
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            addr,
            router: Mutex::new(Some(router)),
            bound: Mutex::new(None),
            local_addr: Mutex::new(None),
            graceful: CancellationToken::new(),
            force: CancellationToken::new(),
            connections: TaskTracker::new(),
            serving: AtomicBool::new(false),
            stopped,
        }
    }

    /// Address the socket was bound to, once bound.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.lock().ok().and_then(|a| *a)
    }

    /// Number of connections currently being served.
    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    async fn bind_socket(&self) -> Result<SocketAddr> {
        if self.local_addr().is_some() {
            return Err(ChaosError::InvalidState(format!(
                "listener for {} is already bound",
                self.addr
            )));
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ChaosError::Listener(format!("failed to bind {}: {}", self.addr, e)))?;
        let local = listener.local_addr()?;

        *lock(&self.bound)? = Some(listener);
        *lock(&self.local_addr)? = Some(local);
        tracing::info!(addr = %local, "HTTP listener bound");
        Ok(local)
    }

    async fn serve_connections(&self) -> Result<()> {
        let listener = lock(&self.bound)?.take();
        let router = lock(&self.router)?.take();
        let (Some(listener), Some(router)) = (listener, router) else {
            return Err(ChaosError::InvalidState(
                "serve requires a bound listener that is not already serving".to_string(),
            ));
        };

        self.serving.store(true, Ordering::SeqCst);
        if self.graceful.is_cancelled() {
            self.stopped.send_replace(true);
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        self.connections.spawn(serve_connection(
                            stream,
                            peer,
                            router.clone(),
                            self.graceful.clone(),
                            self.force.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                _ = self.graceful.cancelled() => break,
            }
        }

        drop(listener);
        self.connections.close();
        self.connections.wait().await;

        self.stopped.send_replace(true);
        tracing::debug!("HTTP listener stopped serving");
        Ok(())
    }

    async fn drain(&self, deadline: Duration) -> Result<()> {
        self.graceful.cancel();

        if !self.serving.load(Ordering::SeqCst) {
            lock(&self.bound)?.take();
            self.stopped.send_replace(true);
            return Ok(());
        }

        let mut stopped = self.stopped.subscribe();
        let drained = tokio::time::timeout(deadline, stopped.wait_for(|s| *s))
            .await
            .map(|_| ());
        match drained {
            Ok(()) => Ok(()),
            Err(_) => {
                tracing::warn!(
                    open = self.connections.len(),
                    "Drain deadline passed, closing open connections"
                );
                self.force.cancel();
                Err(ChaosError::timeout("listener drain", deadline))
            }
        }
    }
}

/// Serve one connection until it ends, draining on `graceful` and dropping
/// the socket on `force`.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    router: Router,
    graceful: CancellationToken,
    force: CancellationToken,
) {
    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(stream), TowerToHyperService::new(router));
    tokio::pin!(conn);

    let mut draining = false;
    loop {
        tokio::select! {
            result = conn.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(%peer, error = %e, "Connection ended with error");
                }
                return;
            }
            _ = graceful.cancelled(), if !draining => {
                draining = true;
                conn.as_mut().graceful_shutdown();
            }
            _ = force.cancelled() => {
                tracing::debug!(%peer, "Connection force closed");
                return;
            }
        }
    }
}

impl Listener for HttpListener {
    fn bind<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<SocketAddr>> + Send + 'a>> {
        Box::pin(self.bind_socket())
    }

    fn serve<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.serve_connections())
    }

    fn shutdown<'a>(
        &'a self,
        deadline: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.drain(deadline))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| ChaosError::Internal("listener state lock poisoned".to_string()))
}

/// Shared state for the built-in routes.
#[derive(Clone)]
pub struct ServiceState {
    pub build_info: Arc<BuildInfo>,
    pub metrics: Arc<LifecycleMetrics>,
    pub trigger: ShutdownTrigger,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
}

#[derive(Debug, Serialize)]
struct VersionResponse {
    ret: i32,
    msg: &'static str,
    data: BuildInfo,
}

/// Merge the built-in routes into `app` and add request middleware.
///
/// `app` must not define `/health`, `/version` or `/metrics`.
pub fn service_router(app: Router, state: ServiceState, log_request_time: bool) -> Router {
    let builtin = Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler).post(version_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone());

    let router = app.merge(builtin).layer(middleware::from_fn_with_state(
        state.metrics.clone(),
        metrics_middleware,
    ));

    if !log_request_time {
        return router;
    }

    router.layer(
        ServiceBuilder::new().layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(
                    DefaultOnResponse::new()
                        .level(Level::INFO)
                        .latency_unit(LatencyUnit::Millis),
                ),
        ),
    )
}

async fn health_handler(State(state): State<ServiceState>) -> Response {
    let (status, label) = if state.trigger.is_fired() {
        (StatusCode::SERVICE_UNAVAILABLE, "shutting_down")
    } else {
        (StatusCode::OK, "healthy")
    };

    (
        status,
        Json(HealthResponse {
            status: label,
            version: state.build_info.version.clone(),
        }),
    )
        .into_response()
}

async fn version_handler(State(state): State<ServiceState>) -> Json<VersionResponse> {
    Json(VersionResponse {
        ret: 0,
        msg: "OK",
        data: (*state.build_info).clone(),
    })
}

async fn metrics_handler(State(state): State<ServiceState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn metrics_middleware(
    State(metrics): State<Arc<LifecycleMetrics>>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

    let response = next.run(req).await;

    metrics.record_request(&route, start.elapsed());
    response
}
