//! Gateway: HTTP routes, WebSocket upgrade and graceful shutdown.
//!
//! ```text
//!              ┌─ GET /health        → 200 "ok" (503 "draining")
//! axum Router ─┼─ GET /stats         → 200 JSON counters
//!              ├─ GET /rooms/{name}  → WebSocket upgrade → session
//!              ├─ GET /rooms/        → 400
//!              └─ anything else      → 404 / 405
//!
//! shutdown ─► 503 for new rooms ─► flush all ─► Close every session
//!             ─► wait for sessions ─► stop listening ─► flush again
//! ```

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::ServerConfig;
use crate::registry::{RegistrySettings, RoomRegistry};
use crate::session::{run_session, SessionContext};
use crate::stats::{spawn_reporter, ServerStats, StatsSnapshot};
use crate::storage::{open_backend, PersistenceBackend, StoreError};

const ROOMS_PREFIX: &str = "/rooms/";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Room name from a request target, exactly as sent (no percent-decoding).
pub fn room_name(uri: &Uri) -> Option<&str> {
    uri.path()
        .strip_prefix(ROOMS_PREFIX)
        .filter(|name| !name.is_empty() && !name.contains('/'))
}

/// Triggers graceful shutdown of a running [`SyncServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Router state shared by every request and session.
struct Gateway {
    registry: Arc<RoomRegistry>,
    stats: Arc<ServerStats>,
    draining: AtomicBool,
    idle_timeout: Duration,
    shutdown_timeout: Duration,
    /// Flipped once to tell every session to send Close.
    close_tx: watch::Sender<bool>,
    /// Number of upgraded sockets still running a session.
    sessions: watch::Sender<usize>,
}

/// Counts one running session for as long as it lives.
struct OpenSession<'a> {
    sessions: &'a watch::Sender<usize>,
}

impl Drop for OpenSession<'_> {
    fn drop(&mut self) {
        self.sessions.send_modify(|open| *open = open.saturating_sub(1));
    }
}

impl Gateway {
    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn open_session(&self) -> OpenSession<'_> {
        self.sessions.send_modify(|open| *open += 1);
        OpenSession {
            sessions: &self.sessions,
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            registry: Arc::clone(&self.registry),
            stats: Arc::clone(&self.stats),
            idle_timeout: self.idle_timeout,
            close_rx: self.close_tx.subscribe(),
        }
    }

    /// Flush every room, close every session and wait for them to end.
    ///
    /// The listener keeps answering while this runs, so health probes see
    /// 503 until it returns.
    async fn drain(&self) {
        self.draining.store(true, Ordering::Release);
        let open_sessions = *self.sessions.borrow();
        log::info!(
            "Shutting down: draining {open_sessions} sessions across {} rooms",
            self.registry.room_count().await
        );

        let timeout = self.shutdown_timeout;
        match tokio::time::timeout(timeout, self.registry.flush_all()).await {
            Ok(summary) => log::info!(
                "Flushed {} rooms ({} clean, {} failed)",
                summary.flushed,
                summary.clean,
                summary.failed
            ),
            Err(_) => log::error!("Flush did not finish within {timeout:?}"),
        }

        self.close_tx.send_replace(true);
        let mut open = self.sessions.subscribe();
        if tokio::time::timeout(timeout, open.wait_for(|open| *open == 0))
            .await
            .is_err()
        {
            log::warn!(
                "{} sessions did not close within {timeout:?}",
                *self.sessions.borrow()
            );
        }
    }

    /// Flush updates that raced the drain.
    async fn final_flush(&self) {
        if let Ok(summary) = tokio::time::timeout(self.shutdown_timeout, self.registry.flush_all()).await {
            if summary.flushed > 0 || summary.failed > 0 {
                log::info!(
                    "Final flush wrote {} rooms ({} failed)",
                    summary.flushed,
                    summary.failed
                );
            }
        }
    }
}

fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/rooms", get(missing_room_name))
        .route("/rooms/", get(missing_room_name))
        .route("/rooms/{name}", get(join_room))
        .fallback(not_found)
        .with_state(gateway)
}

async fn health(State(gateway): State<Arc<Gateway>>) -> (StatusCode, &'static str) {
    if gateway.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else {
        (StatusCode::OK, "ok")
    }
}

async fn stats(State(gateway): State<Arc<Gateway>>) -> Json<StatsSnapshot> {
    Json(gateway.stats.snapshot())
}

async fn missing_room_name() -> (StatusCode, &'static str) {
    (StatusCode::BAD_REQUEST, "room name required")
}

async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}

async fn join_room(
    State(gateway): State<Arc<Gateway>>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    if gateway.is_draining() {
        return (StatusCode::SERVICE_UNAVAILABLE, "draining").into_response();
    }
    let Some(room_id) = room_name(&uri).map(str::to_string) else {
        return missing_room_name().await.into_response();
    };

    ws.on_upgrade(move |socket| async move {
        let _open = gateway.open_session();
        // Outcome is logged by the session.
        let _ = run_session(socket, &room_id, gateway.session_context()).await;
    })
}

/// The collaboration server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<Gateway>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl SyncServer {
    /// Create a server, opening the configured persistence backend.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let backend = open_backend(&config.persistence)?;
        log::info!("Using {} persistence", backend.name());
        Ok(Self::with_backend(config, backend))
    }

    /// Create a server over an already opened backend.
    pub fn with_backend(config: ServerConfig, backend: Arc<dyn PersistenceBackend>) -> Self {
        let stats = Arc::new(ServerStats::new());
        let registry = Arc::new(RoomRegistry::new(
            backend,
            RegistrySettings::from(&config),
            Arc::clone(&stats),
        ));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            gateway: Arc::new(Gateway {
                registry,
                stats,
                draining: AtomicBool::new(false),
                idle_timeout: config.idle_timeout,
                shutdown_timeout: config.shutdown_timeout,
                close_tx: watch::channel(false).0,
                sessions: watch::channel(0).0,
            }),
            config,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.gateway.registry
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.gateway.stats
    }

    pub fn is_draining(&self) -> bool {
        self.gateway.is_draining()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown_tx),
        }
    }

    /// Bind the configured address and serve until SIGINT or SIGTERM.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        let handle = self.shutdown_handle();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(()) => log::info!("Shutdown signal received"),
                Err(e) => log::error!("Failed to listen for shutdown signals: {e}"),
            }
            handle.shutdown();
        });

        self.serve(listener).await
    }

    /// Serve connections from `listener` until the shutdown handle fires,
    /// then drain.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let shutdown_rx = self.shutdown_tx.subscribe();
        let maintenance = self.gateway.registry.spawn_maintenance(shutdown_rx.clone());
        let reporter = spawn_reporter(
            Arc::clone(&self.gateway.stats),
            self.config.stats_interval,
            shutdown_rx.clone(),
        );

        let gateway = Arc::clone(&self.gateway);
        let mut signal = shutdown_rx;
        let drained = async move {
            // A dropped sender also means shut down.
            let _ = signal.wait_for(|stop| *stop).await;
            gateway.drain().await;
        };
        let served = axum::serve(listener, router(Arc::clone(&self.gateway)))
            .with_graceful_shutdown(drained)
            .await;

        self.shutdown_tx.send_replace(true);
        self.gateway.final_flush().await;
        let _ = tokio::join!(maintenance, reporter);
        served?;
        log::info!("Shutdown complete");
        Ok(())
    }
}

async fn wait_for_signal() -> io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;

    fn server() -> SyncServer {
        SyncServer::with_backend(
            ServerConfig::new("127.0.0.1:0").with_shutdown_timeout(Duration::from_millis(200)),
            Arc::new(MemoryBackend::new()),
        )
    }

    #[test]
    fn test_room_names_are_verbatim() {
        let uri = |target: &str| target.parse::<Uri>().unwrap();
        assert_eq!(room_name(&uri("/rooms/demo")), Some("demo"));
        assert_eq!(room_name(&uri("/rooms/Demo%20Room")), Some("Demo%20Room"));
        assert_eq!(room_name(&uri("/rooms/demo?token=x")), Some("demo"));
    }

    #[test]
    fn test_room_name_rejections() {
        let uri = |target: &str| target.parse::<Uri>().unwrap();
        assert_eq!(room_name(&uri("/rooms/")), None);
        assert_eq!(room_name(&uri("/rooms")), None);
        assert_eq!(room_name(&uri("/rooms/a/b")), None);
        assert_eq!(room_name(&uri("/health")), None);
    }

    #[tokio::test]
    async fn test_health_reports_draining() {
        let server = server();
        let ok = health(State(Arc::clone(&server.gateway))).await;
        assert_eq!(ok, (StatusCode::OK, "ok"));

        server.gateway.draining.store(true, Ordering::Release);
        let draining = health(State(Arc::clone(&server.gateway))).await;
        assert_eq!(draining, (StatusCode::SERVICE_UNAVAILABLE, "draining"));
    }

    #[tokio::test]
    async fn test_stats_body() {
        let server = server();
        server.stats().room_opened();
        let Json(snapshot) = stats(State(Arc::clone(&server.gateway))).await;
        assert_eq!(snapshot.rooms, 1);
    }

    #[test]
    fn test_shutdown_handle() {
        let server = server();
        let handle = server.shutdown_handle();
        assert!(!handle.is_shutdown());
        handle.clone().shutdown();
        assert!(handle.is_shutdown());
        assert!(!server.is_draining());
    }

    #[tokio::test]
    async fn test_drain_waits_for_open_sessions() {
        let server = server();
        let gateway = Arc::clone(&server.gateway);
        let open = gateway.open_session();
        let mut close_rx = gateway.close_tx.subscribe();

        let draining = tokio::spawn({
            let gateway = Arc::clone(&gateway);
            async move { gateway.drain().await }
        });
        close_rx.wait_for(|close| *close).await.unwrap();
        assert!(server.is_draining());
        assert!(!draining.is_finished());

        drop(open);
        tokio::time::timeout(Duration::from_millis(100), draining)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*gateway.sessions.borrow(), 0);
    }

    #[tokio::test]
    async fn test_drain_gives_up_on_stuck_sessions() {
        let server = server();
        let _stuck = server.gateway.open_session();
        tokio::time::timeout(Duration::from_secs(2), server.gateway.drain())
            .await
            .unwrap();
        assert_eq!(*server.gateway.sessions.borrow(), 1);
    }

    #[tokio::test]
    async fn test_serve_returns_after_shutdown() {
        let server = server();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = server.shutdown_handle();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.shutdown();
        });
        tokio::time::timeout(Duration::from_secs(5), server.serve(listener))
            .await
            .unwrap()
            .unwrap();
        assert!(server.is_draining());
    }
}
