//! Server module for the Floodgate gateway.
//!
//! Wires configuration, the admission layer and the router together and runs
//! the HTTP server until a shutdown signal arrives.
//!
//! # Shutdown Sequence
//!
//! 1. SIGINT/SIGTERM (or a manual trigger) initiates shutdown
//! 2. The listener stops accepting; in-flight requests drain
//! 3. The deduplication sweeper wakes, releases any pending entries with a
//!    shutdown error and exits
//! 4. Background tasks are joined with a bounded wait
//!
//! # Usage
//!
//! ```rust,no_run
//! use floodgate::{env::get_config, server::start_server};
//!
//! # async fn run() {
//! let config = get_config();
//! if let Err(e) = start_server(config).await {
//!     eprintln!("{}", e);
//! }
//! # }
//! ```

pub mod shutdown;

use self::shutdown::ShutdownCoordinator;
use crate::AppState;
use crate::admission::AdmissionMiddleware;
use crate::admission::config::AdmissionConfigError;
use crate::audit::AuditSink;
use crate::env::AppConfig;
use crate::routing::client::create_upstream_client;
use crate::routing::router::create_router;
use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::time::Duration;
use tracing::{error, info};

const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server startup failures
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid admission configuration: {0}")]
    Config(#[from] AdmissionConfigError),

    #[error("Failed to build upstream HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Build the application state for `config`
pub fn build_state(config: &AppConfig, audit: AuditSink) -> Result<AppState, ServerError> {
    let admission = AdmissionMiddleware::new(config.admission.clone(), audit)?;
    let http_client = create_upstream_client()?;

    Ok(AppState {
        http_client,
        upstream_url: config.upstream_url.clone(),
        admission,
    })
}

/// Start the gateway and block until it has shut down
pub async fn start_server(config: AppConfig) -> Result<(), ServerError> {
    let state = build_state(&config, AuditSink::new())?;
    let listener = TcpListener::bind(config.bind_address).await?;

    info!("Floodgate running on http://{}", listener.local_addr()?);
    info!("Forwarding admitted requests to {}", config.upstream_url);

    let shutdown = ShutdownCoordinator::new();
    let signal_watcher = shutdown.clone();
    tokio::spawn(async move {
        signal_watcher.wait_for_shutdown_signal().await;
    });

    serve(listener, state, shutdown).await
}

/// Serve `state` on `listener` until `shutdown` is initiated
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: ShutdownCoordinator,
) -> Result<(), ServerError> {
    let admission = state.admission.clone();
    shutdown.register(admission.spawn_sweeper(&shutdown));

    let app: Router = create_router(state);
    let mut shutdown_rx = shutdown.subscribe();
    let already_shut_down = shutdown.is_shutdown_initiated();

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if !already_shut_down {
            let _ = shutdown_rx.recv().await;
        }
    })
    .await;

    if let Err(ref e) = result {
        error!("Floodgate server error: {}", e);
    }

    // Covers a server that exited on its own
    shutdown.initiate_shutdown();
    admission.shutdown();
    shutdown.wait_for_tasks_completion(TASK_SHUTDOWN_TIMEOUT).await;
    info!("Floodgate shutdown complete");

    result.map_err(ServerError::from)
}
