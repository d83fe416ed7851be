//! Documentation of the OpenTalent landing page form backend.
//!
//! Two forms feed it: the beta signup and the contact form. Everything here exists so that a
//! visitor who presses submit gets exactly one stored row and one honest message back.
//!
//!
//!
//! # General Infrastructure
//! - Landing page is static, it talks to this server over JSON
//! - `GET /session` hands out a session id and a CSRF token
//! - `POST /beta` and `POST /contact` run the submission pipeline
//! - `GET /stats` serves the counters, `GET /beta/exists` the live duplicate hint
//! - `GET /health` answers 200 while the backend answers a one-row read, 503 otherwise
//! - Submissions are stored in Supabase through its PostgREST endpoint, or in a simulated
//!   backend for local runs
//!
//!
//!
//! # Submission Pipeline
//!
//! **Goal**: no lost submission, no double submission, no spam reaching the database.
//!
//! - Fields are sanitized, then validated; invalid input never leaves the process
//! - Guard checks the CSRF token, a per-session rate limit and a bot score
//! - Every record carries a `client_id` minted before the first attempt
//! - Transient failures are retried with exponential backoff, 1s then 2s
//! - A retried insert that already landed is recognised by its `client_id`
//! - The outcome lands in a bounded local cache, persisted before it is shown
//! - Confirmation mails and analytics are fire and forget
//!
//!
//!
//! # Notes
//!
//! ## Local Cache
//! The cache is not a source of truth, Supabase is. It only powers the counters and gives an
//! operator a way to replay submissions that failed during an outage, see the `replay` binary.
//!
//! ## Cancellation
//! Shutting down cancels every retry loop still waiting on a backoff. A request dropped by
//! the client is cancelled the same way, by dropping its future.
//!
//!
//!
//! # Setup
//!
//! View current docs.
//! ```sh
//! cargo doc --open
//! ```
//!
//! Run locally against the simulated backend.
//! ```sh
//! RUST_LOG=info cargo run --bin landing
//! ```
//!
//! Run against Supabase.
//! ```sh
//! FORMS_BACKEND=supabase SUPABASE_URL=https://<project>.supabase.co cargo run --bin landing
//! ```
use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::{Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

pub mod cache;
pub mod client;
pub mod config;
pub mod database;
pub mod error;
pub mod guard;
pub mod mailer;
pub mod notify;
pub mod persistence;
pub mod pipeline;
pub mod retry;
pub mod routes;
pub mod state;
pub mod utils;
pub mod validator;

use config::Config;
use error::StartupError;
use routes::{
    beta_handler, contact_handler, exists_handler, health_handler, session_handler, stats_handler,
};
use state::State;

pub fn router(state: Arc<State>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/session", get(session_handler))
        .route("/beta", post(beta_handler))
        .route("/beta/exists", get(exists_handler))
        .route("/contact", post(contact_handler))
        .route("/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_server() -> Result<(), StartupError> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading configuration...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = State::new(config).await?;

    info!("Starting server...");
    let app = router(state.clone());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address).await?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        match ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C, shutting down"),
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    shutdown.cancel();
}
