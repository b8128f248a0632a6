//! Documentation of the Dachs proposal upvoting backend.
//!
//! The talk/proposal catalogue itself is static content. This backend only owns the community
//! upvotes on it: who upvoted what, how many upvotes a proposal has, and whether the caller is
//! allowed to vote at all.
//!
//!
//!
//! # General Infrastructure
//! - Frontend runs the GitHub OAuth flow and hands the access token to `POST /auth/session`
//! - Backend resolves the GitHub user with that token and opens a session (cookie)
//! - Every vote checks membership in the required GitHub organization
//! - Redis holds upvotes and sessions; SQLite is the relational alternative for upvotes
//!
//!
//!
//! # Endpoints
//!
//! | Method | Path | Result |
//! |---|---|---|
//! | GET | `/proposals/{slug}/stats` | `{count, hasVoted}` |
//! | GET | `/proposals/{slug}/voters` | voter logins, one per voter |
//! | POST | `/proposals/{slug}/upvote` | `{voted}`, 401 anonymous, 403 non-member |
//! | GET | `/proposals/all-stats` | `{slug: {count, hasVoted}}` |
//! | GET | `/proposals/stats?slugs=a,b` | `{slug: {count, hasVoted}}` for the listed slugs |
//! | POST | `/auth/session` | `{accessToken}` in, identity out, sets the session cookie |
//! | GET | `/auth/me` | identity or `null` |
//! | GET | `/auth/github/orgs` | organization logins of the caller |
//! | POST | `/auth/logout` | ends the session |
//! | GET | `/health` | store liveness |
//!
//! Read endpoints take `?fallback=empty` to get a zero/empty answer instead of a 503 while the
//! store is down. Such answers carry the `x-dachs-degraded: true` header.
//!
//!
//!
//! # Notes
//!
//! ## Duplicate votes
//! The whole point of the ledger is that a voter can never count twice for a proposal, no matter
//! how many toggles race each other. The store enforces it (`HSETNX`, primary key) and a toggle
//! never reads before it writes. See [`ledger`].
//!
//! ## Membership
//! One GitHub call per session, not per vote. See [`membership`].
//!
//! ## Stale logins
//! A fact remembers the login at the time of the vote. Renamed GitHub accounts keep showing the
//! old login in voter lists until they vote again. Accepted.
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
//! Run against a local Redis.
//! ```sh
//! REDIS_URL=redis://localhost:6379 RUST_LOG=info cargo run -p dachs
//! ```
//!
//! Run without Redis.
//! ```sh
//! STORE_BACKEND=sqlite SQLITE_PATH=dachs.db RUST_LOG=info cargo run -p dachs
//! ```
//!
//! Redis integration tests.
//! ```sh
//! REDIS_URL=redis://localhost:6379 cargo test -p dachs-server -- --ignored
//! ```
use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderValue, Method, header::CONTENT_TYPE},
    routing::{get, post},
};

use signal::{
    ctrl_c,
    unix::{SignalKind, signal},
};
use tokio::{net::TcpListener, signal};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

pub mod aggregator;
pub mod catalogue;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod membership;
pub mod memory;
pub mod principal;
pub mod routes;
pub mod session;
pub mod sqlite;
pub mod state;
pub mod utils;

use routes::{
    all_stats_handler, health_handler, logout_handler, me_handler, open_session_handler,
    orgs_handler, slugs_stats_handler, stats_handler, upvote_handler, voters_handler,
};
use state::State;

pub fn build_router(state: Arc<State>) -> Router {
    Router::new()
        .route("/proposals/all-stats", get(all_stats_handler))
        .route("/proposals/stats", get(slugs_stats_handler))
        .route("/proposals/{slug}/stats", get(stats_handler))
        .route("/proposals/{slug}/voters", get(voters_handler))
        .route("/proposals/{slug}/upvote", post(upvote_handler))
        .route("/auth/session", post(open_session_handler))
        .route("/auth/me", get(me_handler))
        .route("/auth/github/orgs", get(orgs_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

pub async fn start_server() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Initializing state...");
    let state = State::new().await?;

    info!("Starting server...");

    let origin: HeaderValue = state
        .config
        .allowed_origin
        .parse()
        .context("Invalid ALLOWED_ORIGIN")?;

    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(60 * 60));

    let app = build_router(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let address = format!("0.0.0.0:{}", state.config.port);
    info!("Binding to {address}");

    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {address}"))?;
    info!("Server running on {address}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutting down...");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
