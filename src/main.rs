//! # Symphony-rs
//!
//! Live viewer backend for agent conversation logs.
//!
//! This server provides:
//! - A push stream that follows whichever session is currently being written
//! - Session browsing and search over `~/.claude/history.jsonl`
//! - Ordered session transcripts with compaction dividers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────────┐
//! │  Frontend   │────▶│  Axum HTTP   │────▶│  ~/.claude/     │
//! │  (static/)  │     │  Server      │     │  history.jsonl  │
//! └─────────────┘     └──────────────┘     │  projects/      │
//!       ▲                   │              └─────────────────┘
//!       │ SSE               ▼                       ▲
//! ┌─────────────┐     ┌──────────────┐              │
//! │  LiveHub    │     │ SessionIndex │──────────────┘
//! │  (live.rs)  │     │  (index.rs)  │
//! └─────────────┘     └──────────────┘
//! ```
//!
//! ## API Endpoints
//!
//! - `GET /health` - Server health check
//! - `GET /api/sessions/live` - SSE stream of the active session
//! - `GET /api/sessions` - Page through sessions, newest first
//! - `GET /api/sessions/{id}` - Ordered transcript of one session
//! - `GET /api/projects` - Projects with session counts
//! - `GET /api/search?q=` - Search submitted prompts

use axum::{
    extract::{Path, Query, State},
    response::{sse::{Event, KeepAlive, Sse}, Json},
    routing::get,
    Router,
};
use futures::stream::Stream;
use serde::Serialize;
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Instant};
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use symphony_rs::catalog::{self, ListQuery, ProjectList, SearchQuery, SearchResponse, SessionDetail, SessionPage};
use symphony_rs::config::Config;
use symphony_rs::error::ApiError;
use symphony_rs::index::{self, SessionIndex};
use symphony_rs::live::LiveHub;

// ============================================================================
// App State - Shared state across all request handlers
// ============================================================================

/// Application state shared across all HTTP handlers.
/// Wrapped in Arc<> for thread-safe sharing.
struct AppState {
    start_time: Instant,          // Server start time for uptime tracking
    config: Config,
    index: Arc<SessionIndex>,     // Cached history aggregation
    live: LiveHub,                // Per-subscriber tail tasks
}

impl AppState {
    fn new(config: Config) -> Self {
        let index = Arc::new(SessionIndex::new(config.history_path(), config.index_ttl));
        let live = LiveHub::new(config.projects_dir(), config.poll_interval);
        Self {
            start_time: Instant::now(),
            config,
            index,
            live,
        }
    }
}

// ============================================================================
// Health Endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    version: &'static str,
    live_subscribers: usize,
    index_rebuilds: u64,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION"),
        live_subscribers: state.live.active_count(),
        index_rebuilds: state.index.rebuild_count(),
    })
}

// ============================================================================
// Session Endpoints
// ============================================================================

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<SessionPage>, ApiError> {
    let index = state.index.get().await;
    catalog::list_sessions(&index, &state.config.projects_dir(), &query).map(Json)
}

async fn list_projects(State(state): State<Arc<AppState>>) -> Json<ProjectList> {
    let index = state.index.get().await;
    Json(catalog::list_projects(&index, &state.config.projects_dir()))
}

async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    let index = state.index.get().await;
    catalog::session_detail(&index, &state.config.projects_dir(), &session_id).map(Json)
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<SearchResponse>, ApiError> {
    let history_path = state.config.history_path();
    let projects_dir = state.config.projects_dir();
    tokio::task::spawn_blocking(move || catalog::search(&history_path, &projects_dir, &query))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map(Json)
}

// ============================================================================
// Live Stream
// ============================================================================

/// Follow the active session. The tail task stops when the client goes away
/// and the stream is dropped.
async fn live_session(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = state
        .live
        .subscribe()
        .map(|event| Ok::<_, Infallible>(event.to_sse()));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ============================================================================
// Main
// ============================================================================

fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        // Health
        .route("/health", get(health))
        // SSE
        .route("/api/sessions/live", get(live_session))
        // Catalog
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{session_id}", get(get_session))
        .route("/api/projects", get(list_projects))
        .route("/api/search", get(search))
        // Static files
        .fallback_service(
            ServeDir::new(&state.config.static_dir).append_index_html_on_directories(true),
        )
        .with_state(state.clone());

    if state.config.cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("symphony_rs=info".parse()?)
            .add_directive("tower_http=info".parse()?))
        .init();

    let config = Config::from_env();
    tracing::info!("Reading agent data from {}", config.claude_dir.display());

    let state = Arc::new(AppState::new(config));

    // Drop the cached index as soon as the history log changes
    if state.config.watch_history {
        index::watch_history(state.index.clone());
    }

    let app = router(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    tracing::info!("Symphony-rs v{} listening on {}", env!("CARGO_PKG_VERSION"), addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
