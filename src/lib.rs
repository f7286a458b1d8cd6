#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]

//! termgate library — a browser terminal served over WebSocket.
//!
//! - `token` — HMAC-signed connection tokens
//! - `shell` — shell resolution and the pseudo-terminal adapter
//! - `sessions` — per-connection state machine, registry and heartbeat
//! - `ws` — WebSocket transport and wire protocol
//! - `files` — sandboxed upload/download
//! - `routes` — plain HTTP endpoints
//! - `config` — configuration loading

pub mod config;
pub mod error;
pub mod files;
pub mod routes;
pub mod sessions;
pub mod shell;
pub mod state;
pub mod token;
pub mod util;
pub mod ws;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use sessions::SessionRegistry;
pub use state::AppState;
pub use token::TokenService;

/// Build the HTTP router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health::health))
        .route("/api/ws", get(ws::ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
