//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::sessions::session::SessionSettings;
use crate::sessions::SessionRegistry;
use crate::shell::adapter::PtySpawner;
use crate::token::TokenService;

/// Shared application state for the termgate server.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Signs and validates connection tokens. The secret never changes after
    /// startup.
    pub tokens: Arc<TokenService>,
    /// Live sessions, for limits, heartbeat and shutdown.
    pub registry: SessionRegistry,
    /// Starts shells for new sessions.
    pub spawner: Arc<dyn PtySpawner>,
    /// Session limits and shell defaults derived from `config`.
    pub settings: Arc<SessionSettings>,
}

impl AppState {
    pub fn new(
        config: Config,
        tokens: Arc<TokenService>,
        spawner: Arc<dyn PtySpawner>,
    ) -> std::io::Result<Self> {
        let settings = SessionSettings::from_config(&config)?;
        Ok(Self {
            registry: SessionRegistry::new(config.server.max_sessions),
            config: Arc::new(config),
            start_time: Instant::now(),
            tokens,
            spawner,
            settings: Arc::new(settings),
        })
    }
}
