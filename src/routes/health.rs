//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// No authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "sessions": state.registry.len().await,
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::shell::pty::NativeSpawner;
    use crate::token::TokenService;

    #[tokio::test]
    async fn test_health_reports_sessions() {
        let tokens = Arc::new(TokenService::new(Some("s"), 60));
        let state = AppState::new(Config::default(), tokens, Arc::new(NativeSpawner)).unwrap();
        let _reg = state.registry.register("abc").await.unwrap();

        let Json(body) = health(State(state)).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 1);
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
    }
}
