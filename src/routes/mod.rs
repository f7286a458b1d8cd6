//! HTTP route handlers.
//!
//! The WebSocket endpoint lives in [`crate::ws`]; it checks its token itself
//! because browsers cannot attach headers to an upgrade request.

pub mod health;
