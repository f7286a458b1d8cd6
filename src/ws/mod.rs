//! WebSocket transport for terminal sessions.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws?token=<token>`. The token is validated
//!    before the upgrade completes; a missing or invalid one gets `401`.
//! 2. The connection is registered (bounded by `max_sessions`) and a
//!    [`Session`] is created in the unauthenticated state.
//! 3. The client sends `auth`; the shell is spawned and `ready` is returned.
//! 4. Input, resize and file frames flow in; coalesced output flows out.
//! 5. The connection ends on client close, transport error, shell exit,
//!    heartbeat eviction or server shutdown. All of them close the session,
//!    which kills the shell.
//!
//! ## Message types (client → server)
//!
//! | Type            | Fields                       | Response           |
//! |-----------------|------------------------------|--------------------|
//! | `auth`          | `token?`, `cols?`, `rows?`   | `ready` or `error` |
//! | `input`         | `data`                       | (none)             |
//! | `resize`        | `cols`, `rows`               | (none)             |
//! | `file_upload`   | `filename`, `size`, `data`   | `output` or `error`|
//! | `file_download` | `filename`                   | binary frame or `error` |
//!
//! A binary frame is a file upload in the length-prefixed format of
//! [`framing`].
//!
//! ## Message types (server → client)
//!
//! | Type     | Key fields              |
//! |----------|-------------------------|
//! | `ready`  | `session_id`, `pid`     |
//! | `output` | `data`                  |
//! | `error`  | `code`, `message`       |

pub mod framing;
pub mod protocol;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::sessions::session::{InboundFrame, Outbound, Session};
use crate::sessions::{Registration, SessionControl};
use crate::shell::adapter::PtyEvent;
use crate::util::short_id;
use crate::AppState;
use self::protocol::ServerMessage;

/// Headroom above `max_message_size` at the transport layer. Frames up to
/// `max_message_size + TRANSPORT_HEADROOM` reach the session and get a
/// `MESSAGE_TOO_LARGE` error. Anything larger is refused by the WebSocket
/// layer before it is buffered, and the connection is dropped.
const TRANSPORT_HEADROOM: usize = 1024 * 1024;

/// How long a closing connection may take to flush its last frames.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// Browsers cannot set headers on a WebSocket upgrade, so the token
    /// travels in the query string.
    pub token: Option<String>,
}

/// `GET /api/ws?token=<token>` — WebSocket upgrade handler.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = query
        .token
        .as_deref()
        .is_some_and(|token| state.tokens.validate(token));
    if !authorized {
        warn!("Rejected WebSocket upgrade: missing or invalid token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "missing or invalid token"})),
        )
            .into_response();
    }

    let limit = state
        .config
        .server
        .max_message_size
        .saturating_add(TRANSPORT_HEADROOM);
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_ws(socket, state))
}

/// How the connection loop ended.
enum Ending {
    /// Close frame already queued (or the peer is gone); flush and finish.
    Graceful,
    /// Drop the transport immediately without a close frame.
    Abort,
}

/// Main WebSocket event loop.
///
/// Outgoing frames go through an mpsc channel to a dedicated send task, so a
/// slow client never blocks the loop. The loop itself `select!`s over:
/// - incoming WebSocket frames
/// - PTY output and exit events (once the shell is spawned)
/// - the output coalescer's flush deadline
/// - registry control requests (probe, evict, shutdown)
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sink.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let mut session = Session::new(
        Arc::clone(&state.spawner),
        Arc::clone(&state.tokens),
        Arc::clone(&state.settings),
        Instant::now(),
    );
    let session_id = session.id().to_string();

    let Registration {
        liveness,
        mut control,
    } = match state.registry.register(&session_id).await {
        Ok(registration) => registration,
        Err(e) => {
            warn!("Refusing connection: {e}");
            let error = ServerMessage::error(e.code(), e.to_string());
            let _ = tx.send(Message::Text(error.to_json().into())).await;
            let _ = tx.send(close_frame(close_code::AGAIN, "session limit")).await;
            session.close("session limit");
            drop(tx);
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, send_task).await;
            return;
        }
    };
    info!(session_id = %short_id(&session_id), "WebSocket connected");

    let mut pty_events: Option<mpsc::Receiver<PtyEvent>> = None;

    let ending = loop {
        let deadline = session.flush_deadline();
        tokio::select! {
            frame = ws_stream.next() => {
                let inbound = match frame {
                    Some(Ok(Message::Text(text))) => InboundFrame::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(data))) => InboundFrame::Binary(data.to_vec()),
                    Some(Ok(Message::Pong(_))) => {
                        liveness.store(true, Ordering::SeqCst);
                        continue;
                    }
                    // Pings are answered by the WebSocket layer.
                    Some(Ok(Message::Ping(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => {
                        session.close("client disconnected");
                        break Ending::Abort;
                    }
                    Some(Err(e)) => {
                        debug!(session_id = %short_id(&session_id), "WebSocket error: {e}");
                        session.close("transport error");
                        break Ending::Abort;
                    }
                };
                let out = session.on_frame(inbound, Instant::now()).await;
                if pty_events.is_none() {
                    pty_events = session.take_pty_events();
                }
                if dispatch(&tx, out).await {
                    break Ending::Graceful;
                }
            }
            event = next_pty_event(&mut pty_events), if pty_events.is_some() => {
                let Some(event) = event else {
                    pty_events = None;
                    continue;
                };
                let out = session.on_pty_event(event, Instant::now());
                if dispatch(&tx, out).await {
                    break Ending::Graceful;
                }
            }
            () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let out = session.on_flush_timer();
                if dispatch(&tx, out).await {
                    break Ending::Graceful;
                }
            }
            Some(request) = control.recv() => match request {
                SessionControl::Probe => {
                    let _ = tx.send(Message::Ping(Vec::new().into())).await;
                }
                SessionControl::Evict => {
                    session.close("heartbeat timeout");
                    break Ending::Abort;
                }
                SessionControl::Shutdown => {
                    session.close("server shutting down");
                    let _ = tx.send(close_frame(close_code::AWAY, "server shutting down")).await;
                    break Ending::Graceful;
                }
            },
        }
    };

    drop(tx);
    match ending {
        Ending::Graceful => {
            let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, send_task).await;
        }
        Ending::Abort => send_task.abort(),
    }
    state.registry.remove(&session_id).await;
    info!(session_id = %short_id(&session_id), "WebSocket disconnected");
}

async fn next_pty_event(events: &mut Option<mpsc::Receiver<PtyEvent>>) -> Option<PtyEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Queue session actions on the send channel. Returns `true` once the
/// connection should end.
async fn dispatch(tx: &mpsc::Sender<Message>, out: Vec<Outbound>) -> bool {
    for action in out {
        let (msg, closing) = match action {
            Outbound::Message(msg) => (Message::Text(msg.to_json().into()), false),
            Outbound::Binary(data) => (Message::Binary(data.into()), false),
            Outbound::Close(reason) => (close_frame(close_code::NORMAL, &reason), true),
        };
        if tx.send(msg).await.is_err() || closing {
            return true;
        }
    }
    false
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
