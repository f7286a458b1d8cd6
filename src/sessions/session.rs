//! A single terminal session: the protocol state machine for one connection.
//!
//! ```text
//! Unauthenticated --auth--> Authenticated
//!        |                        |
//!        +--close/error/exit--> Closed <--+
//! ```
//!
//! [`Session`] performs no transport I/O itself. The connection task feeds it
//! events (inbound frames, PTY events, flush timer) and forwards the returned
//! [`Outbound`] actions to the socket.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::coalescer::OutputCoalescer;
use super::rate::RateWindow;
use crate::config::Config;
use crate::error::{FrameError, UploadError};
use crate::files;
use crate::shell::adapter::{PtyAdapter, PtyEvent, PtySpawner, SpawnRequest};
use crate::token::TokenService;
use crate::util::short_id;
use crate::ws::framing;
use crate::ws::protocol::{self, ClientMessage, FileUpload, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Closed,
}

/// Per-session limits and shell defaults, resolved once from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub max_message_size: usize,
    pub rate_limit: u32,
    pub default_cols: u16,
    pub default_rows: u16,
    pub shell: Option<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub upload_dir: PathBuf,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> std::io::Result<Self> {
        Ok(Self {
            max_message_size: config.server.max_message_size,
            rate_limit: config.server.rate_limit,
            default_cols: config.shell.default_cols,
            default_rows: config.shell.default_rows,
            shell: config.shell.shell.clone(),
            working_dir: config.working_dir()?,
            env: config.shell.env.clone(),
            upload_dir: config.upload_dir()?,
        })
    }
}

/// A raw frame as received from the transport.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl InboundFrame {
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Something the connection task must do on the session's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    /// A file download frame.
    Binary(Vec<u8>),
    /// Close the transport with a normal close frame carrying this reason.
    Close(String),
}

pub struct Session {
    id: String,
    state: SessionState,
    pty: PtyAdapter,
    rate: RateWindow,
    output: OutputCoalescer,
    tokens: Arc<TokenService>,
    settings: Arc<SessionSettings>,
}

impl Session {
    pub fn new(
        spawner: Arc<dyn PtySpawner>,
        tokens: Arc<TokenService>,
        settings: Arc<SessionSettings>,
        now: Instant,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::Unauthenticated,
            pty: PtyAdapter::new(spawner),
            rate: RateWindow::new(settings.rate_limit, now),
            output: OutputCoalescer::new(),
            tokens,
            settings,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    /// The shell's event stream, available once after a successful spawn.
    pub fn take_pty_events(&mut self) -> Option<mpsc::Receiver<PtyEvent>> {
        self.pty.take_events().ok()
    }

    /// When the coalesced output must be flushed, if anything is pending.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.output.deadline()
    }

    /// Handle one inbound frame: rate check, size check, decode, route.
    pub async fn on_frame(&mut self, frame: InboundFrame, now: Instant) -> Vec<Outbound> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        if !self.rate.admit(now) {
            warn!(session_id = %short_id(&self.id), "Rate limit exceeded, dropping message");
            return vec![error_out(
                "RATE_LIMITED",
                format!(
                    "more than {} messages per minute, message dropped",
                    self.settings.rate_limit
                ),
            )];
        }
        if frame.len() > self.settings.max_message_size {
            warn!(
                session_id = %short_id(&self.id),
                "Dropping {}-byte message (max {})",
                frame.len(),
                self.settings.max_message_size
            );
            return vec![error_out(
                "MESSAGE_TOO_LARGE",
                format!(
                    "message of {} bytes exceeds the {} byte limit",
                    frame.len(),
                    self.settings.max_message_size
                ),
            )];
        }

        let decoded = match frame {
            InboundFrame::Text(ref text) => protocol::decode_text(text),
            InboundFrame::Binary(ref data) => {
                framing::decode_upload(data).map(ClientMessage::FileUpload)
            }
        };
        match decoded {
            Ok(msg) => self.route(msg).await,
            Err(e) => {
                debug!(session_id = %short_id(&self.id), "Rejected frame: {e}");
                vec![frame_error(&e)]
            }
        }
    }

    async fn route(&mut self, msg: ClientMessage) -> Vec<Outbound> {
        match (self.state, msg) {
            (SessionState::Unauthenticated, ClientMessage::Auth { token, cols, rows }) => {
                self.authenticate(token.as_deref(), cols, rows)
            }
            (SessionState::Unauthenticated, other) => {
                debug!(
                    session_id = %short_id(&self.id),
                    "Ignoring {} before auth",
                    other.kind()
                );
                Vec::new()
            }
            (SessionState::Authenticated, ClientMessage::Auth { .. }) => {
                debug!(session_id = %short_id(&self.id), "Ignoring repeated auth");
                Vec::new()
            }
            (SessionState::Authenticated, ClientMessage::Input { data }) => {
                match self.pty.write(data.as_bytes()) {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![error_out(e.code(), e.to_string())],
                }
            }
            (SessionState::Authenticated, ClientMessage::Resize { cols, rows }) => {
                match self.pty.resize(cols, rows) {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![error_out(e.code(), e.to_string())],
                }
            }
            (SessionState::Authenticated, ClientMessage::FileUpload(upload)) => {
                self.save_upload(upload).await
            }
            (SessionState::Authenticated, ClientMessage::FileDownload { filename }) => {
                self.serve_download(&filename).await
            }
            (SessionState::Closed, _) => Vec::new(),
        }
    }

    fn authenticate(
        &mut self,
        token: Option<&str>,
        cols: Option<u16>,
        rows: Option<u16>,
    ) -> Vec<Outbound> {
        if let Some(token) = token {
            if !self.tokens.validate(token) {
                warn!(session_id = %short_id(&self.id), "Auth message carried an invalid token");
                return vec![error_out("UNAUTHORIZED", "invalid or expired token")];
            }
        }

        let request = SpawnRequest {
            shell: self.settings.shell.clone(),
            cwd: Some(self.settings.working_dir.clone()),
            cols: cols.unwrap_or(self.settings.default_cols),
            rows: rows.unwrap_or(self.settings.default_rows),
            env: self.settings.env.clone(),
        };
        match self.pty.spawn(&request) {
            Ok(pid) => {
                self.state = SessionState::Authenticated;
                info!(
                    session_id = %short_id(&self.id),
                    "Authenticated, shell pid {pid:?} at {}x{}",
                    request.cols,
                    request.rows
                );
                vec![Outbound::Message(ServerMessage::Ready {
                    session_id: self.id.clone(),
                    pid,
                })]
            }
            Err(e) => {
                error!(session_id = %short_id(&self.id), "Shell spawn failed: {e}");
                let reason = "shell spawn failed".to_string();
                self.close(&reason);
                vec![error_out(e.code(), e.to_string()), Outbound::Close(reason)]
            }
        }
    }

    async fn save_upload(&mut self, upload: FileUpload) -> Vec<Outbound> {
        let FileUpload { filename, data, .. } = upload;
        let path = match files::resolve_in_sandbox(&self.settings.upload_dir, &filename).await {
            Ok(path) => path,
            Err(e) => return vec![self.upload_error(&filename, &e)],
        };
        if let Err(e) = files::write_upload(&path, &data).await {
            return vec![self.upload_error(&filename, &e)];
        }
        info!(
            session_id = %short_id(&self.id),
            "Saved upload {} ({} bytes)",
            path.display(),
            data.len()
        );

        // Shell output received before the upload keeps its place in the
        // stream. A partial UTF-8 sequence stays buffered for its remaining bytes.
        let mut out: Vec<Outbound> = self
            .output
            .flush()
            .map(|text| Outbound::Message(ServerMessage::output(text)))
            .into_iter()
            .collect();
        out.push(Outbound::Message(ServerMessage::output(format!(
            "\r\n[termgate] saved {filename} ({} bytes)\r\n",
            data.len()
        ))));
        out
    }

    async fn serve_download(&mut self, filename: &str) -> Vec<Outbound> {
        let result = match files::resolve_in_sandbox(&self.settings.upload_dir, filename).await {
            Ok(path) => files::read_download(&path, self.settings.max_message_size).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(data) => {
                debug!(
                    session_id = %short_id(&self.id),
                    "Sending {filename} ({} bytes)",
                    data.len()
                );
                vec![Outbound::Binary(framing::encode_file(filename, &data))]
            }
            Err(e) => vec![self.upload_error(filename, &e)],
        }
    }

    fn upload_error(&self, filename: &str, e: &UploadError) -> Outbound {
        warn!(session_id = %short_id(&self.id), "File transfer of {filename:?} failed: {e}");
        error_out(e.code(), e.to_string())
    }

    /// Handle output or exit of the shell.
    pub fn on_pty_event(&mut self, event: PtyEvent, now: Instant) -> Vec<Outbound> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        match event {
            PtyEvent::Data(bytes) => self
                .output
                .push(&bytes, now)
                .map(|text| Outbound::Message(ServerMessage::output(text)))
                .into_iter()
                .collect(),
            PtyEvent::Exit(status) => {
                info!(session_id = %short_id(&self.id), "Shell exited with {status}");
                let mut out: Vec<Outbound> = self
                    .output
                    .flush_all()
                    .map(|text| Outbound::Message(ServerMessage::output(text)))
                    .into_iter()
                    .collect();
                let reason = format!("shell exited with {status}");
                self.close(&reason);
                out.push(Outbound::Close(reason));
                out
            }
        }
    }

    /// The coalescer deadline passed.
    pub fn on_flush_timer(&mut self) -> Vec<Outbound> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        self.output
            .flush()
            .map(|text| Outbound::Message(ServerMessage::output(text)))
            .into_iter()
            .collect()
    }

    /// Enter `Closed`: kill the shell and drop pending output. Idempotent.
    pub fn close(&mut self, reason: &str) {
        if self.state == SessionState::Closed {
            return;
        }
        info!(session_id = %short_id(&self.id), "Closing session: {reason}");
        self.state = SessionState::Closed;
        self.pty.kill(None);
        self.output.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close("dropped");
    }
}

fn error_out(code: &str, message: impl Into<String>) -> Outbound {
    Outbound::Message(ServerMessage::error(code, message))
}

fn frame_error(e: &FrameError) -> Outbound {
    error_out(e.code(), e.to_string())
}
