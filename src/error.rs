//! Error types shared across the crate.
//!
//! Each protocol-visible error exposes a stable upper-case `code()` that is
//! sent to the client inside an `error` message.

use thiserror::Error;

/// Failures of the pseudo-terminal adapter.
#[derive(Debug, Error)]
pub enum PtyError {
    /// An operation other than `spawn` was attempted before the shell started.
    #[error("pseudo-terminal not spawned")]
    NotSpawned,

    /// `spawn` was called on an adapter that already owns a process.
    #[error("pseudo-terminal already spawned")]
    AlreadySpawned,

    /// The event stream was already handed to another consumer.
    #[error("pseudo-terminal events already subscribed")]
    AlreadySubscribed,

    /// PTY allocation or process creation failed.
    #[error("failed to spawn shell {shell}: {reason}")]
    Spawn { shell: String, reason: String },

    /// The shell's input queue is gone (process exited or was killed).
    #[error("shell input closed")]
    InputClosed,

    /// Terminal window resize ioctl failed.
    #[error("resize failed: {0}")]
    Resize(String),
}

impl PtyError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotSpawned => "NOT_SPAWNED",
            Self::AlreadySpawned | Self::AlreadySubscribed => "ALREADY_SPAWNED",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::InputClosed => "SESSION_ERROR",
            Self::Resize(_) => "RESIZE_FAILED",
        }
    }
}

/// Failures decoding an inbound frame into a typed message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("failed to parse JSON message: {0}")]
    InvalidJson(String),

    #[error("message has no \"type\" field")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} message: {reason}")]
    InvalidMessage { kind: String, reason: String },

    #[error("invalid binary frame: {0}")]
    InvalidFrame(String),
}

impl FrameError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "INVALID_JSON",
            Self::MissingType => "MISSING_FIELD",
            Self::UnknownType(_) => "UNKNOWN_TYPE",
            Self::InvalidMessage { .. } => "INVALID_MESSAGE",
            Self::InvalidFrame(_) => "INVALID_FRAME",
        }
    }
}

/// Failures resolving, writing or reading a sandboxed file.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid filename {0:?}: must be a plain file name")]
    InvalidFilename(String),

    #[error("path {0:?} escapes the upload directory")]
    OutsideSandbox(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("file too large ({size} bytes, max {max})")]
    TooLarge { size: u64, max: usize },

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UploadError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFilename(_) | Self::OutsideSandbox(_) => "INVALID_PATH",
            Self::NotFound(_) => "FILE_NOT_FOUND",
            Self::TooLarge { .. } => "FILE_TOO_LARGE",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

/// Failures loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Failures admitting a new session into the registry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session limit reached ({0} active)")]
    Full(usize),
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Full(_) => "SESSION_LIMIT",
        }
    }
}
