//! Typed messages exchanged over the WebSocket.
//!
//! Control frames are JSON text objects tagged by `"type"`. Decoding is a
//! strict parse-and-validate step: a frame becomes one of the fixed
//! [`ClientMessage`] variants or a [`FrameError`], never a half-trusted value.

use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FrameError;

/// Message types a client may send.
const CLIENT_TYPES: &[&str] = &["auth", "input", "resize", "file_upload", "file_download"];

/// A file carried by `file_upload`, from either a JSON or a binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub filename: String,
    /// Declared size; always equal to `data.len()` once decoded.
    pub size: u64,
    pub data: Vec<u8>,
}

/// Inbound (client → server) messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Start the shell. `token` is re-validated when present.
    Auth {
        token: Option<String>,
        cols: Option<u16>,
        rows: Option<u16>,
    },
    /// Raw keystrokes for the shell, forwarded verbatim.
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    FileUpload(FileUpload),
    FileDownload { filename: String },
}

impl ClientMessage {
    /// Tag name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::Input { .. } => "input",
            Self::Resize { .. } => "resize",
            Self::FileUpload(_) => "file_upload",
            Self::FileDownload { .. } => "file_download",
        }
    }
}

/// Outbound (server → client) messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Coalesced shell output.
    Output { data: String },
    /// Non-fatal failure report. `code` is a stable upper-case identifier.
    Error { code: String, message: String },
    /// The shell is running and accepts input.
    Ready {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn output(data: impl Into<String>) -> Self {
        Self::Output { data: data.into() }
    }

    pub fn to_json(&self) -> String {
        // Serializing these plain enums cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Wire shape of client messages before validation.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Auth {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        cols: Option<u16>,
        #[serde(default)]
        rows: Option<u16>,
    },
    Input {
        data: String,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    FileUpload {
        filename: String,
        size: u64,
        /// Base64 file content.
        data: String,
    },
    FileDownload {
        filename: String,
    },
}

/// Decode a text control frame.
pub fn decode_text(text: &str) -> Result<ClientMessage, FrameError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    if !CLIENT_TYPES.contains(&kind.as_str()) {
        return Err(FrameError::UnknownType(kind));
    }
    let invalid = |reason: String| FrameError::InvalidMessage {
        kind: kind.clone(),
        reason,
    };
    let wire: WireMessage = serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;

    match wire {
        WireMessage::Auth { token, cols, rows } => {
            if cols == Some(0) || rows == Some(0) {
                return Err(invalid("cols and rows must be positive".into()));
            }
            Ok(ClientMessage::Auth { token, cols, rows })
        }
        WireMessage::Input { data } => Ok(ClientMessage::Input { data }),
        WireMessage::Resize { cols, rows } => {
            if cols == 0 || rows == 0 {
                return Err(invalid("cols and rows must be positive".into()));
            }
            Ok(ClientMessage::Resize { cols, rows })
        }
        WireMessage::FileUpload {
            filename,
            size,
            data,
        } => {
            let data = base64::engine::general_purpose::STANDARD
                .decode(data.as_bytes())
                .map_err(|e| invalid(format!("data is not base64: {e}")))?;
            if data.len() as u64 != size {
                return Err(invalid(format!(
                    "declared size {size} does not match {} decoded bytes",
                    data.len()
                )));
            }
            Ok(ClientMessage::FileUpload(FileUpload {
                filename,
                size,
                data,
            }))
        }
        WireMessage::FileDownload { filename } => Ok(ClientMessage::FileDownload { filename }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_input() {
        let msg = decode_text(r#"{"type":"input","data":"ls -la\r"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Input {
                data: "ls -la\r".into()
            }
        );
    }

    #[test]
    fn test_decode_auth_optional_fields() {
        let msg = decode_text(r#"{"type":"auth"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Auth {
                token: None,
                cols: None,
                rows: None
            }
        );
        let msg = decode_text(r#"{"type":"auth","token":"t","cols":120,"rows":40}"#).unwrap();
        assert_eq!(msg.kind(), "auth");
    }

    #[test]
    fn test_decode_rejects_bad_json() {
        let err = decode_text("{not json").unwrap_err();
        assert_eq!(err.code(), "INVALID_JSON");
    }

    #[test]
    fn test_decode_rejects_missing_and_unknown_type() {
        assert_eq!(
            decode_text(r#"{"data":"x"}"#).unwrap_err(),
            FrameError::MissingType
        );
        assert_eq!(
            decode_text(r#"{"type":"exec","data":"x"}"#).unwrap_err().code(),
            "UNKNOWN_TYPE"
        );
        // Server-only tags are not accepted from clients.
        assert_eq!(
            decode_text(r#"{"type":"output","data":"x"}"#).unwrap_err().code(),
            "UNKNOWN_TYPE"
        );
    }

    #[test]
    fn test_decode_validates_fields() {
        let cases = [
            r#"{"type":"input"}"#,
            r#"{"type":"input","data":5}"#,
            r#"{"type":"resize","cols":"80","rows":24}"#,
            r#"{"type":"resize","cols":0,"rows":24}"#,
            r#"{"type":"resize","cols":80,"rows":70000}"#,
            r#"{"type":"file_upload","filename":"a","size":3,"data":"!!!"}"#,
            r#"{"type":"file_upload","filename":"a","size":4,"data":"YWJj"}"#,
        ];
        for case in cases {
            let err = decode_text(case).unwrap_err();
            assert_eq!(err.code(), "INVALID_MESSAGE", "{case}");
        }
    }

    #[test]
    fn test_decode_json_upload() {
        let msg =
            decode_text(r#"{"type":"file_upload","filename":"a.txt","size":3,"data":"YWJj"}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::FileUpload(FileUpload {
                filename: "a.txt".into(),
                size: 3,
                data: b"abc".to_vec(),
            })
        );
    }

    #[test]
    fn test_server_message_shape() {
        let json: Value =
            serde_json::from_str(&ServerMessage::error("RATE_LIMITED", "slow down").to_json())
                .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "RATE_LIMITED");
        assert_eq!(json["message"], "slow down");

        let ready = ServerMessage::Ready {
            session_id: "abc".into(),
            pid: None,
        };
        let json: Value = serde_json::from_str(&ready.to_json()).unwrap();
        assert_eq!(json["type"], "ready");
        assert!(json.get("pid").is_none());
    }
}
