//! Binary frame codec for file payloads.
//!
//! # Frame Format
//!
//! ```text
//! +-----------------+---------------------------+------------------+
//! | u32 BE hdr_len  | hdr_len bytes JSON header | raw file content |
//! +-----------------+---------------------------+------------------+
//! ```
//!
//! The header is `{"filename": "...", "size": N}` and `size` must equal the
//! length of the trailing content. Uploads (client → server) and downloads
//! (server → client) share the format.

use serde::{Deserialize, Serialize};

use super::protocol::FileUpload;
use crate::error::FrameError;

/// Size of the big-endian header length prefix.
pub const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Serialize, Deserialize)]
struct FileHeader {
    filename: String,
    size: u64,
}

/// Decode a binary upload frame into a [`FileUpload`].
pub fn decode_upload(frame: &[u8]) -> Result<FileUpload, FrameError> {
    let Some((prefix, rest)) = frame.split_first_chunk::<LENGTH_PREFIX>() else {
        return Err(FrameError::InvalidFrame(format!(
            "frame of {} bytes is shorter than the {LENGTH_PREFIX}-byte length prefix",
            frame.len()
        )));
    };
    let header_len = u32::from_be_bytes(*prefix) as usize;
    if header_len > rest.len() {
        return Err(FrameError::InvalidFrame(format!(
            "header length {header_len} exceeds frame size {}",
            frame.len()
        )));
    }
    let (header, data) = rest.split_at(header_len);
    let header: FileHeader = serde_json::from_slice(header)
        .map_err(|e| FrameError::InvalidFrame(format!("bad header: {e}")))?;
    if header.size != data.len() as u64 {
        return Err(FrameError::InvalidFrame(format!(
            "declared size {} does not match {} payload bytes",
            header.size,
            data.len()
        )));
    }
    Ok(FileUpload {
        filename: header.filename,
        size: header.size,
        data: data.to_vec(),
    })
}

/// Encode a file into a binary frame.
pub fn encode_file(filename: &str, data: &[u8]) -> Vec<u8> {
    let header = FileHeader {
        filename: filename.to_string(),
        size: data.len() as u64,
    };
    // A struct of a string and an integer always serializes.
    let header = serde_json::to_vec(&header).unwrap_or_default();
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + header.len() + data.len());
    #[allow(clippy::cast_possible_truncation)]
    frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(data);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(header: &[u8], declared_len: u32, payload: &[u8]) -> Vec<u8> {
        let mut frame = declared_len.to_be_bytes().to_vec();
        frame.extend_from_slice(header);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn test_decode_valid_upload() {
        let frame = encode_file("notes.txt", b"hello\n");
        let upload = decode_upload(&frame).unwrap();
        assert_eq!(upload.filename, "notes.txt");
        assert_eq!(upload.size, 6);
        assert_eq!(upload.data, b"hello\n");
    }

    #[test]
    fn test_header_length_beyond_frame_is_rejected() {
        let header = br#"{"filename":"a","size":0}"#;
        let frame = frame_with(header, 10_000, b"");
        let err = decode_upload(&frame).unwrap_err();
        assert_eq!(err.code(), "INVALID_FRAME");
        assert!(err.to_string().contains("exceeds frame size"));

        let frame = frame_with(header, u32::MAX, b"");
        assert!(decode_upload(&frame).is_err());
    }

    #[test]
    fn test_short_frames_are_rejected() {
        assert!(decode_upload(&[]).is_err());
        assert!(decode_upload(&[0, 0, 1]).is_err());
    }

    #[test]
    fn test_bad_header_and_size_mismatch() {
        let frame = frame_with(b"not-json", 8, b"data");
        assert_eq!(decode_upload(&frame).unwrap_err().code(), "INVALID_FRAME");

        let header = br#"{"filename":"a","size":9}"#;
        #[allow(clippy::cast_possible_truncation)]
        let frame = frame_with(header, header.len() as u32, b"data");
        assert!(decode_upload(&frame)
            .unwrap_err()
            .to_string()
            .contains("does not match"));
    }

    #[test]
    fn test_empty_payload() {
        let upload = decode_upload(&encode_file("empty", b"")).unwrap();
        assert!(upload.data.is_empty());
    }
}
