//! Wire messages exchanged with the worker.
//!
//! Every message is a JSON object with a `type` tag. The enum is closed:
//! exhaustive matching at the channel boundary, with unknown tags landing
//! in the [`WireError::UnknownType`] fallback bucket rather than a serde
//! error string. `fileListResponse` may omit `requestId` — older workers
//! never echoed it, and the channel matches such a response against the
//! oldest outstanding list call.

use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

/// The operation named by a push-style [`WireMessage::FileOperation`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FileOp {
    Read,
    Write,
    Delete,
    Rename,
}

/// A message on the worker channel.
///
/// Tag spellings (`fileListRequest`, ...) are fixed by the worker protocol
/// and must not drift.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    /// Ask for the worker's file listing.
    #[serde(rename_all = "camelCase")]
    FileListRequest { request_id: RequestId },

    /// Listing result. `request_id` absent = matches any outstanding list
    /// call (backward compatibility with workers that never echo it).
    #[serde(rename_all = "camelCase")]
    FileListResponse {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        files: Vec<String>,
    },

    /// Request file content. Answered by a push `FileOperation` matched by
    /// path, not by a correlation id.
    FileReadRequest { path: String },

    /// Write file content.
    FileWriteRequest {
        path: String,
        content: String,
        overwrite: bool,
    },

    /// Delete a path.
    FileDeleteRequest { path: String },

    /// Push-style operation result from the worker. `content` accompanies
    /// a successful read; `error` present means the operation failed.
    FileOperation {
        operation: FileOp,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WireMessage {
    /// Decode a message off the wire.
    pub fn decode(text: &str) -> Result<Self, WireError> {
        // Two-step decode so an unrecognized `type` tag is reported as
        // UnknownType (counted and dropped upstream) instead of a generic
        // parse failure.
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| WireError::Malformed(e.to_string()))?;
        let tag = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| WireError::Malformed("missing `type` field".into()))?
            .to_string();
        match serde_json::from_value::<Self>(value) {
            Ok(msg) => Ok(msg),
            Err(_) if !Self::known_tag(&tag) => Err(WireError::UnknownType(tag)),
            Err(e) => Err(WireError::Malformed(e.to_string())),
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> String {
        // Serialization of a field-complete enum cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    fn known_tag(tag: &str) -> bool {
        matches!(
            tag,
            "fileListRequest"
                | "fileListResponse"
                | "fileReadRequest"
                | "fileWriteRequest"
                | "fileDeleteRequest"
                | "fileOperation"
        )
    }

    /// The correlation id this message carries, if any.
    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::FileListRequest { request_id } => Some(request_id),
            Self::FileListResponse { request_id, .. } => request_id.as_ref(),
            _ => None,
        }
    }

    /// The path this message names, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::FileReadRequest { path }
            | Self::FileWriteRequest { path, .. }
            | Self::FileDeleteRequest { path }
            | Self::FileOperation { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Error decoding a wire message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Not valid JSON, or a known tag with a bad shape.
    #[error("malformed wire message: {0}")]
    Malformed(String),
    /// Valid JSON with a `type` tag this client does not know.
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

// ============================================================================
// Tests
// ============================================================================
