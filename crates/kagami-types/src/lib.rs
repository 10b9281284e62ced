//! Shared wire and identity types for kagami.
//!
//! This crate is the protocol foundation: request IDs, the closed wire
//! message enum, directory entry types, and the identity record returned
//! by the auth backend. It has **no internal kagami dependencies** — a
//! pure leaf crate that other crates build on.
//!
//! # Message Flow Overview
//!
//! ```text
//! ChannelClient ──FileListRequest{requestId}──▶ Worker
//!               ◀─FileListResponse{requestId?, files}─
//!
//! ChannelClient ──FileReadRequest{path}───────▶ Worker
//!               ◀─FileOperation{read, path, content}─  (push, matched by path)
//!
//! ChannelClient ──FileWriteRequest{path, content, overwrite}─▶ Worker
//! ChannelClient ──FileDeleteRequest{path}─────▶ Worker
//! ```
//!
//! Requests that carry a [`RequestId`] are matched to their responses by
//! that id; the read/write/delete family is confirmed (or failed) by
//! push-style [`WireMessage::FileOperation`] messages matched by path.

pub mod entry;
pub mod identity;
pub mod ids;
pub mod wire;

pub use entry::{EntryKind, FileEntry};
pub use identity::Identity;
pub use ids::{ClockIdSource, CounterIdSource, RequestId, RequestIdSource};
pub use wire::{FileOp, WireError, WireMessage};

/// Current Unix time in milliseconds.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
