//! The post-episode [`ValidationExport`] blob (spec.md §3, §4.K) and the
//! parity result computed from a session's exports.

use crate::ids::SubjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A 16-byte frame-state digest, hex-free on the wire (plain byte array).
pub type FrameHash = [u8; 16];

/// One confirmed frame hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedHash {
    pub frame: u64,
    pub hash: FrameHash,
}

/// One verified action taken by `subject` at `frame`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedAction {
    pub frame: u64,
    pub action: serde_json::Value,
}

/// A desync observed by the exporting client against a specific peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesyncEvent {
    pub frame: u64,
    pub our_hash: FrameHash,
    pub peer_hash: FrameHash,
    pub timestamp: i64,
    pub hash_was_state_dumped: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub total_frames: u64,
    pub verified_frame: u64,
    pub desync_count: u64,
}

/// The post-episode blob a client sends once its episode ends (`validation_export`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationExport {
    pub session_id: crate::ids::SessionId,
    pub subject_id: SubjectId,
    pub confirmed_hashes: Vec<ConfirmedHash>,
    pub verified_actions: BTreeMap<SubjectId, Vec<VerifiedAction>>,
    pub desync_events: Vec<DesyncEvent>,
    pub summary: ExportSummary,
}

/// Outcome of §4.K parity validation across all peers' exports for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParityResult {
    /// Every export agreed on every frame up to the common verified frame.
    Ok,
    /// At least one expected export never arrived (dropped, or the session's
    /// audit retention window elapsed first).
    Partial { missing: Vec<SubjectId> },
    /// Two exports disagreed on the hash of a frame.
    Desync { frame: u64 },
    /// Two exports disagreed on a verified action at a frame.
    Divergence { frame: u64, subject: SubjectId },
}
