//! The error taxonomy of spec.md §7. Each kind propagates as a tagged
//! result; nothing in this crate panics or uses exceptions-as-control-flow —
//! "no match yet" and "still loading" are plain `Option`/`bool`, not errors.

use protocol::{ProbeId, SessionId, SubjectId};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("invalid state transition for subject {subject}")]
    InvalidTransition { subject: SubjectId },

    #[error("unknown session {session_id}")]
    UnknownSession { session_id: SessionId },

    #[error("probe {probe_id} timed out before completion")]
    ProbeTimeout { probe_id: ProbeId },

    #[error("probe {probe_id} was rejected: {reason}")]
    ProbeRejected { probe_id: ProbeId, reason: String },

    #[error("peer {subject} disconnected outside of a grace window")]
    PeerDisconnected { subject: SubjectId },

    #[error("subject {subject} was excluded mid-game: {reason}")]
    MidGameExclusion { subject: SubjectId, reason: String },

    #[error("audit export missing for subject {subject} in session {session_id}")]
    AuditMissing {
        session_id: SessionId,
        subject: SubjectId,
    },

    #[error("audit mismatch in session {session_id} at frame {frame}")]
    AuditMismatch { session_id: SessionId, frame: u64 },

    #[error("emit queue overflowed for subject {subject}")]
    EmitOverflow { subject: SubjectId },
}
