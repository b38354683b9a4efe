//! The client↔server typed envelope.
//!
//! On the wire every message is `{"event": "...", "payload": {...}}` — the
//! reference implementation speaks this over Socket.IO; any equivalent
//! bidirectional message stream works, which is why this crate only commits
//! to the JSON shape and not to a particular transport.

use crate::export::ValidationExport;
use crate::ids::{ProbeId, SceneId, SessionId, SubjectId};
use serde::{Deserialize, Serialize};

/// Which WebRTC connection kind a participant's client currently reports
/// for a session (§3 `p2p_health`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Direct,
    Relay,
    SocketioFallback,
}

/// The role assigned to a peer for one probe pairing (§4.E).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeRole {
    Offerer,
    Answerer,
}

/// Events emitted by the browser client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    Register {
        token: Option<String>,
    },
    JoinGame {
        scene_id: SceneId,
    },
    LeaveGame {
        session_id: Option<SessionId>,
    },
    AdvanceScene {
        scene_id: SceneId,
    },
    PyodideLoadingStart,
    PyodideLoadingComplete,
    Ping {
        timestamp: i64,
    },
    PeerSdp {
        session_id: SessionId,
        payload: serde_json::Value,
    },
    PeerIce {
        session_id: SessionId,
        payload: serde_json::Value,
    },
    ProbeSignal {
        probe_id: ProbeId,
        payload: serde_json::Value,
    },
    ProbeConnected {
        probe_id: ProbeId,
    },
    ProbeRttReport {
        probe_id: ProbeId,
        rtt_ms: u32,
    },
    ProbeFailed {
        probe_id: ProbeId,
        reason: String,
    },
    PlayerAction {
        session_id: SessionId,
        frame: u64,
        action: serde_json::Value,
    },
    P2pHealthReport {
        session_id: SessionId,
        connection_type: ConnectionKind,
        rtt_ms: Option<u32>,
        status: String,
    },
    MidGameExclusion {
        session_id: SessionId,
        reason: String,
        frame_number: u64,
        timestamp: i64,
    },
    ValidationExport(ValidationExport),
}

/// Events emitted by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    WaitroomJoined {
        scene_id: SceneId,
    },
    GameStart {
        session_id: SessionId,
        participants: Vec<SubjectId>,
        /// Player-slot index (0 = "player 0") for every participant, in the
        /// session's stable player order.
        slot_assignments: Vec<(SubjectId, u8)>,
    },
    SessionEnded {
        reason: crate::reason::TerminationReason,
        message: String,
    },
    /// A proposed group's pre-game P2P probe failed, timed out, or exceeded
    /// `max_p2p_rtt_ms`; the recipient returns to its waitroom.
    MatchProbeFailed {
        session_id: SessionId,
        reason: String,
    },
    ProbeStart {
        probe_id: ProbeId,
        role: ProbeRole,
    },
    ProbeSignal {
        probe_id: ProbeId,
        payload: serde_json::Value,
    },
    ProbePingRequest {
        probe_id: ProbeId,
    },
    ProbeFailed {
        probe_id: ProbeId,
        reason: String,
    },
    Pong {
        timestamp: i64,
        server_timestamp: i64,
    },
    PeerSdp {
        session_id: SessionId,
        from: SubjectId,
        payload: serde_json::Value,
    },
    PeerIce {
        session_id: SessionId,
        from: SubjectId,
        payload: serde_json::Value,
    },
    PlayerAction {
        session_id: SessionId,
        from: SubjectId,
        frame: u64,
        action: serde_json::Value,
    },
    Error {
        code: String,
        message: String,
    },
    StateUpdate(crate::admin::AdminStateUpdate),
}
