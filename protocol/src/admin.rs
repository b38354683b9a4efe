//! Wire shape of the admin aggregator's read API and `state_update` broadcast
//! (spec.md §4.J). The aggregation logic lives in `coordinator`; this is just
//! the data contract it serializes.

use crate::ids::{SceneId, SessionId, SubjectId};
use crate::reason::TerminationReason;
use serde::{Deserialize, Serialize};

/// Monotone session health, healthiest first (§4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    Healthy,
    Degraded,
    Reconnecting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminSessionEntry {
    pub session_id: SessionId,
    pub state: String,
    pub scene_id: SceneId,
    pub participants: Vec<SubjectId>,
    pub avg_rtt_ms: Option<u32>,
    pub health: SessionHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminTerminationEntry {
    pub session_id: SessionId,
    pub reason: TerminationReason,
    pub details: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdminSummaryStats {
    pub total_started: u64,
    pub total_completed: u64,
    pub completion_rate: f64,
    pub avg_session_duration_ms: f64,
}

/// One broadcast to the admin room; throttled by the aggregator to at most
/// one per session per `N` ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminStateUpdate {
    pub sessions: Vec<AdminSessionEntry>,
    pub terminations: Vec<AdminTerminationEntry>,
    pub summary: AdminSummaryStats,
}
