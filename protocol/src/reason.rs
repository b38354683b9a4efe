//! Termination reason taxonomy (spec.md §3, §7).

use serde::{Deserialize, Serialize};

/// Why a [`Session`](crate::SessionId) reached `ENDED`.
///
/// Drives participant-facing messaging (via the per-scene content-message
/// map) and audit classification. The server never synthesizes the
/// user-visible message itself; it only carries the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The game ran its course normally.
    Normal,
    /// A partner disconnected outside of a loading grace window.
    PartnerDisconnected,
    /// The client-side monitor detected sustained high latency.
    SustainedLatency,
    /// The client-side monitor detected the tab was hidden past grace.
    TabHiddenTimeout,
    /// A researcher-defined custom exclusion rule fired.
    CustomExclusion,
    /// The pre-game P2P probe failed, timed out, or exceeded the RTT gate.
    ProbeFailed,
    /// The participant lost window focus for longer than the allowed grace.
    FocusLossTimeout,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::PartnerDisconnected => "partner_disconnected",
            Self::SustainedLatency => "sustained_latency",
            Self::TabHiddenTimeout => "tab_hidden_timeout",
            Self::CustomExclusion => "custom_exclusion",
            Self::ProbeFailed => "probe_failed",
            Self::FocusLossTimeout => "focus_loss_timeout",
        }
    }
}
