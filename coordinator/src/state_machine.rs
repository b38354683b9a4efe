//! The participant state machine (spec.md §4.C).
//!
//! `IDLE → IN_WAITROOM → IN_GAME → GAME_ENDED → IDLE`, plus the "any → IDLE"
//! escape hatch for retention eviction. Any other transition is a protocol
//! violation: it is logged and rejected, never thrown as a panic.

use protocol::SubjectId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    Idle,
    InWaitroom,
    InGame,
    GameEnded,
}

/// Checks whether `from -> to` is a legal edge in the graph of §4.C.
/// `any -> Idle` is always legal (explicit reset after disconnect retention).
pub fn is_legal_transition(from: ParticipantState, to: ParticipantState) -> bool {
    use ParticipantState::*;
    match (from, to) {
        (_, Idle) => true,
        (Idle, InWaitroom) => true,
        (InWaitroom, InGame) => true,
        (InWaitroom, Idle) => true,
        (InGame, GameEnded) => true,
        (GameEnded, Idle) => true,
        _ => false,
    }
}

/// Attempts `from -> to`; logs and returns `false` on an illegal edge
/// instead of raising an error, per §4.C ("logged and rejected, without
/// throwing").
pub fn try_transition(subject: &SubjectId, from: ParticipantState, to: ParticipantState) -> bool {
    if is_legal_transition(from, to) {
        true
    } else {
        tracing::warn!(
            subject = %subject,
            from = ?from,
            to = ?to,
            "rejected illegal participant state transition"
        );
        false
    }
}

/// The gate enforced at the front of every waitroom-entry handler (§4.C).
pub fn can_join_waitroom(state: ParticipantState) -> bool {
    state == ParticipantState::Idle
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        use ParticipantState::*;
        assert!(is_legal_transition(Idle, InWaitroom));
        assert!(is_legal_transition(InWaitroom, InGame));
        assert!(is_legal_transition(InGame, GameEnded));
        assert!(is_legal_transition(GameEnded, Idle));
    }

    #[test]
    fn skipping_a_state_is_illegal() {
        use ParticipantState::*;
        assert!(!is_legal_transition(Idle, InGame));
        assert!(!is_legal_transition(InWaitroom, GameEnded));
        assert!(!is_legal_transition(GameEnded, InGame));
    }

    #[test]
    fn any_state_can_reset_to_idle() {
        use ParticipantState::*;
        for s in [Idle, InWaitroom, InGame, GameEnded] {
            assert!(is_legal_transition(s, Idle));
        }
    }

    #[test]
    fn can_join_waitroom_only_from_idle() {
        use ParticipantState::*;
        assert!(can_join_waitroom(Idle));
        assert!(!can_join_waitroom(InWaitroom));
        assert!(!can_join_waitroom(InGame));
        assert!(!can_join_waitroom(GameEnded));
    }
}
