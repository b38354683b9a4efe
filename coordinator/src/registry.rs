//! The participant registry (spec.md §4.B, §3 `Participant`/`GroupHistory`).
//!
//! Canonical store for every participant a coordinator process has ever
//! seen. Protected by one coarse `RwLock` per table, per the lock-order
//! discipline of §5 (`PARTICIPANTS` before every other table).

use crate::state_machine::{try_transition, ParticipantState};
use chrono::{DateTime, Utc};
use protocol::{ConnectionId, GroupId, SceneId, SubjectId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// EWMA smoothing factor for the application-level RTT ping (§4.A).
const RTT_EWMA_ALPHA: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct Participant {
    pub subject_id: SubjectId,
    pub current_connection: Option<ConnectionId>,
    pub is_connected: bool,
    pub state: ParticipantState,
    pub scene_id: Option<SceneId>,
    pub group_id: Option<GroupId>,
    pub rtt_to_server_ms: Option<u32>,
    pub custom_attributes: serde_json::Map<String, serde_json::Value>,
    pub stager_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Participant {
    fn new(subject_id: SubjectId) -> Self {
        let now = Utc::now();
        Self {
            subject_id,
            current_connection: None,
            is_connected: false,
            state: ParticipantState::Idle,
            scene_id: None,
            group_id: None,
            rtt_to_server_ms: None,
            custom_attributes: serde_json::Map::new(),
            stager_state: None,
            created_at: now,
            last_updated_at: now,
        }
    }
}

/// Most-recent-wins grouping record for a subject (§3 `GroupHistory`).
#[derive(Debug, Clone, Default)]
pub struct GroupHistory {
    pub previous_partners: HashSet<SubjectId>,
    pub source_scene_id: Option<SceneId>,
    pub group_id: Option<GroupId>,
}

pub struct ParticipantRegistry {
    participants: RwLock<HashMap<SubjectId, Participant>>,
    group_history: RwLock<HashMap<SubjectId, GroupHistory>>,
}

impl Default for ParticipantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self {
            participants: RwLock::new(HashMap::new()),
            group_history: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// If `presented_token` names an existing, currently-disconnected
    /// participant, rebinds to it (`was_recovered = true`). Otherwise mints a
    /// fresh [`SubjectId`] (§4.B).
    pub async fn register_or_recover(
        &self,
        conn_id: ConnectionId,
        presented_token: Option<SubjectId>,
    ) -> (SubjectId, bool) {
        let mut participants = self.participants.write().await;

        if let Some(token) = presented_token {
            if let Some(existing) = participants.get_mut(&token) {
                if !existing.is_connected {
                    existing.current_connection = Some(conn_id);
                    existing.is_connected = true;
                    existing.last_updated_at = Utc::now();
                    tracing::info!(subject = %token, "recovered participant on reconnect");
                    return (token, true);
                }
            }
        }

        let subject_id = SubjectId(Uuid::new_v4().to_string());
        let mut participant = Participant::new(subject_id.clone());
        participant.current_connection = Some(conn_id);
        participant.is_connected = true;
        participants.insert(subject_id.clone(), participant);
        tracing::info!(subject = %subject_id, "minted new participant");
        (subject_id, false)
    }

    pub async fn bind_connection(&self, subject_id: &SubjectId, conn_id: ConnectionId) {
        let mut participants = self.participants.write().await;
        if let Some(p) = participants.get_mut(subject_id) {
            p.current_connection = Some(conn_id);
            p.is_connected = true;
            p.last_updated_at = Utc::now();
        }
    }

    /// Preserves state and stager, per §4.B — only the connectivity flag
    /// changes.
    pub async fn mark_disconnected(&self, subject_id: &SubjectId) {
        let mut participants = self.participants.write().await;
        if let Some(p) = participants.get_mut(subject_id) {
            p.is_connected = false;
            p.last_updated_at = Utc::now();
        }
    }

    pub async fn get(&self, subject_id: &SubjectId) -> Option<Participant> {
        self.participants.read().await.get(subject_id).cloned()
    }

    pub async fn iter_by_scene(&self, scene_id: &SceneId) -> Vec<Participant> {
        self.participants
            .read()
            .await
            .values()
            .filter(|p| p.scene_id.as_ref() == Some(scene_id))
            .cloned()
            .collect()
    }

    pub async fn iter_by_state(&self, state: ParticipantState) -> Vec<Participant> {
        self.participants
            .read()
            .await
            .values()
            .filter(|p| p.state == state)
            .cloned()
            .collect()
    }

    pub async fn record_rtt(&self, subject_id: &SubjectId, sample_ms: u32) {
        let mut participants = self.participants.write().await;
        if let Some(p) = participants.get_mut(subject_id) {
            p.rtt_to_server_ms = Some(match p.rtt_to_server_ms {
                None => sample_ms,
                Some(prev) => {
                    (RTT_EWMA_ALPHA * sample_ms as f64 + (1.0 - RTT_EWMA_ALPHA) * prev as f64)
                        .round() as u32
                }
            });
            p.last_updated_at = Utc::now();
        }
    }

    /// Attempts `subject_id`'s transition to `to`; returns whether it was
    /// legal and, if so, applies it.
    pub async fn set_state(&self, subject_id: &SubjectId, to: ParticipantState) -> bool {
        let mut participants = self.participants.write().await;
        let Some(p) = participants.get_mut(subject_id) else {
            return false;
        };
        if !try_transition(subject_id, p.state, to) {
            return false;
        }
        p.state = to;
        p.last_updated_at = Utc::now();
        true
    }

    pub async fn set_scene(&self, subject_id: &SubjectId, scene_id: Option<SceneId>) {
        let mut participants = self.participants.write().await;
        if let Some(p) = participants.get_mut(subject_id) {
            p.scene_id = scene_id;
            p.last_updated_at = Utc::now();
        }
    }

    pub async fn set_group(&self, subject_id: &SubjectId, group_id: Option<GroupId>) {
        let mut participants = self.participants.write().await;
        if let Some(p) = participants.get_mut(subject_id) {
            p.group_id = group_id;
            p.last_updated_at = Utc::now();
        }
    }

    pub async fn set_stager_state(&self, subject_id: &SubjectId, stager: serde_json::Value) {
        let mut participants = self.participants.write().await;
        if let Some(p) = participants.get_mut(subject_id) {
            p.stager_state = Some(stager);
        }
    }

    pub async fn merge_custom_attributes(
        &self,
        subject_id: &SubjectId,
        attrs: serde_json::Map<String, serde_json::Value>,
    ) {
        let mut participants = self.participants.write().await;
        if let Some(p) = participants.get_mut(subject_id) {
            p.custom_attributes.extend(attrs);
        }
    }

    /// Writes [`GroupHistory`] for every participant in `subject_ids`,
    /// replacing any prior record (most-recent-wins), per §4.B.
    pub async fn record_group(
        &self,
        subject_ids: &[SubjectId],
        scene_id: SceneId,
        group_id: GroupId,
    ) {
        let mut histories = self.group_history.write().await;
        for subject_id in subject_ids {
            let partners: HashSet<SubjectId> = subject_ids
                .iter()
                .filter(|id| *id != subject_id)
                .cloned()
                .collect();
            histories.insert(
                subject_id.clone(),
                GroupHistory {
                    previous_partners: partners,
                    source_scene_id: Some(scene_id.clone()),
                    group_id: Some(group_id.clone()),
                },
            );
        }
    }

    pub async fn group_history(&self, subject_id: &SubjectId) -> Option<GroupHistory> {
        self.group_history.read().await.get(subject_id).cloned()
    }

    /// Full cleanup including [`GroupHistory`]; invoked only by the
    /// lifecycle manager's retention sweep (§4.B).
    pub async fn hard_evict(&self, subject_id: &SubjectId) {
        self.participants.write().await.remove(subject_id);
        self.group_history.write().await.remove(subject_id);
        tracing::info!(subject = %subject_id, "hard-evicted participant");
    }

    /// All subjects disconnected for at least `retention` — candidates for
    /// the retention sweep (§4.F).
    pub async fn disconnected_longer_than(
        &self,
        retention: chrono::Duration,
    ) -> Vec<SubjectId> {
        let now = Utc::now();
        self.participants
            .read()
            .await
            .values()
            .filter(|p| !p.is_connected && now - p.last_updated_at >= retention)
            .map(|p| p.subject_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_mints_a_fresh_subject_then_recovers_it() {
        let registry = ParticipantRegistry::new();
        let (subject, recovered) = registry
            .register_or_recover(ConnectionId::from("c1"), None)
            .await;
        assert!(!recovered);

        registry.mark_disconnected(&subject).await;

        let (again, recovered) = registry
            .register_or_recover(ConnectionId::from("c2"), Some(subject.clone()))
            .await;
        assert!(recovered);
        assert_eq!(again, subject);

        let participant = registry.get(&subject).await.unwrap();
        assert!(participant.is_connected);
        assert_eq!(participant.current_connection, Some(ConnectionId::from("c2")));
    }

    #[tokio::test]
    async fn reconnect_refuses_a_still_connected_token() {
        let registry = ParticipantRegistry::new();
        let (subject, _) = registry
            .register_or_recover(ConnectionId::from("c1"), None)
            .await;

        let (other, recovered) = registry
            .register_or_recover(ConnectionId::from("c2"), Some(subject.clone()))
            .await;
        assert!(!recovered);
        assert_ne!(other, subject);
    }

    #[tokio::test]
    async fn record_group_is_most_recent_wins() {
        let registry = ParticipantRegistry::new();
        let a = SubjectId::from("a");
        let b = SubjectId::from("b");
        let c = SubjectId::from("c");
        let scene = SceneId::from("s1");

        registry
            .record_group(&[a.clone(), b.clone()], scene.clone(), GroupId::from("g1"))
            .await;
        let hist = registry.group_history(&a).await.unwrap();
        assert!(hist.previous_partners.contains(&b));

        registry
            .record_group(&[a.clone(), c.clone()], scene, GroupId::from("g2"))
            .await;
        let hist = registry.group_history(&a).await.unwrap();
        assert!(hist.previous_partners.contains(&c));
        assert!(!hist.previous_partners.contains(&b));
    }

    #[tokio::test]
    async fn rtt_ewma_smooths_samples() {
        let registry = ParticipantRegistry::new();
        let (subject, _) = registry
            .register_or_recover(ConnectionId::from("c1"), None)
            .await;
        registry.record_rtt(&subject, 100).await;
        assert_eq!(registry.get(&subject).await.unwrap().rtt_to_server_ms, Some(100));
        registry.record_rtt(&subject, 200).await;
        // 0.2 * 200 + 0.8 * 100 = 120
        assert_eq!(registry.get(&subject).await.unwrap().rtt_to_server_ms, Some(120));
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let registry = ParticipantRegistry::new();
        let (subject, _) = registry
            .register_or_recover(ConnectionId::from("c1"), None)
            .await;
        assert!(!registry.set_state(&subject, ParticipantState::InGame).await);
        assert_eq!(registry.get(&subject).await.unwrap().state, ParticipantState::Idle);
        assert!(registry.set_state(&subject, ParticipantState::InWaitroom).await);
    }
}
