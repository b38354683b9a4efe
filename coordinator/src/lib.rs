//! The coordination engine (spec.md §4) behind an injected [`Transport`].
//!
//! Nothing in this crate touches a socket. `relay-server` drives this crate
//! from axum's WebSocket handlers and supplies the concrete `Transport`; this
//! split is what lets the whole engine be exercised with `FakeTransport` in
//! `#[cfg(test)]`.

pub mod admin;
pub mod audit;
pub mod config;
pub mod error;
pub mod grace;
pub mod matchmaker;
pub mod probe;
pub mod registry;
pub mod session;
pub mod state_machine;
pub mod transport;

pub use config::Config;
pub use error::CoordinatorError;
pub use session::{Session, SessionState};
pub use transport::{EmitTarget, Transport};

use crate::admin::AdminAggregator;
use crate::audit::{AuditPersistence, AuditSink};
use crate::grace::GraceTracker;
use crate::probe::ProbeCoordinator;
use crate::registry::ParticipantRegistry;
use crate::session::SessionManager;
use crate::state_machine::ParticipantState;
use protocol::{
    ClientEvent, ConnectionId, ProbeId, ServerEvent, SessionId, SubjectId, TerminationReason,
};
use std::sync::Arc;

/// The top-level facade `relay-server` holds one of per process: owns every
/// table named in §5's lock-order discipline and dispatches every
/// `ClientEvent` to the subsystem responsible for it.
pub struct Coordinator {
    pub config: Arc<Config>,
    pub registry: Arc<ParticipantRegistry>,
    pub probe_coordinator: Arc<ProbeCoordinator>,
    pub admin: Arc<AdminAggregator>,
    pub audit: Arc<AuditSink>,
    pub grace: Arc<GraceTracker>,
    pub sessions: Arc<SessionManager>,
}

impl Coordinator {
    pub fn new(config: Config, audit_persistence: Arc<dyn AuditPersistence>) -> Arc<Self> {
        let config = Arc::new(config);
        let registry = ParticipantRegistry::shared();
        let probe_coordinator = ProbeCoordinator::shared();
        let admin = AdminAggregator::shared();
        let audit = AuditSink::shared(audit_persistence);
        let grace = Arc::new(GraceTracker::new());
        let sessions = SessionManager::shared(
            config.clone(),
            registry.clone(),
            probe_coordinator.clone(),
            admin.clone(),
            audit.clone(),
            grace.clone(),
        );
        Arc::new(Self { config, registry, probe_coordinator, admin, audit, grace, sessions })
    }

    /// §4.B: registers a fresh connection, minting or recovering a
    /// [`SubjectId`] depending on the presented token.
    pub async fn register(&self, conn_id: ConnectionId, presented_token: Option<SubjectId>) -> SubjectId {
        let (subject_id, recovered) = self.registry.register_or_recover(conn_id, presented_token).await;
        if recovered {
            self.grace.complete_loading(&subject_id).await;
        }
        subject_id
    }

    /// Entry point for every in-band message from a client (§4.G dispatch).
    /// The caller (the transport hub) resolves the connection to a
    /// `SubjectId` before calling this — see §4.A.
    pub async fn handle_client_event(
        &self,
        transport: &dyn Transport,
        subject_id: &SubjectId,
        event: ClientEvent,
    ) {
        match event {
            ClientEvent::Register { .. } => {
                // Handled by the transport hub at connection-upgrade time (§4.A);
                // a stray in-band `register` after that is a no-op.
            }
            ClientEvent::JoinGame { scene_id } => {
                self.sessions.add_subject_to_game(transport, subject_id.clone(), scene_id).await;
            }
            ClientEvent::LeaveGame { session_id } => {
                let session_id = match session_id {
                    Some(id) => Some(id),
                    None => self
                        .registry
                        .get(subject_id)
                        .await
                        .and_then(|p| p.group_id)
                        .map(|g| SessionId(g.0)),
                };
                if let Some(session_id) = session_id {
                    self.sessions.end_session(transport, &session_id, TerminationReason::Normal).await;
                }
            }
            ClientEvent::AdvanceScene { scene_id } => {
                // §4.C: `advance_scene` is the sole trigger for GAME_ENDED -> IDLE.
                self.registry.set_state(subject_id, ParticipantState::Idle).await;
                self.registry.set_scene(subject_id, Some(scene_id)).await;
            }
            ClientEvent::PyodideLoadingStart => {
                self.grace.start_loading(subject_id.clone()).await;
            }
            ClientEvent::PyodideLoadingComplete => {
                self.grace.complete_loading(subject_id).await;
            }
            ClientEvent::Ping { timestamp } => {
                // §4.A layer 2: application-level RTT sampling, distinct from
                // the transport heartbeat. `timestamp` is the client's send
                // time, so round-trip so far is measured against it.
                let server_timestamp = now_ms();
                let sample_ms = (server_timestamp - timestamp).max(0) as u32;
                self.registry.record_rtt(subject_id, sample_ms).await;
                transport
                    .emit(
                        EmitTarget::Subject(subject_id.clone()),
                        ServerEvent::Pong { timestamp, server_timestamp },
                    )
                    .await;
            }
            ClientEvent::PeerSdp { session_id, payload } => {
                self.relay_to_session_peers(
                    transport,
                    &session_id,
                    subject_id,
                    ServerEvent::PeerSdp { session_id: session_id.clone(), from: subject_id.clone(), payload },
                )
                .await;
            }
            ClientEvent::PeerIce { session_id, payload } => {
                self.relay_to_session_peers(
                    transport,
                    &session_id,
                    subject_id,
                    ServerEvent::PeerIce { session_id: session_id.clone(), from: subject_id.clone(), payload },
                )
                .await;
            }
            ClientEvent::ProbeSignal { probe_id, payload } => {
                self.probe_coordinator.on_probe_signal(transport, &probe_id, subject_id, payload).await;
            }
            ClientEvent::ProbeConnected { probe_id } => {
                self.probe_coordinator.on_probe_connected(transport, &probe_id, subject_id).await;
            }
            ClientEvent::ProbeRttReport { probe_id, rtt_ms } => {
                self.probe_coordinator.on_probe_rtt_report(&probe_id, subject_id, rtt_ms).await;
            }
            ClientEvent::ProbeFailed { probe_id, reason } => {
                self.on_probe_failed(&probe_id, reason).await;
            }
            ClientEvent::PlayerAction { session_id, frame, action } => {
                self.relay_to_session_peers(
                    transport,
                    &session_id,
                    subject_id,
                    ServerEvent::PlayerAction { session_id: session_id.clone(), from: subject_id.clone(), frame, action },
                )
                .await;
            }
            ClientEvent::P2pHealthReport { session_id, connection_type, rtt_ms, status: _ } => {
                self.admin.record_health_report(&session_id, subject_id, connection_type, rtt_ms).await;
            }
            ClientEvent::MidGameExclusion { session_id, reason, frame_number, timestamp } => {
                let _ = timestamp;
                let _ = frame_number;
                let termination_reason = classify_exclusion_reason(&reason);
                self.sessions.mid_game_exclusion(transport, subject_id, &session_id, termination_reason).await;
            }
            ClientEvent::ValidationExport(export) => {
                self.audit.record_export(export).await;
            }
        }
    }

    async fn relay_to_session_peers(
        &self,
        transport: &dyn Transport,
        session_id: &SessionId,
        from: &SubjectId,
        event: ServerEvent,
    ) {
        // §4.G: relayed verbatim to every *other* peer in the session, never
        // echoed back to the sender.
        transport
            .emit(EmitTarget::RoomExcept(transport::session_room(session_id), from.clone()), event)
            .await;
    }

    async fn on_probe_failed(&self, probe_id: &ProbeId, reason: String) {
        self.probe_coordinator.on_probe_failed(probe_id, reason).await;
    }

    /// Periodic maintenance (§4.F retention sweep, §4.H safety timeout). The
    /// binary crate drives this on a `tokio::time::interval`.
    pub async fn retention_sweep(&self, transport: &dyn Transport) {
        self.sessions.retention_sweep(transport).await;
    }
}

/// Maps a monitor-supplied free-text exclusion reason to the termination
/// taxonomy (§7); unrecognized strings fall back to `custom_exclusion`,
/// matching the monitor's designed extensibility (researcher-defined rules).
fn classify_exclusion_reason(reason: &str) -> TerminationReason {
    match reason {
        "sustained_latency" => TerminationReason::SustainedLatency,
        "tab_hidden_timeout" => TerminationReason::TabHiddenTimeout,
        "focus_loss_timeout" => TerminationReason::FocusLossTimeout,
        _ => TerminationReason::CustomExclusion,
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;
    use async_trait::async_trait;

    struct NullPersistence;
    #[async_trait]
    impl AuditPersistence for NullPersistence {
        async fn persist(&self, _record: &audit::AuditRecord) {}
        async fn append_match_log(&self, _line: String) {}
    }

    #[tokio::test]
    async fn register_mints_a_subject_and_ping_is_answered() {
        let coordinator = Coordinator::new(Config::default(), Arc::new(NullPersistence));
        let transport = FakeTransport::new();
        let subject = coordinator.register(ConnectionId::from("c1"), None).await;
        coordinator.handle_client_event(&transport, &subject, ClientEvent::Ping { timestamp: 42 }).await;
        let events = transport.events_for(&format!("subject:{subject}")).await;
        assert!(matches!(events[0], ServerEvent::Pong { timestamp: 42, .. }));
    }

    #[test]
    fn unrecognized_exclusion_reason_falls_back_to_custom() {
        assert_eq!(classify_exclusion_reason("whatever"), TerminationReason::CustomExclusion);
        assert_eq!(classify_exclusion_reason("sustained_latency"), TerminationReason::SustainedLatency);
    }

    #[tokio::test]
    async fn advance_scene_resets_game_ended_to_idle_so_the_subject_can_rejoin() {
        use crate::config::{MatchmakerKind, SceneConfig};
        use protocol::SceneId;
        use std::collections::HashMap;

        let mut config = Config::default();
        config.scenes.insert(
            SceneId::from("s1"),
            SceneConfig {
                group_size: 2,
                matchmaker: MatchmakerKind::Fifo,
                max_server_rtt_sum_ms: None,
                max_p2p_rtt_ms: None,
                fallback_to_fifo: false,
                termination_messages: HashMap::new(),
            },
        );
        let coordinator = Coordinator::new(config, Arc::new(NullPersistence));
        let transport = FakeTransport::new();

        let a = coordinator.register(ConnectionId::from("c1"), None).await;
        let b = coordinator.register(ConnectionId::from("c2"), None).await;
        coordinator
            .handle_client_event(&transport, &a, ClientEvent::JoinGame { scene_id: SceneId::from("s1") })
            .await;
        coordinator
            .handle_client_event(&transport, &b, ClientEvent::JoinGame { scene_id: SceneId::from("s1") })
            .await;
        assert_eq!(coordinator.registry.get(&a).await.unwrap().state, ParticipantState::InGame);

        let session_id = coordinator.registry.get(&a).await.unwrap().group_id.map(|g| SessionId(g.0)).unwrap();
        coordinator.sessions.end_session(&transport, &session_id, TerminationReason::Normal).await;
        assert_eq!(coordinator.registry.get(&a).await.unwrap().state, ParticipantState::GameEnded);

        coordinator
            .handle_client_event(&transport, &a, ClientEvent::AdvanceScene { scene_id: SceneId::from("s1") })
            .await;
        assert_eq!(coordinator.registry.get(&a).await.unwrap().state, ParticipantState::Idle);

        // A can now re-enter a waitroom; before the fix this was rejected
        // with `invalid_state` because `GameEnded` never reset to `Idle`.
        coordinator
            .handle_client_event(&transport, &a, ClientEvent::JoinGame { scene_id: SceneId::from("s1") })
            .await;
        let events = transport.events_for(&format!("subject:{a}")).await;
        assert!(events.iter().any(|e| matches!(e, ServerEvent::WaitroomJoined { .. })));
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Error { code, .. } if code == "invalid_state")));
    }
}
