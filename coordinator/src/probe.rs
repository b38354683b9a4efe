//! The P2P probe coordinator (spec.md §4.E).
//!
//! Drives each candidate pair of a proposed group through a brief WebRTC
//! connectivity + RTT measurement ritual before the group is committed to a
//! [`Session`](crate::session::Session). A pure predicate from the caller's
//! point of view: it returns an aggregate result and may update the RTT EWMA
//! with fresh samples, but otherwise does not mutate participant state.

use crate::registry::ParticipantRegistry;
use crate::transport::{EmitTarget, Transport};
use protocol::{ProbeId, ProbeRole, ServerEvent, SubjectId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Ok { rtt_ms: u32 },
    Timeout,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum GroupProbeOutcome {
    /// Every pair connected; the worst pairwise RTT is reported so the
    /// caller can gate on `max_p2p_rtt_ms`.
    Ok { max_rtt_ms: u32 },
    Timeout,
    Failed { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Offering,
    Answering,
    Ice,
    Measuring,
    Done,
    Failed,
}

struct PairProbeState {
    pair: (SubjectId, SubjectId),
    phase: RwLock<Phase>,
    connected: RwLock<HashSet<SubjectId>>,
    rtt_reports: RwLock<HashMap<SubjectId, u32>>,
    outcome_tx: watch::Sender<Option<ProbeOutcome>>,
}

#[derive(Default)]
pub struct ProbeCoordinator {
    active: RwLock<HashMap<ProbeId, Arc<PairProbeState>>>,
}

impl ProbeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Probes all `C(n, 2)` pairs of `group` concurrently (§4.E: "For
    /// group_size > 2, all C(n,2) pairs are probed concurrently; a single
    /// failure fails the group"). Fresh RTT samples update the registry's
    /// EWMA for every probed subject.
    pub async fn probe_group(
        &self,
        transport: &dyn Transport,
        registry: &ParticipantRegistry,
        group: &[SubjectId],
        timeout: Duration,
    ) -> GroupProbeOutcome {
        let mut pairs = Vec::new();
        for i in 0..group.len() {
            for j in (i + 1)..group.len() {
                pairs.push((group[i].clone(), group[j].clone()));
            }
        }

        let mut futures = Vec::new();
        for pair in pairs {
            futures.push(self.probe_pair(transport, registry, pair, timeout));
        }

        let results = futures_util::future::join_all(futures).await;

        let mut max_rtt = 0u32;
        for outcome in results {
            match outcome {
                ProbeOutcome::Ok { rtt_ms } => max_rtt = max_rtt.max(rtt_ms),
                ProbeOutcome::Timeout => return GroupProbeOutcome::Timeout,
                ProbeOutcome::Failed { reason } => return GroupProbeOutcome::Failed { reason },
            }
        }
        GroupProbeOutcome::Ok { max_rtt_ms: max_rtt }
    }

    async fn probe_pair(
        &self,
        transport: &dyn Transport,
        registry: &ParticipantRegistry,
        pair: (SubjectId, SubjectId),
        timeout: Duration,
    ) -> ProbeOutcome {
        let probe_id = ProbeId(Uuid::new_v4().to_string());
        let (outcome_tx, mut outcome_rx) = watch::channel(None);
        let state = Arc::new(PairProbeState {
            pair: pair.clone(),
            phase: RwLock::new(Phase::Offering),
            connected: RwLock::new(HashSet::new()),
            rtt_reports: RwLock::new(HashMap::new()),
            outcome_tx,
        });
        self.active.write().await.insert(probe_id.clone(), state.clone());

        transport
            .emit(
                EmitTarget::Subject(pair.0.clone()),
                ServerEvent::ProbeStart { probe_id: probe_id.clone(), role: ProbeRole::Offerer },
            )
            .await;
        transport
            .emit(
                EmitTarget::Subject(pair.1.clone()),
                ServerEvent::ProbeStart { probe_id: probe_id.clone(), role: ProbeRole::Answerer },
            )
            .await;

        let outcome = tokio::time::timeout(timeout, async {
            loop {
                if outcome_rx.changed().await.is_err() {
                    return ProbeOutcome::Failed { reason: "probe state dropped".into() };
                }
                if let Some(outcome) = outcome_rx.borrow().clone() {
                    return outcome;
                }
            }
        })
        .await
        .unwrap_or(ProbeOutcome::Timeout);

        // Remove first so any late inbound signal looked up by probe_id
        // misses and is discarded, per §5 cancellation semantics.
        self.active.write().await.remove(&probe_id);

        match &outcome {
            ProbeOutcome::Ok { rtt_ms } => {
                registry.record_rtt(&pair.0, *rtt_ms).await;
                registry.record_rtt(&pair.1, *rtt_ms).await;
            }
            ProbeOutcome::Timeout => {
                tracing::warn!(error = %crate::error::CoordinatorError::ProbeTimeout { probe_id: probe_id.clone() });
            }
            ProbeOutcome::Failed { reason } => {
                tracing::warn!(
                    error = %crate::error::CoordinatorError::ProbeRejected {
                        probe_id: probe_id.clone(),
                        reason: reason.clone(),
                    }
                );
            }
        }

        outcome
    }

    /// Relays opaque WebRTC signaling verbatim to the other peer of the pair
    /// (§4.E step 3). Looked up by `probe_id`; a miss (expired/unknown probe)
    /// is silently dropped.
    pub async fn on_probe_signal(
        &self,
        transport: &dyn Transport,
        probe_id: &ProbeId,
        from: &SubjectId,
        payload: serde_json::Value,
    ) {
        let Some(state) = self.active.read().await.get(probe_id).cloned() else {
            return;
        };
        let to = if &state.pair.0 == from { &state.pair.1 } else { &state.pair.0 };
        transport
            .emit(
                EmitTarget::Subject(to.clone()),
                ServerEvent::ProbeSignal { probe_id: probe_id.clone(), payload },
            )
            .await;
    }

    /// On both peers reporting `probe_connected`, advances `ice → measuring`
    /// and kicks off the ping-pong round by emitting `probe_ping_request`
    /// (§4.E step 5).
    pub async fn on_probe_connected(&self, transport: &dyn Transport, probe_id: &ProbeId, from: &SubjectId) {
        let Some(state) = self.active.read().await.get(probe_id).cloned() else {
            return;
        };
        let became_ready = {
            let mut connected = state.connected.write().await;
            connected.insert(from.clone());
            connected.len() == 2
        };
        if became_ready {
            *state.phase.write().await = Phase::Measuring;
            self.request_ping(transport, probe_id).await;
        }
    }

    pub async fn request_ping(&self, transport: &dyn Transport, probe_id: &ProbeId) {
        let Some(state) = self.active.read().await.get(probe_id).cloned() else {
            return;
        };
        for subject in [&state.pair.0, &state.pair.1] {
            transport
                .emit(
                    EmitTarget::Subject(subject.clone()),
                    ServerEvent::ProbePingRequest { probe_id: probe_id.clone() },
                )
                .await;
        }
    }

    pub async fn on_probe_rtt_report(&self, probe_id: &ProbeId, from: &SubjectId, rtt_ms: u32) {
        let Some(state) = self.active.read().await.get(probe_id).cloned() else {
            return;
        };
        let done = {
            let mut reports = state.rtt_reports.write().await;
            reports.insert(from.clone(), rtt_ms);
            reports.len() == 2
        };
        if done {
            *state.phase.write().await = Phase::Done;
            let reports = state.rtt_reports.read().await;
            let worst = reports.values().copied().max().unwrap_or(rtt_ms);
            let _ = state.outcome_tx.send(Some(ProbeOutcome::Ok { rtt_ms: worst }));
        }
    }

    pub async fn on_probe_failed(&self, probe_id: &ProbeId, reason: String) {
        let Some(state) = self.active.read().await.get(probe_id).cloned() else {
            return;
        };
        *state.phase.write().await = Phase::Failed;
        let _ = state.outcome_tx.send(Some(ProbeOutcome::Failed { reason }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;

    #[tokio::test]
    async fn successful_pair_probe_reports_worst_rtt() {
        let coordinator = ProbeCoordinator::shared();
        let registry = ParticipantRegistry::new();
        let transport = FakeTransport::new();
        let group = vec![SubjectId::from("a"), SubjectId::from("b")];

        let coordinator2 = coordinator.clone();
        let driver = tokio::spawn(async move {
            // Give probe_group a moment to register the pair then drive it
            // to completion as if both peers connected and reported RTT.
            tokio::time::sleep(Duration::from_millis(20)).await;
            let probe_id = coordinator2
                .active
                .read()
                .await
                .keys()
                .next()
                .cloned()
                .expect("pair probe registered");
            let driver_transport = FakeTransport::new();
            coordinator2.on_probe_connected(&driver_transport, &probe_id, &SubjectId::from("a")).await;
            coordinator2.on_probe_connected(&driver_transport, &probe_id, &SubjectId::from("b")).await;
            coordinator2.on_probe_rtt_report(&probe_id, &SubjectId::from("a"), 40).await;
            coordinator2.on_probe_rtt_report(&probe_id, &SubjectId::from("b"), 60).await;
        });

        let outcome = coordinator
            .probe_group(&transport, &registry, &group, Duration::from_secs(2))
            .await;
        driver.await.unwrap();

        assert_eq!(outcome, GroupProbeOutcome::Ok { max_rtt_ms: 60 });
        assert_eq!(registry.get(&SubjectId::from("a")).await.unwrap().rtt_to_server_ms, Some(60));
    }

    #[tokio::test]
    async fn probe_times_out_without_completion() {
        let coordinator = ProbeCoordinator::shared();
        let registry = ParticipantRegistry::new();
        let transport = FakeTransport::new();
        let group = vec![SubjectId::from("a"), SubjectId::from("b")];

        let outcome = coordinator
            .probe_group(&transport, &registry, &group, Duration::from_millis(20))
            .await;
        assert_eq!(outcome, GroupProbeOutcome::Timeout);
    }

    #[tokio::test]
    async fn explicit_probe_failure_fails_the_group() {
        let coordinator = ProbeCoordinator::shared();
        let registry = ParticipantRegistry::new();
        let transport = FakeTransport::new();
        let group = vec![SubjectId::from("a"), SubjectId::from("b")];

        let coordinator2 = coordinator.clone();
        let driver = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let probe_id = coordinator2
                .active
                .read()
                .await
                .keys()
                .next()
                .cloned()
                .expect("pair probe registered");
            coordinator2.on_probe_failed(&probe_id, "ice gathering failed".into()).await;
        });

        let outcome = coordinator
            .probe_group(&transport, &registry, &group, Duration::from_secs(2))
            .await;
        driver.await.unwrap();
        assert_eq!(outcome, GroupProbeOutcome::Failed { reason: "ice gathering failed".into() });
    }
}
