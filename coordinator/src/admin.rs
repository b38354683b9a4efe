//! The admin aggregator (spec.md §4.J).
//!
//! A pure observer: it never sits on a critical path, and nothing in F/G/I
//! blocks on it. It keeps just enough state to answer the read API and drive
//! the throttled `state_update` broadcast.

use chrono::{DateTime, Utc};
use protocol::{
    AdminSessionEntry, AdminStateUpdate, AdminSummaryStats, AdminTerminationEntry, ConnectionKind,
    SceneId, SessionHealth, SessionId, SubjectId, TerminationReason,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// RTT at or above this is `degraded` rather than `healthy` (§4.J).
const RTT_WARNING_THRESHOLD_MS: u32 = 150;

/// Throttle window between `state_update` broadcasts for the same session.
pub const DEFAULT_THROTTLE_MS: i64 = 500;

#[derive(Debug, Clone)]
struct HealthReport {
    connection_type: ConnectionKind,
    rtt_ms: Option<u32>,
}

#[derive(Debug, Clone)]
struct TrackedSession {
    scene_id: SceneId,
    state: String,
    participants: Vec<SubjectId>,
    is_connected: HashMap<SubjectId, bool>,
    reports: HashMap<SubjectId, HealthReport>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct ConsoleLogs {
    by_subject: HashMap<SubjectId, Vec<String>>,
}

impl ConsoleLogs {
    fn push(&mut self, subject: &SubjectId, line: String) {
        let entries = self.by_subject.entry(subject.clone()).or_default();
        entries.push(line);
        if entries.len() > 20 {
            entries.remove(0);
        }
    }
}

#[derive(Default)]
struct SummaryCounters {
    total_started: u64,
    total_completed: u64,
    total_duration_ms: u64,
}

pub struct AdminAggregator {
    sessions: RwLock<HashMap<SessionId, TrackedSession>>,
    terminations: RwLock<HashMap<SessionId, AdminTerminationEntry>>,
    console_logs: RwLock<ConsoleLogs>,
    counters: RwLock<SummaryCounters>,
    last_broadcast: RwLock<HashMap<SessionId, DateTime<Utc>>>,
}

impl Default for AdminAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl AdminAggregator {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            terminations: RwLock::new(HashMap::new()),
            console_logs: RwLock::new(ConsoleLogs::default()),
            counters: RwLock::new(SummaryCounters::default()),
            last_broadcast: RwLock::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Called by F on every session state transition (§4.J inputs: "From
    /// A/C/F: state transition events").
    pub async fn record_session_state(
        &self,
        session_id: SessionId,
        scene_id: SceneId,
        state: &str,
        participants: &[SubjectId],
    ) {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session_id).or_insert_with(|| {
            TrackedSession {
                scene_id: scene_id.clone(),
                state: state.to_string(),
                participants: participants.to_vec(),
                is_connected: participants.iter().map(|s| (s.clone(), true)).collect(),
                reports: HashMap::new(),
                started_at: Utc::now(),
                ended_at: None,
            }
        });
        entry.state = state.to_string();
        if entry.participants.is_empty() {
            entry.participants = participants.to_vec();
        }
        if state == "matched" {
            self.counters.write().await.total_started += 1;
        }
        if state == "ended" || state == "probe_failed" {
            entry.ended_at = Some(Utc::now());
        }
        // A probe-failed teardown never played a session; it must not count
        // toward §4.J's completion stats the way a real "ended" does.
        if state == "ended" {
            let duration = (entry.ended_at.unwrap() - entry.started_at).num_milliseconds().max(0) as u64;
            let mut counters = self.counters.write().await;
            counters.total_completed += 1;
            counters.total_duration_ms += duration;
        }
    }

    pub async fn record_connection_state(&self, session_id: &SessionId, subject: &SubjectId, is_connected: bool) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session.is_connected.insert(subject.clone(), is_connected);
        }
    }

    /// Consumes a `p2p_health_report` (§4.G item 3: consumed by J, not
    /// relayed).
    pub async fn record_health_report(
        &self,
        session_id: &SessionId,
        subject: &SubjectId,
        connection_type: ConnectionKind,
        rtt_ms: Option<u32>,
    ) {
        if let Some(session) = self.sessions.write().await.get_mut(session_id) {
            session
                .reports
                .insert(subject.clone(), HealthReport { connection_type, rtt_ms });
        }
    }

    pub async fn record_termination(&self, session_id: SessionId, reason: TerminationReason, details: String) {
        self.terminations
            .write()
            .await
            .insert(session_id.clone(), AdminTerminationEntry { session_id, reason, details });
    }

    pub async fn record_console_log(&self, subject: &SubjectId, line: String) {
        self.console_logs.write().await.push(subject, line);
    }

    pub async fn console_log_for(&self, subject: &SubjectId) -> Vec<String> {
        self.console_logs
            .read()
            .await
            .by_subject
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether at least `throttle_ms` has elapsed since the last broadcast
    /// for `session_id` (§4.J: "throttled to at most one update per N ms per
    /// session").
    pub async fn should_broadcast(&self, session_id: &SessionId, throttle_ms: i64) -> bool {
        let now = Utc::now();
        let mut last = self.last_broadcast.write().await;
        match last.get(session_id) {
            Some(prev) if now - *prev < chrono::Duration::milliseconds(throttle_ms) => false,
            _ => {
                last.insert(session_id.clone(), now);
                true
            }
        }
    }

    pub async fn snapshot(&self) -> AdminStateUpdate {
        let sessions = self.sessions.read().await;
        let entries: Vec<AdminSessionEntry> = sessions
            .iter()
            .map(|(session_id, session)| {
                let rtts: Vec<u32> = session.reports.values().filter_map(|r| r.rtt_ms).collect();
                let avg_rtt_ms = if rtts.is_empty() {
                    None
                } else {
                    Some((rtts.iter().map(|r| *r as u64).sum::<u64>() / rtts.len() as u64) as u32)
                };
                AdminSessionEntry {
                    session_id: session_id.clone(),
                    state: session.state.clone(),
                    scene_id: session.scene_id.clone(),
                    participants: session.participants.clone(),
                    avg_rtt_ms,
                    health: derive_session_health(session.reports.values().cloned().collect(), session.is_connected.values().copied()),
                }
            })
            .collect();

        let terminations: Vec<AdminTerminationEntry> = self.terminations.read().await.values().cloned().collect();
        let counters = self.counters.read().await;
        let completion_rate = if counters.total_started == 0 {
            0.0
        } else {
            counters.total_completed as f64 / counters.total_started as f64
        };
        let avg_session_duration_ms = if counters.total_completed == 0 {
            0.0
        } else {
            counters.total_duration_ms as f64 / counters.total_completed as f64
        };

        AdminStateUpdate {
            sessions: entries,
            terminations,
            summary: AdminSummaryStats {
                total_started: counters.total_started,
                total_completed: counters.total_completed,
                completion_rate,
                avg_session_duration_ms,
            },
        }
    }
}

/// Monotone, healthiest-first (§4.J): `reconnecting` if any participant is
/// disconnected, else `degraded` if any report is non-direct or over the RTT
/// warning threshold, else `healthy`.
fn derive_session_health(
    reports: Vec<HealthReportForDerive>,
    mut is_connected: impl Iterator<Item = bool>,
) -> SessionHealth {
    if is_connected.any(|c| !c) {
        return SessionHealth::Reconnecting;
    }
    let degraded = reports.iter().any(|r| {
        r.connection_type != ConnectionKind::Direct
            || r.rtt_ms.map(|rtt| rtt >= RTT_WARNING_THRESHOLD_MS).unwrap_or(false)
    });
    if degraded {
        SessionHealth::Degraded
    } else {
        SessionHealth::Healthy
    }
}

type HealthReportForDerive = HealthReport;

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(s: &str) -> SubjectId {
        SubjectId::from(s)
    }

    #[tokio::test]
    async fn new_session_is_healthy_with_no_reports() {
        let agg = AdminAggregator::new();
        let session_id = SessionId::from("s1");
        agg.record_session_state(
            session_id.clone(),
            SceneId::from("scene"),
            "playing",
            &[subject("a"), subject("b")],
        )
        .await;
        let snapshot = agg.snapshot().await;
        assert_eq!(snapshot.sessions.len(), 1);
        assert_eq!(snapshot.sessions[0].health, SessionHealth::Healthy);
    }

    #[tokio::test]
    async fn disconnect_marks_session_reconnecting() {
        let agg = AdminAggregator::new();
        let session_id = SessionId::from("s1");
        agg.record_session_state(
            session_id.clone(),
            SceneId::from("scene"),
            "playing",
            &[subject("a"), subject("b")],
        )
        .await;
        agg.record_connection_state(&session_id, &subject("a"), false).await;
        let snapshot = agg.snapshot().await;
        assert_eq!(snapshot.sessions[0].health, SessionHealth::Reconnecting);
    }

    #[tokio::test]
    async fn high_rtt_report_marks_session_degraded() {
        let agg = AdminAggregator::new();
        let session_id = SessionId::from("s1");
        agg.record_session_state(
            session_id.clone(),
            SceneId::from("scene"),
            "playing",
            &[subject("a"), subject("b")],
        )
        .await;
        agg.record_health_report(&session_id, &subject("a"), ConnectionKind::Direct, Some(500))
            .await;
        let snapshot = agg.snapshot().await;
        assert_eq!(snapshot.sessions[0].health, SessionHealth::Degraded);
        assert_eq!(snapshot.sessions[0].avg_rtt_ms, Some(500));
    }

    #[tokio::test]
    async fn completion_rate_reflects_started_vs_ended() {
        let agg = AdminAggregator::new();
        agg.record_session_state(SessionId::from("s1"), SceneId::from("scene"), "matched", &[]).await;
        agg.record_session_state(SessionId::from("s1"), SceneId::from("scene"), "ended", &[]).await;
        agg.record_session_state(SessionId::from("s2"), SceneId::from("scene"), "matched", &[]).await;
        let snapshot = agg.snapshot().await;
        assert_eq!(snapshot.summary.total_started, 2);
        assert_eq!(snapshot.summary.total_completed, 1);
        assert_eq!(snapshot.summary.completion_rate, 0.5);
    }

    #[tokio::test]
    async fn probe_failed_teardown_does_not_count_as_completed() {
        let agg = AdminAggregator::new();
        agg.record_session_state(SessionId::from("s1"), SceneId::from("scene"), "matched", &[]).await;
        agg.record_session_state(SessionId::from("s1"), SceneId::from("scene"), "probe_failed", &[]).await;
        let snapshot = agg.snapshot().await;
        assert_eq!(snapshot.summary.total_started, 1);
        assert_eq!(snapshot.summary.total_completed, 0);
        assert_eq!(snapshot.summary.completion_rate, 0.0);
    }

    #[tokio::test]
    async fn broadcast_is_throttled_within_the_window() {
        let agg = AdminAggregator::new();
        let session_id = SessionId::from("s1");
        assert!(agg.should_broadcast(&session_id, 500).await);
        assert!(!agg.should_broadcast(&session_id, 500).await);
    }

    #[tokio::test]
    async fn console_log_ring_buffer_caps_at_twenty() {
        let agg = AdminAggregator::new();
        let subject = subject("a");
        for i in 0..25 {
            agg.record_console_log(&subject, format!("line {i}")).await;
        }
        let lines = agg.console_log_for(&subject).await;
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[0], "line 5");
    }
}
