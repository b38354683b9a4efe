//! The audit / export sink (spec.md §4.K).
//!
//! The single source of research-grade truth: once a session ends, every
//! participant's client uploads a [`ValidationExport`]; once they have all
//! arrived (or the retention window elapses) parity is checked and the union
//! is persisted, regardless of whether the players perceived the session as
//! successful.

use async_trait::async_trait;
use protocol::{
    ConfirmedHash, DesyncEvent, ParityResult, SessionId, SubjectId, ValidationExport,
    VerifiedAction,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditRecord {
    pub session_id: SessionId,
    pub expected: Vec<SubjectId>,
    pub exports: BTreeMap<SubjectId, ValidationExport>,
    pub parity: Option<ParityResult>,
}

/// Persists a finalized [`AuditRecord`]. The concrete implementation decides
/// where — `relay-server` wires a file-backed one in at `audit_dir`.
#[async_trait]
pub trait AuditPersistence: Send + Sync {
    async fn persist(&self, record: &AuditRecord);
    async fn append_match_log(&self, line: String);
}

/// Writes `data/<experiment_id>/audit/<session_id>.json` and appends to
/// `data/<experiment_id>/match_log.jsonl` (§6 persisted-state layout).
pub struct FileAuditPersistence {
    base_dir: String,
}

impl FileAuditPersistence {
    pub fn new(experiment_audit_dir: impl Into<String>) -> Self {
        Self { base_dir: experiment_audit_dir.into() }
    }
}

#[async_trait]
impl AuditPersistence for FileAuditPersistence {
    async fn persist(&self, record: &AuditRecord) {
        let dir = format!("{}/audit", self.base_dir);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            tracing::error!(error = %e, dir = %dir, "failed to create audit directory");
            return;
        }
        let path = format!("{}/{}.json", dir, record.session_id);
        match serde_json::to_vec_pretty(record) {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&path, bytes).await {
                    tracing::error!(error = %e, path = %path, "failed to write audit record");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize audit record"),
        }
    }

    async fn append_match_log(&self, line: String) {
        use tokio::io::AsyncWriteExt;
        if let Err(e) = tokio::fs::create_dir_all(&self.base_dir).await {
            tracing::error!(error = %e, "failed to create match-log directory");
            return;
        }
        let path = format!("{}/match_log.jsonl", self.base_dir);
        match tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(mut file) => {
                let mut buf = line;
                buf.push('\n');
                if let Err(e) = file.write_all(buf.as_bytes()).await {
                    tracing::error!(error = %e, "failed to append match log line");
                }
            }
            Err(e) => tracing::error!(error = %e, path = %path, "failed to open match log"),
        }
    }
}

struct PendingAudit {
    expected: Vec<SubjectId>,
    exports: BTreeMap<SubjectId, ValidationExport>,
}

pub struct AuditSink {
    pending: RwLock<HashMap<SessionId, PendingAudit>>,
    persistence: Arc<dyn AuditPersistence>,
}

impl AuditSink {
    pub fn new(persistence: Arc<dyn AuditPersistence>) -> Self {
        Self { pending: RwLock::new(HashMap::new()), persistence }
    }

    pub fn shared(persistence: Arc<dyn AuditPersistence>) -> Arc<Self> {
        Arc::new(Self::new(persistence))
    }

    /// Registers the set of subjects a session expects an export from; call
    /// this when the session reaches ENDED.
    pub async fn expect(&self, session_id: SessionId, expected: Vec<SubjectId>) {
        self.pending
            .write()
            .await
            .insert(session_id, PendingAudit { expected, exports: BTreeMap::new() });
    }

    /// Records one participant's export (§4.K step 1). Returns the computed
    /// parity result once every expected export has arrived, `None`
    /// otherwise.
    pub async fn record_export(&self, export: ValidationExport) -> Option<ParityResult> {
        let session_id = export.session_id.clone();
        let mut pending = self.pending.write().await;
        let Some(entry) = pending.get_mut(&session_id) else {
            tracing::warn!(session_id = %session_id, "validation export for unknown/expired session");
            return None;
        };
        entry.exports.insert(export.subject_id.clone(), export);
        if entry.exports.len() < entry.expected.len() {
            return None;
        }

        let entry = pending.remove(&session_id).unwrap();
        let parity = compute_parity(&entry.expected, &entry.exports);
        self.finalize(session_id, entry.expected, entry.exports, parity.clone()).await;
        Some(parity)
    }

    /// Called by the retention sweep when `audit_retention_timeout` elapses
    /// before every expected export arrived (§4.F step 6, §7 `audit_missing`).
    pub async fn finalize_on_timeout(&self, session_id: &SessionId) -> Option<ParityResult> {
        let entry = self.pending.write().await.remove(session_id)?;
        let missing: Vec<SubjectId> = entry
            .expected
            .iter()
            .filter(|s| !entry.exports.contains_key(s))
            .cloned()
            .collect();
        let parity = if missing.is_empty() {
            compute_parity(&entry.expected, &entry.exports)
        } else {
            for subject in &missing {
                tracing::warn!(
                    error = %crate::error::CoordinatorError::AuditMissing {
                        session_id: session_id.clone(),
                        subject: subject.clone(),
                    }
                );
            }
            ParityResult::Partial { missing }
        };
        self.finalize(session_id.clone(), entry.expected, entry.exports, parity.clone()).await;
        Some(parity)
    }

    async fn finalize(
        &self,
        session_id: SessionId,
        expected: Vec<SubjectId>,
        exports: BTreeMap<SubjectId, ValidationExport>,
        parity: ParityResult,
    ) {
        match &parity {
            ParityResult::Ok => tracing::info!(session_id = %session_id, "audit parity ok"),
            ParityResult::Desync { frame } | ParityResult::Divergence { frame, .. } => {
                tracing::warn!(
                    error = %crate::error::CoordinatorError::AuditMismatch { session_id: session_id.clone(), frame: *frame }
                );
            }
            other => tracing::warn!(session_id = %session_id, parity = ?other, "audit parity flagged"),
        }
        let record = AuditRecord { session_id, expected, exports, parity: Some(parity) };
        self.persistence.persist(&record).await;
    }

    pub async fn is_pending(&self, session_id: &SessionId) -> bool {
        self.pending.read().await.contains_key(session_id)
    }

    /// Appends one line to `data/<experiment_id>/match_log.jsonl` (§6
    /// persisted-state layout), one record per matched group.
    pub async fn append_match_log(&self, line: String) {
        self.persistence.append_match_log(line).await;
    }
}

/// Pure parity check (§4.K): for every frame at or below the minimum
/// `verified_frame` across all exports, every export must agree on the frame
/// hash and on every subject's verified action.
pub fn compute_parity(
    expected: &[SubjectId],
    exports: &BTreeMap<SubjectId, ValidationExport>,
) -> ParityResult {
    let missing: Vec<SubjectId> = expected.iter().filter(|s| !exports.contains_key(s)).cloned().collect();
    if !missing.is_empty() {
        return ParityResult::Partial { missing };
    }

    let Some(min_verified_frame) = exports.values().map(|e| e.summary.verified_frame).min() else {
        return ParityResult::Ok;
    };

    let mut hash_by_frame: HashMap<u64, [u8; 16]> = HashMap::new();
    for export in exports.values() {
        for confirmed in &export.confirmed_hashes {
            if confirmed.frame > min_verified_frame {
                continue;
            }
            match hash_by_frame.get(&confirmed.frame) {
                Some(existing) if *existing != confirmed.hash => {
                    return ParityResult::Desync { frame: confirmed.frame };
                }
                Some(_) => {}
                None => {
                    hash_by_frame.insert(confirmed.frame, confirmed.hash);
                }
            }
        }
    }

    let mut action_by_subject_frame: HashMap<(SubjectId, u64), &VerifiedAction> = HashMap::new();
    for export in exports.values() {
        for (subject, actions) in &export.verified_actions {
            for action in actions {
                if action.frame > min_verified_frame {
                    continue;
                }
                let key = (subject.clone(), action.frame);
                match action_by_subject_frame.get(&key) {
                    Some(existing) if existing.action != action.action => {
                        return ParityResult::Divergence { frame: action.frame, subject: subject.clone() };
                    }
                    Some(_) => {}
                    None => {
                        action_by_subject_frame.insert(key, action);
                    }
                }
            }
        }
    }

    ParityResult::Ok
}
