//! The `Transport` seam (spec.md §4.A) the core drives without knowing
//! whether it's axum WebSockets, a test double, or anything else.
//!
//! The coordinator crate never touches a socket directly; `relay-server`
//! supplies the concrete implementation. This mirrors how the teacher's
//! relay-server keeps the WebSocket sink behind a `SplitSink` it passes
//! around, except here the seam is an explicit trait so the core can be
//! exercised without axum in the loop.

use protocol::{ConnectionId, ServerEvent, SubjectId};

/// Who an emit is addressed to. Emit MUST NOT reorder messages sent to the
/// same target from the same logical sender (§4.A).
#[derive(Debug, Clone)]
pub enum EmitTarget {
    Connection(ConnectionId),
    Subject(SubjectId),
    Room(String),
    /// All other members of `room`, excluding the named subject — used for
    /// relaying signaling/input that must not echo back to its sender
    /// (§4.G: "relayed verbatim to all *other* peers in the session").
    RoomExcept(String, SubjectId),
    Broadcast,
}

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn emit(&self, target: EmitTarget, event: ServerEvent);
    /// Joins whichever connection `subject` currently owns to `room`. The
    /// concrete implementation resolves the subject's live connection; the
    /// core never needs to know a `ConnectionId` to manage room membership.
    async fn join_room(&self, subject: &SubjectId, room: &str);
    async fn leave_room(&self, subject: &SubjectId, room: &str);
}

/// The room every session's runtime traffic is multicast on.
pub fn session_room(session_id: &protocol::SessionId) -> String {
    format!("session:{session_id}")
}

/// The room the admin `state_update` broadcast goes out on (§4.J).
pub const ADMIN_ROOM: &str = "admin";

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::Mutex;

    /// Records every emit instead of touching a socket; used to drive the
    /// session manager and friends in unit tests without axum. Tracks real
    /// room membership (unlike a no-op stub) so tests can assert on
    /// sender-excluding relay targets.
    #[derive(Default)]
    pub struct FakeTransport {
        pub emitted: Mutex<Vec<(String, ServerEvent)>>,
        rooms: Mutex<HashMap<String, HashSet<SubjectId>>>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn events_for(&self, target_label: &str) -> Vec<ServerEvent> {
            self.emitted
                .lock()
                .await
                .iter()
                .filter(|(t, _)| t == target_label)
                .map(|(_, e)| e.clone())
                .collect()
        }

        pub async fn all(&self) -> Vec<(String, ServerEvent)> {
            self.emitted.lock().await.clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn emit(&self, target: EmitTarget, event: ServerEvent) {
            match target {
                EmitTarget::Connection(c) => {
                    self.emitted.lock().await.push((format!("conn:{c}"), event));
                }
                EmitTarget::Subject(s) => {
                    self.emitted.lock().await.push((format!("subject:{s}"), event));
                }
                EmitTarget::Room(r) => {
                    let members: Vec<SubjectId> =
                        self.rooms.lock().await.get(&r).cloned().unwrap_or_default().into_iter().collect();
                    let mut emitted = self.emitted.lock().await;
                    for subject in members {
                        emitted.push((format!("subject:{subject}"), event.clone()));
                    }
                }
                EmitTarget::RoomExcept(r, exclude) => {
                    let members: Vec<SubjectId> = self
                        .rooms
                        .lock()
                        .await
                        .get(&r)
                        .cloned()
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|s| *s != exclude)
                        .collect();
                    let mut emitted = self.emitted.lock().await;
                    for subject in members {
                        emitted.push((format!("subject:{subject}"), event.clone()));
                    }
                }
                EmitTarget::Broadcast => {
                    self.emitted.lock().await.push(("broadcast".to_string(), event));
                }
            }
        }

        async fn join_room(&self, subject: &SubjectId, room: &str) {
            self.rooms.lock().await.entry(room.to_string()).or_default().insert(subject.clone());
        }

        async fn leave_room(&self, subject: &SubjectId, room: &str) {
            if let Some(members) = self.rooms.lock().await.get_mut(room) {
                members.remove(subject);
            }
        }
    }
}
