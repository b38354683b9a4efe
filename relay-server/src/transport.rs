//! The concrete [`coordinator::Transport`] (spec.md §4.A) wiring coordinator
//! emits to live axum WebSocket connections.
//!
//! Each connection gets a bounded outbound queue instead of an unbounded
//! `mpsc`, per §5's backpressure contract: if the queue is full, the oldest
//! non-critical message is evicted to make room; if even that can't free
//! space for a session-critical message (`game_start`, `session_ended`), the
//! connection is torn down rather than stall the coordinator.

use coordinator::{EmitTarget, Transport};
use protocol::{ConnectionId, ServerEvent, SubjectId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

/// Outbound queue depth per connection before non-critical messages start
/// getting evicted (§5: "emit queues per connection have a bounded size").
const QUEUE_CAPACITY: usize = 128;

fn is_critical(event: &ServerEvent) -> bool {
    matches!(event, ServerEvent::GameStart { .. } | ServerEvent::SessionEnded { .. })
}

pub struct OutboundQueue {
    inner: std::sync::Mutex<VecDeque<ServerEvent>>,
    pub notify: Notify,
    pub overflowed: std::sync::atomic::AtomicBool,
}

impl OutboundQueue {
    fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            overflowed: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn push(&self, event: ServerEvent, subject_id: Option<&SubjectId>) {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() < QUEUE_CAPACITY {
            queue.push_back(event);
            drop(queue);
            self.notify.notify_one();
            return;
        }
        if let Some(pos) = queue.iter().position(|e| !is_critical(e)) {
            queue.remove(pos);
            queue.push_back(event);
            drop(queue);
            self.notify.notify_one();
            return;
        }
        if is_critical(&event) {
            // Queue is saturated with other critical messages; nothing safe
            // to evict. The connection is beyond saving.
            drop(queue);
            self.overflowed.store(true, std::sync::atomic::Ordering::SeqCst);
            self.notify.notify_one();
            if let Some(subject_id) = subject_id {
                tracing::error!(
                    error = %coordinator::CoordinatorError::EmitOverflow { subject: subject_id.clone() }
                );
            }
        }
        // Non-critical message with no evictable slot: dropped silently.
    }

    pub fn drain(&self) -> Vec<ServerEvent> {
        let mut queue = self.inner.lock().unwrap();
        queue.drain(..).collect()
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct AxumTransport {
    connections: RwLock<HashMap<ConnectionId, Arc<OutboundQueue>>>,
    subject_connection: RwLock<HashMap<SubjectId, ConnectionId>>,
    rooms: RwLock<HashMap<String, HashSet<SubjectId>>>,
}

impl AxumTransport {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register_connection(&self, conn_id: ConnectionId) -> Arc<OutboundQueue> {
        let queue = Arc::new(OutboundQueue::new());
        self.connections.write().await.insert(conn_id, queue.clone());
        queue
    }

    pub async fn bind_subject(&self, subject_id: SubjectId, conn_id: ConnectionId) {
        self.subject_connection.write().await.insert(subject_id, conn_id);
    }

    pub async fn deregister_connection(&self, conn_id: &ConnectionId) {
        self.connections.write().await.remove(conn_id);
    }

    pub async fn forget_subject(&self, subject_id: &SubjectId) {
        self.subject_connection.write().await.remove(subject_id);
        let mut rooms = self.rooms.write().await;
        for members in rooms.values_mut() {
            members.remove(subject_id);
        }
    }

    async fn queue_for_subject(&self, subject_id: &SubjectId) -> Option<Arc<OutboundQueue>> {
        let conn_id = self.subject_connection.read().await.get(subject_id).cloned()?;
        self.connections.read().await.get(&conn_id).cloned()
    }
}

#[async_trait::async_trait]
impl Transport for AxumTransport {
    async fn emit(&self, target: EmitTarget, event: ServerEvent) {
        match target {
            EmitTarget::Connection(conn_id) => {
                if let Some(queue) = self.connections.read().await.get(&conn_id) {
                    queue.push(event, None);
                }
            }
            EmitTarget::Subject(subject_id) => {
                if let Some(queue) = self.queue_for_subject(&subject_id).await {
                    queue.push(event, Some(&subject_id));
                }
            }
            EmitTarget::Room(room) => {
                let members: Vec<SubjectId> = self.rooms.read().await.get(&room).cloned().unwrap_or_default().into_iter().collect();
                for subject_id in members {
                    if let Some(queue) = self.queue_for_subject(&subject_id).await {
                        queue.push(event.clone(), Some(&subject_id));
                    }
                }
            }
            EmitTarget::RoomExcept(room, exclude) => {
                let members: Vec<SubjectId> = self
                    .rooms
                    .read()
                    .await
                    .get(&room)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|s| *s != exclude)
                    .collect();
                for subject_id in members {
                    if let Some(queue) = self.queue_for_subject(&subject_id).await {
                        queue.push(event.clone(), Some(&subject_id));
                    }
                }
            }
            EmitTarget::Broadcast => {
                let queues: Vec<Arc<OutboundQueue>> = self.connections.read().await.values().cloned().collect();
                for queue in queues {
                    queue.push(event.clone(), None);
                }
            }
        }
    }

    async fn join_room(&self, subject: &SubjectId, room: &str) {
        self.rooms.write().await.entry(room.to_string()).or_default().insert(subject.clone());
    }

    async fn leave_room(&self, subject: &SubjectId, room: &str) {
        if let Some(members) = self.rooms.write().await.get_mut(room) {
            members.remove(subject);
        }
    }
}
