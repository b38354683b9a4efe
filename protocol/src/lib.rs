//! Wire types shared between the coordination server and the browser client.
//!
//! Everything here is plain `serde` data: the typed `{event, payload}`
//! envelope (see [`events`]), the opaque identifiers participants and
//! sessions are known by ([`ids`]), the termination-reason taxonomy
//! ([`reason`]), the post-episode [`export::ValidationExport`] blob, and the
//! admin aggregator's read-API contract ([`admin`]). None of it depends on a
//! transport — the coordinator and relay-server crates decide how these
//! values travel over the wire.

pub mod admin;
pub mod events;
pub mod export;
pub mod ids;
pub mod reason;

pub use admin::AdminStateUpdate;
pub use events::{ClientEvent, ConnectionKind, ProbeRole, ServerEvent};
pub use export::{ConfirmedHash, DesyncEvent, ParityResult, ValidationExport, VerifiedAction};
pub use ids::{ConnectionId, GroupId, ProbeId, SceneId, SessionId, SubjectId};
pub use reason::TerminationReason;
