//! Opaque identifiers shared between server and browser client.
//!
//! All of these are plain strings on the wire; the newtypes exist so the
//! core never accidentally compares a `SubjectID` to a `SessionID`.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    SubjectId,
    "Stable participant identifier, issued at first contact and preserved across reconnects."
);
string_id!(
    ConnectionId,
    "Ephemeral identifier for one physical transport connection."
);
string_id!(SessionId, "Identifier of one matched group's one playthrough.");
string_id!(GroupId, "Identifier of a matched group; equal to the SessionId that formed it.");
string_id!(SceneId, "Identifier of one experiment content unit.");
string_id!(ProbeId, "Identifier of one P2P connectivity probe attempt.");
