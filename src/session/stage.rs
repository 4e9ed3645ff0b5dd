//! Session stage
//!
//! The externally observable lifecycle state. On the wire a stage is always a
//! lower-case string; anything the controller does not recognise (including
//! an engine that never reported) is surfaced as [`Stage::Idle`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle stage of the VPN session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// No session, or the engine never reported
    #[default]
    Idle,
    /// Waiting for the user to grant VPN consent
    RequestingPermission,
    /// Engine started, tunnel not yet up
    Connecting,
    /// Tunnel up
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Session ended by the engine or by expiry
    Disconnected,
}

impl Stage {
    /// All stages, in lifecycle order
    pub const ALL: [Stage; 6] = [
        Stage::Idle,
        Stage::RequestingPermission,
        Stage::Connecting,
        Stage::Connected,
        Stage::Disconnecting,
        Stage::Disconnected,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::RequestingPermission => "requesting_permission",
            Stage::Connecting => "connecting",
            Stage::Connected => "connected",
            Stage::Disconnecting => "disconnecting",
            Stage::Disconnected => "disconnected",
        }
    }

    /// Map an engine-reported stage name into a [`Stage`]
    ///
    /// Matching ignores case and surrounding whitespace. Unrecognised names map
    /// to [`Stage::Idle`].
    pub fn from_engine(name: &str) -> Stage {
        let name = name.trim();
        Stage::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str().eq_ignore_ascii_case(name))
            .unwrap_or_default()
    }

    /// True while a session occupies the engine (a new connect must be refused)
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Stage::Connecting | Stage::Connected | Stage::Disconnecting
        )
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
