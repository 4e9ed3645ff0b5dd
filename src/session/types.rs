//! Session value objects
//!
//! A [`Session`] is built once per `connect` and moved through the permission
//! continuation into the engine start. Nothing about a pending session lives
//! in a shared slot another `connect` could overwrite.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use zeroize::Zeroizing;

use super::error::{Result, SessionError};
use super::stage::Stage;
use crate::timer::TimerSnapshot;

/// Username/password pair handed to the tunnel engine
#[derive(Clone, Default)]
pub struct Credentials {
    /// Account name (may be empty when the config carries its own auth)
    pub username: String,
    /// Account password, wiped on drop
    pub password: Zeroizing<String>,
}

impl Credentials {
    /// Build a credential pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    /// True when neither a username nor a password was supplied
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session duration limit as supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerParams {
    /// Allowed session length in seconds, `-1` for unlimited
    pub allowed_duration_seconds: i64,
    /// Pro users are never time-limited
    pub is_pro_user: bool,
}

impl TimerParams {
    /// Sentinel meaning "no limit"
    pub const UNLIMITED: i64 = -1;

    /// No time limit
    pub fn unlimited() -> Self {
        Self {
            allowed_duration_seconds: Self::UNLIMITED,
            is_pro_user: false,
        }
    }
}

impl Default for TimerParams {
    fn default() -> Self {
        Self::unlimited()
    }
}

/// Everything `connect` needs
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Opaque engine configuration (an OpenVPN profile for the process engine)
    pub config: Option<String>,
    /// Engine credentials
    pub credentials: Credentials,
    /// Display name shown by the engine
    pub name: String,
    /// App identifiers routed outside the tunnel
    pub bypass_list: BTreeSet<String>,
    /// Session duration limit
    pub timer: TimerParams,
}

/// One VPN session
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque engine configuration, never empty
    pub config: String,
    /// Engine credentials
    pub credentials: Credentials,
    /// Display name
    pub display_name: String,
    /// App identifiers routed outside the tunnel
    pub bypass_list: BTreeSet<String>,
}

impl Session {
    /// Validate a connect request and build the session value
    ///
    /// Fails with [`SessionError::InvalidArgument`] when the config is absent
    /// or blank.
    pub fn from_request(request: ConnectRequest) -> Result<(Session, TimerParams)> {
        let config = match request.config {
            Some(config) if !config.trim().is_empty() => config,
            _ => return Err(SessionError::InvalidArgument("config is required".into())),
        };

        Ok((
            Session {
                config,
                credentials: request.credentials,
                display_name: request.name,
                bypass_list: request.bypass_list,
            },
            request.timer,
        ))
    }
}

/// Why the last session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The caller disconnected
    UserDisconnect,
    /// The session time limit was reached
    Expired,
    /// The engine dropped the tunnel
    EngineDropped,
    /// The user declined VPN consent
    PermissionDenied,
    /// The engine failed to start
    EngineFailure,
    /// The controller was disposed
    Disposed,
    /// The session timer could not be persisted
    StoreFailure,
}

/// Traffic counters reported by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Seconds since the tunnel came up
    pub duration_seconds: u64,
    /// Unix time (ms) of the last received packet, if any
    pub last_packet_received_ms: Option<i64>,
    /// Bytes received through the tunnel
    pub bytes_in: u64,
    /// Bytes sent through the tunnel
    pub bytes_out: u64,
}

/// Snapshot returned by `status()`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    /// Current stage
    pub stage: Stage,
    /// Why the previous session ended, if one has
    pub end_reason: Option<EndReason>,
    /// Last traffic counters of the current session
    pub traffic: TrafficStats,
    /// Persisted timer record, if a session is armed
    pub timer: Option<TimerSnapshot>,
    /// Whether dropped tunnels are re-established
    pub auto_reconnect: bool,
}
