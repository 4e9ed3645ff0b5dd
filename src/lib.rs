//! # lamco-vpn-session
//!
//! VPN session lifecycle controller. The tunnel itself is run by an external
//! engine (an OpenVPN binary, a platform VPN service); this crate is the
//! coordination layer in front of it:
//!
//! - consent gating: `connect` waits on a single-flight permission request
//! - session time limits: an absolute-deadline supervisor that outlives the
//!   host surface and survives restarts through the persisted record
//! - stage reporting: one ordered stream of lower-case stage names
//!
//! # Architecture
//!
//! ```text
//! host ──ControlRequest──> ControlSurface
//!                               │
//!                               v
//!                       SessionController ──────> TunnelEngine (start / stop)
//!                        │    │     │  ^                │
//!                        │    │     │  └─ EngineEvent ──┘
//!                        │    │     │
//!                        │    │     └──> StageEventBroadcaster ──> StageStream
//!                        │    └──> PermissionCoordinator ──> PermissionApi
//!                        └──> TimerSupervisor ──> PersistentStore
//! ```
//!
//! # Data Flow
//!
//! **Connect:** controller → persist timer record → permission (if needed) →
//! engine start → timer start → `connecting`
//!
//! **Engine callbacks:** engine → sink → controller event loop → stage stream
//!
//! **Expiry:** supervisor tick → controller → engine stop → `disconnected`

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Configuration file and CLI overrides
pub mod config;

/// Host control surface (request/response dispatch)
pub mod control;

/// Tunnel engine seam and the child-process engine
pub mod engine;

/// Stage event stream
pub mod events;

/// Consent gating
pub mod permission;

/// Session controller, stages and value types
pub mod session;

/// Durable key/value store
pub mod store;

/// Session time limits
pub mod timer;

/// Utility functions
pub mod utils;

pub use session::{
    ConnectRequest, ControllerOptions, Credentials, SessionController, SessionError, Stage,
    TimerParams,
};
