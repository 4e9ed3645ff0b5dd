//! Session lifecycle
//!
//! [`SessionController`] is the entry point: it owns the stage, gates
//! `connect` behind consent, drives the tunnel engine and reacts to engine
//! callbacks and timer expiry.

mod controller;
mod error;
mod stage;
mod types;

pub use controller::{ControllerOptions, SessionController, AUTO_RECONNECT_KEY};
pub use error::{Result, SessionError};
pub use stage::Stage;
pub use types::{
    ConnectRequest, Credentials, EndReason, Session, SessionStatus, TimerParams, TrafficStats,
};
