//! Session error types

use thiserror::Error;

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Session lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// No engine handle has been installed yet
    #[error("VPN engine is not initialized")]
    NotInitialized,

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A permission request is already pending
    #[error("A VPN permission request is already in progress")]
    RequestInProgress,

    /// The hosting surface went away while a permission request was pending
    #[error("Host surface detached while a permission request was pending")]
    SurfaceDetached,

    /// The tunnel engine failed to start or stop
    #[error("VPN engine failure: {0}")]
    EngineFailure(String),

    /// The session time limit was reached
    #[error("Session time limit reached")]
    ExpiredSession,

    /// The user declined VPN consent
    #[error("VPN permission denied")]
    PermissionDenied,

    /// A session is already connecting or connected
    #[error("A VPN session is already active")]
    SessionActive,

    /// The session was ended before its permission request resolved
    #[error("Session was discarded before permission was resolved")]
    SessionDiscarded,

    /// Persistent store failure
    #[error("Persistent store error: {0}")]
    Store(String),
}

impl SessionError {
    /// Stable error code for the control surface
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::NotInitialized => "NOT_INITIALIZED",
            SessionError::InvalidArgument(_) => "INVALID_ARGUMENT",
            SessionError::RequestInProgress => "REQUEST_IN_PROGRESS",
            SessionError::SurfaceDetached => "SURFACE_DETACHED",
            SessionError::EngineFailure(_) => "ENGINE_FAILURE",
            SessionError::ExpiredSession => "EXPIRED_SESSION",
            SessionError::PermissionDenied => "PERMISSION_DENIED",
            SessionError::SessionActive => "SESSION_ACTIVE",
            SessionError::SessionDiscarded => "SESSION_DISCARDED",
            SessionError::Store(_) => "STORE_ERROR",
        }
    }

    pub(crate) fn engine(err: anyhow::Error) -> Self {
        SessionError::EngineFailure(format!("{:#}", err))
    }

    pub(crate) fn store(err: anyhow::Error) -> Self {
        SessionError::Store(format!("{:#}", err))
    }
}
