//! Host Control Surface
//!
//! Maps request/response operations onto the [`SessionController`]. Requests
//! are JSON objects tagged by `method`, with camelCase argument names:
//!
//! ```json
//! {"id": 7, "method": "connect", "config": "...", "name": "Frankfurt",
//!  "username": "alice", "password": "...", "bypassPackages": [],
//!  "allowedSeconds": 3600, "isProUser": false}
//! ```
//!
//! Every request gets exactly one response echoing its `id`, carrying either
//! `result` or `error: {code, message}`. Error codes come from
//! [`SessionError::code`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::engine::TunnelEngine;
use crate::permission::RequestToken;
use crate::session::{
    ConnectRequest, Credentials, SessionController, SessionError, TimerParams,
};

fn unlimited() -> i64 {
    TimerParams::UNLIMITED
}

/// Control operation
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum ControlRequest {
    /// Install the tunnel engine
    Initialize,
    /// Start a session
    #[serde(rename_all = "camelCase")]
    Connect {
        /// Engine configuration
        #[serde(default)]
        config: Option<String>,
        /// Display name
        #[serde(default)]
        name: String,
        /// Account name
        #[serde(default)]
        username: String,
        /// Account password
        #[serde(default)]
        password: String,
        /// App identifiers routed outside the tunnel
        #[serde(default)]
        bypass_packages: Vec<String>,
        /// Session limit in seconds, -1 for unlimited
        #[serde(default = "unlimited")]
        allowed_seconds: i64,
        /// Pro users are never time-limited
        #[serde(default)]
        is_pro_user: bool,
    },
    /// Stop the session
    Disconnect,
    /// Full status snapshot
    Status,
    /// Current stage name
    Stage,
    /// Whether consent is in place
    CheckPermission,
    /// Ask for consent without connecting
    RequestPermission,
    /// Start the session timer
    #[serde(rename_all = "camelCase")]
    StartTimer {
        /// Limit in seconds, -1 for unlimited
        #[serde(default = "unlimited")]
        duration_seconds: i64,
        /// Pro users are never time-limited
        #[serde(default)]
        is_pro_user: bool,
    },
    /// Replace the timer budget, measured from now
    #[serde(rename_all = "camelCase")]
    UpdateTimer {
        /// Limit in seconds, -1 for unlimited
        #[serde(default = "unlimited")]
        duration_seconds: i64,
        /// Pro users are never time-limited
        #[serde(default)]
        is_pro_user: bool,
    },
    /// Tear everything down
    Dispose,
    /// Toggle auto-reconnect
    SetAutoReconnect {
        /// New setting
        enabled: bool,
    },
    /// Answer a consent request
    PermissionResult {
        /// Token from the `permission_requested` event
        token: String,
        /// User's answer
        granted: bool,
    },
    /// Host surface came up
    AttachSurface,
    /// Host surface went away
    DetachSurface,
}

impl ControlRequest {
    /// Method name, for logging
    pub fn method(&self) -> &'static str {
        match self {
            ControlRequest::Initialize => "initialize",
            ControlRequest::Connect { .. } => "connect",
            ControlRequest::Disconnect => "disconnect",
            ControlRequest::Status => "status",
            ControlRequest::Stage => "stage",
            ControlRequest::CheckPermission => "checkPermission",
            ControlRequest::RequestPermission => "requestPermission",
            ControlRequest::StartTimer { .. } => "startTimer",
            ControlRequest::UpdateTimer { .. } => "updateTimer",
            ControlRequest::Dispose => "dispose",
            ControlRequest::SetAutoReconnect { .. } => "setAutoReconnect",
            ControlRequest::PermissionResult { .. } => "permissionResult",
            ControlRequest::AttachSurface => "attachSurface",
            ControlRequest::DetachSurface => "detachSurface",
        }
    }
}

/// A request with its correlation id
#[derive(Debug, Clone, Deserialize)]
pub struct ControlEnvelope {
    /// Echoed back in the response
    #[serde(default)]
    pub id: Option<Value>,
    /// The operation
    #[serde(flatten)]
    pub request: ControlRequest,
}

/// Error payload of a failed request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlError {
    /// Stable error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl From<&SessionError> for ControlError {
    fn from(err: &SessionError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Response to one request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlResponse {
    /// Correlation id from the request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Result on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ControlError>,
}

impl ControlResponse {
    fn from_outcome(id: Option<Value>, outcome: Result<Value, SessionError>) -> Self {
        match outcome {
            Ok(result) => Self {
                id,
                result: Some(result),
                error: None,
            },
            Err(err) => Self {
                id,
                result: None,
                error: Some(ControlError::from(&err)),
            },
        }
    }

    /// True when the request succeeded
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

type EngineFactory = dyn Fn() -> Arc<dyn TunnelEngine> + Send + Sync;

/// Dispatches control requests to a controller
#[derive(Clone)]
pub struct ControlSurface {
    controller: SessionController,
    engine_factory: Arc<EngineFactory>,
}

impl ControlSurface {
    /// Dispatch to `controller`; `initialize` installs an engine built by
    /// `engine_factory`
    pub fn new(
        controller: SessionController,
        engine_factory: impl Fn() -> Arc<dyn TunnelEngine> + Send + Sync + 'static,
    ) -> Self {
        Self {
            controller,
            engine_factory: Arc::new(engine_factory),
        }
    }

    /// Controller behind this surface
    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    /// Parse and dispatch one JSON request
    pub async fn handle_json(&self, line: &str) -> ControlResponse {
        match serde_json::from_str::<ControlEnvelope>(line) {
            Ok(envelope) => self.handle_envelope(envelope).await,
            Err(e) => {
                let id = serde_json::from_str::<Value>(line)
                    .ok()
                    .and_then(|v| v.get("id").cloned());
                ControlResponse::from_outcome(
                    id,
                    Err(SessionError::InvalidArgument(format!("malformed request: {}", e))),
                )
            }
        }
    }

    /// Dispatch one request, echoing its id
    pub async fn handle_envelope(&self, envelope: ControlEnvelope) -> ControlResponse {
        let outcome = self.dispatch(envelope.request).await;
        ControlResponse::from_outcome(envelope.id, outcome)
    }

    /// Dispatch one request
    pub async fn dispatch(&self, request: ControlRequest) -> Result<Value, SessionError> {
        debug!("Control request: {}", request.method());
        let controller = &self.controller;

        match request {
            ControlRequest::Initialize => {
                let stage = controller.initialize((self.engine_factory)()).await;
                Ok(Value::from(stage.as_str()))
            }
            ControlRequest::Connect {
                config,
                name,
                username,
                password,
                bypass_packages,
                allowed_seconds,
                is_pro_user,
            } => {
                controller
                    .connect(ConnectRequest {
                        config,
                        credentials: Credentials::new(username, password),
                        name,
                        bypass_list: bypass_packages.into_iter().collect(),
                        timer: TimerParams {
                            allowed_duration_seconds: allowed_seconds,
                            is_pro_user,
                        },
                    })
                    .await?;
                Ok(Value::Bool(true))
            }
            ControlRequest::Disconnect => {
                controller.disconnect().await?;
                Ok(Value::Bool(true))
            }
            ControlRequest::Status => {
                let status = controller.status().await;
                Ok(serde_json::to_value(status).unwrap_or(Value::Null))
            }
            ControlRequest::Stage => Ok(json!(controller.stage().await.as_str())),
            ControlRequest::CheckPermission => Ok(json!(controller.check_permission()?)),
            ControlRequest::RequestPermission => {
                Ok(json!(controller.request_permission().await?))
            }
            ControlRequest::StartTimer {
                duration_seconds,
                is_pro_user,
            } => {
                let state = controller
                    .start_timer(TimerParams {
                        allowed_duration_seconds: duration_seconds,
                        is_pro_user,
                    })
                    .await?;
                Ok(serde_json::to_value(state).unwrap_or(Value::Null))
            }
            ControlRequest::UpdateTimer {
                duration_seconds,
                is_pro_user,
            } => {
                let state = controller
                    .update_timer(TimerParams {
                        allowed_duration_seconds: duration_seconds,
                        is_pro_user,
                    })
                    .await?;
                Ok(serde_json::to_value(state).unwrap_or(Value::Null))
            }
            ControlRequest::Dispose => {
                controller.dispose().await;
                Ok(Value::Bool(true))
            }
            ControlRequest::SetAutoReconnect { enabled } => {
                controller.set_auto_reconnect(enabled).await;
                Ok(Value::Bool(true))
            }
            ControlRequest::PermissionResult { token, granted } => Ok(json!(
                controller.permission_result(&RequestToken::from(token), granted)
            )),
            ControlRequest::AttachSurface => {
                controller.attach_surface();
                Ok(Value::Bool(true))
            }
            ControlRequest::DetachSurface => {
                controller.detach_surface();
                Ok(Value::Bool(true))
            }
        }
    }
}
