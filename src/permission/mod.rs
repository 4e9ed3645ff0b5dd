//! VPN Consent
//!
//! Connecting requires the user's consent, obtained through a host-provided
//! [`PermissionApi`] (a system dialog, a prompt on the host's UI, a policy
//! file). The outcome arrives later, on a different path, keyed by the
//! [`RequestToken`] the request was issued with.
//!
//! [`PermissionCoordinator`] turns that callback flow into a single-slot
//! continuation:
//!
//! ```text
//! request_grant() ──> PermissionHandle ──await──> Granted / Denied / SurfaceDetached
//!        │                                             ^
//!        └── PermissionApi::present(token)             │
//!                                    host ── resolve(token, outcome)
//! ```
//!
//! At most one request is pending. A second `request_grant` fails with
//! [`SessionError::RequestInProgress`] and does not touch the first. When
//! the hosting surface detaches, the pending request resolves with
//! [`SessionError::SurfaceDetached`]; no request is ever left dangling.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::session::SessionError;
use crate::store::PersistentStore;

/// Store key remembering a granted consent
pub const PERMISSION_GRANTED_KEY: &str = "vpn_permission_granted";

/// Identifies one consent request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(String);

impl RequestToken {
    /// Fresh random token
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Token as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RequestToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User's answer to a consent request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOutcome {
    /// Consent given
    Granted,
    /// Consent refused
    Denied,
}

impl From<bool> for PermissionOutcome {
    fn from(granted: bool) -> Self {
        if granted {
            PermissionOutcome::Granted
        } else {
            PermissionOutcome::Denied
        }
    }
}

/// Host-side consent mechanism
#[async_trait]
pub trait PermissionApi: Send + Sync {
    /// Whether consent has already been given
    fn already_granted(&self) -> bool;

    /// Prepare a request
    ///
    /// Returns `None` when consent is already in place and no request is
    /// needed, otherwise the token the request will be issued with.
    fn prepare(&self) -> Option<RequestToken> {
        if self.already_granted() {
            None
        } else {
            Some(RequestToken::generate())
        }
    }

    /// Ask the user
    ///
    /// The answer is delivered later through
    /// [`PermissionCoordinator::resolve`] with the same token.
    ///
    /// # Arguments
    ///
    /// * `token` - Token the answer must be delivered with
    async fn present(&self, token: &RequestToken) -> anyhow::Result<()>;

    /// Called once per resolved request
    fn on_outcome(&self, _outcome: PermissionOutcome) {}
}

/// Consent that is always in place
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionApi for AlwaysGranted {
    fn already_granted(&self) -> bool {
        true
    }

    async fn present(&self, _token: &RequestToken) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Remembers a granted consent in the persistent store
///
/// Wraps the host's prompt. Once the user grants, later calls to
/// `already_granted` return true without prompting again.
pub struct StoredPermission<P> {
    inner: P,
    store: Arc<dyn PersistentStore>,
}

impl<P: PermissionApi> StoredPermission<P> {
    /// Wrap `inner`, remembering grants in `store`
    pub fn new(inner: P, store: Arc<dyn PersistentStore>) -> Self {
        Self { inner, store }
    }

    /// Forget a remembered grant
    pub fn revoke(&self) -> anyhow::Result<()> {
        info!("Revoking remembered VPN consent");
        self.store.remove(PERMISSION_GRANTED_KEY)
    }

    fn remembered(&self) -> bool {
        match self.store.get(PERMISSION_GRANTED_KEY) {
            Ok(Some(value)) => value.as_bool().unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                warn!("Could not read remembered consent: {:#}", e);
                false
            }
        }
    }
}

#[async_trait]
impl<P: PermissionApi> PermissionApi for StoredPermission<P> {
    fn already_granted(&self) -> bool {
        self.remembered() || self.inner.already_granted()
    }

    fn prepare(&self) -> Option<RequestToken> {
        if self.remembered() {
            None
        } else {
            self.inner.prepare()
        }
    }

    async fn present(&self, token: &RequestToken) -> anyhow::Result<()> {
        self.inner.present(token).await
    }

    fn on_outcome(&self, outcome: PermissionOutcome) {
        if outcome == PermissionOutcome::Granted {
            if let Err(e) = self
                .store
                .set(PERMISSION_GRANTED_KEY, serde_json::Value::Bool(true))
            {
                warn!("Could not remember VPN consent: {:#}", e);
            }
        }
        self.inner.on_outcome(outcome);
    }
}

type OutcomeSender = oneshot::Sender<Result<PermissionOutcome, SessionError>>;

struct Pending {
    token: RequestToken,
    tx: OutcomeSender,
}

/// Handle on an issued (or trivially satisfied) consent request
#[derive(Debug)]
pub struct PermissionHandle {
    token: Option<RequestToken>,
    rx: oneshot::Receiver<Result<PermissionOutcome, SessionError>>,
}

impl PermissionHandle {
    fn ready(outcome: PermissionOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(outcome));
        Self { token: None, rx }
    }

    /// Token the request was issued with, `None` if no prompt was needed
    pub fn token(&self) -> Option<&RequestToken> {
        self.token.as_ref()
    }

    /// True when the outcome is already known and no prompt was shown
    pub fn is_immediate(&self) -> bool {
        self.token.is_none()
    }

    /// Wait for the outcome
    pub async fn outcome(self) -> Result<PermissionOutcome, SessionError> {
        self.rx.await.unwrap_or(Err(SessionError::SurfaceDetached))
    }
}

/// Single-flight gate over a [`PermissionApi`]
pub struct PermissionCoordinator {
    api: Arc<dyn PermissionApi>,
    pending: Mutex<Option<Pending>>,
    attached: AtomicBool,
}

impl PermissionCoordinator {
    /// Gate requests to `api`; the surface starts out attached
    pub fn new(api: Arc<dyn PermissionApi>) -> Self {
        Self {
            api,
            pending: Mutex::new(None),
            attached: AtomicBool::new(true),
        }
    }

    /// Passthrough to [`PermissionApi::already_granted`]
    pub fn already_granted(&self) -> bool {
        self.api.already_granted()
    }

    /// Whether a hosting surface is attached
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Fail with [`SessionError::SurfaceDetached`] when no surface is attached
    pub fn ensure_attached(&self) -> Result<(), SessionError> {
        if self.is_attached() {
            Ok(())
        } else {
            Err(SessionError::SurfaceDetached)
        }
    }

    /// Whether a request is outstanding
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Token of the outstanding request
    pub fn pending_token(&self) -> Option<RequestToken> {
        self.pending.lock().as_ref().map(|p| p.token.clone())
    }

    /// Issue a consent request
    ///
    /// Fails with [`SessionError::RequestInProgress`] when one is already
    /// outstanding, leaving it untouched. When the API reports consent is
    /// already in place the returned handle resolves to `Granted` at once.
    pub async fn request_grant(&self) -> Result<PermissionHandle, SessionError> {
        let (token, rx) = {
            let mut slot = self.pending.lock();
            if slot.is_some() {
                debug!("Rejecting concurrent permission request");
                return Err(SessionError::RequestInProgress);
            }
            self.ensure_attached()?;

            let Some(token) = self.api.prepare() else {
                debug!("Permission already granted, no prompt needed");
                return Ok(PermissionHandle::ready(PermissionOutcome::Granted));
            };

            let (tx, rx) = oneshot::channel();
            *slot = Some(Pending {
                token: token.clone(),
                tx,
            });
            (token, rx)
        };

        info!("Requesting VPN permission (token {})", token);

        if let Err(e) = self.api.present(&token).await {
            warn!("Could not present permission request: {:#}", e);
            self.take_if(&token);
            return Err(SessionError::SurfaceDetached);
        }

        Ok(PermissionHandle {
            token: Some(token),
            rx,
        })
    }

    /// Deliver the outcome for `token`
    ///
    /// Returns false (and changes nothing) when `token` does not match the
    /// outstanding request.
    pub fn resolve(&self, token: &RequestToken, outcome: PermissionOutcome) -> bool {
        let Some(pending) = self.take_if(token) else {
            debug!("Ignoring permission result for unknown token {}", token);
            return false;
        };

        info!("VPN permission {:?}", outcome);
        self.api.on_outcome(outcome);
        if pending.tx.send(Ok(outcome)).is_err() {
            debug!("Permission outcome receiver already gone");
        }
        true
    }

    /// Mark the surface attached
    pub fn surface_attached(&self) {
        self.attached.store(true, Ordering::SeqCst);
        debug!("Host surface attached");
    }

    /// Mark the surface detached and fail any outstanding request
    ///
    /// Returns true when a pending request was failed.
    pub fn surface_detached(&self) -> bool {
        self.attached.store(false, Ordering::SeqCst);
        debug!("Host surface detached");
        self.fail_pending(SessionError::SurfaceDetached)
    }

    /// Fail the outstanding request, if any, with `error`
    pub fn fail_pending(&self, error: SessionError) -> bool {
        let Some(pending) = self.pending.lock().take() else {
            return false;
        };
        info!("Failing pending permission request {}: {}", pending.token, error);
        let _ = pending.tx.send(Err(error));
        true
    }

    fn take_if(&self, token: &RequestToken) -> Option<Pending> {
        let mut slot = self.pending.lock();
        match slot.as_ref() {
            Some(pending) if &pending.token == token => slot.take(),
            _ => None,
        }
    }
}
