//! Session Lifecycle Controller
//!
//! Owns the authoritative stage and the single serialization point for every
//! state change. Four sources feed it concurrently:
//!
//! - caller operations (`connect`, `disconnect`, timer calls, ...)
//! - the permission outcome, delivered to the waiting `connect`
//! - engine callbacks, queued by [`EngineEventSink`]
//! - timer expiry, queued by the [`TimerSupervisor`]
//!
//! Each of them commits its transition while holding the controller's state
//! lock. The only unbounded wait, the user's consent, happens with the lock
//! released; the continuation re-acquires it and checks that its session is
//! still the current one before committing.
//!
//! # State machine
//!
//! ```text
//! idle ──connect──> [requesting_permission] ──granted──> connecting ──engine──> connected
//!                           │ denied / detached                                   │
//!                           v                                                     │
//!                          idle <──────────── disconnecting <──── disconnect ─────┤
//!                                                                                 │
//!                  disconnected <──────────── disconnecting <────── expiry ───────┘
//! ```
//!
//! An engine-reported drop ends the session in `disconnected`, unless
//! auto-reconnect is on, in which case the same session is restarted after a
//! delay.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{Result, SessionError};
use super::stage::Stage;
use super::types::{ConnectRequest, EndReason, Session, SessionStatus, TimerParams, TrafficStats};
use crate::engine::{EngineEvent, EngineEventSink, TaggedEvent, TunnelEngine};
use crate::events::{StageEventBroadcaster, StageStream};
use crate::permission::{
    PermissionApi, PermissionCoordinator, PermissionOutcome, RequestToken,
};
use crate::store::PersistentStore;
use crate::timer::{
    Clock, DeadlineCheck, SystemClock, TimerExpired, TimerSnapshot, TimerState, TimerSupervisor,
};

/// Store key remembering the auto-reconnect setting
pub const AUTO_RECONNECT_KEY: &str = "auto_reconnect_enabled";

/// Controller tuning
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// How often the timer supervisor checks the deadline
    pub check_interval: Duration,
    /// Re-establish tunnels the engine dropped
    pub auto_reconnect: bool,
    /// Delay before a reconnect attempt
    pub reconnect_delay: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(1),
            auto_reconnect: false,
            reconnect_delay: Duration::from_secs(2),
        }
    }
}

enum EngineSlot {
    Uninitialized,
    Initialized {
        engine: Arc<dyn TunnelEngine>,
        epoch: u64,
    },
}

impl EngineSlot {
    fn engine(&self) -> Result<Arc<dyn TunnelEngine>> {
        match self {
            EngineSlot::Initialized { engine, .. } => Ok(Arc::clone(engine)),
            EngineSlot::Uninitialized => Err(SessionError::NotInitialized),
        }
    }

    fn epoch(&self) -> Option<u64> {
        match self {
            EngineSlot::Initialized { epoch, .. } => Some(*epoch),
            EngineSlot::Uninitialized => None,
        }
    }
}

struct ControllerState {
    engine: EngineSlot,
    stage: Stage,
    session: Option<Session>,
    /// Bumped whenever a session begins or ends; stale continuations compare it
    generation: u64,
    end_reason: Option<EndReason>,
    traffic: TrafficStats,
    auto_reconnect: bool,
    /// Set once the engine reports `connected`; only such sessions reconnect
    was_connected: bool,
    reconnect: Option<CancellationToken>,
}

impl ControllerState {
    fn cancel_reconnect(&mut self) {
        if let Some(token) = self.reconnect.take() {
            debug!("Cancelling scheduled reconnect");
            token.cancel();
        }
    }

    fn end_session(&mut self, reason: EndReason) {
        self.cancel_reconnect();
        if self.session.take().is_some() {
            self.end_reason = Some(reason);
        }
        self.generation += 1;
    }
}

struct Inner {
    state: Mutex<ControllerState>,
    permission: PermissionCoordinator,
    timer: TimerSupervisor,
    events: StageEventBroadcaster,
    store: Arc<dyn PersistentStore>,
    engine_tx: mpsc::UnboundedSender<TaggedEvent>,
    next_epoch: AtomicU64,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// VPN session lifecycle controller
///
/// Cheap to clone; all clones drive the same session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Create a controller using the system clock
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        store: Arc<dyn PersistentStore>,
        permission: Arc<dyn PermissionApi>,
        options: ControllerOptions,
    ) -> Self {
        Self::with_clock(store, permission, Arc::new(SystemClock), options)
    }

    /// Create a controller with an explicit clock
    pub fn with_clock(
        store: Arc<dyn PersistentStore>,
        permission: Arc<dyn PermissionApi>,
        clock: Arc<dyn Clock>,
        options: ControllerOptions,
    ) -> Self {
        let auto_reconnect = match store.get(AUTO_RECONNECT_KEY) {
            Ok(Some(value)) => value.as_bool().unwrap_or(options.auto_reconnect),
            Ok(None) => options.auto_reconnect,
            Err(e) => {
                warn!("Could not read auto-reconnect setting: {:#}", e);
                options.auto_reconnect
            }
        };

        let (timer, expired_rx) =
            TimerSupervisor::spawn(Arc::clone(&store), clock, options.check_interval);
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let inner = Arc::new(Inner {
            state: Mutex::new(ControllerState {
                engine: EngineSlot::Uninitialized,
                stage: Stage::Idle,
                session: None,
                generation: 0,
                end_reason: None,
                traffic: TrafficStats::default(),
                auto_reconnect,
                was_connected: false,
                reconnect: None,
            }),
            permission: PermissionCoordinator::new(permission),
            timer,
            events: StageEventBroadcaster::new(),
            store,
            engine_tx,
            next_epoch: AtomicU64::new(1),
            reconnect_delay: options.reconnect_delay,
            shutdown: shutdown.clone(),
        });

        tokio::spawn(run_event_loop(
            Arc::downgrade(&inner),
            engine_rx,
            expired_rx,
            shutdown,
        ));

        Self { inner }
    }

    /// Install the tunnel engine
    ///
    /// Replaces a previously installed engine; callbacks from the old one are
    /// ignored from then on. With no session running, the stage is taken
    /// from the engine's own status. Broadcasts and returns the resulting
    /// stage.
    pub async fn initialize(&self, engine: Arc<dyn TunnelEngine>) -> Stage {
        let mut state = self.inner.state.lock().await;

        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::SeqCst);
        engine.attach(EngineEventSink::new(epoch, self.inner.engine_tx.clone()));

        if matches!(state.engine, EngineSlot::Initialized { .. }) {
            warn!("Replacing an already initialized VPN engine");
        }

        if state.session.is_none() && state.stage != Stage::RequestingPermission {
            let reported = engine.current_status();
            let stage = match Stage::from_engine(&reported) {
                Stage::RequestingPermission => Stage::Idle,
                stage => stage,
            };
            debug!("Engine status at initialize: '{}' ({})", reported, stage);
            state.stage = stage;
        }
        state.engine = EngineSlot::Initialized { engine, epoch };

        info!("VPN engine initialized (stage {})", state.stage);
        self.inner.events.emit(state.stage);
        state.stage
    }

    /// Whether an engine is installed
    pub async fn is_initialized(&self) -> bool {
        matches!(
            self.inner.state.lock().await.engine,
            EngineSlot::Initialized { .. }
        )
    }

    /// Start a session
    ///
    /// Validates the request, persists the timer record, obtains consent if
    /// needed and starts the engine. Resolves exactly once:
    ///
    /// - `Ok(())` once the engine accepted the start (stage `connecting`)
    /// - [`SessionError::InvalidArgument`] / [`SessionError::NotInitialized`] /
    ///   [`SessionError::RequestInProgress`] / [`SessionError::SessionActive`]
    ///   with nothing changed
    /// - [`SessionError::PermissionDenied`] or [`SessionError::SurfaceDetached`]
    ///   after reverting to `idle`
    /// - [`SessionError::SessionDiscarded`] when the session was disconnected
    ///   or disposed while consent was pending
    /// - [`SessionError::EngineFailure`] when the engine refused to start
    pub async fn connect(&self, request: ConnectRequest) -> Result<()> {
        let (session, timer_params) = Session::from_request(request)?;
        let inner = &self.inner;

        let mut state = inner.state.lock().await;
        let engine = state.engine.engine()?;

        if state.stage == Stage::RequestingPermission || inner.permission.is_pending() {
            return Err(SessionError::RequestInProgress);
        }
        if state.stage.is_active() {
            return Err(SessionError::SessionActive);
        }

        inner
            .timer
            .persist(timer_params)
            .map_err(SessionError::store)?;

        state.end_session(EndReason::UserDisconnect);
        state.end_reason = None;
        state.traffic = TrafficStats::default();
        state.was_connected = false;
        let generation = state.generation;

        info!(
            "Connecting '{}' (limit {}s, pro={})",
            session.display_name, timer_params.allowed_duration_seconds, timer_params.is_pro_user
        );

        let handle = match inner.permission.request_grant().await {
            Ok(handle) => handle,
            Err(e) => {
                inner.clear_timer().await;
                return Err(e);
            }
        };

        if handle.is_immediate() {
            return inner.start_tunnel(&mut state, engine, session).await;
        }

        inner.set_stage(&mut state, Stage::RequestingPermission);
        drop(state);

        let outcome = handle.outcome().await;

        let mut state = inner.state.lock().await;
        if state.generation != generation || state.stage != Stage::RequestingPermission {
            info!("Session ended while permission was pending, discarding");
            return Err(SessionError::SessionDiscarded);
        }

        match outcome {
            Ok(PermissionOutcome::Granted) => {
                let engine = match state.engine.engine() {
                    Ok(engine) => engine,
                    Err(e) => {
                        inner.abandon_request(&mut state, EndReason::Disposed).await;
                        return Err(e);
                    }
                };
                inner.start_tunnel(&mut state, engine, session).await
            }
            Ok(PermissionOutcome::Denied) => {
                info!("VPN permission denied, returning to idle");
                inner
                    .abandon_request(&mut state, EndReason::PermissionDenied)
                    .await;
                Err(SessionError::PermissionDenied)
            }
            Err(e) => {
                info!("Permission request failed: {}", e);
                inner.abandon_request(&mut state, EndReason::PermissionDenied).await;
                Err(e)
            }
        }
    }

    /// Stop the session
    ///
    /// Fails with [`SessionError::NotInitialized`] when no engine is
    /// installed. Otherwise always ends in `idle` with the timer cancelled and
    /// its record cleared, even when the engine fails to stop; that failure is
    /// still reported.
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let engine = state.engine.engine()?;

        info!("Disconnecting");
        state.end_session(EndReason::UserDisconnect);
        if !matches!(state.stage, Stage::Idle | Stage::RequestingPermission) {
            inner.set_stage(&mut state, Stage::Disconnecting);
        }

        let stopped = engine.stop().await;
        if let Err(e) = &stopped {
            warn!("Engine failed to stop, forcing local cleanup: {:#}", e);
        }

        inner.clear_timer().await;
        inner.set_stage(&mut state, Stage::Idle);

        stopped.map_err(SessionError::engine)
    }

    /// Last known stage
    pub async fn stage(&self) -> Stage {
        self.inner.state.lock().await.stage
    }

    /// Stage, end reason, traffic and timer in one snapshot
    pub async fn status(&self) -> SessionStatus {
        let state = self.inner.state.lock().await;
        SessionStatus {
            stage: state.stage,
            end_reason: state.end_reason,
            traffic: state.traffic,
            timer: self.inner.timer.snapshot(),
            auto_reconnect: state.auto_reconnect,
        }
    }

    /// Persisted timer record and remaining time
    pub fn timer_snapshot(&self) -> Option<TimerSnapshot> {
        self.inner.timer.snapshot()
    }

    /// Subscribe to stage transitions
    ///
    /// Replaces any existing subscription. The current stage is delivered
    /// first.
    pub async fn subscribe(&self) -> StageStream {
        let state = self.inner.state.lock().await;
        let stream = self.inner.events.subscribe();
        self.inner.events.emit(state.stage);
        stream
    }

    /// End the current stage subscription
    pub fn unsubscribe(&self) {
        self.inner.events.unsubscribe();
    }

    /// End `stream`'s subscription, unless a newer one has replaced it
    pub fn unsubscribe_stream(&self, stream: &StageStream) {
        self.inner.events.unsubscribe_stream(stream);
    }

    /// Whether consent is already in place
    ///
    /// Fails with [`SessionError::SurfaceDetached`] while no surface is
    /// attached.
    pub fn check_permission(&self) -> Result<bool> {
        self.inner.permission.ensure_attached()?;
        Ok(self.inner.permission.already_granted())
    }

    /// Ask for consent without connecting
    ///
    /// Subject to the same single-flight rule as `connect`.
    pub async fn request_permission(&self) -> Result<bool> {
        let handle = {
            let state = self.inner.state.lock().await;
            if state.stage == Stage::RequestingPermission {
                return Err(SessionError::RequestInProgress);
            }
            self.inner.permission.request_grant().await?
        };

        let outcome = handle.outcome().await?;
        Ok(outcome == PermissionOutcome::Granted)
    }

    /// Deliver the user's answer for `token`
    ///
    /// Returns false when `token` is not the pending request.
    pub fn permission_result(&self, token: &RequestToken, granted: bool) -> bool {
        self.inner
            .permission
            .resolve(token, PermissionOutcome::from(granted))
    }

    /// Token of the pending consent request
    pub fn pending_permission(&self) -> Option<RequestToken> {
        self.inner.permission.pending_token()
    }

    /// Mark the host surface attached
    pub fn attach_surface(&self) {
        self.inner.permission.surface_attached();
    }

    /// Mark the host surface detached
    ///
    /// Fails a pending consent request with
    /// [`SessionError::SurfaceDetached`]. The timer keeps running.
    pub fn detach_surface(&self) {
        if self.inner.permission.surface_detached() {
            info!("Pending permission request failed by surface detach");
        }
    }

    /// Persist a timer record starting now and arm expiry checks
    pub async fn start_timer(&self, params: TimerParams) -> Result<TimerState> {
        let _state = self.inner.state.lock().await;
        self.inner
            .timer
            .start(params)
            .await
            .map_err(SessionError::store)
    }

    /// Replace the timer budget, measured from now
    pub async fn update_timer(&self, params: TimerParams) -> Result<TimerState> {
        let _state = self.inner.state.lock().await;
        self.inner
            .timer
            .update(params)
            .await
            .map_err(SessionError::store)
    }

    /// Enable or disable re-establishing dropped tunnels
    ///
    /// The setting is remembered in the store and survives restarts.
    pub async fn set_auto_reconnect(&self, enabled: bool) {
        let mut state = self.inner.state.lock().await;
        state.auto_reconnect = enabled;
        if !enabled {
            state.cancel_reconnect();
        }
        if let Err(e) = self
            .inner
            .store
            .set(AUTO_RECONNECT_KEY, serde_json::Value::Bool(enabled))
        {
            warn!("Could not remember auto-reconnect setting: {:#}", e);
        }
        info!("Auto-reconnect {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Tear down: stop the engine, fail any pending consent request, end the
    /// stage stream and return to the uninitialized state
    pub async fn dispose(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;

        info!("Disposing session controller");
        inner.permission.fail_pending(SessionError::SurfaceDetached);
        state.end_session(EndReason::Disposed);

        if let Ok(engine) = state.engine.engine() {
            if let Err(e) = engine.stop().await {
                warn!("Engine failed to stop during dispose: {:#}", e);
            }
        }
        inner.clear_timer().await;

        inner.set_stage(&mut state, Stage::Idle);
        state.engine = EngineSlot::Uninitialized;
        inner.events.unsubscribe();
    }
}

impl Inner {
    fn set_stage(&self, state: &mut ControllerState, stage: Stage) {
        if state.stage == stage {
            return;
        }
        info!("Stage {} -> {}", state.stage, stage);
        state.stage = stage;
        if !self.events.has_subscriber() {
            debug!("No stage subscriber, {} not delivered", stage);
        }
        self.events.emit(stage);
    }

    async fn clear_timer(&self) {
        if let Err(e) = self.timer.cancel().await {
            warn!("Failed to clear timer state: {:#}", e);
        }
    }

    async fn abandon_request(&self, state: &mut ControllerState, reason: EndReason) {
        self.clear_timer().await;
        state.generation += 1;
        state.end_reason = Some(reason);
        self.set_stage(state, Stage::Idle);
    }

    /// Start the engine and arm the timer with the record `connect` persisted
    async fn start_tunnel(
        &self,
        state: &mut ControllerState,
        engine: Arc<dyn TunnelEngine>,
        session: Session,
    ) -> Result<()> {
        if !session.bypass_list.is_empty() {
            debug!("Bypass list: {:?}", session.bypass_list);
        }

        if let Err(e) = engine.start(&session).await {
            warn!("Engine failed to start: {:#}", e);
            self.clear_timer().await;
            state.generation += 1;
            state.end_reason = Some(EndReason::EngineFailure);
            self.set_stage(state, Stage::Idle);
            return Err(SessionError::engine(e));
        }

        state.session = Some(session);
        self.set_stage(state, Stage::Connecting);

        let params = match self.timer.state() {
            Ok(Some(record)) => TimerParams {
                allowed_duration_seconds: record.allowed_duration_seconds,
                is_pro_user: record.is_pro_user,
            },
            Ok(None) => TimerParams::unlimited(),
            Err(e) => {
                warn!("Could not read timer record, running unlimited: {:#}", e);
                TimerParams::unlimited()
            }
        };

        if let Err(e) = self.timer.start(params).await {
            warn!("Could not arm the session timer, stopping the engine: {:#}", e);
            if let Err(stop_err) = engine.stop().await {
                warn!("Engine failed to stop: {:#}", stop_err);
            }
            state.session = None;
            self.clear_timer().await;
            state.generation += 1;
            state.end_reason = Some(EndReason::StoreFailure);
            self.set_stage(state, Stage::Idle);
            return Err(SessionError::store(e));
        }
        Ok(())
    }

    async fn handle_engine_event(self: &Arc<Self>, tagged: TaggedEvent) {
        let mut state = self.state.lock().await;

        if state.engine.epoch() != Some(tagged.epoch) {
            debug!("Ignoring event from a replaced engine");
            return;
        }
        if state.session.is_none() {
            // A tunnel adopted at initialize is followed until it goes down
            if let (true, EngineEvent::StageChanged(name)) =
                (state.stage.is_active(), &tagged.event)
            {
                match Stage::from_engine(name) {
                    Stage::RequestingPermission => {}
                    stage => self.set_stage(&mut state, stage),
                }
                return;
            }
            debug!("Ignoring engine event with no session: {:?}", tagged.event);
            return;
        }

        let name = match tagged.event {
            EngineEvent::Traffic(stats) => {
                state.traffic = stats;
                return;
            }
            EngineEvent::StageChanged(name) => name,
        };

        let stage = Stage::from_engine(&name);
        debug!("Engine reported '{}' ({})", name, stage);

        match stage {
            Stage::RequestingPermission => {
                debug!("Ignoring permission stage reported by the engine");
            }
            Stage::Connecting | Stage::Connected | Stage::Disconnecting => {
                state.cancel_reconnect();
                if stage == Stage::Connected {
                    state.was_connected = true;
                }
                self.set_stage(&mut state, stage);
            }
            Stage::Idle => {
                self.set_stage(&mut state, stage);
            }
            Stage::Disconnected => {
                if state.auto_reconnect && state.was_connected {
                    self.set_stage(&mut state, stage);
                    self.schedule_reconnect(&mut state);
                } else {
                    info!("Engine dropped the tunnel, ending session");
                    state.end_session(EndReason::EngineDropped);
                    self.clear_timer().await;
                    self.set_stage(&mut state, stage);
                }
            }
        }
    }

    /// A restart that never reaches `connected` is not retried again
    fn schedule_reconnect(self: &Arc<Self>, state: &mut ControllerState) {
        state.cancel_reconnect();
        state.was_connected = false;

        let token = CancellationToken::new();
        state.reconnect = Some(token.clone());

        let generation = state.generation;
        let delay = self.reconnect_delay;
        let weak = Arc::downgrade(self);

        info!("Tunnel dropped, reconnecting in {:?}", delay);

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(inner) = weak.upgrade() {
                inner.reconnect(generation).await;
            }
        });
    }

    async fn reconnect(&self, generation: u64) {
        let mut state = self.state.lock().await;

        if state.generation != generation || state.reconnect.is_none() {
            debug!("Reconnect no longer wanted");
            return;
        }
        state.reconnect = None;

        let (Ok(engine), Some(session)) = (state.engine.engine(), state.session.clone()) else {
            return;
        };

        info!("Reconnecting '{}'", session.display_name);
        match engine.start(&session).await {
            Ok(()) => self.set_stage(&mut state, Stage::Connecting),
            Err(e) => {
                warn!("Reconnect failed, ending session: {:#}", e);
                state.end_session(EndReason::EngineFailure);
                self.clear_timer().await;
                self.set_stage(&mut state, Stage::Disconnected);
            }
        }
    }

    async fn handle_expiry(&self, expired: TimerExpired) {
        let mut state = self.state.lock().await;

        if state.stage == Stage::RequestingPermission {
            debug!("Ignoring expiry while permission is pending");
            return;
        }
        if !self.timer.is_armed() || self.timer.check_now() != DeadlineCheck::Expired {
            debug!("Expiry superseded by a timer change");
            return;
        }

        info!(
            "{} after {}s, disconnecting",
            SessionError::ExpiredSession,
            expired.state.allowed_duration_seconds
        );

        state.end_session(EndReason::Expired);
        state.end_reason = Some(EndReason::Expired);
        self.set_stage(&mut state, Stage::Disconnecting);

        if let Ok(engine) = state.engine.engine() {
            if let Err(e) = engine.stop().await {
                warn!("Engine failed to stop on expiry: {:#}", e);
            }
        }

        self.clear_timer().await;
        self.set_stage(&mut state, Stage::Disconnected);
    }
}

async fn run_event_loop(
    inner: Weak<Inner>,
    mut engine_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    mut expired_rx: mpsc::UnboundedReceiver<TimerExpired>,
    shutdown: CancellationToken,
) {
    debug!("Session event loop started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            Some(tagged) = engine_rx.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_engine_event(tagged).await;
            }
            Some(expired) = expired_rx.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                inner.handle_expiry(expired).await;
            }
            else => break,
        }
    }

    debug!("Session event loop stopped");
}
