//! Session Time Limits
//!
//! Enforces the allowed session duration with an absolute deadline model:
//! the persisted [`TimerState`] holds the start time and the allowed
//! duration, and every check recomputes
//!
//! ```text
//! remaining = (connection_start_time + allowed_duration_seconds) - now
//! ```
//!
//! from the store. Nothing counts down in memory, so a suspended process, a
//! missed tick or a restart between checks cannot stretch a session.
//!
//! # Architecture
//!
//! ```text
//! SessionController ──TimerCommand──> supervisor task ──> PersistentStore
//!        ^                                 │
//!        └────────── TimerExpired ─────────┘ (interval tick, deadline passed)
//! ```
//!
//! The supervisor task is owned by the controller, not by the host surface,
//! so detaching the UI never stops enforcement. Expiry is reported as a
//! message; the supervisor never calls back into the controller directly.
//!
//! # Sentinels
//!
//! - `allowed_duration_seconds == -1` (or any negative value, or a record
//!   written without the field) means unlimited
//! - `is_pro_user == true` means unlimited regardless of the duration
//! - `allowed_duration_seconds == 0` expires on the next check

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::TimerParams;
use crate::store::PersistentStore;

/// Store key holding the single canonical timer record
pub const TIMER_STATE_KEY: &str = "timer_state";

fn unlimited_duration() -> i64 {
    TimerParams::UNLIMITED
}

/// Persisted timer record
///
/// Always written and read as one value under [`TIMER_STATE_KEY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    /// Allowed session length in seconds, negative for unlimited
    #[serde(default = "unlimited_duration")]
    pub allowed_duration_seconds: i64,
    /// Pro users are never time-limited
    #[serde(default)]
    pub is_pro_user: bool,
    /// Session start, Unix time in milliseconds
    pub connection_start_time: i64,
}

impl TimerState {
    /// Build a record starting at `start_ms`
    pub fn new(params: TimerParams, start_ms: i64) -> Self {
        Self {
            allowed_duration_seconds: params.allowed_duration_seconds,
            is_pro_user: params.is_pro_user,
            connection_start_time: start_ms,
        }
    }

    /// True when this record never expires
    pub fn is_unlimited(&self) -> bool {
        self.is_pro_user || self.allowed_duration_seconds < 0
    }

    /// Absolute deadline in Unix milliseconds, `None` when unlimited
    pub fn deadline_ms(&self) -> Option<i64> {
        if self.is_unlimited() {
            return None;
        }
        Some(
            self.connection_start_time
                .saturating_add(self.allowed_duration_seconds.saturating_mul(1000)),
        )
    }

    /// Milliseconds left at `now_ms`, `None` when unlimited
    ///
    /// May be zero or negative once the deadline has passed.
    pub fn remaining_ms(&self, now_ms: i64) -> Option<i64> {
        self.deadline_ms()
            .map(|deadline| deadline.saturating_sub(now_ms))
    }

    /// Read the record from the store
    ///
    /// A record that does not deserialize is logged and treated as absent.
    pub fn load(store: &dyn PersistentStore) -> Result<Option<TimerState>> {
        let Some(value) = store.get(TIMER_STATE_KEY)? else {
            return Ok(None);
        };

        match serde_json::from_value::<TimerState>(value) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!("Ignoring malformed timer record: {}", e);
                Ok(None)
            }
        }
    }

    /// Write the record to the store as one value
    pub fn save(&self, store: &dyn PersistentStore) -> Result<()> {
        let value = serde_json::to_value(self).context("Failed to encode timer record")?;
        store.set(TIMER_STATE_KEY, value)
    }

    /// Remove the record from the store
    pub fn clear(store: &dyn PersistentStore) -> Result<()> {
        store.remove(TIMER_STATE_KEY)
    }
}

/// Outcome of a single deadline check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineCheck {
    /// No record is persisted
    Idle,
    /// A record exists but never expires
    Unlimited,
    /// Deadline still ahead
    Running {
        /// Milliseconds until the deadline
        remaining_ms: i64,
    },
    /// Deadline reached or passed
    Expired,
}

impl DeadlineCheck {
    /// Evaluate a (possibly absent) record at `now_ms`
    pub fn evaluate(state: Option<&TimerState>, now_ms: i64) -> DeadlineCheck {
        match state {
            None => DeadlineCheck::Idle,
            Some(state) => match state.remaining_ms(now_ms) {
                None => DeadlineCheck::Unlimited,
                Some(remaining_ms) if remaining_ms <= 0 => DeadlineCheck::Expired,
                Some(remaining_ms) => DeadlineCheck::Running { remaining_ms },
            },
        }
    }
}

/// Timer record plus remaining time, for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimerSnapshot {
    /// Persisted record
    #[serde(flatten)]
    pub state: TimerState,
    /// Whole seconds left (never negative), `None` when unlimited
    pub remaining_seconds: Option<i64>,
}

impl TimerSnapshot {
    fn at(state: TimerState, now_ms: i64) -> Self {
        Self {
            remaining_seconds: state.remaining_ms(now_ms).map(|ms| ms.max(0) / 1000),
            state,
        }
    }
}

/// Wall clock used for deadlines
pub trait Clock: Send + Sync {
    /// Current Unix time in milliseconds
    fn now_ms(&self) -> i64;
}

/// System wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<i64>,
}

impl ManualClock {
    /// Clock frozen at `start_ms`
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Mutex::new(start_ms),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_add(i64::try_from(by.as_millis()).unwrap_or(i64::MAX));
    }

    /// Jump to an absolute time
    pub fn set(&self, now_ms: i64) {
        *self.now.lock() = now_ms;
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        *self.now.lock()
    }
}

/// Messages accepted by the supervisor task
#[derive(Debug)]
pub enum TimerCommand {
    /// Persist a record starting now and arm the deadline checks
    Start {
        /// Duration limit
        params: TimerParams,
        /// Persisted record, or the store failure
        response: oneshot::Sender<Result<TimerState>>,
    },
    /// Replace the record with a new budget measured from now
    Update {
        /// Duration limit
        params: TimerParams,
        /// Persisted record, or the store failure
        response: oneshot::Sender<Result<TimerState>>,
    },
    /// Disarm and clear the record
    Cancel {
        /// Store outcome
        response: oneshot::Sender<Result<()>>,
    },
}

/// Deadline-passed notification sent to the session controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpired {
    /// Record that expired
    pub state: TimerState,
}

/// Background deadline monitor
///
/// Spawns one task that owns the command queue and the check interval. The
/// task runs until the supervisor is dropped or [`TimerSupervisor::shutdown`]
/// is called.
pub struct TimerSupervisor {
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    armed: Arc<AtomicBool>,
    commands: mpsc::UnboundedSender<TimerCommand>,
    shutdown: CancellationToken,
}

impl TimerSupervisor {
    /// Spawn the supervisor task
    ///
    /// A record already in the store (left by a previous process) arms the
    /// supervisor immediately. Returns the supervisor and the receiver on
    /// which expiries are reported.
    pub fn spawn(
        store: Arc<dyn PersistentStore>,
        clock: Arc<dyn Clock>,
        check_interval: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<TimerExpired>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (expired_tx, expired_rx) = mpsc::unbounded_channel();

        let resumed = matches!(TimerState::load(store.as_ref()), Ok(Some(_)));
        if resumed {
            info!("Resuming session timer from persisted record");
        }

        let armed = Arc::new(AtomicBool::new(resumed));
        let shutdown = CancellationToken::new();

        let task = SupervisorTask {
            store: Arc::clone(&store),
            clock: Arc::clone(&clock),
            armed: Arc::clone(&armed),
            expired_tx,
        };
        tokio::spawn(task.run(command_rx, check_interval, shutdown.clone()));

        (
            Self {
                store,
                clock,
                armed,
                commands: command_tx,
                shutdown,
            },
            expired_rx,
        )
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> TimerCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| anyhow!("Timer supervisor is not running"))?;
        rx.await
            .map_err(|_| anyhow!("Timer supervisor dropped the request"))?
    }

    /// Persist `{params, start = now}` and arm the deadline checks
    ///
    /// Calling it again overwrites the record; nothing accumulates.
    pub async fn start(&self, params: TimerParams) -> Result<TimerState> {
        self.request(|response| TimerCommand::Start { params, response })
            .await
    }

    /// Replace the budget, measured from now
    ///
    /// The new deadline is `now + duration`, not the old deadline plus any
    /// delta.
    pub async fn update(&self, params: TimerParams) -> Result<TimerState> {
        self.request(|response| TimerCommand::Update { params, response })
            .await
    }

    /// Disarm and clear the persisted record
    pub async fn cancel(&self) -> Result<()> {
        self.request(|response| TimerCommand::Cancel { response })
            .await
    }

    /// Persist a record without arming the checks
    ///
    /// Used by `connect` to record the caller's limit before the permission
    /// outcome is known.
    pub fn persist(&self, params: TimerParams) -> Result<TimerState> {
        let state = TimerState::new(params, self.clock.now_ms());
        state.save(self.store.as_ref())?;
        Ok(state)
    }

    /// Read the persisted record
    pub fn state(&self) -> Result<Option<TimerState>> {
        TimerState::load(self.store.as_ref())
    }

    /// Evaluate the deadline now, straight from the store
    pub fn check_now(&self) -> DeadlineCheck {
        match self.state() {
            Ok(state) => DeadlineCheck::evaluate(state.as_ref(), self.clock.now_ms()),
            Err(e) => {
                warn!("Timer check could not read the store: {:#}", e);
                DeadlineCheck::Idle
            }
        }
    }

    /// Persisted record plus remaining time
    pub fn snapshot(&self) -> Option<TimerSnapshot> {
        self.state()
            .ok()
            .flatten()
            .map(|state| TimerSnapshot::at(state, self.clock.now_ms()))
    }

    /// True while deadline checks are active
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Stop the supervisor task (the persisted record is left in place)
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TimerSupervisor {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct SupervisorTask {
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    armed: Arc<AtomicBool>,
    expired_tx: mpsc::UnboundedSender<TimerExpired>,
}

impl SupervisorTask {
    async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<TimerCommand>,
        check_interval: Duration,
        shutdown: CancellationToken,
    ) {
        info!("Timer supervisor started (check every {:?})", check_interval);

        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = ticker.tick() => self.tick(),
            }
        }

        info!("Timer supervisor stopped");
    }

    fn handle(&self, command: TimerCommand) {
        match command {
            TimerCommand::Start { params, response } => {
                let result = self.rebase(params);
                if let Ok(state) = &result {
                    info!(
                        "Session timer started: {}s, pro={}",
                        state.allowed_duration_seconds, state.is_pro_user
                    );
                }
                let _ = response.send(result);
            }
            TimerCommand::Update { params, response } => {
                let result = self.rebase(params);
                if let Ok(state) = &result {
                    info!(
                        "Session timer updated: {}s from now, pro={}",
                        state.allowed_duration_seconds, state.is_pro_user
                    );
                }
                let _ = response.send(result);
            }
            TimerCommand::Cancel { response } => {
                self.armed.store(false, Ordering::SeqCst);
                let result = TimerState::clear(self.store.as_ref());
                debug!("Session timer cancelled");
                let _ = response.send(result);
            }
        }
    }

    fn rebase(&self, params: TimerParams) -> Result<TimerState> {
        let state = TimerState::new(params, self.clock.now_ms());
        state.save(self.store.as_ref())?;
        self.armed.store(true, Ordering::SeqCst);
        Ok(state)
    }

    fn tick(&self) {
        if !self.armed.load(Ordering::SeqCst) {
            return;
        }

        let state = match TimerState::load(self.store.as_ref()) {
            Ok(state) => state,
            Err(e) => {
                warn!("Timer tick could not read the store: {:#}", e);
                return;
            }
        };

        match DeadlineCheck::evaluate(state.as_ref(), self.clock.now_ms()) {
            DeadlineCheck::Idle => {
                debug!("Timer record gone, disarming");
                self.armed.store(false, Ordering::SeqCst);
            }
            DeadlineCheck::Unlimited => {}
            DeadlineCheck::Running { remaining_ms } => {
                debug!("Session time remaining: {}ms", remaining_ms);
            }
            DeadlineCheck::Expired => {
                if let Some(state) = state {
                    info!("Session deadline reached");
                    if self.expired_tx.send(TimerExpired { state }).is_err() {
                        debug!("Expiry receiver gone");
                    }
                }
            }
        }
    }
}
