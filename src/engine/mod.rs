//! Tunnel Engine Seam
//!
//! The tunnel itself is run by an external engine. The controller drives it
//! through [`TunnelEngine`] and hears back through an [`EngineEventSink`]
//! installed at `initialize` time. Engine callbacks may arrive from any task
//! or thread; the sink only enqueues, and the controller applies events in
//! order under its own lock.
//!
//! `process` provides an engine that runs an OpenVPN-compatible binary as a
//! child process.

pub mod process;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::session::{Session, TrafficStats};

/// Asynchronous notification from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Engine-side stage name (mapped with `Stage::from_engine`)
    StageChanged(String),
    /// Traffic counters
    Traffic(TrafficStats),
}

/// Event tagged with the engine installation it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TaggedEvent {
    pub(crate) epoch: u64,
    pub(crate) event: EngineEvent,
}

/// Callback handle given to the engine
///
/// Cheap to clone and safe to call from any thread. Events sent after the
/// engine has been replaced or disposed are dropped by the controller.
#[derive(Debug, Clone)]
pub struct EngineEventSink {
    epoch: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EngineEventSink {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { epoch, tx }
    }

    /// Deliver an event
    pub fn send(&self, event: EngineEvent) {
        if self
            .tx
            .send(TaggedEvent {
                epoch: self.epoch,
                event,
            })
            .is_err()
        {
            debug!("Engine event dropped, controller is gone");
        }
    }

    /// Report a stage change by name
    pub fn stage_changed(&self, stage: impl Into<String>) {
        self.send(EngineEvent::StageChanged(stage.into()));
    }

    /// Report traffic counters
    pub fn traffic(&self, stats: TrafficStats) {
        self.send(EngineEvent::Traffic(stats));
    }
}

/// External tunnel engine
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Install the callback used for stage and traffic notifications
    ///
    /// Called once when the engine is handed to the controller.
    fn attach(&self, sink: EngineEventSink);

    /// Start a tunnel for `session`
    ///
    /// Returns once the engine has accepted the request; progress is
    /// reported through the sink.
    async fn start(&self, session: &Session) -> anyhow::Result<()>;

    /// Stop the running tunnel
    async fn stop(&self) -> anyhow::Result<()>;

    /// Engine-side stage name
    fn current_status(&self) -> String;
}
