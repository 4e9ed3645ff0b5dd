//! Shared fakes for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use lamco_vpn_session::engine::{EngineEventSink, TunnelEngine};
use lamco_vpn_session::events::StageStream;
use lamco_vpn_session::permission::{PermissionApi, RequestToken};
use lamco_vpn_session::session::{
    ConnectRequest, ControllerOptions, Credentials, Session, SessionController, Stage, TimerParams,
};
use lamco_vpn_session::store::{MemoryStore, PersistentStore};
use lamco_vpn_session::timer::ManualClock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const T0: i64 = 1_700_000_000_000;
pub const WAIT: Duration = Duration::from_secs(2);

/// Engine that records calls and lets the test push callbacks
#[derive(Default)]
pub struct RecordingEngine {
    sink: Mutex<Option<EngineEventSink>>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_start: AtomicBool,
    pub fail_stop: AtomicBool,
    pub last_session: Mutex<Option<String>>,
    /// Reported by `current_status`; `idle` when unset
    pub status: Mutex<Option<String>>,
}

impl RecordingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push an engine-side stage name
    pub fn report(&self, stage: &str) {
        if let Some(sink) = self.sink.lock().as_ref() {
            sink.stage_changed(stage);
        }
    }

    pub fn sink(&self) -> Option<EngineEventSink> {
        self.sink.lock().clone()
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TunnelEngine for RecordingEngine {
    fn attach(&self, sink: EngineEventSink) {
        *self.sink.lock() = Some(sink);
    }

    async fn start(&self, session: &Session) -> anyhow::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        *self.last_session.lock() = Some(session.display_name.clone());
        if self.fail_start.load(Ordering::SeqCst) {
            anyhow::bail!("engine refused to start");
        }
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            anyhow::bail!("engine stop failed");
        }
        Ok(())
    }

    fn current_status(&self) -> String {
        self.status.lock().clone().unwrap_or_else(|| "idle".to_string())
    }
}

/// Permission API whose answer the test delivers through the controller
#[derive(Default)]
pub struct ScriptedPermission {
    pub granted: AtomicBool,
    pub presented: Mutex<Vec<RequestToken>>,
}

impl ScriptedPermission {
    pub fn granted() -> Arc<Self> {
        let api = Self::default();
        api.granted.store(true, Ordering::SeqCst);
        Arc::new(api)
    }

    pub fn prompting() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PermissionApi for ScriptedPermission {
    fn already_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn present(&self, token: &RequestToken) -> anyhow::Result<()> {
        self.presented.lock().push(token.clone());
        Ok(())
    }
}

pub struct Harness {
    pub controller: SessionController,
    pub engine: Arc<RecordingEngine>,
    pub permission: Arc<ScriptedPermission>,
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
}

pub fn options() -> ControllerOptions {
    ControllerOptions {
        check_interval: Duration::from_millis(10),
        auto_reconnect: false,
        reconnect_delay: Duration::from_millis(20),
    }
}

/// Controller with an uninitialized engine slot
pub fn harness_with(permission: Arc<ScriptedPermission>, options: ControllerOptions) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(T0));
    let controller = SessionController::with_clock(
        store.clone() as Arc<dyn PersistentStore>,
        permission.clone() as Arc<dyn PermissionApi>,
        clock.clone(),
        options,
    );
    Harness {
        controller,
        engine: RecordingEngine::new(),
        permission,
        store,
        clock,
    }
}

/// Controller with the recording engine installed
pub async fn harness(permission: Arc<ScriptedPermission>) -> Harness {
    let harness = harness_with(permission, options());
    harness.controller.initialize(harness.engine.clone()).await;
    harness
}

pub fn request(allowed_seconds: i64, is_pro_user: bool) -> ConnectRequest {
    ConnectRequest {
        config: Some("client\nremote vpn.example.com 1194\n".into()),
        credentials: Credentials::new("alice", "hunter2"),
        name: "Frankfurt".into(),
        bypass_list: Default::default(),
        timer: TimerParams {
            allowed_duration_seconds: allowed_seconds,
            is_pro_user,
        },
    }
}

pub async fn next_stage(stream: &mut StageStream) -> Option<Stage> {
    tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("timed out waiting for a stage event")
}

pub async fn wait_for_stage(controller: &SessionController, stage: Stage) {
    tokio::time::timeout(WAIT, async {
        while controller.stage().await != stage {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("stage never became {}", stage));
}

pub async fn wait_for_token(controller: &SessionController) -> RequestToken {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(token) = controller.pending_permission() {
                return token;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("no permission request was issued")
}
