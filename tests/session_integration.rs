mod common;

use async_trait::async_trait;
use common::{
    harness, harness_with, next_stage, options, request, wait_for_stage, wait_for_token,
    RecordingEngine, ScriptedPermission, T0, WAIT,
};
use lamco_vpn_session::engine::{EngineEventSink, TunnelEngine};
use lamco_vpn_session::permission::PermissionApi;
use lamco_vpn_session::session::{
    ConnectRequest, EndReason, Session, SessionController, SessionError, Stage, TimerParams,
    TrafficStats, AUTO_RECONNECT_KEY,
};
use lamco_vpn_session::store::{MemoryStore, PersistentStore};
use lamco_vpn_session::timer::{ManualClock, TIMER_STATE_KEY};
use mockall::mock;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Engine {}

    #[async_trait]
    impl TunnelEngine for Engine {
        fn attach(&self, sink: EngineEventSink);
        async fn start(&self, session: &Session) -> anyhow::Result<()>;
        async fn stop(&self) -> anyhow::Result<()>;
        fn current_status(&self) -> String;
    }
}

#[tokio::test]
async fn test_connect_without_config_changes_nothing() {
    let h = harness(ScriptedPermission::granted()).await;

    let result = h
        .controller
        .connect(ConnectRequest {
            config: None,
            ..request(60, false)
        })
        .await;

    assert_eq!(result, Err(SessionError::InvalidArgument("config is required".into())));
    assert_eq!(h.controller.stage().await, Stage::Idle);
    assert_eq!(h.engine.starts(), 0);
    assert_eq!(h.store.get(TIMER_STATE_KEY).unwrap(), None);
}

#[tokio::test]
async fn test_connect_before_initialize() {
    let h = harness_with(ScriptedPermission::granted(), options());

    let result = h.controller.connect(request(60, false)).await;
    assert_eq!(result, Err(SessionError::NotInitialized));
    assert_eq!(h.controller.disconnect().await, Err(SessionError::NotInitialized));
    assert_eq!(h.controller.stage().await, Stage::Idle);
}

#[tokio::test]
async fn test_initialize_broadcasts_idle() {
    let h = harness_with(ScriptedPermission::granted(), options());
    let mut stream = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));

    h.controller.initialize(h.engine.clone()).await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));
    assert!(h.controller.is_initialized().await);
}

#[tokio::test]
async fn test_granted_connect_reaches_connected() {
    let h = harness(ScriptedPermission::granted()).await;
    let mut stream = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));

    h.controller.connect(request(600, false)).await.unwrap();
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connecting));

    h.engine.report("CONNECTED");
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connected));

    assert_eq!(h.engine.starts(), 1);
    assert_eq!(h.engine.last_session.lock().as_deref(), Some("Frankfurt"));
    assert!(h.permission.presented.lock().is_empty());

    let snapshot = h.controller.timer_snapshot().unwrap();
    assert_eq!(snapshot.state.allowed_duration_seconds, 600);
    assert_eq!(snapshot.state.connection_start_time, T0);
}

#[tokio::test]
async fn test_denied_permission_never_starts_engine() {
    let h = harness_with(ScriptedPermission::prompting(), options());

    let mut engine = MockEngine::new();
    engine.expect_attach().times(1).return_const(());
    engine.expect_start().never();
    engine
        .expect_current_status()
        .return_const("idle".to_string());
    h.controller.initialize(Arc::new(engine)).await;

    let controller = h.controller.clone();
    let pending = tokio::spawn(async move { controller.connect(request(60, false)).await });

    let token = wait_for_token(&h.controller).await;
    assert_eq!(h.controller.stage().await, Stage::RequestingPermission);
    assert!(h.store.get(TIMER_STATE_KEY).unwrap().is_some());

    assert!(h.controller.permission_result(&token, false));
    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();

    assert_eq!(result, Err(SessionError::PermissionDenied));
    assert_eq!(h.controller.stage().await, Stage::Idle);
    assert_eq!(h.store.get(TIMER_STATE_KEY).unwrap(), None);
    assert_eq!(
        h.controller.status().await.end_reason,
        Some(EndReason::PermissionDenied)
    );
}

#[tokio::test]
async fn test_prompted_grant_starts_engine() {
    let h = harness(ScriptedPermission::prompting()).await;
    let mut stream = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));

    let controller = h.controller.clone();
    let pending = tokio::spawn(async move { controller.connect(request(60, false)).await });

    assert_eq!(next_stage(&mut stream).await, Some(Stage::RequestingPermission));
    let token = wait_for_token(&h.controller).await;
    assert_eq!(h.permission.presented.lock().as_slice(), &[token.clone()]);

    h.clock.advance(Duration::from_secs(30));
    h.controller.permission_result(&token, true);

    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(result, Ok(()));
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connecting));
    assert_eq!(h.engine.starts(), 1);

    // Timer measured from engine start, not from the prompt
    let snapshot = h.controller.timer_snapshot().unwrap();
    assert_eq!(snapshot.state.connection_start_time, T0 + 30_000);
}

#[tokio::test]
async fn test_second_connect_while_pending_is_rejected() {
    let h = harness(ScriptedPermission::prompting()).await;

    let controller = h.controller.clone();
    let first = tokio::spawn(async move { controller.connect(request(60, false)).await });
    let token = wait_for_token(&h.controller).await;

    let second = h.controller.connect(request(120, true)).await;
    assert_eq!(second, Err(SessionError::RequestInProgress));
    assert_eq!(
        h.controller.request_permission().await,
        Err(SessionError::RequestInProgress)
    );
    assert_eq!(h.controller.pending_permission(), Some(token.clone()));

    h.controller.permission_result(&token, true);
    let result = tokio::time::timeout(WAIT, first).await.unwrap().unwrap();
    assert_eq!(result, Ok(()));

    let snapshot = h.controller.timer_snapshot().unwrap();
    assert_eq!(snapshot.state.allowed_duration_seconds, 60);
    assert!(!snapshot.state.is_pro_user);
}

#[tokio::test]
async fn test_connect_while_connected_is_rejected() {
    let h = harness(ScriptedPermission::granted()).await;
    h.controller.connect(request(60, false)).await.unwrap();

    assert_eq!(
        h.controller.connect(request(60, false)).await,
        Err(SessionError::SessionActive)
    );
    assert_eq!(h.engine.starts(), 1);
}

#[tokio::test]
async fn test_engine_start_failure_reverts_to_idle() {
    let h = harness(ScriptedPermission::granted()).await;
    h.engine.fail_start.store(true, Ordering::SeqCst);

    let result = h.controller.connect(request(60, false)).await;
    assert!(matches!(result, Err(SessionError::EngineFailure(_))));
    assert_eq!(h.controller.stage().await, Stage::Idle);
    assert_eq!(h.store.get(TIMER_STATE_KEY).unwrap(), None);
}

#[tokio::test]
async fn test_disconnect_ends_idle_even_when_stop_fails() {
    let h = harness(ScriptedPermission::granted()).await;
    let mut stream = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));

    h.controller.connect(request(600, false)).await.unwrap();
    h.engine.report("connected");
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connecting));
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connected));

    h.engine.fail_stop.store(true, Ordering::SeqCst);
    let result = h.controller.disconnect().await;

    assert!(matches!(result, Err(SessionError::EngineFailure(_))));
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Disconnecting));
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));
    assert_eq!(h.controller.stage().await, Stage::Idle);
    assert_eq!(h.store.get(TIMER_STATE_KEY).unwrap(), None);
    assert!(h.controller.timer_snapshot().is_none());
}

#[tokio::test]
async fn test_timer_expiry_disconnects() {
    let h = harness(ScriptedPermission::granted()).await;
    let mut stream = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));

    h.controller.connect(request(60, false)).await.unwrap();
    h.engine.report("connected");
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connecting));
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connected));

    // Detaching the host surface does not stop enforcement
    h.controller.detach_surface();

    h.clock.advance(Duration::from_secs(61));
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Disconnecting));
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Disconnected));

    let status = h.controller.status().await;
    assert_eq!(status.stage, Stage::Disconnected);
    assert_eq!(status.end_reason, Some(EndReason::Expired));
    assert_eq!(status.timer, None);
    assert_eq!(h.engine.stops(), 1);

    // Late engine callbacks for the ended session are ignored
    h.engine.report("disconnected");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.controller.stage().await, Stage::Disconnected);

    // A new session may start after expiry
    h.controller.connect(request(60, false)).await.unwrap();
    assert_eq!(h.controller.stage().await, Stage::Connecting);
}

#[tokio::test]
async fn test_pro_user_never_expires() {
    let h = harness(ScriptedPermission::granted()).await;

    h.controller.connect(request(0, true)).await.unwrap();
    h.engine.report("connected");
    wait_for_stage(&h.controller, Stage::Connected).await;

    h.clock.advance(Duration::from_secs(365 * 24 * 3600));
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(h.controller.stage().await, Stage::Connected);
    assert_eq!(h.engine.stops(), 0);
    assert_eq!(h.controller.timer_snapshot().unwrap().remaining_seconds, None);
}

#[tokio::test]
async fn test_update_timer_extends_from_now() {
    let h = harness(ScriptedPermission::granted()).await;

    h.controller.connect(request(300, false)).await.unwrap();
    h.engine.report("connected");
    wait_for_stage(&h.controller, Stage::Connected).await;

    h.clock.advance(Duration::from_secs(250));
    let updated = h
        .controller
        .update_timer(TimerParams {
            allowed_duration_seconds: 300,
            is_pro_user: false,
        })
        .await
        .unwrap();
    assert_eq!(updated.deadline_ms(), Some(T0 + 550_000));

    // Past the first deadline, still inside the updated one
    h.clock.advance(Duration::from_secs(100));
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(h.controller.stage().await, Stage::Connected);

    h.clock.advance(Duration::from_secs(201));
    wait_for_stage(&h.controller, Stage::Disconnected).await;
}

#[tokio::test]
async fn test_detach_fails_pending_request() {
    let h = harness(ScriptedPermission::prompting()).await;

    let controller = h.controller.clone();
    let pending = tokio::spawn(async move { controller.connect(request(60, false)).await });
    wait_for_token(&h.controller).await;

    h.controller.detach_surface();
    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();

    assert_eq!(result, Err(SessionError::SurfaceDetached));
    assert_eq!(h.controller.stage().await, Stage::Idle);
    assert_eq!(h.controller.check_permission(), Err(SessionError::SurfaceDetached));
    assert_eq!(h.engine.starts(), 0);

    h.controller.attach_surface();
    assert_eq!(h.controller.check_permission(), Ok(false));
}

#[tokio::test]
async fn test_disconnect_while_pending_discards_session() {
    let h = harness(ScriptedPermission::prompting()).await;

    let controller = h.controller.clone();
    let pending = tokio::spawn(async move { controller.connect(request(60, false)).await });
    let token = wait_for_token(&h.controller).await;

    h.controller.disconnect().await.unwrap();
    assert_eq!(h.controller.stage().await, Stage::Idle);

    h.controller.permission_result(&token, true);
    let result = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();

    assert_eq!(result, Err(SessionError::SessionDiscarded));
    assert_eq!(h.engine.starts(), 0);
    assert_eq!(h.controller.stage().await, Stage::Idle);
}

#[tokio::test]
async fn test_engine_drop_ends_session() {
    let h = harness(ScriptedPermission::granted()).await;

    h.controller.connect(request(600, false)).await.unwrap();
    h.engine.report("connected");
    wait_for_stage(&h.controller, Stage::Connected).await;

    h.engine.report("disconnected");
    wait_for_stage(&h.controller, Stage::Disconnected).await;

    let status = h.controller.status().await;
    assert_eq!(status.end_reason, Some(EndReason::EngineDropped));
    assert_eq!(status.timer, None);
    assert_eq!(h.engine.starts(), 1);
}

#[tokio::test]
async fn test_auto_reconnect_restarts_session() {
    let h = harness(ScriptedPermission::granted()).await;
    h.controller.set_auto_reconnect(true).await;
    let mut stream = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));

    h.controller.connect(request(600, false)).await.unwrap();
    h.engine.report("connected");
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connecting));
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connected));

    h.engine.report("disconnected");
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Disconnected));
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connecting));

    assert_eq!(h.engine.starts(), 2);
    assert!(h.controller.timer_snapshot().is_some());
    assert!(h.controller.status().await.auto_reconnect);
}

#[tokio::test]
async fn test_disconnect_cancels_scheduled_reconnect() {
    let mut opts = options();
    opts.auto_reconnect = true;
    opts.reconnect_delay = Duration::from_millis(100);
    let h = harness_with(ScriptedPermission::granted(), opts);
    h.controller.initialize(h.engine.clone()).await;

    h.controller.connect(request(600, false)).await.unwrap();
    h.engine.report("connected");
    wait_for_stage(&h.controller, Stage::Connected).await;
    h.engine.report("disconnected");
    wait_for_stage(&h.controller, Stage::Disconnected).await;

    h.controller.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(h.engine.starts(), 1);
    assert_eq!(h.controller.stage().await, Stage::Idle);
}

#[tokio::test]
async fn test_traffic_reported_in_status() {
    let h = harness(ScriptedPermission::granted()).await;
    h.controller.connect(request(-1, false)).await.unwrap();

    let stats = TrafficStats {
        duration_seconds: 12,
        last_packet_received_ms: Some(T0 + 11_000),
        bytes_in: 4096,
        bytes_out: 1024,
    };
    h.engine.sink().unwrap().traffic(stats);
    h.engine.report("connected");
    wait_for_stage(&h.controller, Stage::Connected).await;

    assert_eq!(h.controller.status().await.traffic, stats);
}

#[tokio::test]
async fn test_engine_events_without_session_ignored() {
    let h = harness(ScriptedPermission::granted()).await;

    h.engine.report("connected");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.controller.stage().await, Stage::Idle);
}

#[tokio::test]
async fn test_dispose_ends_stream_and_uninitializes() {
    let h = harness(ScriptedPermission::granted()).await;
    let mut stream = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));

    h.controller.connect(request(60, false)).await.unwrap();
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connecting));

    h.controller.dispose().await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));
    assert_eq!(next_stage(&mut stream).await, None);

    assert_eq!(h.engine.stops(), 1);
    assert!(!h.controller.is_initialized().await);
    assert_eq!(h.store.get(TIMER_STATE_KEY).unwrap(), None);
    assert_eq!(
        h.controller.connect(request(60, false)).await,
        Err(SessionError::NotInitialized)
    );
}

#[tokio::test]
async fn test_standalone_permission_request() {
    let h = harness(ScriptedPermission::prompting()).await;
    assert_eq!(h.controller.check_permission(), Ok(false));

    let controller = h.controller.clone();
    let pending = tokio::spawn(async move { controller.request_permission().await });
    let token = wait_for_token(&h.controller).await;

    assert!(!h
        .controller
        .permission_result(&"other".into(), true));
    assert!(h.controller.permission_result(&token, true));

    let granted = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(granted, Ok(true));
    assert_eq!(h.controller.stage().await, Stage::Idle);
}

#[tokio::test]
async fn test_drop_before_connected_is_not_retried() {
    let mut opts = options();
    opts.auto_reconnect = true;
    let h = harness_with(ScriptedPermission::granted(), opts);
    h.controller.initialize(h.engine.clone()).await;

    h.controller.connect(request(600, false)).await.unwrap();
    for _ in 0..3 {
        h.engine.report("disconnected");
    }
    wait_for_stage(&h.controller, Stage::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    let status = h.controller.status().await;
    assert_eq!(status.stage, Stage::Disconnected);
    assert_eq!(status.end_reason, Some(EndReason::EngineDropped));
    assert_eq!(status.timer, None);
    assert_eq!(h.engine.starts(), 1);
}

#[tokio::test]
async fn test_failed_reconnect_is_not_retried() {
    let h = harness(ScriptedPermission::granted()).await;
    h.controller.set_auto_reconnect(true).await;

    h.controller.connect(request(600, false)).await.unwrap();
    h.engine.report("connected");
    wait_for_stage(&h.controller, Stage::Connected).await;

    h.engine.report("disconnected");
    tokio::time::timeout(WAIT, async {
        while h.engine.starts() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // The restarted tunnel drops before it ever comes up
    h.engine.report("disconnected");
    wait_for_stage(&h.controller, Stage::Disconnected).await;
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(h.engine.starts(), 2);
    assert_eq!(
        h.controller.status().await.end_reason,
        Some(EndReason::EngineDropped)
    );
}

#[tokio::test]
async fn test_initialize_adopts_engine_status() {
    let h = harness_with(ScriptedPermission::granted(), options());
    *h.engine.status.lock() = Some("CONNECTED".into());
    let mut stream = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Idle));

    let stage = h.controller.initialize(h.engine.clone()).await;
    assert_eq!(stage, Stage::Connected);
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Connected));
    assert_eq!(h.controller.stage().await, Stage::Connected);

    // The adopted tunnel is followed until it goes down
    h.engine.report("disconnected");
    assert_eq!(next_stage(&mut stream).await, Some(Stage::Disconnected));
    h.engine.report("connected");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(h.controller.stage().await, Stage::Disconnected);

    // A stage the engine cannot be in on its own settles on idle
    let engine = RecordingEngine::new();
    *engine.status.lock() = Some("requesting_permission".into());
    assert_eq!(h.controller.initialize(engine).await, Stage::Idle);
}

/// Memory store that refuses timer writes after a budget is used up
struct TimerWriteBudget {
    values: MemoryStore,
    remaining: AtomicUsize,
}

impl PersistentStore for TimerWriteBudget {
    fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
        self.values.get(key)
    }

    fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
        if key == TIMER_STATE_KEY
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            anyhow::bail!("disk full");
        }
        self.values.set(key, value)
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.values.remove(key)
    }

    fn clear(&self) -> anyhow::Result<()> {
        self.values.clear()
    }
}

#[tokio::test]
async fn test_timer_store_failure_stops_engine() {
    // First write records the limit, the rebase at engine start fails
    let store = Arc::new(TimerWriteBudget {
        values: MemoryStore::new(),
        remaining: AtomicUsize::new(1),
    });
    let controller = SessionController::with_clock(
        store.clone() as Arc<dyn PersistentStore>,
        ScriptedPermission::granted() as Arc<dyn PermissionApi>,
        Arc::new(ManualClock::new(T0)),
        options(),
    );
    let engine = RecordingEngine::new();
    controller.initialize(engine.clone()).await;

    let result = controller.connect(request(60, false)).await;

    assert!(matches!(result, Err(SessionError::Store(_))));
    assert_eq!(engine.starts(), 1);
    assert_eq!(engine.stops(), 1);
    let status = controller.status().await;
    assert_eq!(status.stage, Stage::Idle);
    assert_eq!(status.end_reason, Some(EndReason::StoreFailure));
    assert_eq!(store.get(TIMER_STATE_KEY).unwrap(), None);
    assert!(controller.timer_snapshot().is_none());

    // Callbacks from the abandoned tunnel change nothing
    engine.report("connected");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(controller.stage().await, Stage::Idle);
}

#[tokio::test]
async fn test_auto_reconnect_setting_survives_restart() {
    let h = harness(ScriptedPermission::granted()).await;
    h.controller.set_auto_reconnect(true).await;
    assert_eq!(h.store.get(AUTO_RECONNECT_KEY).unwrap(), Some(json!(true)));

    let restarted = SessionController::with_clock(
        h.store.clone() as Arc<dyn PersistentStore>,
        ScriptedPermission::granted() as Arc<dyn PermissionApi>,
        h.clock.clone(),
        options(),
    );
    assert!(restarted.status().await.auto_reconnect);

    restarted.set_auto_reconnect(false).await;
    assert_eq!(h.store.get(AUTO_RECONNECT_KEY).unwrap(), Some(json!(false)));
}

#[tokio::test]
async fn test_dispose_clears_timer_without_engine() {
    let h = harness_with(ScriptedPermission::granted(), options());
    h.controller
        .start_timer(TimerParams {
            allowed_duration_seconds: 60,
            is_pro_user: false,
        })
        .await
        .unwrap();
    assert!(h.store.get(TIMER_STATE_KEY).unwrap().is_some());

    h.controller.dispose().await;

    assert_eq!(h.store.get(TIMER_STATE_KEY).unwrap(), None);
    assert!(h.controller.timer_snapshot().is_none());
}

#[tokio::test]
async fn test_stale_stream_unsubscribe_keeps_current() {
    let h = harness(ScriptedPermission::granted()).await;
    let mut first = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut first).await, Some(Stage::Idle));

    let mut second = h.controller.subscribe().await;
    assert_eq!(next_stage(&mut second).await, Some(Stage::Idle));
    assert_eq!(next_stage(&mut first).await, None);

    h.controller.unsubscribe_stream(&first);
    h.controller.connect(request(60, false)).await.unwrap();
    assert_eq!(next_stage(&mut second).await, Some(Stage::Connecting));

    h.controller.unsubscribe_stream(&second);
    assert_eq!(next_stage(&mut second).await, None);
}
